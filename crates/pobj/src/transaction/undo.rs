//! Undo log
//!
//! Before-images of every logged write of one transaction attempt. Rollback
//! replays them newest first; commit uses the recorded ranges to decide what
//! to flush.

use crate::heap::PersistentHeap;

/// Old contents of one written range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoRecord {
    pub address: u64,
    pub old: Vec<u8>,
}

/// UndoLog - before-images in write order
#[derive(Debug, Default)]
pub struct UndoLog {
    records: Vec<UndoRecord>,
}

impl UndoLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, address: u64, old: Vec<u8>) {
        self.records.push(UndoRecord { address, old });
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Written ranges, in write order
    pub fn ranges(&self) -> impl Iterator<Item = (u64, usize)> + '_ {
        self.records.iter().map(|r| (r.address, r.old.len()))
    }

    /// Restore every before-image, newest first
    ///
    /// Restores are unlogged. A failing restore is logged and skipped so the
    /// remaining ranges still roll back.
    pub fn rollback(self, heap: &PersistentHeap) {
        for record in self.records.into_iter().rev() {
            if let Err(e) = heap.write_bytes_unlogged(record.address, &record.old) {
                log::error!(
                    "failed to restore {} bytes at {}: {}",
                    record.old.len(),
                    crate::util::format_address(record.address),
                    e
                );
            }
        }
    }
}
