//! Undo Journal - write-ahead before-images for file-backed heaps
//!
//! The journal is a sidecar file next to the heap image (`<heap>.journal`).
//! Before a transaction overwrites a range in place, the old contents of the
//! range are appended and synced here. The OS may write mapped pages back at
//! any moment, so after a crash the image can hold bytes of a transaction that
//! never committed; the next open rolls those back from the journal.
//!
//! Record layout (little-endian):
//! ```text
//! ┌──────┬──────┬─────────┬─────┬──────────┬─────────────┐
//! │ kind │ txid │ address │ len │ checksum │ payload ... │
//! │  u8  │ u64  │   u64   │ u32 │   u64    │  len bytes  │
//! └──────┴──────┴─────────┴─────┴──────────┴─────────────┘
//! ```
//!
//! A transaction is finished once its commit or abort record is synced.
//! Recovery rolls back every unfinished transaction: before-images newest
//! first, then the blocks it allocated. A torn or corrupt record ends the
//! scan; the write it would have covered never happened.
//!
//! The file is truncated whenever no journaled transaction is open.

use crate::error::Result;
use parking_lot::Mutex;
use rustc_hash::{FxHashSet, FxHasher};
use std::fs::{File, OpenOptions};
use std::hash::Hasher;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const HEADER_SIZE: usize = 1 + 8 + 8 + 4 + 8;

const KIND_UNDO: u8 = 1;
const KIND_ALLOC: u8 = 2;
const KIND_COMMIT: u8 = 3;
const KIND_ABORT: u8 = 4;

/// One journal record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    /// Contents of `old.len()` bytes at `address` before the transaction wrote them
    Undo { txid: u64, address: u64, old: Vec<u8> },
    /// Block allocated by the transaction
    Alloc { txid: u64, address: u64 },
    /// Transaction committed; its writes are flushed
    Commit { txid: u64 },
    /// Transaction rolled back in process; its restores are flushed
    Abort { txid: u64 },
}

impl JournalRecord {
    pub fn txid(&self) -> u64 {
        match self {
            JournalRecord::Undo { txid, .. }
            | JournalRecord::Alloc { txid, .. }
            | JournalRecord::Commit { txid }
            | JournalRecord::Abort { txid } => *txid,
        }
    }

    /// Whether this record finishes its transaction
    pub fn is_finish(&self) -> bool {
        matches!(
            self,
            JournalRecord::Commit { .. } | JournalRecord::Abort { .. }
        )
    }

    fn parts(&self) -> (u8, u64, &[u8]) {
        match self {
            JournalRecord::Undo { address, old, .. } => (KIND_UNDO, *address, old),
            JournalRecord::Alloc { address, .. } => (KIND_ALLOC, *address, &[][..]),
            JournalRecord::Commit { .. } => (KIND_COMMIT, 0, &[][..]),
            JournalRecord::Abort { .. } => (KIND_ABORT, 0, &[][..]),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let txid = self.txid();
        let (kind, address, payload) = self.parts();

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        buf.push(kind);
        buf.extend_from_slice(&txid.to_le_bytes());
        buf.extend_from_slice(&address.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&checksum(kind, txid, address, payload).to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    /// Decode the record at the start of `buf`
    ///
    /// Returns the record and its encoded size, or `None` for a torn or
    /// corrupt record.
    fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < HEADER_SIZE {
            return None;
        }

        let kind = buf[0];
        let txid = u64::from_le_bytes(buf[1..9].try_into().ok()?);
        let address = u64::from_le_bytes(buf[9..17].try_into().ok()?);
        let len = u32::from_le_bytes(buf[17..21].try_into().ok()?) as usize;
        let sum = u64::from_le_bytes(buf[21..29].try_into().ok()?);

        let end = HEADER_SIZE.checked_add(len)?;
        let payload = buf.get(HEADER_SIZE..end)?;
        if checksum(kind, txid, address, payload) != sum {
            return None;
        }

        let record = match kind {
            KIND_UNDO => JournalRecord::Undo {
                txid,
                address,
                old: payload.to_vec(),
            },
            KIND_ALLOC => JournalRecord::Alloc { txid, address },
            KIND_COMMIT => JournalRecord::Commit { txid },
            KIND_ABORT => JournalRecord::Abort { txid },
            _ => return None,
        };
        Some((record, end))
    }
}

fn checksum(kind: u8, txid: u64, address: u64, payload: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write_u8(kind);
    hasher.write_u64(txid);
    hasher.write_u64(address);
    hasher.write_usize(payload.len());
    hasher.write(payload);
    hasher.finish()
}

struct JournalFile {
    file: File,
    /// Transactions with records but no finish record yet
    open: FxHashSet<u64>,
}

/// Journal - append-only undo journal of one heap file
pub struct Journal {
    path: PathBuf,
    inner: Mutex<JournalFile>,
    next_txid: AtomicU64,
}

impl Journal {
    /// Journal path for the heap image at `heap_path`
    pub fn path_for(heap_path: &Path) -> PathBuf {
        let mut path = heap_path.as_os_str().to_owned();
        path.push(".journal");
        PathBuf::from(path)
    }

    /// Open (or create) the journal of the heap image at `heap_path`
    ///
    /// Existing records are kept until [`Journal::reset`].
    pub fn open(heap_path: &Path) -> Result<Self> {
        let path = Self::path_for(heap_path);
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        Ok(Self {
            path,
            inner: Mutex::new(JournalFile {
                file,
                open: FxHashSet::default(),
            }),
            next_txid: AtomicU64::new(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the journal file in bytes
    pub fn len(&self) -> Result<u64> {
        Ok(self.inner.lock().file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Every intact record, in append order
    pub fn read_records(&self) -> Result<Vec<JournalRecord>> {
        let mut buf = Vec::new();
        File::open(&self.path)?.read_to_end(&mut buf)?;

        let mut records = Vec::new();
        let mut offset = 0;
        while offset < buf.len() {
            match JournalRecord::decode(&buf[offset..]) {
                Some((record, size)) => {
                    records.push(record);
                    offset += size;
                }
                None => {
                    log::warn!(
                        "journal {} ends with {} unreadable bytes",
                        self.path.display(),
                        buf.len() - offset
                    );
                    break;
                }
            }
        }
        Ok(records)
    }

    /// Identifier for a new journaled transaction
    pub fn begin(&self) -> u64 {
        self.next_txid.fetch_add(1, Ordering::Relaxed)
    }

    /// Append and sync a before-image
    ///
    /// Must return before the range is overwritten in place.
    pub fn record_undo(&self, txid: u64, address: u64, old: &[u8]) -> Result<()> {
        self.append(
            &JournalRecord::Undo {
                txid,
                address,
                old: old.to_vec(),
            },
            true,
        )
    }

    /// Append an allocation record
    ///
    /// Not synced on its own: an allocation whose record is lost leaks its
    /// block but leaves no visible data behind.
    pub fn record_alloc(&self, txid: u64, address: u64) -> Result<()> {
        self.append(&JournalRecord::Alloc { txid, address }, false)
    }

    /// Append and sync the finish record of `txid`
    ///
    /// Callers flush the transaction's heap ranges first. Truncates the file
    /// once no journaled transaction remains open.
    pub fn finish(&self, txid: u64, committed: bool) -> Result<()> {
        let record = if committed {
            JournalRecord::Commit { txid }
        } else {
            JournalRecord::Abort { txid }
        };

        let mut inner = self.inner.lock();
        if !inner.open.contains(&txid) {
            return Ok(());
        }
        inner.file.write_all(&record.encode())?;
        inner.file.sync_data()?;
        inner.open.remove(&txid);

        if inner.open.is_empty() {
            inner.file.set_len(0)?;
            inner.file.sync_data()?;
        }
        Ok(())
    }

    /// Drop every record
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.set_len(0)?;
        inner.file.sync_all()?;
        inner.open.clear();
        Ok(())
    }

    fn append(&self, record: &JournalRecord, sync: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.write_all(&record.encode())?;
        if sync {
            inner.file.sync_data()?;
        }
        inner.open.insert(record.txid());
        Ok(())
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal").field("path", &self.path).finish()
    }
}

/// Outcome of replaying a journal on open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RecoveryReport {
    /// Unfinished transactions rolled back
    pub transactions: u64,
    /// Before-images written back
    pub restored_ranges: u64,
    /// Blocks of unfinished transactions released
    pub released_blocks: u64,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.transactions == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn journal() -> (tempfile::TempDir, Journal) {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(&dir.path().join("heap.img")).unwrap();
        (dir, journal)
    }

    #[test]
    fn test_path_for_appends_suffix() {
        assert_eq!(
            Journal::path_for(Path::new("/data/objects.heap")),
            PathBuf::from("/data/objects.heap.journal")
        );
    }

    #[test]
    fn test_records_read_back_in_order() {
        let (_dir, journal) = journal();
        let txid = journal.begin();
        journal.record_alloc(txid, 0x220).unwrap();
        journal.record_undo(txid, 0x240, &[1, 2, 3]).unwrap();

        assert_eq!(
            journal.read_records().unwrap(),
            vec![
                JournalRecord::Alloc {
                    txid,
                    address: 0x220
                },
                JournalRecord::Undo {
                    txid,
                    address: 0x240,
                    old: vec![1, 2, 3]
                },
            ]
        );
    }

    #[test]
    fn test_truncated_when_last_transaction_finishes() {
        let (_dir, journal) = journal();
        let first = journal.begin();
        let second = journal.begin();
        journal.record_undo(first, 0x240, &[0; 8]).unwrap();
        journal.record_undo(second, 0x260, &[0; 8]).unwrap();

        journal.finish(first, true).unwrap();
        let records = journal.read_records().unwrap();
        assert_eq!(records.len(), 3);
        assert!(records[2].is_finish());

        journal.finish(second, false).unwrap();
        assert!(journal.is_empty().unwrap());
    }

    #[test]
    fn test_finish_without_records_writes_nothing() {
        let (_dir, journal) = journal();
        let txid = journal.begin();
        journal.finish(txid, true).unwrap();
        assert!(journal.is_empty().unwrap());
    }

    #[test]
    fn test_torn_tail_ignored() {
        let (_dir, journal) = journal();
        let txid = journal.begin();
        journal.record_undo(txid, 0x240, &[7; 16]).unwrap();

        let torn = JournalRecord::Undo {
            txid,
            address: 0x300,
            old: vec![9; 16],
        }
        .encode();
        let mut file = OpenOptions::new().append(true).open(journal.path()).unwrap();
        file.write_all(&torn[..torn.len() - 5]).unwrap();

        let records = journal.read_records().unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_corrupt_record_ignored() {
        let mut bytes = JournalRecord::Undo {
            txid: 1,
            address: 0x240,
            old: vec![1, 2, 3, 4],
        }
        .encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        assert!(JournalRecord::decode(&bytes).is_none());
    }

    #[test]
    fn test_reset_clears_file() {
        let (_dir, journal) = journal();
        let txid = journal.begin();
        journal.record_undo(txid, 0x240, &[0; 8]).unwrap();
        journal.reset().unwrap();

        assert!(journal.read_records().unwrap().is_empty());
        journal.finish(txid, true).unwrap();
        assert!(journal.is_empty().unwrap());
    }
}
