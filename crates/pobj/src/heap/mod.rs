//! Heap Module - Mapped Persistent Heap
//!
//! A single mapped region holding a superblock followed by allocator blocks.
//! Addresses handed out are byte offsets into the mapping, so they stay valid
//! across process restarts; offset 0 lies inside the superblock and therefore
//! doubles as the null reference.
//!
//! Heap Layout:
//! ```text
//! ┌──────────────┬─────────┬──────────┬─────────┬──────────┬─────┐
//! │  superblock  │ hdr │ payload │ hdr │ payload │ ... │ free │
//! └──────────────┴─────────┴──────────┴─────────┴──────────┴─────┘
//! 0              512
//! ```
//!
//! Every block starts with an 8-byte header (block size | allocated bit); the
//! address of a block is the first payload byte. Blocks come in power-of-two
//! size classes starting at 16 bytes, each with a free list whose head lives in
//! the superblock.
//!
//! Writes made while a transaction is active on the calling thread are
//! undo-logged. Allocator metadata is never logged: allocations made by an
//! attempt are released if it rolls back, and frees are deferred to commit.
//!
//! File-backed heaps keep a [`Journal`] next to the image. Opening an image
//! rolls back every transaction the journal shows as unfinished.

pub mod journal;
pub mod mapping;
pub mod raw_string;
pub mod region;

pub use journal::{Journal, JournalRecord, RecoveryReport};
pub use mapping::HeapMapping;
pub use raw_string::RawString;
pub use region::MemoryRegion;

use crate::error::{PobjError, Result};
use crate::transaction;
use parking_lot::Mutex;
use serde::Serialize;
use rustc_hash::FxHashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// "POBJHEAP" in little-endian byte order
const MAGIC: u64 = u64::from_le_bytes(*b"POBJHEAP");

/// Superblock layout revision
const LAYOUT_VERSION: u32 = 1;

// Superblock offsets
const MAGIC_OFFSET: u64 = 0;
const VERSION_OFFSET: u64 = 8;
const CAPACITY_OFFSET: u64 = 16;
const TOP_OFFSET: u64 = 24;
const ROOT_OFFSET: u64 = 32;
const LIVE_BLOCKS_OFFSET: u64 = 40;
const LIVE_BYTES_OFFSET: u64 = 48;
const FREE_LIST_OFFSET: u64 = 56;

/// Number of size classes (16 bytes up to 8TB)
const NUM_CLASSES: usize = 40;

/// Superblock size; the first block starts here
pub const SUPERBLOCK_SIZE: u64 = 512;

/// Smallest block, header included
pub const MIN_BLOCK_SIZE: u64 = 16;

/// Per-block header width
pub const BLOCK_HEADER_SIZE: u64 = 8;

const ALLOCATED_BIT: u64 = 1;

static NEXT_HEAP_ID: AtomicU64 = AtomicU64::new(1);

/// Heap statistics, read from the superblock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeapStats {
    /// Mapped size in bytes
    pub capacity: u64,
    /// Bump pointer high-water mark
    pub top: u64,
    /// Allocated blocks
    pub live_blocks: u64,
    /// Bytes held by allocated blocks, headers included
    pub live_bytes: u64,
}

/// PersistentHeap - allocator and byte access over one mapping
pub struct PersistentHeap {
    /// Process-unique identity, used to bind transactions to this heap
    id: u64,

    /// Mapped bytes
    mapping: HeapMapping,

    /// Serialises every allocator metadata update
    alloc_lock: Mutex<()>,

    /// Undo journal, `None` for volatile heaps
    journal: Option<Journal>,

    /// What replaying the journal on open rolled back
    recovery: RecoveryReport,
}

impl PersistentHeap {
    /// Create a volatile heap over anonymous memory
    pub fn anonymous(size: usize) -> Result<Self> {
        let heap = Self::from_mapping(HeapMapping::anonymous(size)?, None);
        heap.format()?;
        Ok(heap)
    }

    /// Open a heap file, formatting it if it was just created
    ///
    /// An existing image is validated and then recovered from its journal.
    /// Returns the heap and whether it was formatted.
    pub fn open(path: &Path, size: usize) -> Result<(Self, bool)> {
        let (mapping, created) = HeapMapping::file(path, size)?;
        let journal = Journal::open(path)?;
        let mut heap = Self::from_mapping(mapping, None);

        if created {
            heap.format()?;
            heap.mapping.flush()?;
            journal.reset()?;
        } else {
            heap.validate()?;
            heap.recovery = heap.recover(&journal)?;
        }

        heap.journal = Some(journal);
        Ok((heap, created))
    }

    fn from_mapping(mapping: HeapMapping, journal: Option<Journal>) -> Self {
        Self {
            id: NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed),
            mapping,
            alloc_lock: Mutex::new(()),
            journal,
            recovery: RecoveryReport::default(),
        }
    }

    /// Roll back the unfinished transactions recorded in `journal`
    ///
    /// Before-images are written back newest first, then blocks the
    /// unfinished transactions allocated are released. The restored image is
    /// flushed before the journal is cleared.
    fn recover(&self, journal: &Journal) -> Result<RecoveryReport> {
        let records = journal.read_records()?;
        let finished: FxHashSet<u64> = records
            .iter()
            .filter(|record| record.is_finish())
            .map(JournalRecord::txid)
            .collect();

        let mut report = RecoveryReport::default();
        let mut rolled_back = FxHashSet::default();

        for record in records.iter().rev() {
            if let JournalRecord::Undo { txid, address, old } = record {
                if !finished.contains(txid) {
                    self.mapping.write(*address, old).map_err(|e| {
                        PobjError::CorruptHeap(format!("journal record outside heap: {}", e))
                    })?;
                    report.restored_ranges += 1;
                    rolled_back.insert(*txid);
                }
            }
        }

        for record in &records {
            if let JournalRecord::Alloc { txid, address } = record {
                if !finished.contains(txid) {
                    rolled_back.insert(*txid);
                    if self.is_allocated(*address) {
                        self.free_block(*address)?;
                        report.released_blocks += 1;
                    }
                }
            }
        }

        report.transactions = rolled_back.len() as u64;
        if !records.is_empty() {
            self.mapping.flush()?;
        }
        journal.reset()?;

        if !report.is_empty() {
            log::warn!(
                "rolled back {} unfinished transaction(s) from {}",
                report.transactions,
                journal.path().display()
            );
        }
        Ok(report)
    }

    /// Write a fresh superblock
    fn format(&self) -> Result<()> {
        let capacity = self.mapping.size() as u64;
        if capacity < SUPERBLOCK_SIZE + MIN_BLOCK_SIZE {
            return Err(PobjError::CorruptHeap(format!(
                "heap of {} bytes cannot hold a superblock",
                capacity
            )));
        }

        self.mapping.zero(0, SUPERBLOCK_SIZE as usize)?;
        self.put_raw(MAGIC_OFFSET, &MAGIC.to_le_bytes())?;
        self.put_raw(VERSION_OFFSET, &LAYOUT_VERSION.to_le_bytes())?;
        self.put_u64_raw(CAPACITY_OFFSET, capacity)?;
        self.put_u64_raw(TOP_OFFSET, SUPERBLOCK_SIZE)?;
        Ok(())
    }

    /// Check the superblock of an existing image
    fn validate(&self) -> Result<()> {
        let size = self.mapping.size() as u64;
        if size < SUPERBLOCK_SIZE {
            return Err(PobjError::CorruptHeap(format!(
                "image of {} bytes is smaller than a superblock",
                size
            )));
        }

        if self.read_u64(MAGIC_OFFSET)? != MAGIC {
            return Err(PobjError::CorruptHeap("bad magic".to_string()));
        }

        let version = self.read_u32(VERSION_OFFSET)?;
        if version != LAYOUT_VERSION {
            return Err(PobjError::CorruptHeap(format!(
                "layout version {} (expected {})",
                version, LAYOUT_VERSION
            )));
        }

        let capacity = self.read_u64(CAPACITY_OFFSET)?;
        if capacity != size {
            return Err(PobjError::CorruptHeap(format!(
                "superblock capacity {} does not match image size {}",
                capacity, size
            )));
        }

        let top = self.read_u64(TOP_OFFSET)?;
        if top < SUPERBLOCK_SIZE || top > capacity {
            return Err(PobjError::CorruptHeap(format!(
                "bump pointer {} outside heap",
                top
            )));
        }

        Ok(())
    }

    /// Process-unique identity of this heap
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Mapped size in bytes
    pub fn capacity(&self) -> u64 {
        self.mapping.size() as u64
    }

    /// Backing file, `None` for volatile heaps
    pub fn path(&self) -> Option<&Path> {
        self.mapping.path()
    }

    /// Undo journal of a file-backed heap
    pub fn journal(&self) -> Option<&Journal> {
        self.journal.as_ref()
    }

    /// What opening this heap rolled back
    pub fn recovery(&self) -> RecoveryReport {
        self.recovery
    }

    // ========================================================================
    // Byte access
    // ========================================================================

    /// Read bytes at an address
    pub fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        self.mapping.read(address, buf)
    }

    /// Copy `len` bytes starting at an address into a new buffer
    pub fn snapshot(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_bytes(address, &mut buf)?;
        Ok(buf)
    }

    /// Write bytes, undo-logging the old contents if a transaction is active
    pub fn write_bytes(&self, address: u64, data: &[u8]) -> Result<()> {
        transaction::log_write(self.id, address, data.len(), || {
            self.snapshot(address, data.len())
        })?;
        self.mapping.write(address, data)
    }

    /// Write bytes without logging
    ///
    /// Used for detached blocks, rollback itself and freshly zeroed memory.
    pub fn write_bytes_unlogged(&self, address: u64, data: &[u8]) -> Result<()> {
        self.mapping.write(address, data)
    }

    /// Copy `len` bytes from `src` to `dst`, logged at the destination
    pub fn copy(&self, src: u64, dst: u64, len: usize) -> Result<()> {
        let bytes = self.snapshot(src, len)?;
        self.write_bytes(dst, &bytes)
    }

    /// Copy `len` bytes from `src` to `dst` without logging
    pub fn copy_unlogged(&self, src: u64, dst: u64, len: usize) -> Result<()> {
        let bytes = self.snapshot(src, len)?;
        self.write_bytes_unlogged(dst, &bytes)
    }

    pub fn read_u8(&self, address: u64) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_bytes(address, &mut b)?;
        Ok(b[0])
    }

    pub fn read_u32(&self, address: u64) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_bytes(address, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn read_u64(&self, address: u64) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read_bytes(address, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    /// Logged u64 write
    pub fn write_u64(&self, address: u64, value: u64) -> Result<()> {
        self.write_bytes(address, &value.to_le_bytes())
    }

    fn put_raw(&self, address: u64, data: &[u8]) -> Result<()> {
        self.mapping.write(address, data)
    }

    fn put_u64_raw(&self, address: u64, value: u64) -> Result<()> {
        self.put_raw(address, &value.to_le_bytes())
    }

    // ========================================================================
    // Root slot
    // ========================================================================

    /// Address stored in the superblock root slot (0 when unset)
    pub fn root_address(&self) -> Result<u64> {
        self.read_u64(ROOT_OFFSET)
    }

    /// Store an address in the root slot; logged like any field write
    pub fn set_root_address(&self, address: u64) -> Result<()> {
        self.write_u64(ROOT_OFFSET, address)
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocate a zeroed block with room for `size` bytes
    ///
    /// Inside a transaction the block is released again if the attempt rolls
    /// back.
    pub fn allocate(&self, size: usize) -> Result<u64> {
        let address = self.allocate_block(size)?;
        if let Err(e) = transaction::track_allocation(self.id, address, size) {
            if let Err(free_error) = self.free_block(address) {
                log::error!(
                    "releasing untracked block {} failed: {}",
                    crate::util::format_address(address),
                    free_error
                );
            }
            return Err(e);
        }
        Ok(address)
    }

    /// Allocate a block outside any transaction bookkeeping
    pub fn allocate_detached(&self, size: usize) -> Result<u64> {
        self.allocate_block(size)
    }

    /// Release a block
    ///
    /// Inside a transaction the release happens at commit; a rolled-back
    /// attempt keeps the block.
    pub fn free(&self, address: u64) -> Result<()> {
        self.check_allocated(address)?;
        if transaction::defer_free(self.id, address) {
            return Ok(());
        }
        self.free_block(address)
    }

    /// Release a block immediately, regardless of any active transaction
    pub fn free_detached(&self, address: u64) -> Result<()> {
        self.free_block(address)
    }

    fn allocate_block(&self, size: usize) -> Result<u64> {
        let (class, block_size) = size_class(size as u64 + BLOCK_HEADER_SIZE).ok_or(
            PobjError::OutOfMemory {
                requested: size as u64,
                capacity: self.capacity(),
            },
        )?;

        let _guard = self.alloc_lock.lock();

        let head_slot = FREE_LIST_OFFSET + (class as u64) * 8;
        let head = self.read_u64(head_slot)?;
        let address = if head != 0 {
            let next = self.read_u64(head)?;
            self.put_u64_raw(head_slot, next)?;
            head
        } else {
            let top = self.read_u64(TOP_OFFSET)?;
            let end = top
                .checked_add(block_size)
                .filter(|end| *end <= self.capacity())
                .ok_or(PobjError::OutOfMemory {
                    requested: size as u64,
                    capacity: self.capacity(),
                })?;
            self.put_u64_raw(TOP_OFFSET, end)?;
            top + BLOCK_HEADER_SIZE
        };

        self.put_u64_raw(address - BLOCK_HEADER_SIZE, block_size | ALLOCATED_BIT)?;
        self.mapping
            .zero(address, (block_size - BLOCK_HEADER_SIZE) as usize)?;

        let live_blocks = self.read_u64(LIVE_BLOCKS_OFFSET)?;
        self.put_u64_raw(LIVE_BLOCKS_OFFSET, live_blocks + 1)?;
        let live_bytes = self.read_u64(LIVE_BYTES_OFFSET)?;
        self.put_u64_raw(LIVE_BYTES_OFFSET, live_bytes + block_size)?;

        log::trace!(
            "allocated {} bytes at {}",
            block_size,
            crate::util::format_address(address)
        );
        Ok(address)
    }

    fn free_block(&self, address: u64) -> Result<()> {
        let _guard = self.alloc_lock.lock();

        let block_size = self.check_allocated(address)?;
        let (class, _) = size_class(block_size).ok_or_else(|| PobjError::InvalidAddress {
            address,
            reason: format!("block size {} has no size class", block_size),
        })?;

        let head_slot = FREE_LIST_OFFSET + (class as u64) * 8;
        let head = self.read_u64(head_slot)?;
        self.put_u64_raw(address, head)?;
        self.put_u64_raw(head_slot, address)?;
        self.put_u64_raw(address - BLOCK_HEADER_SIZE, block_size)?;

        let live_blocks = self.read_u64(LIVE_BLOCKS_OFFSET)?;
        self.put_u64_raw(LIVE_BLOCKS_OFFSET, live_blocks.saturating_sub(1))?;
        let live_bytes = self.read_u64(LIVE_BYTES_OFFSET)?;
        self.put_u64_raw(LIVE_BYTES_OFFSET, live_bytes.saturating_sub(block_size))?;

        log::trace!("freed block at {}", crate::util::format_address(address));
        Ok(())
    }

    /// Size of the allocated block at `address`, header included
    ///
    /// Fails with `InvalidAddress` if the address is not the start of a live
    /// block.
    pub fn check_allocated(&self, address: u64) -> Result<u64> {
        let first = SUPERBLOCK_SIZE + BLOCK_HEADER_SIZE;
        if address < first || (address - first) % MIN_BLOCK_SIZE != 0 {
            return Err(PobjError::InvalidAddress {
                address,
                reason: "not a block address".to_string(),
            });
        }

        let top = self.read_u64(TOP_OFFSET)?;
        if address >= top {
            return Err(PobjError::InvalidAddress {
                address,
                reason: "beyond the allocated part of the heap".to_string(),
            });
        }

        let header = self.read_u64(address - BLOCK_HEADER_SIZE)?;
        if header & ALLOCATED_BIT == 0 {
            return Err(PobjError::InvalidAddress {
                address,
                reason: "block is not allocated (double free?)".to_string(),
            });
        }

        Ok(header & !ALLOCATED_BIT)
    }

    /// Check whether `address` is the start of a live block
    pub fn is_allocated(&self, address: u64) -> bool {
        self.check_allocated(address).is_ok()
    }

    // ========================================================================
    // Durability
    // ========================================================================

    /// Flush the whole mapping
    pub fn flush(&self) -> Result<()> {
        self.mapping.flush()
    }

    /// Flush one range
    pub fn flush_range(&self, address: u64, len: usize) -> Result<()> {
        self.mapping.flush_range(address, len)
    }

    /// Flush the superblock (allocator metadata and root slot)
    pub fn flush_superblock(&self) -> Result<()> {
        self.mapping.flush_range(0, SUPERBLOCK_SIZE as usize)
    }

    /// Flush a whole block, header included
    pub fn flush_block(&self, address: u64) -> Result<()> {
        let size = self.check_allocated(address)?;
        self.mapping
            .flush_range(address - BLOCK_HEADER_SIZE, size as usize)
    }

    /// Get heap statistics
    pub fn stats(&self) -> Result<HeapStats> {
        Ok(HeapStats {
            capacity: self.read_u64(CAPACITY_OFFSET)?,
            top: self.read_u64(TOP_OFFSET)?,
            live_blocks: self.read_u64(LIVE_BLOCKS_OFFSET)?,
            live_bytes: self.read_u64(LIVE_BYTES_OFFSET)?,
        })
    }
}

/// Size class index and block size for a block of `total` bytes
fn size_class(total: u64) -> Option<(usize, u64)> {
    let mut block_size = MIN_BLOCK_SIZE;
    for class in 0..NUM_CLASSES {
        if block_size >= total {
            return Some((class, block_size));
        }
        block_size <<= 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> PersistentHeap {
        PersistentHeap::anonymous(256 * 1024).unwrap()
    }

    #[test]
    fn test_size_class() {
        assert_eq!(size_class(1), Some((0, 16)));
        assert_eq!(size_class(16), Some((0, 16)));
        assert_eq!(size_class(17), Some((1, 32)));
        assert_eq!(size_class(100), Some((3, 128)));
        assert_eq!(size_class(u64::MAX), None);
    }

    #[test]
    fn test_allocate_zeroed_and_aligned() {
        let heap = heap();
        let a = heap.allocate(24).unwrap();
        let b = heap.allocate(24).unwrap();

        assert_ne!(a, 0);
        assert_ne!(a, b);
        assert_eq!(a % 8, 0);
        assert_eq!(heap.snapshot(a, 24).unwrap(), vec![0u8; 24]);
        assert_eq!(heap.stats().unwrap().live_blocks, 2);
    }

    #[test]
    fn test_free_list_reuse() {
        let heap = heap();
        let a = heap.allocate(40).unwrap();
        heap.write_bytes(a, &[0xAB; 40]).unwrap();
        heap.free(a).unwrap();

        let b = heap.allocate(40).unwrap();
        assert_eq!(a, b);
        assert_eq!(heap.snapshot(b, 40).unwrap(), vec![0u8; 40]);
    }

    #[test]
    fn test_double_free_detected() {
        let heap = heap();
        let a = heap.allocate(8).unwrap();
        heap.free(a).unwrap();

        assert!(matches!(
            heap.free(a),
            Err(PobjError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_invalid_addresses() {
        let heap = heap();
        assert!(!heap.is_allocated(0));
        assert!(!heap.is_allocated(SUPERBLOCK_SIZE + 3));
        assert!(!heap.is_allocated(heap.capacity() - 8));
    }

    #[test]
    fn test_out_of_memory() {
        let heap = heap();
        let result = heap.allocate(heap.capacity() as usize);
        assert!(matches!(result, Err(PobjError::OutOfMemory { .. })));
    }

    #[test]
    fn test_live_bytes_return_to_zero() {
        let heap = heap();
        let blocks: Vec<u64> = (1..20).map(|n| heap.allocate(n * 7).unwrap()).collect();
        for block in blocks {
            heap.free(block).unwrap();
        }

        let stats = heap.stats().unwrap();
        assert_eq!(stats.live_blocks, 0);
        assert_eq!(stats.live_bytes, 0);
    }

    #[test]
    fn test_reopen_preserves_root_and_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heap.img");

        let (heap, formatted) = PersistentHeap::open(&path, 128 * 1024).unwrap();
        assert!(formatted);
        let a = heap.allocate(16).unwrap();
        heap.set_root_address(a).unwrap();
        heap.flush().unwrap();
        drop(heap);

        let (heap, formatted) = PersistentHeap::open(&path, 128 * 1024).unwrap();
        assert!(!formatted);
        assert_eq!(heap.root_address().unwrap(), a);
        assert!(heap.is_allocated(a));
        drop(heap);

        std::fs::write(&path, vec![0x5Au8; 4096]).unwrap();
        assert!(matches!(
            PersistentHeap::open(&path, 128 * 1024),
            Err(PobjError::CorruptHeap(_))
        ));
    }

    #[test]
    fn test_open_rolls_back_unfinished_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heap.img");

        let (heap, _) = PersistentHeap::open(&path, 128 * 1024).unwrap();
        let kept = heap.allocate(16).unwrap();
        heap.write_bytes(kept, &[1; 16]).unwrap();

        // Interrupted transaction: overwrote `kept` and allocated `orphan`
        let journal = heap.journal().unwrap();
        let txid = journal.begin();
        journal.record_undo(txid, kept, &[1; 16]).unwrap();
        heap.write_bytes_unlogged(kept, &[2; 16]).unwrap();
        let orphan = heap.allocate_detached(16).unwrap();
        journal.record_alloc(txid, orphan).unwrap();

        // Finished transaction: its before-image must not be replayed
        let done = journal.begin();
        journal.record_undo(done, kept, &[0; 16]).unwrap();
        journal.finish(done, true).unwrap();

        heap.flush().unwrap();
        let live_blocks = heap.stats().unwrap().live_blocks;
        drop(heap);

        let (heap, formatted) = PersistentHeap::open(&path, 128 * 1024).unwrap();
        assert!(!formatted);
        assert_eq!(heap.snapshot(kept, 16).unwrap(), vec![1; 16]);
        assert!(!heap.is_allocated(orphan));
        assert_eq!(heap.stats().unwrap().live_blocks, live_blocks - 1);
        assert_eq!(
            heap.recovery(),
            RecoveryReport {
                transactions: 1,
                restored_ranges: 1,
                released_blocks: 1,
            }
        );
        assert!(heap.journal().unwrap().is_empty().unwrap());
    }

    #[test]
    fn test_anonymous_heap_has_no_journal() {
        let heap = heap();
        assert!(heap.journal().is_none());
        assert!(heap.recovery().is_empty());
    }
}
