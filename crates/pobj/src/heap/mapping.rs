//! Heap Mapping - memmap2 wrapper for the persistent heap
//!
//! Provides the raw byte view the heap is built on:
//! - File mappings (durable heaps, survive the process)
//! - Anonymous mappings (volatile heaps, used by tests and scratch contexts)
//!
//! Sizes are rounded up to the system page size.

use crate::error::{PobjError, Result};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

static SYSTEM_PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Get system page size, cached after the first call
pub fn get_page_size() -> usize {
    let cached = SYSTEM_PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }

    let size = page_size::get();
    SYSTEM_PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

/// Align size to page boundary (round up)
pub fn align_to_page(size: usize) -> usize {
    crate::util::align_up(size, get_page_size())
}

/// HeapMapping - the mapped bytes backing one heap
///
/// All access goes through a raw base pointer so that threads holding
/// different object monitors can write disjoint ranges concurrently. Callers
/// provide the exclusion; the mapping only checks bounds.
pub struct HeapMapping {
    /// Keeps the mapping alive; flushes go through it
    mmap: MmapMut,

    /// Base address of the mapping
    base: *mut u8,

    /// Size in bytes
    size: usize,

    /// Backing file, `None` for anonymous mappings
    path: Option<PathBuf>,
}

// SAFETY: the mapping is owned for the lifetime of the struct and `base` points
// into it. Concurrent access to overlapping ranges is excluded by the object
// monitors and the heap's allocation lock.
unsafe impl Send for HeapMapping {}
unsafe impl Sync for HeapMapping {}

impl HeapMapping {
    /// Create anonymous memory mapping
    ///
    /// Memory is initialised with zeros.
    pub fn anonymous(size: usize) -> Result<Self> {
        let aligned_size = align_to_page(size);

        let mut mmap = MmapOptions::new().len(aligned_size).map_anon()?;
        let base = mmap.as_mut_ptr();

        Ok(Self {
            mmap,
            base,
            size: aligned_size,
            path: None,
        })
    }

    /// Map a heap file, creating it with `size` bytes if it is new or empty
    ///
    /// Returns the mapping and whether the file was created (and so needs
    /// formatting).
    pub fn file(path: &Path, size: usize) -> Result<(Self, bool)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let existing = file.metadata()?.len() as usize;
        let created = existing == 0;
        let size = if created {
            let aligned_size = align_to_page(size);
            file.set_len(aligned_size as u64)?;
            aligned_size
        } else {
            existing
        };

        let mut mmap = Self::map_file(&file)?;
        let base = mmap.as_mut_ptr();

        Ok((
            Self {
                mmap,
                base,
                size,
                path: Some(path.to_path_buf()),
            },
            created,
        ))
    }

    fn map_file(file: &File) -> Result<MmapMut> {
        // SAFETY: the heap file is owned by this context; other processes
        // truncating or rewriting it is outside the supported model.
        let mmap = unsafe { MmapOptions::new().map_mut(file)? };
        Ok(mmap)
    }

    /// Get size of the mapping
    pub fn size(&self) -> usize {
        self.size
    }

    /// Backing file path
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Check if range lies within the mapping
    pub fn contains_range(&self, offset: u64, len: usize) -> bool {
        (offset as usize)
            .checked_add(len)
            .map_or(false, |end| end <= self.size)
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        if self.contains_range(offset, len) {
            Ok(())
        } else {
            Err(PobjError::InvalidAddress {
                address: offset,
                reason: format!("range of {} bytes exceeds heap of {} bytes", len, self.size),
            })
        }
    }

    /// Read bytes from the mapping
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;

        // SAFETY: range checked above; the source lies inside the mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.add(offset as usize),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Write bytes to the mapping
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;

        // SAFETY: range checked above; exclusion is provided by the caller.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.base.add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    /// Fill a range with zeros
    pub fn zero(&self, offset: u64, len: usize) -> Result<()> {
        self.check_range(offset, len)?;

        // SAFETY: range checked above.
        unsafe {
            std::ptr::write_bytes(self.base.add(offset as usize), 0, len);
        }
        Ok(())
    }

    /// Flush the whole mapping to its file
    pub fn flush(&self) -> Result<()> {
        if self.path.is_some() {
            self.mmap.flush()?;
        }
        Ok(())
    }

    /// Flush one range to its file
    pub fn flush_range(&self, offset: u64, len: usize) -> Result<()> {
        if self.path.is_some() && len > 0 {
            self.check_range(offset, len)?;
            self.mmap.flush_range(offset as usize, len)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_rounds_to_page() {
        let mapping = HeapMapping::anonymous(100).unwrap();
        assert_eq!(mapping.size() % get_page_size(), 0);
        assert!(mapping.size() >= 100);
    }

    #[test]
    fn test_read_write() {
        let mapping = HeapMapping::anonymous(4096).unwrap();
        mapping.write(16, &[1, 2, 3, 4]).unwrap();

        let mut buf = [0u8; 4];
        mapping.read(16, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_out_of_bounds() {
        let mapping = HeapMapping::anonymous(4096).unwrap();
        let size = mapping.size() as u64;
        assert!(mapping.write(size - 2, &[0; 4]).is_err());
        assert!(mapping.read(u64::MAX, &mut [0; 1]).is_err());
    }

    #[test]
    fn test_file_created_then_reopened() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heap.img");

        let (mapping, created) = HeapMapping::file(&path, 8192).unwrap();
        assert!(created);
        mapping.write(0, b"pobj").unwrap();
        mapping.flush().unwrap();
        drop(mapping);

        let (mapping, created) = HeapMapping::file(&path, 8192).unwrap();
        assert!(!created);
        let mut buf = [0u8; 4];
        mapping.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"pobj");
    }
}
