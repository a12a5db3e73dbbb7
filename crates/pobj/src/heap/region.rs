//! Memory Region - typed view of one heap block
//!
//! A `MemoryRegion` pairs a heap with the address of a block and exposes
//! fixed-width little-endian reads and writes at byte offsets. Writes go
//! through the heap's logged path, so they are undone if the enclosing
//! transaction rolls back. Writes outside a transaction are not
//! crash-consistent.

use super::PersistentHeap;
use crate::error::Result;

/// MemoryRegion - `(heap, address)` view with typed accessors
#[derive(Clone, Copy)]
pub struct MemoryRegion<'a> {
    heap: &'a PersistentHeap,
    address: u64,
}

impl<'a> MemoryRegion<'a> {
    pub fn new(heap: &'a PersistentHeap, address: u64) -> Self {
        Self { heap, address }
    }

    /// Address of the block
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Heap the block lives in
    pub fn heap(&self) -> &'a PersistentHeap {
        self.heap
    }

    /// Read `N` bytes at `offset`
    pub fn get_bytes<const N: usize>(&self, offset: u64) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.heap.read_bytes(self.address + offset, &mut buf)?;
        Ok(buf)
    }

    /// Write bytes at `offset` (logged)
    pub fn put_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.heap.write_bytes(self.address + offset, data)
    }

    pub fn get_byte(&self, offset: u64) -> Result<i8> {
        Ok(i8::from_le_bytes(self.get_bytes(offset)?))
    }

    pub fn get_short(&self, offset: u64) -> Result<i16> {
        Ok(i16::from_le_bytes(self.get_bytes(offset)?))
    }

    pub fn get_int(&self, offset: u64) -> Result<i32> {
        Ok(i32::from_le_bytes(self.get_bytes(offset)?))
    }

    pub fn get_long(&self, offset: u64) -> Result<i64> {
        Ok(i64::from_le_bytes(self.get_bytes(offset)?))
    }

    /// Unsigned view of a long slot, used for addresses
    pub fn get_address(&self, offset: u64) -> Result<u64> {
        Ok(u64::from_le_bytes(self.get_bytes(offset)?))
    }

    pub fn put_byte(&self, offset: u64, value: i8) -> Result<()> {
        self.put_bytes(offset, &value.to_le_bytes())
    }

    pub fn put_short(&self, offset: u64, value: i16) -> Result<()> {
        self.put_bytes(offset, &value.to_le_bytes())
    }

    pub fn put_int(&self, offset: u64, value: i32) -> Result<()> {
        self.put_bytes(offset, &value.to_le_bytes())
    }

    pub fn put_long(&self, offset: u64, value: i64) -> Result<()> {
        self.put_bytes(offset, &value.to_le_bytes())
    }

    pub fn put_address(&self, offset: u64, address: u64) -> Result<()> {
        self.put_bytes(offset, &address.to_le_bytes())
    }
}

impl std::fmt::Debug for MemoryRegion<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("address", &crate::util::format_address(self.address))
            .finish()
    }
}
