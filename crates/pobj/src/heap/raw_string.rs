//! Raw strings - length-prefixed UTF-8 blocks
//!
//! Each object's type name lives in its own block: a little-endian u32 byte
//! length followed by the UTF-8 bytes. The block is freed with the object.

use super::PersistentHeap;
use crate::error::{PobjError, Result};

const LENGTH_SIZE: usize = 4;

/// RawString - a string block in the persistent heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawString {
    address: u64,
}

impl RawString {
    /// Allocate a block holding `value`
    ///
    /// Inside a transaction the block is released if the attempt rolls back.
    pub fn write(heap: &PersistentHeap, value: &str) -> Result<Self> {
        let len = u32::try_from(value.len())
            .map_err(|_| PobjError::InvalidArgument(format!("string of {} bytes", value.len())))?;

        let address = heap.allocate(LENGTH_SIZE + value.len())?;
        let mut bytes = Vec::with_capacity(LENGTH_SIZE + value.len());
        bytes.extend_from_slice(&len.to_le_bytes());
        bytes.extend_from_slice(value.as_bytes());
        heap.write_bytes(address, &bytes)?;

        Ok(Self { address })
    }

    /// View an existing block
    pub fn at(address: u64) -> Self {
        Self { address }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    /// Decode the stored string
    pub fn read(&self, heap: &PersistentHeap) -> Result<String> {
        let block_size = heap.check_allocated(self.address)?;
        let len = heap.read_u32(self.address)? as u64;
        if len + (LENGTH_SIZE as u64) + super::BLOCK_HEADER_SIZE > block_size {
            return Err(PobjError::CorruptHeap(format!(
                "string at {} claims {} bytes",
                crate::util::format_address(self.address),
                len
            )));
        }

        let bytes = heap.snapshot(self.address + LENGTH_SIZE as u64, len as usize)?;
        String::from_utf8(bytes).map_err(|e| {
            PobjError::CorruptHeap(format!(
                "string at {} is not UTF-8: {}",
                crate::util::format_address(self.address),
                e
            ))
        })
    }

    /// Release the block
    pub fn free(self, heap: &PersistentHeap) -> Result<()> {
        heap.free(self.address)
    }
}
