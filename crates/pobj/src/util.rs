//! Util Module - Shared Utilities
//!
//! Helper functions used throughout the object layer.

/// Align value up to a power-of-two boundary
///
/// # Examples
/// ```
/// assert_eq!(pobj::util::align_up(100, 8), 104);
/// assert_eq!(pobj::util::align_up(64, 8), 64);
/// ```
#[inline]
pub fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Format a heap address the way every diagnostic prints it
pub fn format_address(address: u64) -> String {
    format!("0x{:016X}", address)
}

/// Size constants
pub mod constants {
    /// 1 Kilobyte
    pub const KB: usize = 1024;
    /// 1 Megabyte
    pub const MB: usize = 1024 * 1024;
}
