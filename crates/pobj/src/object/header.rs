//! Object Header - common prefix of every object block
//!
//! Object Header Layout (24 bytes):
//! ┌─────────────────────────────────────────┐
//! │   Type name pointer (8 bytes)           │  <- address of a RawString block
//! ├─────────────────────────────────────────┤
//! │   Format version (4 bytes)              │  <- 99
//! ├─────────────────────────────────────────┤
//! │   Reference count (4 bytes, signed)     │  <- never negative
//! ├─────────────────────────────────────────┤
//! │   Colour (1 byte) + padding (7 bytes)   │
//! └─────────────────────────────────────────┘
//!
//! The same four slots are fields 0..=3 of every object type, so user field
//! indices start at 4.

/// Offset of the type-name pointer
pub const TYPE_NAME_OFFSET: u64 = 0;

/// Offset of the format version
pub const VERSION_OFFSET: u64 = 8;

/// Offset of the reference count
pub const REF_COUNT_OFFSET: u64 = 12;

/// Offset of the colour byte
pub const COLOR_OFFSET: u64 = 16;

/// Size of object header in bytes
pub const HEADER_SIZE: u64 = 24;

/// Number of header fields
pub const HEADER_FIELD_COUNT: usize = 4;

/// Format version written by fresh constructions
pub const DEFAULT_VERSION: i32 = 99;

/// Cycle collector colour
///
/// `Black` marks an object with an acknowledged live incoming reference; every
/// `add_reference` writes it. The other colours belong to the external
/// collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GcColor {
    Black = 0,
    Gray = 1,
    White = 2,
    Purple = 3,
}

impl GcColor {
    pub fn to_byte(self) -> i8 {
        self as u8 as i8
    }

    /// Decode a stored colour; unknown bytes yield `None`
    pub fn from_byte(byte: i8) -> Option<Self> {
        match byte {
            0 => Some(GcColor::Black),
            1 => Some(GcColor::Gray),
            2 => Some(GcColor::White),
            3 => Some(GcColor::Purple),
            _ => None,
        }
    }
}
