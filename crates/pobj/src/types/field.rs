//! Field kinds and typed field handles
//!
//! Scalar kinds are zero-sized marker types implementing the sealed [`Scalar`]
//! trait, which fixes the tag, the stored width and the bit encoding. Storage
//! is little-endian; float and double keep their exact IEEE-754 bit patterns,
//! boolean is one byte (0 or 1) and char is a 32-bit code point.

use super::ValueType;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Semantic tag of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldTag {
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Char,
    Boolean,
    Object,
    Value,
}

impl FieldTag {
    pub fn name(self) -> &'static str {
        match self {
            FieldTag::Byte => "byte",
            FieldTag::Short => "short",
            FieldTag::Int => "int",
            FieldTag::Long => "long",
            FieldTag::Float => "float",
            FieldTag::Double => "double",
            FieldTag::Char => "char",
            FieldTag::Boolean => "boolean",
            FieldTag::Object => "object",
            FieldTag::Value => "value",
        }
    }
}

impl fmt::Display for FieldTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Declared type of one field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Char,
    Boolean,
    /// Reference to another object; `None` accepts any type
    Object(Option<Arc<str>>),
    /// Inline value block
    Value(Arc<ValueType>),
}

impl FieldType {
    pub fn tag(&self) -> FieldTag {
        match self {
            FieldType::Byte => FieldTag::Byte,
            FieldType::Short => FieldTag::Short,
            FieldType::Int => FieldTag::Int,
            FieldType::Long => FieldTag::Long,
            FieldType::Float => FieldTag::Float,
            FieldType::Double => FieldTag::Double,
            FieldType::Char => FieldTag::Char,
            FieldType::Boolean => FieldTag::Boolean,
            FieldType::Object(_) => FieldTag::Object,
            FieldType::Value(_) => FieldTag::Value,
        }
    }

    /// Stored width in bytes
    pub fn width(&self) -> u64 {
        match self {
            FieldType::Byte | FieldType::Boolean => 1,
            FieldType::Short => 2,
            FieldType::Int | FieldType::Float | FieldType::Char => 4,
            FieldType::Long | FieldType::Double | FieldType::Object(_) => 8,
            FieldType::Value(ty) => ty.size(),
        }
    }

    /// Natural alignment
    pub fn alignment(&self) -> u64 {
        match self {
            FieldType::Value(_) => 8,
            other => other.width(),
        }
    }

    /// Human-readable form used in type-mismatch errors
    pub fn describe(&self) -> String {
        match self {
            FieldType::Object(Some(target)) => format!("object<{}>", target),
            FieldType::Value(ty) => format!("value<{}>", ty.name()),
            other => other.tag().name().to_string(),
        }
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Scalar field kind
///
/// Implemented only by the markers in [`kind`].
pub trait Scalar: sealed::Sealed + 'static {
    /// Rust type a field of this kind reads and writes
    type Value: Copy + PartialEq + fmt::Debug + Send + 'static;

    const TAG: FieldTag;

    /// Stored width in bytes
    const WIDTH: usize;

    /// Declared field type for this kind
    fn field_type() -> FieldType;

    /// Stored bits, in the low `WIDTH` bytes
    fn to_bits(value: Self::Value) -> u64;

    fn from_bits(bits: u64) -> Self::Value;

    /// Little-endian stored bytes
    fn encode(value: Self::Value) -> Vec<u8> {
        Self::to_bits(value).to_le_bytes()[..Self::WIDTH].to_vec()
    }

    /// Decode from at least `WIDTH` little-endian bytes
    fn decode(bytes: &[u8]) -> Self::Value {
        let mut buf = [0u8; 8];
        buf[..Self::WIDTH].copy_from_slice(&bytes[..Self::WIDTH]);
        Self::from_bits(u64::from_le_bytes(buf))
    }
}

/// Scalar kind markers
pub mod kind {
    use super::{sealed, FieldTag, FieldType, Scalar};

    #[derive(Debug, Clone, Copy)]
    pub enum Byte {}
    #[derive(Debug, Clone, Copy)]
    pub enum Short {}
    #[derive(Debug, Clone, Copy)]
    pub enum Int {}
    #[derive(Debug, Clone, Copy)]
    pub enum Long {}
    #[derive(Debug, Clone, Copy)]
    pub enum Float {}
    #[derive(Debug, Clone, Copy)]
    pub enum Double {}
    #[derive(Debug, Clone, Copy)]
    pub enum Char {}
    #[derive(Debug, Clone, Copy)]
    pub enum Boolean {}

    macro_rules! integer_kind {
        ($marker:ident, $ty:ty, $unsigned:ty, $width:expr) => {
            impl sealed::Sealed for $marker {}

            impl Scalar for $marker {
                type Value = $ty;
                const TAG: FieldTag = FieldTag::$marker;
                const WIDTH: usize = $width;

                fn field_type() -> FieldType {
                    FieldType::$marker
                }

                fn to_bits(value: $ty) -> u64 {
                    value as $unsigned as u64
                }

                fn from_bits(bits: u64) -> $ty {
                    bits as $unsigned as $ty
                }
            }
        };
    }

    integer_kind!(Byte, i8, u8, 1);
    integer_kind!(Short, i16, u16, 2);
    integer_kind!(Int, i32, u32, 4);
    integer_kind!(Long, i64, u64, 8);

    impl sealed::Sealed for Float {}

    impl Scalar for Float {
        type Value = f32;
        const TAG: FieldTag = FieldTag::Float;
        const WIDTH: usize = 4;

        fn field_type() -> FieldType {
            FieldType::Float
        }

        fn to_bits(value: f32) -> u64 {
            value.to_bits() as u64
        }

        fn from_bits(bits: u64) -> f32 {
            f32::from_bits(bits as u32)
        }
    }

    impl sealed::Sealed for Double {}

    impl Scalar for Double {
        type Value = f64;
        const TAG: FieldTag = FieldTag::Double;
        const WIDTH: usize = 8;

        fn field_type() -> FieldType {
            FieldType::Double
        }

        fn to_bits(value: f64) -> u64 {
            value.to_bits()
        }

        fn from_bits(bits: u64) -> f64 {
            f64::from_bits(bits)
        }
    }

    impl sealed::Sealed for Char {}

    impl Scalar for Char {
        type Value = char;
        const TAG: FieldTag = FieldTag::Char;
        const WIDTH: usize = 4;

        fn field_type() -> FieldType {
            FieldType::Char
        }

        fn to_bits(value: char) -> u64 {
            value as u32 as u64
        }

        // Bits that are not a scalar value decode to U+FFFD.
        fn from_bits(bits: u64) -> char {
            char::from_u32(bits as u32).unwrap_or(char::REPLACEMENT_CHARACTER)
        }
    }

    impl sealed::Sealed for Boolean {}

    impl Scalar for Boolean {
        type Value = bool;
        const TAG: FieldTag = FieldTag::Boolean;
        const WIDTH: usize = 1;

        fn field_type() -> FieldType {
            FieldType::Boolean
        }

        fn to_bits(value: bool) -> u64 {
            value as u64
        }

        fn from_bits(bits: u64) -> bool {
            bits & 0xFF != 0
        }
    }
}

/// Handle to a scalar field of kind `K`
pub struct Field<K: Scalar> {
    index: usize,
    _kind: PhantomData<fn() -> K>,
}

impl<K: Scalar> Field<K> {
    /// Handle for the field at `index`; checked against the object on use
    pub const fn at(index: usize) -> Self {
        Self {
            index,
            _kind: PhantomData,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl<K: Scalar> Clone for Field<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: Scalar> Copy for Field<K> {}

impl<K: Scalar> fmt::Debug for Field<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Field<{}>({})", K::TAG, self.index)
    }
}

/// Handle to an object reference field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectField {
    index: usize,
    target: Option<Arc<str>>,
}

impl ObjectField {
    /// Handle for the field at `index` expecting objects of `target` (or any)
    pub fn at(index: usize, target: Option<&str>) -> Self {
        Self {
            index,
            target: target.map(Arc::from),
        }
    }

    pub(crate) fn new(index: usize, target: Option<Arc<str>>) -> Self {
        Self { index, target }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }
}

/// Handle to an inline value field
#[derive(Debug, Clone)]
pub struct ValueField {
    index: usize,
    ty: Arc<ValueType>,
}

impl ValueField {
    pub fn at(index: usize, ty: &Arc<ValueType>) -> Self {
        Self {
            index,
            ty: Arc::clone(ty),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn value_type(&self) -> &Arc<ValueType> {
        &self.ty
    }
}

#[cfg(test)]
mod tests {
    use super::kind::*;
    use super::*;

    #[test]
    fn test_integer_encoding() {
        assert_eq!(Byte::encode(-1), vec![0xFF]);
        assert_eq!(Short::decode(&Short::encode(-2)), -2);
        assert_eq!(Int::encode(1), vec![1, 0, 0, 0]);
        assert_eq!(Long::decode(&Long::encode(i64::MIN)), i64::MIN);
    }

    #[test]
    fn test_float_bits_exact() {
        let nan = f64::from_bits(0x7FF8_0000_DEAD_BEEF);
        let decoded = Double::decode(&Double::encode(nan));
        assert_eq!(decoded.to_bits(), nan.to_bits());

        assert_eq!(Float::decode(&Float::encode(-0.0)).to_bits(), (-0.0f32).to_bits());
    }

    #[test]
    fn test_bool_and_char() {
        assert_eq!(Boolean::encode(true), vec![1]);
        assert!(!Boolean::decode(&[0]));
        assert!(Boolean::decode(&[2]));

        assert_eq!(Char::decode(&Char::encode('ж')), 'ж');
        assert_eq!(Char::from_bits(0xD800), char::REPLACEMENT_CHARACTER);
    }

    #[test]
    fn test_widths() {
        assert_eq!(FieldType::Boolean.width(), 1);
        assert_eq!(FieldType::Char.width(), 4);
        assert_eq!(FieldType::Object(None).width(), 8);
        assert_eq!(FieldType::Object(Some("Node".into())).describe(), "object<Node>");
    }
}
