//! Types Module - Object Layout Descriptors
//!
//! Descriptors are immutable and computed once: every field gets a byte offset
//! with natural alignment, and the first four fields of every object type
//! describe the common header.
//!
//! Record layout:
//! ```text
//! ┌───────────┬─────────┬──────────┬────────┬─────┬──────────────────┐
//! │ type name │ version │ refcount │ colour │ pad │ user fields ...  │
//! └───────────┴─────────┴──────────┴────────┴─────┴──────────────────┘
//! 0           8         12         16       17    24
//! ```
//!
//! Array layout: the header, a 32-bit length at offset 24, elements from 32.

pub mod field;
pub mod registry;
pub mod value;

pub use field::{kind, Field, FieldTag, FieldType, ObjectField, Scalar, ValueField};
pub use registry::TypeRegistry;
pub use value::{ValueBuilder, ValueType};

use crate::error::{PobjError, Result};
use crate::object::header::{
    COLOR_OFFSET, HEADER_FIELD_COUNT, HEADER_SIZE, REF_COUNT_OFFSET, TYPE_NAME_OFFSET,
    VERSION_OFFSET,
};
use crate::util::align_up;
use std::sync::Arc;

/// Offset of the length slot of array objects
pub const ARRAY_LENGTH_OFFSET: u64 = HEADER_SIZE;

/// Offset of the first array element
pub const ARRAY_ELEMENTS_OFFSET: u64 = HEADER_SIZE + 8;

/// Record or array
#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    Record,
    Array { element: FieldType },
}

/// ObjectType - immutable layout of one object type
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectType {
    name: Arc<str>,
    parent: Option<Arc<str>>,
    kind: TypeKind,
    /// Header fields first
    fields: Vec<FieldType>,
    offsets: Vec<u64>,
    /// Allocation size; for arrays the size without elements
    size: u64,
}

impl ObjectType {
    /// Start describing a record type
    ///
    /// ```rust
    /// use pobj::types::{kind::Long, ObjectType};
    ///
    /// let mut b = ObjectType::record("Node");
    /// let value = b.field::<Long>();
    /// let next = b.object_field(Some("Node"));
    /// let node = b.build();
    ///
    /// assert_eq!(value.index(), 4);
    /// assert_eq!(node.offset(next.index()), Some(32));
    /// ```
    pub fn record(name: &str) -> RecordBuilder {
        RecordBuilder {
            name: Arc::from(name),
            parent: None,
            fields: Vec::new(),
        }
    }

    /// Start describing a record type that extends `parent`
    ///
    /// The parent's fields come first at the same indices and offsets, so
    /// handles built for the parent work on the child.
    pub fn record_extending(parent: &ObjectType, name: &str) -> RecordBuilder {
        RecordBuilder {
            name: Arc::from(name),
            parent: Some(Arc::clone(&parent.name)),
            fields: parent.fields[HEADER_FIELD_COUNT..].to_vec(),
        }
    }

    /// Describe an array type with the given element kind
    ///
    /// Elements may be scalars or object references.
    pub fn array(name: &str, element: FieldType) -> Result<Arc<ObjectType>> {
        if let FieldType::Value(ty) = &element {
            return Err(PobjError::InvalidArgument(format!(
                "array {} cannot hold inline values of {}",
                name,
                ty.name()
            )));
        }

        let (fields, offsets) = header_layout();
        Ok(Arc::new(ObjectType {
            name: Arc::from(name),
            parent: None,
            kind: TypeKind::Array { element },
            fields,
            offsets,
            size: ARRAY_ELEMENTS_OFFSET,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> &Arc<str> {
        &self.name
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn kind(&self) -> &TypeKind {
        &self.kind
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, TypeKind::Array { .. })
    }

    /// Element kind of an array type
    pub fn element(&self) -> Option<&FieldType> {
        match &self.kind {
            TypeKind::Array { element } => Some(element),
            TypeKind::Record => None,
        }
    }

    /// Number of fields, header included
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn field(&self, index: usize) -> Option<&FieldType> {
        self.fields.get(index)
    }

    pub fn offset(&self, index: usize) -> Option<u64> {
        self.offsets.get(index).copied()
    }

    /// Allocation size (arrays: without elements)
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Allocation size of an array of `length` elements
    pub fn array_size(&self, length: usize) -> Option<u64> {
        let width = self.element()?.width();
        (length as u64)
            .checked_mul(width)
            .and_then(|bytes| bytes.checked_add(ARRAY_ELEMENTS_OFFSET))
    }

    /// Offset of array element `index`
    pub fn element_offset(&self, index: usize) -> Option<u64> {
        let width = self.element()?.width();
        Some(ARRAY_ELEMENTS_OFFSET + index as u64 * width)
    }

    /// Indices of the object reference fields beyond the header
    pub fn object_field_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.fields
            .iter()
            .enumerate()
            .skip(HEADER_FIELD_COUNT)
            .filter(|(_, field)| field.tag() == FieldTag::Object)
            .map(|(index, _)| index)
    }
}

/// Builder handing out typed field handles in declaration order
#[derive(Debug)]
pub struct RecordBuilder {
    name: Arc<str>,
    parent: Option<Arc<str>>,
    fields: Vec<FieldType>,
}

impl RecordBuilder {
    fn next_index(&self) -> usize {
        HEADER_FIELD_COUNT + self.fields.len()
    }

    /// Declare a scalar field
    pub fn field<K: Scalar>(&mut self) -> Field<K> {
        let index = self.next_index();
        self.fields.push(K::field_type());
        Field::at(index)
    }

    /// Declare a reference field; `target` restricts the referenced type
    pub fn object_field(&mut self, target: Option<&str>) -> ObjectField {
        let index = self.next_index();
        let target: Option<Arc<str>> = target.map(Arc::from);
        self.fields.push(FieldType::Object(target.clone()));
        ObjectField::new(index, target)
    }

    /// Declare an inline value field
    pub fn value_field(&mut self, ty: &Arc<ValueType>) -> ValueField {
        let index = self.next_index();
        self.fields.push(FieldType::Value(Arc::clone(ty)));
        ValueField::at(index, ty)
    }

    pub fn build(self) -> Arc<ObjectType> {
        let (mut fields, mut offsets) = header_layout();
        let (user_offsets, size) = layout(HEADER_SIZE, &self.fields);
        fields.extend(self.fields);
        offsets.extend(user_offsets);

        Arc::new(ObjectType {
            name: self.name,
            parent: self.parent,
            kind: TypeKind::Record,
            fields,
            offsets,
            size,
        })
    }
}

/// Header fields and their offsets
fn header_layout() -> (Vec<FieldType>, Vec<u64>) {
    (
        vec![
            FieldType::Long,
            FieldType::Int,
            FieldType::Int,
            FieldType::Byte,
        ],
        vec![
            TYPE_NAME_OFFSET,
            VERSION_OFFSET,
            REF_COUNT_OFFSET,
            COLOR_OFFSET,
        ],
    )
}

/// Naturally aligned offsets starting at `start`, and the padded end
pub(crate) fn layout(start: u64, fields: &[FieldType]) -> (Vec<u64>, u64) {
    let mut cursor = start;
    let offsets = fields
        .iter()
        .map(|field| {
            let offset = align_up(cursor as usize, field.alignment() as usize) as u64;
            cursor = offset + field.width();
            offset
        })
        .collect();
    (offsets, align_up(cursor as usize, 8) as u64)
}
