//! Value types - headerless blocks of scalar fields
//!
//! A value type is embedded inline in the objects that declare a field of it
//! and copied out into detached blocks when read. Field indices start at 0.

use super::field::{Field, FieldType, Scalar};
use super::layout;
use std::sync::Arc;

/// ValueType - layout of an inline value block
#[derive(Debug, Clone, PartialEq)]
pub struct ValueType {
    name: Arc<str>,
    fields: Vec<FieldType>,
    offsets: Vec<u64>,
    size: u64,
}

impl ValueType {
    /// Start describing a value type
    pub fn builder(name: &str) -> ValueBuilder {
        ValueBuilder {
            name: Arc::from(name),
            fields: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn field(&self, index: usize) -> Option<&FieldType> {
        self.fields.get(index)
    }

    pub fn offset(&self, index: usize) -> Option<u64> {
        self.offsets.get(index).copied()
    }

    /// Block size in bytes, padded to 8
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Builder handing out field handles in declaration order
#[derive(Debug)]
pub struct ValueBuilder {
    name: Arc<str>,
    fields: Vec<FieldType>,
}

impl ValueBuilder {
    /// Declare a scalar field
    pub fn field<K: Scalar>(&mut self) -> Field<K> {
        self.fields.push(K::field_type());
        Field::at(self.fields.len() - 1)
    }

    pub fn build(self) -> Arc<ValueType> {
        let (offsets, size) = layout(0, &self.fields);
        Arc::new(ValueType {
            name: self.name,
            fields: self.fields,
            offsets,
            size,
        })
    }
}
