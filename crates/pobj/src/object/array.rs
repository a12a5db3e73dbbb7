//! Array objects
//!
//! An array is an object whose type has an element kind instead of fields.
//! The length is fixed at construction and stored at offset 24; elements
//! start at offset 32. Object-element arrays follow the same reference
//! protocol as reference fields.

use super::PersistentObject;
use crate::context::PersistentContext;
use crate::error::{PobjError, Result};
use crate::transaction::Transaction;
use crate::types::{FieldType, ObjectType, Scalar, ARRAY_LENGTH_OFFSET};
use std::sync::Arc;

impl PersistentObject {
    /// Construct an array of `length` zeroed elements
    pub fn new_array(
        ctx: &Arc<PersistentContext>,
        ty: &Arc<ObjectType>,
        length: usize,
    ) -> Result<Arc<Self>> {
        if !ty.is_array() {
            return Err(PobjError::InvalidArgument(format!(
                "{} is not an array type",
                ty.name()
            )));
        }

        let stored_length = i32::try_from(length).map_err(|_| {
            PobjError::InvalidArgument(format!("array length {} exceeds i32::MAX", length))
        })?;
        let size = ty.array_size(length).ok_or_else(|| {
            PobjError::InvalidArgument(format!("array of {} elements is too large", length))
        })?;

        let ty = ctx.register_type(Arc::clone(ty))?;
        Transaction::run(ctx, &[], || {
            let array = Self::construct(ctx, &ty, size)?;
            array.region().put_int(ARRAY_LENGTH_OFFSET, stored_length)?;
            Ok(array)
        })
    }

    fn element_type(&self) -> Result<&FieldType> {
        self.object_type().element().ok_or_else(|| {
            PobjError::InvalidArgument(format!("{} is not an array type", self.type_name()))
        })
    }

    /// Number of elements
    pub fn length(self: &Arc<Self>) -> Result<usize> {
        self.element_type()?;
        let region = self.region();
        let length = self.read_locked(|| region.get_int(ARRAY_LENGTH_OFFSET))?;
        Ok(length.max(0) as usize)
    }

    /// Offset of element `index` after checking kind and bounds
    fn check_element(self: &Arc<Self>, index: usize, expected: &FieldType) -> Result<u64> {
        let element = self.element_type()?;
        if element.tag() != expected.tag() {
            return Err(PobjError::TypeMismatch {
                type_name: self.type_name().to_string(),
                index,
                expected: expected.describe(),
                found: element.describe(),
            });
        }

        let length = self.length()?;
        if index >= length {
            return Err(PobjError::ElementIndexOutOfBounds { index, length });
        }

        // Array types always have element offsets.
        Ok(self.object_type().element_offset(index).unwrap_or_default())
    }

    /// Read scalar element `index`
    pub fn get_element<K: Scalar>(self: &Arc<Self>, index: usize) -> Result<K::Value> {
        let offset = self.check_element(index, &K::field_type())?;
        let address = self.address() + offset;
        let heap = self.context().heap();
        self.read_locked(|| Ok(K::decode(&heap.snapshot(address, K::WIDTH)?)))
    }

    /// Write scalar element `index`
    pub fn set_element<K: Scalar>(
        self: &Arc<Self>,
        index: usize,
        value: K::Value,
    ) -> Result<()> {
        let offset = self.check_element(index, &K::field_type())?;
        let address = self.address() + offset;
        let heap = self.context().heap();
        let bytes = K::encode(value);
        self.write_locked(|| heap.write_bytes(address, &bytes))
    }

    /// Read object element `index`; `None` for null
    pub fn get_element_object(
        self: &Arc<Self>,
        index: usize,
    ) -> Result<Option<Arc<PersistentObject>>> {
        let offset = self.check_element(index, &FieldType::Object(None))?;
        self.load_reference(offset)
    }

    /// Store object element `index`
    pub fn set_element_object(
        self: &Arc<Self>,
        index: usize,
        value: Option<&Arc<PersistentObject>>,
    ) -> Result<()> {
        let offset = self.check_element(index, &FieldType::Object(None))?;
        if let Some(value) = value {
            let target = match self.element_type()? {
                FieldType::Object(target) => target.clone(),
                _ => None,
            };
            self.check_assignable(index, target.as_deref(), value)?;
        }
        self.store_reference(offset, value)
    }
}
