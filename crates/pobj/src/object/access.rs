//! Field access and the locking protocol
//!
//! Reads:
//! - outside a transaction: enter the monitor (blocking), read, exit; object
//!   references use a bounded wait and fail with `LockTimeout`
//! - inside a transaction: if the transaction already holds the object, read;
//!   otherwise take the lock with the thread's adaptive timeout, keep it until
//!   the transaction ends, or fail with `RetryRequested`
//!
//! Writes always run in a (possibly nested) transaction locking the object.
//!
//! Every accessor checks the field index and the requested kind before
//! touching memory; a mismatch has no side effects.

use super::header::HEADER_FIELD_COUNT;
use super::{PersistentObject, PersistentValue};
use crate::error::{PobjError, Result};
use crate::logging::{log_event, ObjectEvent};
use crate::transaction::{self, Transaction};
use crate::types::{Field, FieldTag, FieldType, ObjectField, Scalar, ValueField};
use std::sync::Arc;

impl PersistentObject {
    /// Offset of field `index` after checking it exists and has kind `tag`
    pub(crate) fn check(&self, index: usize, tag: FieldTag) -> Result<u64> {
        let ty = self.object_type();
        let field = ty.field(index).ok_or_else(|| PobjError::FieldIndexOutOfBounds {
            type_name: ty.name().to_string(),
            index,
            count: ty.field_count(),
        })?;

        if field.tag() != tag {
            return Err(PobjError::TypeMismatch {
                type_name: ty.name().to_string(),
                index,
                expected: tag.name().to_string(),
                found: field.describe(),
            });
        }

        // Field exists, so its offset does too.
        Ok(ty.offset(index).unwrap_or_default())
    }

    /// Like [`check`](Self::check), rejecting header fields
    fn check_writable(&self, index: usize, tag: FieldTag) -> Result<u64> {
        if index < HEADER_FIELD_COUNT {
            return Err(PobjError::ReservedField { index });
        }
        self.check(index, tag)
    }

    /// Offset of a reference field whose declared target is assignable to the
    /// handle's target
    fn check_object(&self, field: &ObjectField) -> Result<(u64, Option<Arc<str>>)> {
        let offset = self.check(field.index(), FieldTag::Object)?;
        let declared = match self.object_type().field(field.index()) {
            Some(FieldType::Object(target)) => target.clone(),
            _ => None,
        };

        let compatible = match (declared.as_deref(), field.target()) {
            (_, None) => true,
            (Some(declared), Some(requested)) => self
                .context()
                .registry()
                .is_assignable(declared, requested),
            (None, Some(_)) => false,
        };

        if !compatible {
            return Err(PobjError::TypeMismatch {
                type_name: self.type_name().to_string(),
                index: field.index(),
                expected: format!("object<{}>", field.target().unwrap_or("any")),
                found: format!("object<{}>", declared.as_deref().unwrap_or("any")),
            });
        }

        Ok((offset, declared))
    }

    /// Check that `value` may be stored where `target` is declared
    pub(crate) fn check_assignable(
        &self,
        index: usize,
        target: Option<&str>,
        value: &PersistentObject,
    ) -> Result<()> {
        value.ensure_live()?;
        if let Some(target) = target {
            if !self
                .context()
                .registry()
                .is_assignable(value.type_name(), target)
            {
                return Err(PobjError::TypeMismatch {
                    type_name: self.type_name().to_string(),
                    index,
                    expected: format!("object<{}>", target),
                    found: format!("object<{}>", value.type_name()),
                });
            }
        }
        Ok(())
    }

    /// Run a read under the locking protocol
    pub(crate) fn read_locked<R>(self: &Arc<Self>, read: impl FnOnce() -> Result<R>) -> Result<R> {
        if Transaction::is_active() {
            if !transaction::holds_lock(self.address()) {
                transaction::lock_object(self)?;
            }
            self.ensure_live()?;
            return read();
        }

        self.monitor().enter();
        let result = self.ensure_live().and_then(|_| read());
        self.monitor().exit();
        result
    }

    /// Like [`read_locked`](Self::read_locked) but with a bounded wait outside
    /// transactions
    pub(crate) fn read_locked_bounded<R>(
        self: &Arc<Self>,
        read: impl FnOnce() -> Result<R>,
    ) -> Result<R> {
        if Transaction::is_active() {
            return self.read_locked(read);
        }

        let ctx = self.context();
        let bound = ctx.config().blocking_lock_timeout();
        if !self.monitor().try_enter_for(bound) {
            let waited_ms = bound.as_millis() as u64;
            ctx.stats().record_lock_timeout();
            log_event(ObjectEvent::LockTimeout {
                address: self.address(),
                waited_ms,
                in_transaction: false,
            });
            return Err(PobjError::LockTimeout {
                address: self.address(),
                waited_ms,
            });
        }

        let result = self.ensure_live().and_then(|_| read());
        self.monitor().exit();
        result
    }

    /// Run a write in a transaction locking this object
    pub(crate) fn write_locked<R>(
        self: &Arc<Self>,
        mut write: impl FnMut() -> Result<R>,
    ) -> Result<R> {
        Transaction::run(self.context(), &[self], || {
            self.ensure_live()?;
            write()
        })
    }

    // ========================================================================
    // Scalars
    // ========================================================================

    /// Read a scalar field
    ///
    /// ```rust
    /// use pobj::{HeapConfig, PersistentContext, PersistentObject};
    /// use pobj::types::{kind::Double, ObjectType};
    ///
    /// let ctx = PersistentContext::open(HeapConfig::volatile(1 << 20)).unwrap();
    /// let mut b = ObjectType::record("Reading");
    /// let celsius = b.field::<Double>();
    /// let reading = PersistentObject::new(&ctx, &ctx.register_type(b.build()).unwrap()).unwrap();
    ///
    /// reading.set(celsius, -40.25).unwrap();
    /// assert_eq!(reading.get(celsius).unwrap(), -40.25);
    /// ```
    pub fn get<K: Scalar>(self: &Arc<Self>, field: Field<K>) -> Result<K::Value> {
        let offset = self.check(field.index(), K::TAG)?;
        let address = self.address() + offset;
        let heap = self.context().heap();
        self.read_locked(|| Ok(K::decode(&heap.snapshot(address, K::WIDTH)?)))
    }

    /// Write a scalar field
    pub fn set<K: Scalar>(self: &Arc<Self>, field: Field<K>, value: K::Value) -> Result<()> {
        let offset = self.check_writable(field.index(), K::TAG)?;
        let address = self.address() + offset;
        let heap = self.context().heap();
        let bytes = K::encode(value);
        self.write_locked(|| heap.write_bytes(address, &bytes))
    }

    /// Read the scalar field at `index`
    pub fn get_at<K: Scalar>(self: &Arc<Self>, index: usize) -> Result<K::Value> {
        self.get(Field::<K>::at(index))
    }

    /// Write the scalar field at `index`
    pub fn set_at<K: Scalar>(self: &Arc<Self>, index: usize, value: K::Value) -> Result<()> {
        self.set(Field::<K>::at(index), value)
    }

    // ========================================================================
    // Object references
    // ========================================================================

    /// Read a reference field; `None` for null
    pub fn get_object_field(
        self: &Arc<Self>,
        field: &ObjectField,
    ) -> Result<Option<Arc<PersistentObject>>> {
        let (offset, _) = self.check_object(field)?;
        self.load_reference(offset)
    }

    /// Store a reference field
    ///
    /// The new value gains a reference and the old one loses one (and may be
    /// reclaimed), in the same transaction as the write.
    pub fn set_object_field(
        self: &Arc<Self>,
        field: &ObjectField,
        value: Option<&Arc<PersistentObject>>,
    ) -> Result<()> {
        let (offset, declared) = self.check_object(field)?;
        if let Some(value) = value {
            self.check_assignable(field.index(), declared.as_deref(), value)?;
        }
        self.store_reference(offset, value)
    }

    /// Read the address at `offset` and resolve it through the cache
    pub(crate) fn load_reference(
        self: &Arc<Self>,
        offset: u64,
    ) -> Result<Option<Arc<PersistentObject>>> {
        let region = self.region();
        let address = self.read_locked_bounded(|| region.get_address(offset))?;
        if address == 0 {
            return Ok(None);
        }
        self.context().object(address).map(Some)
    }

    /// Replace the reference at `offset`
    ///
    /// Outer transaction on this object reads the old address; a nested one on
    /// the new and old values adjusts both counts and writes the new address.
    pub(crate) fn store_reference(
        self: &Arc<Self>,
        offset: u64,
        value: Option<&Arc<PersistentObject>>,
    ) -> Result<()> {
        let ctx = Arc::clone(self.context());
        let region = self.region();

        self.write_locked(|| {
            let old_address = region.get_address(offset)?;
            let old = if old_address != 0 {
                Some(ctx.object(old_address)?)
            } else {
                None
            };

            let mut to_lock: Vec<&Arc<PersistentObject>> = Vec::with_capacity(2);
            to_lock.extend(value);
            to_lock.extend(old.as_ref());

            Transaction::run(&ctx, &to_lock, || {
                if let Some(value) = value {
                    value.add_reference()?;
                }
                if let Some(old) = &old {
                    old.delete_reference()?;
                }
                region.put_address(offset, value.map_or(0, |v| v.address()))
            })
        })
    }

    // ========================================================================
    // Value fields
    // ========================================================================

    fn check_value(&self, field: &ValueField) -> Result<u64> {
        let offset = self.check(field.index(), FieldTag::Value)?;
        match self.object_type().field(field.index()) {
            Some(FieldType::Value(declared)) if **declared == **field.value_type() => Ok(offset),
            Some(declared) => Err(PobjError::TypeMismatch {
                type_name: self.type_name().to_string(),
                index: field.index(),
                expected: format!("value<{}>", field.value_type().name()),
                found: declared.describe(),
            }),
            None => Err(PobjError::FieldIndexOutOfBounds {
                type_name: self.type_name().to_string(),
                index: field.index(),
                count: self.object_type().field_count(),
            }),
        }
    }

    /// Copy an inline value out into a detached block
    pub fn get_value_field(self: &Arc<Self>, field: &ValueField) -> Result<PersistentValue> {
        let offset = self.check_value(field)?;
        let ty = field.value_type();
        let value = PersistentValue::detached(self.context(), ty)?;
        let src = self.address() + offset;
        let heap = self.context().heap();

        value.monitor().enter();
        let result =
            self.read_locked(|| heap.copy_unlogged(src, value.address(), ty.size() as usize));
        value.monitor().exit();

        result.map(|_| value)
    }

    /// Copy a detached value into the inline field
    pub fn set_value_field(
        self: &Arc<Self>,
        field: &ValueField,
        value: &PersistentValue,
    ) -> Result<()> {
        let offset = self.check_writable(field.index(), FieldTag::Value)?;
        self.check_value(field)?;
        if **value.value_type() != **field.value_type() {
            return Err(PobjError::TypeMismatch {
                type_name: self.type_name().to_string(),
                index: field.index(),
                expected: format!("value<{}>", field.value_type().name()),
                found: format!("value<{}>", value.value_type().name()),
            });
        }

        let dst = self.address() + offset;
        let size = value.value_type().size() as usize;
        let heap = self.context().heap();

        self.write_locked(|| {
            value.monitor().enter();
            let result = heap.copy(value.address(), dst, size);
            value.monitor().exit();
            result
        })
    }
}
