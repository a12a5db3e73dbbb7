//! Detached value blocks
//!
//! Reading a value-type field copies the inline block into a freshly
//! allocated block outside any transaction. The copy has its own monitor, is
//! read and written without logging, and is released when dropped.

use crate::context::PersistentContext;
use crate::error::{PobjError, Result};
use crate::sync::Monitor;
use crate::types::{Field, FieldTag, Scalar, ValueType};
use std::fmt;
use std::sync::Arc;

/// PersistentValue - detached copy of an inline value
pub struct PersistentValue {
    ty: Arc<ValueType>,
    address: u64,
    ctx: Arc<PersistentContext>,
    monitor: Monitor,
}

impl PersistentValue {
    /// Allocate a zeroed detached block for `ty`
    pub fn detached(ctx: &Arc<PersistentContext>, ty: &Arc<ValueType>) -> Result<Self> {
        let address = ctx.heap().allocate_detached(ty.size() as usize)?;
        Ok(Self {
            ty: Arc::clone(ty),
            address,
            ctx: Arc::clone(ctx),
            monitor: Monitor::new(),
        })
    }

    pub fn value_type(&self) -> &Arc<ValueType> {
        &self.ty
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    fn check(&self, index: usize, tag: FieldTag) -> Result<u64> {
        let field = self.ty.field(index).ok_or_else(|| PobjError::FieldIndexOutOfBounds {
            type_name: self.ty.name().to_string(),
            index,
            count: self.ty.field_count(),
        })?;
        if field.tag() != tag {
            return Err(PobjError::TypeMismatch {
                type_name: self.ty.name().to_string(),
                index,
                expected: tag.name().to_string(),
                found: field.describe(),
            });
        }
        Ok(self.ty.offset(index).unwrap_or_default())
    }

    /// Read a scalar field of the copy
    pub fn get<K: Scalar>(&self, field: Field<K>) -> Result<K::Value> {
        let offset = self.check(field.index(), K::TAG)?;
        let heap = self.ctx.heap();

        self.monitor.enter();
        let result = heap.snapshot(self.address + offset, K::WIDTH);
        self.monitor.exit();

        Ok(K::decode(&result?))
    }

    /// Write a scalar field of the copy (unlogged)
    pub fn set<K: Scalar>(&self, field: Field<K>, value: K::Value) -> Result<()> {
        let offset = self.check(field.index(), K::TAG)?;
        let heap = self.ctx.heap();

        self.monitor.enter();
        let result = heap.write_bytes_unlogged(self.address + offset, &K::encode(value));
        self.monitor.exit();
        result
    }
}

impl Drop for PersistentValue {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.heap().free_detached(self.address) {
            log::error!(
                "failed to release value block {}: {}",
                crate::util::format_address(self.address),
                e
            );
        }
    }
}

impl fmt::Debug for PersistentValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentValue")
            .field("type", &self.ty.name())
            .field("address", &crate::util::format_address(self.address))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::object::PersistentObject;
    use crate::types::kind::{Float, Int};
    use crate::types::ObjectType;

    #[test]
    fn test_copy_semantics() {
        let ctx = PersistentContext::open(HeapConfig::volatile(1 << 20)).unwrap();
        let mut vb = ValueType::builder("Point");
        let x = vb.field::<Int>();
        let y = vb.field::<Float>();
        let point = vb.build();

        let mut b = ObjectType::record("Marker");
        let position = b.value_field(&point);
        let marker = PersistentObject::new(&ctx, &ctx.register_type(b.build()).unwrap()).unwrap();

        let value = marker.get_value_field(&position).unwrap();
        value.set(x, 3).unwrap();
        value.set(y, 1.5).unwrap();
        assert_eq!(marker.get_value_field(&position).unwrap().get(x).unwrap(), 0);

        marker.set_value_field(&position, &value).unwrap();
        value.set(x, 100).unwrap();

        let stored = marker.get_value_field(&position).unwrap();
        assert_eq!(stored.get(x).unwrap(), 3);
        assert_eq!(stored.get(y).unwrap(), 1.5);
    }

    #[test]
    fn test_drop_releases_block() {
        let ctx = PersistentContext::open(HeapConfig::volatile(1 << 20)).unwrap();
        let mut vb = ValueType::builder("Pair");
        vb.field::<Int>();
        let pair = vb.build();

        let before = ctx.heap_stats().unwrap().live_blocks;
        let value = PersistentValue::detached(&ctx, &pair).unwrap();
        assert_eq!(ctx.heap_stats().unwrap().live_blocks, before + 1);
        drop(value);
        assert_eq!(ctx.heap_stats().unwrap().live_blocks, before);
    }
}
