//! Type registry - name to descriptor table
//!
//! Reconstructing a representative from a bare address needs the descriptor
//! named in the object's header. Every type that may be stored in the heap is
//! registered once at startup.

use super::{ObjectType, ValueType};
use crate::error::{PobjError, Result};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// TypeRegistry - interned type name to descriptor
#[derive(Default)]
pub struct TypeRegistry {
    types: RwLock<FxHashMap<Arc<str>, Arc<ObjectType>>>,
    values: RwLock<FxHashMap<Arc<str>, Arc<ValueType>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object type
    ///
    /// Registering an identical layout again returns the descriptor already
    /// held; a different layout under the same name is a `TypeConflict`.
    pub fn register(&self, ty: Arc<ObjectType>) -> Result<Arc<ObjectType>> {
        let mut types = self.types.write();
        if let Some(existing) = types.get(ty.name()) {
            if **existing == *ty {
                return Ok(Arc::clone(existing));
            }
            return Err(PobjError::TypeConflict {
                name: ty.name().to_string(),
            });
        }

        types.insert(Arc::from(ty.name()), Arc::clone(&ty));
        Ok(ty)
    }

    /// Register a value type under the same rules as object types
    pub fn register_value(&self, ty: Arc<ValueType>) -> Result<Arc<ValueType>> {
        let mut values = self.values.write();
        if let Some(existing) = values.get(ty.name()) {
            if **existing == *ty {
                return Ok(Arc::clone(existing));
            }
            return Err(PobjError::TypeConflict {
                name: ty.name().to_string(),
            });
        }

        values.insert(Arc::from(ty.name()), Arc::clone(&ty));
        Ok(ty)
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<ObjectType>> {
        self.types
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| PobjError::UnknownType(name.to_string()))
    }

    pub fn lookup_value(&self, name: &str) -> Result<Arc<ValueType>> {
        self.values
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| PobjError::UnknownType(name.to_string()))
    }

    /// Whether an object of type `from` may be stored where `to` is expected
    ///
    /// Walks parent links; a parent that is not registered ends the walk.
    pub fn is_assignable(&self, from: &str, to: &str) -> bool {
        let types = self.types.read();
        let mut current: Option<&str> = Some(from);
        let mut hops = 0;

        while let Some(name) = current {
            if name == to {
                return true;
            }
            // A parent cycle is a registration mistake; stop instead of spinning.
            hops += 1;
            if hops > types.len() {
                return false;
            }
            current = types.get(name).and_then(|ty| ty.parent());
        }

        false
    }

    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.read().is_empty()
    }
}
