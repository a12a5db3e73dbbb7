//! Object Cache - One Representative per Heap Address
//!
//! Maps heap addresses to weak handles of their in-memory representatives so
//! that every thread asking for the same address gets the same
//! `PersistentObject` (and therefore the same monitor) while any strong
//! handle is alive. Dead entries are dropped lazily on lookup and in periodic
//! prunes.

use crate::context::PersistentContext;
use crate::error::{PobjError, Result};
use crate::heap::RawString;
use crate::object::header::TYPE_NAME_OFFSET;
use crate::object::{ObjectPointer, PersistentObject};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Weak};

/// Insertions between automatic prunes of dead entries
const PRUNE_INTERVAL: usize = 1024;

struct CacheInner {
    entries: FxHashMap<u64, Weak<PersistentObject>>,
    inserts_since_prune: usize,
}

impl CacheInner {
    fn insert(&mut self, address: u64, object: &Arc<PersistentObject>) {
        self.entries.insert(address, Arc::downgrade(object));
        self.inserts_since_prune += 1;
        if self.inserts_since_prune >= PRUNE_INTERVAL {
            self.prune();
        }
    }

    fn prune(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, weak| weak.strong_count() > 0);
        self.inserts_since_prune = 0;
        before - self.entries.len()
    }
}

/// ObjectCache - address to representative map
pub struct ObjectCache {
    inner: Mutex<CacheInner>,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: FxHashMap::default(),
                inserts_since_prune: 0,
            }),
        }
    }

    /// Register a freshly constructed representative
    pub fn add(&self, object: &Arc<PersistentObject>) {
        self.inner.lock().insert(object.address(), object);
    }

    /// Live representative of `address`, if one is cached
    pub fn get(&self, address: u64) -> Option<Arc<PersistentObject>> {
        let inner = self.inner.lock();
        inner.entries.get(&address).and_then(Weak::upgrade)
    }

    /// Representative of `address`, rebuilding it from the header if needed
    ///
    /// Reconstruction reads the stored type name, resolves it through the
    /// registry and inserts the new representative, all under the cache lock
    /// so concurrent callers agree on one instance.
    pub fn get_or_reconstruct(
        &self,
        ctx: &Arc<PersistentContext>,
        address: u64,
    ) -> Result<Arc<PersistentObject>> {
        let mut inner = self.inner.lock();
        if let Some(object) = inner.entries.get(&address).and_then(Weak::upgrade) {
            return Ok(object);
        }

        let heap = ctx.heap();
        heap.check_allocated(address)?;
        let name_address = heap.read_u64(address + TYPE_NAME_OFFSET)?;
        if name_address == 0 || !heap.is_allocated(name_address) {
            return Err(PobjError::InvalidAddress {
                address,
                reason: "block does not hold an object header".to_string(),
            });
        }

        let type_name = RawString::at(name_address).read(heap)?;
        let ty = ctx.type_for_name(&type_name)?;
        let object = Arc::new(PersistentObject::from_pointer(
            ctx,
            ObjectPointer::new(ty, address),
        ));

        inner.insert(address, &object);
        ctx.stats().record_reconstruction();
        Ok(object)
    }

    /// Drop the entry for `address`
    pub fn remove(&self, address: u64) -> bool {
        self.inner.lock().entries.remove(&address).is_some()
    }

    /// Drop the entry for `address` only if it still refers to `expected`
    pub fn remove_exact(&self, address: u64, expected: &Weak<PersistentObject>) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get(&address) {
            Some(current) if Weak::ptr_eq(current, expected) => {
                inner.entries.remove(&address);
                true
            }
            _ => false,
        }
    }

    /// Number of entries, dead ones included
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove entries whose representative is gone; returns how many
    pub fn prune(&self) -> usize {
        self.inner.lock().prune()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.inserts_since_prune = 0;
    }
}

impl Default for ObjectCache {
    fn default() -> Self {
        Self::new()
    }
}
