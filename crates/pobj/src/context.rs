//! Persistent Context - Entry Point of the Object Layer
//!
//! A context owns one mapped heap together with everything needed to hand
//! out objects over it:
//!
//! - the type registry that resolves stored type names
//! - the object cache that keeps one representative per address
//! - the cycle-candidate set handed to an external collector
//! - the adaptive lock backoff and statistics
//!
//! The heap has a single root slot. Objects reachable from the root survive
//! the process when the heap is file-backed.
//!
//! ## Thread Safety
//!
//! `PersistentContext` is shared as `Arc<PersistentContext>`; every operation
//! takes `&self` and synchronises internally.

use crate::cache::ObjectCache;
use crate::collector::CycleCandidates;
use crate::config::HeapConfig;
use crate::error::{PobjError, Result};
use crate::heap::{HeapStats, PersistentHeap};
use crate::logging::{configure_logger, log_event, EventLoggerConfig, ObjectEvent};
use crate::object::PersistentObject;
use crate::stats::ObjectStats;
use crate::sync::{LockBackoff, Monitor};
use crate::transaction::{self, Transaction};
use crate::types::{ObjectType, TypeRegistry, ValueType};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// PersistentContext - heap, registry and caches of one persistent heap
pub struct PersistentContext {
    config: HeapConfig,
    heap: PersistentHeap,
    registry: TypeRegistry,
    cache: ObjectCache,
    candidates: CycleCandidates,
    stats: ObjectStats,
    backoff: LockBackoff,
    /// Guards the root slot
    root_monitor: Monitor,
    closed: AtomicBool,
}

impl PersistentContext {
    /// Open the heap described by `config`
    ///
    /// Without a path an anonymous heap is mapped. A path that does not exist
    /// yet is created and formatted; an existing file is validated and its
    /// contents (root included) are available immediately.
    ///
    /// # Errors
    ///
    /// `Configuration` for invalid settings, `CorruptHeap` for a file that is
    /// not a heap of this layout, `Io` when mapping fails.
    pub fn open(config: HeapConfig) -> Result<Arc<Self>> {
        config.validate()?;

        if config.verbose {
            configure_logger(EventLoggerConfig {
                console: true,
                ..Default::default()
            });
        }

        let (heap, formatted) = match &config.path {
            Some(path) => PersistentHeap::open(path, config.heap_size)?,
            None => (PersistentHeap::anonymous(config.heap_size)?, true),
        };

        let path = config.path.as_ref().map(|p| p.display().to_string());
        let recovery = heap.recovery();
        if let (Some(path), false) = (&path, recovery.is_empty()) {
            log_event(ObjectEvent::JournalRecovered {
                path: path.clone(),
                transactions: recovery.transactions,
                restored_ranges: recovery.restored_ranges,
            });
        }
        log_event(ObjectEvent::HeapOpened {
            path,
            capacity: heap.capacity(),
            formatted,
        });

        Ok(Arc::new(Self {
            backoff: LockBackoff::from_config(&config),
            config,
            heap,
            registry: TypeRegistry::new(),
            cache: ObjectCache::new(),
            candidates: CycleCandidates::new(),
            stats: ObjectStats::new(),
            root_monitor: Monitor::new(),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn heap(&self) -> &PersistentHeap {
        &self.heap
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    /// Objects whose count was decremented but stayed positive
    pub fn candidates(&self) -> &CycleCandidates {
        &self.candidates
    }

    pub fn stats(&self) -> &ObjectStats {
        &self.stats
    }

    pub fn backoff(&self) -> &LockBackoff {
        &self.backoff
    }

    pub(crate) fn root_monitor(&self) -> &Monitor {
        &self.root_monitor
    }

    pub fn heap_stats(&self) -> Result<HeapStats> {
        self.heap.stats()
    }

    // ========================================================================
    // Types
    // ========================================================================

    /// Register an object type; an identical earlier registration is returned
    pub fn register_type(&self, ty: Arc<ObjectType>) -> Result<Arc<ObjectType>> {
        self.registry.register(ty)
    }

    pub fn register_value_type(&self, ty: Arc<ValueType>) -> Result<Arc<ValueType>> {
        self.registry.register_value(ty)
    }

    pub fn type_for_name(&self, name: &str) -> Result<Arc<ObjectType>> {
        self.registry.lookup(name)
    }

    // ========================================================================
    // Objects
    // ========================================================================

    /// Representative of the object at `address`
    ///
    /// Returns the cached representative while one is alive, otherwise
    /// rebuilds it from the stored type name.
    pub fn object(self: &Arc<Self>, address: u64) -> Result<Arc<PersistentObject>> {
        self.ensure_open()?;
        if address == 0 {
            return Err(PobjError::InvalidAddress {
                address,
                reason: "null reference".to_string(),
            });
        }
        self.cache.get_or_reconstruct(self, address)
    }

    /// Run `body` in a transaction with `objects` locked
    pub fn transaction<T, F>(
        self: &Arc<Self>,
        objects: &[&Arc<PersistentObject>],
        body: F,
    ) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        Transaction::run(self, objects, body)
    }

    /// See [`PersistentObject::delete_residual_references`]
    pub fn delete_residual_references(self: &Arc<Self>, address: u64, count: u32) -> Result<()> {
        self.object(address)?.delete_residual_references(count)
    }

    // ========================================================================
    // Root
    // ========================================================================

    /// Object stored in the root slot
    pub fn root(self: &Arc<Self>) -> Result<Option<Arc<PersistentObject>>> {
        self.ensure_open()?;
        let address = if Transaction::is_active() {
            transaction::lock_root(self)?;
            self.heap.root_address()?
        } else {
            let bound = self.config.blocking_lock_timeout();
            if !self.root_monitor.try_enter_for(bound) {
                self.stats.record_lock_timeout();
                return Err(PobjError::LockTimeout {
                    address: 0,
                    waited_ms: bound.as_millis() as u64,
                });
            }
            let address = self.heap.root_address();
            self.root_monitor.exit();
            address?
        };

        if address == 0 {
            return Ok(None);
        }
        self.object(address).map(Some)
    }

    /// Store `object` in the root slot
    ///
    /// The root holds a counted reference: the new root is incremented and
    /// the previous one loses a reference, which reclaims it if nothing else
    /// refers to it.
    pub fn set_root(self: &Arc<Self>, object: Option<&Arc<PersistentObject>>) -> Result<()> {
        let to_lock: Vec<&Arc<PersistentObject>> = object.into_iter().collect();

        Transaction::run(self, &to_lock, || {
            transaction::lock_root(self)?;
            if let Some(object) = object {
                object.ensure_live()?;
            }

            let old_address = self.heap.root_address()?;
            let old = match old_address {
                0 => None,
                address => Some(self.object(address)?),
            };

            if let Some(object) = object {
                object.add_reference()?;
            }
            self.heap
                .set_root_address(object.map_or(0, |object| object.address()))?;
            if let Some(old) = old {
                old.delete_reference()?;
            }
            Ok(())
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Flush the heap and drop every cached representative
    ///
    /// Closing twice is a no-op. Afterwards transactions, object lookups and
    /// root access fail with `InvalidState`; representatives still held by
    /// the caller can only be read.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.heap.flush()?;
        self.cache.clear();
        log_event(ObjectEvent::HeapClosed {
            live_blocks: self.heap.stats()?.live_blocks,
        });
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(PobjError::InvalidState {
                expected: "open context".to_string(),
                actual: "context closed".to_string(),
            });
        }
        Ok(())
    }
}

impl Drop for PersistentContext {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(e) = self.heap.flush() {
                log::warn!("flushing heap on drop failed: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for PersistentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentContext")
            .field("path", &self.heap.path())
            .field("capacity", &self.heap.capacity())
            .field("closed", &self.is_closed())
            .finish()
    }
}
