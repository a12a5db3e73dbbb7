//! Object Module - Persistent Objects
//!
//! A `PersistentObject` is the in-process representative of an object block
//! in the persistent heap. Its identity is the block address: the object
//! cache keeps at most one live representative per address, and equality and
//! hashing compare addresses only.
//!
//! Submodules:
//! - `header`: header layout and colours
//! - `access`: type-checked field access and the locking protocol
//! - `refcount`: reference counting, reclamation and residual discharge
//! - `array`: array objects
//! - `value`: detached value blocks

pub mod access;
pub mod array;
pub mod header;
pub mod refcount;
pub mod value;

pub use header::GcColor;
pub use value::PersistentValue;

use crate::context::PersistentContext;
use crate::error::{PobjError, Result};
use crate::heap::{MemoryRegion, RawString};
use crate::sync::{Acquire, Monitor};
use crate::transaction::{self, Transaction};
use crate::types::ObjectType;
use header::{COLOR_OFFSET, DEFAULT_VERSION, REF_COUNT_OFFSET, TYPE_NAME_OFFSET, VERSION_OFFSET};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Transient `(type, address)` pair a representative is built from
#[derive(Debug, Clone)]
pub struct ObjectPointer {
    ty: Arc<ObjectType>,
    address: u64,
}

impl ObjectPointer {
    pub fn new(ty: Arc<ObjectType>, address: u64) -> Self {
        Self { ty, address }
    }

    pub fn object_type(&self) -> &Arc<ObjectType> {
        &self.ty
    }

    pub fn address(&self) -> u64 {
        self.address
    }
}

/// PersistentObject - representative of one heap object
pub struct PersistentObject {
    pointer: ObjectPointer,
    monitor: Monitor,
    ctx: Arc<PersistentContext>,
    /// Set when the object's blocks were released
    freed: AtomicBool,
}

impl PersistentObject {
    /// Construct a fresh record object
    ///
    /// Allocates and zeroes the block, writes the type name, version 99, a
    /// reference count of 1 and colour `Black`, all in one transaction. The
    /// caller owns the initial reference and releases it with
    /// [`delete_reference`](Self::delete_reference).
    pub fn new(ctx: &Arc<PersistentContext>, ty: &Arc<ObjectType>) -> Result<Arc<Self>> {
        if ty.is_array() {
            return Err(PobjError::InvalidArgument(format!(
                "{} is an array type; use new_array",
                ty.name()
            )));
        }

        let ty = ctx.register_type(Arc::clone(ty))?;
        Transaction::run(ctx, &[], || Self::construct(ctx, &ty, ty.size()))
    }

    /// Allocate and initialise an object block of `size` bytes
    ///
    /// Must run inside a transaction.
    pub(crate) fn construct(
        ctx: &Arc<PersistentContext>,
        ty: &Arc<ObjectType>,
        size: u64,
    ) -> Result<Arc<Self>> {
        let heap = ctx.heap();
        let address = heap.allocate(size as usize)?;
        let object = Arc::new(Self::from_pointer(
            ctx,
            ObjectPointer::new(Arc::clone(ty), address),
        ));
        transaction::lock_object(&object)?;

        let name = RawString::write(heap, ty.name())?;
        let region = object.region();
        region.put_address(TYPE_NAME_OFFSET, name.address())?;
        region.put_int(VERSION_OFFSET, DEFAULT_VERSION)?;
        region.put_int(REF_COUNT_OFFSET, 1)?;
        region.put_byte(COLOR_OFFSET, GcColor::Black.to_byte())?;

        ctx.cache().add(&object);
        let weak = Arc::downgrade(&object);
        let abort_ctx = Arc::clone(ctx);
        transaction::on_abort(move || {
            abort_ctx.cache().remove_exact(address, &weak);
        });

        ctx.stats().record_construction();
        Ok(object)
    }

    /// Representative for an existing block; touches nothing in the heap
    pub(crate) fn from_pointer(ctx: &Arc<PersistentContext>, pointer: ObjectPointer) -> Self {
        Self {
            pointer,
            monitor: Monitor::new(),
            ctx: Arc::clone(ctx),
            freed: AtomicBool::new(false),
        }
    }

    /// Heap address, the object's identity
    pub fn address(&self) -> u64 {
        self.pointer.address
    }

    pub fn object_type(&self) -> &Arc<ObjectType> {
        &self.pointer.ty
    }

    pub fn type_name(&self) -> &str {
        self.pointer.ty.name()
    }

    pub fn pointer(&self) -> &ObjectPointer {
        &self.pointer
    }

    pub fn context(&self) -> &Arc<PersistentContext> {
        &self.ctx
    }

    /// Identity comparison
    pub fn is(&self, other: &PersistentObject) -> bool {
        self.address() == other.address()
    }

    /// Whether the object's blocks have been released
    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_freed(&self) {
        self.freed.store(true, Ordering::Release);
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.is_freed() {
            return Err(PobjError::ObjectFreed {
                address: self.address(),
            });
        }
        Ok(())
    }

    pub(crate) fn region(&self) -> MemoryRegion<'_> {
        MemoryRegion::new(self.ctx.heap(), self.address())
    }

    // ========================================================================
    // Monitor
    // ========================================================================

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// Block until the calling thread holds this object's monitor
    pub fn monitor_enter(&self) {
        self.monitor.enter();
    }

    /// Release the monitor once; `false` if the thread does not hold it
    pub fn monitor_exit(&self) -> bool {
        self.monitor.exit()
    }

    /// Timed entry with the thread's adaptive timeout
    pub fn monitor_enter_timeout(&self) -> bool {
        match self.ctx.backoff().acquire(&self.monitor) {
            Acquire::Acquired => {
                self.ctx.stats().record_lock_acquired();
                true
            }
            Acquire::TimedOut { .. } => {
                self.ctx.stats().record_lock_timeout();
                false
            }
        }
    }

    /// Lock every object of `to_lock` in sequence, appending each to `locked`
    ///
    /// With `block == false` each acquisition is timed; on the first timeout
    /// every monitor taken by this batch is released, `locked` is cleared and
    /// `false` is returned.
    pub fn monitor_enter_all(
        to_lock: &[&Arc<PersistentObject>],
        locked: &mut Vec<Arc<PersistentObject>>,
        block: bool,
    ) -> bool {
        for object in to_lock {
            if block {
                object.monitor_enter();
            } else if !object.monitor_enter_timeout() {
                Self::monitor_exit_all(locked);
                return false;
            }
            locked.push(Arc::clone(object));
        }
        true
    }

    /// Release every monitor of a batch, newest first
    pub fn monitor_exit_all(locked: &mut Vec<Arc<PersistentObject>>) {
        while let Some(object) = locked.pop() {
            object.monitor_exit();
        }
    }
}

impl PartialEq for PersistentObject {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for PersistentObject {}

impl Hash for PersistentObject {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address().hash(state);
    }
}

impl fmt::Debug for PersistentObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentObject")
            .field("type", &self.type_name())
            .field("address", &crate::util::format_address(self.address()))
            .field("freed", &self.is_freed())
            .finish()
    }
}
