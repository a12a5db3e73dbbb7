//! Reference counting and reclamation
//!
//! Counts live in the object header and change only inside transactions.
//! When a count reaches zero the object is reclaimed with an explicit
//! worklist, so arbitrarily long chains never recurse:
//!
//! ```text
//! push(obj)
//! while let Some(o) = pop():
//!     for child in children(o):
//!         if child already scheduled: skip
//!         dec(child) == 0 ? push(child) : add_candidate(child)
//!     free(o)
//! ```
//!
//! Objects whose count stays positive after a decrement become cycle
//! candidates; an external collector may later discharge their internal
//! references with [`PersistentObject::delete_residual_references`].

use super::header::{GcColor, COLOR_OFFSET, REF_COUNT_OFFSET, TYPE_NAME_OFFSET, VERSION_OFFSET};
use super::PersistentObject;
use crate::context::PersistentContext;
use crate::error::{invariant_violation, PobjError, Result};
use crate::heap::RawString;
use crate::logging::{log_event, ObjectEvent};
use crate::transaction::{self, Transaction};
use crate::types::{FieldType, TypeKind, ARRAY_LENGTH_OFFSET};
use rustc_hash::FxHashSet;
use std::sync::Arc;

impl PersistentObject {
    /// Current reference count
    pub fn ref_count(self: &Arc<Self>) -> Result<i32> {
        let region = self.region();
        self.read_locked(|| region.get_int(REF_COUNT_OFFSET))
    }

    pub fn color(self: &Arc<Self>) -> Result<GcColor> {
        let region = self.region();
        let byte = self.read_locked(|| region.get_byte(COLOR_OFFSET))?;
        GcColor::from_byte(byte).ok_or_else(|| {
            PobjError::CorruptHeap(format!(
                "object {} has colour byte {}",
                crate::util::format_address(self.address()),
                byte
            ))
        })
    }

    /// Store a colour; used by the external cycle collector
    pub fn set_color(self: &Arc<Self>, color: GcColor) -> Result<()> {
        let region = self.region();
        self.write_locked(|| region.put_byte(COLOR_OFFSET, color.to_byte()))
    }

    pub fn version(self: &Arc<Self>) -> Result<i32> {
        let region = self.region();
        self.read_locked(|| region.get_int(VERSION_OFFSET))
    }

    /// Type name as written in the heap
    pub fn stored_type_name(self: &Arc<Self>) -> Result<String> {
        let region = self.region();
        let heap = self.context().heap();
        self.read_locked(|| RawString::at(region.get_address(TYPE_NAME_OFFSET)?).read(heap))
    }

    /// Increment the count; returns the new count
    pub fn inc_ref_count(self: &Arc<Self>) -> Result<i32> {
        self.write_locked(|| self.adjust_ref_count(1))
    }

    /// Decrement the count without reclaiming; returns the new count
    ///
    /// A decrement below zero is an invariant violation.
    pub fn dec_ref_count(self: &Arc<Self>) -> Result<i32> {
        self.write_locked(|| self.adjust_ref_count(-1))
    }

    /// Add `delta` to the count; the lock must be held by the transaction
    fn adjust_ref_count(&self, delta: i32) -> Result<i32> {
        let region = self.region();
        let count = region.get_int(REF_COUNT_OFFSET)?;
        let next = match count.checked_add(delta) {
            Some(next) if next >= 0 => next,
            _ => invariant_violation(
                self.context().config().invariant_policy,
                self.address(),
                format!("reference count {} adjusted by {}", count, delta),
            ),
        };
        region.put_int(REF_COUNT_OFFSET, next)?;
        Ok(next)
    }

    /// Acknowledge a new incoming reference: increment and colour `Black`
    pub fn add_reference(self: &Arc<Self>) -> Result<()> {
        let region = self.region();
        self.write_locked(|| {
            self.adjust_ref_count(1)?;
            region.put_byte(COLOR_OFFSET, GcColor::Black.to_byte())
        })
    }

    /// Drop one reference, reclaiming the object and everything only it kept
    /// alive when the count reaches zero
    pub fn delete_reference(self: &Arc<Self>) -> Result<()> {
        let ctx = Arc::clone(self.context());
        self.write_locked(|| {
            if self.adjust_ref_count(-1)? > 0 {
                self.schedule_candidate();
                return Ok(());
            }
            reclaim(&ctx, self)
        })
    }

    /// Discharge `count` references that come from inside an orphaned cycle
    ///
    /// Decrements `count - 1` times, then performs one
    /// [`delete_reference`](Self::delete_reference). Finding fewer than
    /// `count` references is an invariant violation.
    pub fn delete_residual_references(self: &Arc<Self>, count: u32) -> Result<()> {
        if count == 0 {
            return Err(PobjError::InvalidArgument(
                "residual reference count must be at least 1".to_string(),
            ));
        }

        let ctx = Arc::clone(self.context());
        let region = self.region();
        let address = self.address();

        self.write_locked(|| {
            let current = region.get_int(REF_COUNT_OFFSET)?;
            if i64::from(current) < i64::from(count) {
                invariant_violation(
                    ctx.config().invariant_policy,
                    address,
                    format!(
                        "discharging {} residual references from a count of {}",
                        count, current
                    ),
                );
            }

            for _ in 1..count {
                self.adjust_ref_count(-1)?;
            }
            transaction::on_commit(move || {
                log_event(ObjectEvent::ResidualDischarge { address, count });
            });
            self.delete_reference()
        })
    }

    /// Register this object as a cycle candidate when the transaction commits
    fn schedule_candidate(&self) {
        let ctx = Arc::clone(self.context());
        let address = self.address();
        transaction::on_commit(move || {
            if ctx.candidates().add_candidate(address) {
                log_event(ObjectEvent::CandidateAdded { address });
            }
        });
    }

    /// Addresses of the objects this one references
    ///
    /// The layout is taken from the type named in the header. The lock must be
    /// held by the transaction.
    fn child_addresses(&self) -> Result<Vec<u64>> {
        let ctx = self.context();
        let region = self.region();
        let name = RawString::at(region.get_address(TYPE_NAME_OFFSET)?).read(ctx.heap())?;
        let ty = ctx.type_for_name(&name)?;

        let offsets: Vec<u64> = match ty.kind() {
            TypeKind::Array {
                element: FieldType::Object(_),
            } => {
                let length = region.get_int(ARRAY_LENGTH_OFFSET)?.max(0) as usize;
                (0..length).filter_map(|i| ty.element_offset(i)).collect()
            }
            TypeKind::Array { .. } => Vec::new(),
            TypeKind::Record => ty
                .object_field_indices()
                .filter_map(|index| ty.offset(index))
                .collect(),
        };

        let mut children = Vec::with_capacity(offsets.len());
        for offset in offsets {
            let child = region.get_address(offset)?;
            if child != 0 {
                children.push(child);
            }
        }
        Ok(children)
    }

    /// Release the object block and its type-name block at commit
    fn free(self: &Arc<Self>) -> Result<()> {
        let ctx = Arc::clone(self.context());
        let heap = ctx.heap();
        let name_address = self.region().get_address(TYPE_NAME_OFFSET)?;
        heap.free(name_address)?;
        heap.free(self.address())?;

        let object = Arc::clone(self);
        transaction::on_commit(move || {
            let address = object.address();
            ctx.cache().remove_exact(address, &Arc::downgrade(&object));
            object.mark_freed();
            ctx.candidates().remove_from_candidates(address);
            ctx.stats().record_free();
            log_event(ObjectEvent::ObjectFreed {
                address,
                type_name: object.type_name().to_string(),
            });
        });
        Ok(())
    }
}

/// Worklist reclamation starting at `root`, whose count just reached zero
fn reclaim(ctx: &Arc<PersistentContext>, root: &Arc<PersistentObject>) -> Result<()> {
    let mut scheduled: FxHashSet<u64> = FxHashSet::default();
    scheduled.insert(root.address());
    let mut worklist = vec![Arc::clone(root)];

    while let Some(object) = worklist.pop() {
        for child_address in object.child_addresses()? {
            if scheduled.contains(&child_address) {
                continue;
            }

            let child = ctx.object(child_address)?;
            let remaining = Transaction::run(ctx, &[&child], || child.adjust_ref_count(-1))?;
            if remaining == 0 {
                scheduled.insert(child_address);
                worklist.push(child);
            } else {
                child.schedule_candidate();
            }
        }
        object.free()?;
    }

    Ok(())
}
