//! Transaction Module - Undo-Logged Transactions with Retry
//!
//! A transaction runs a body with a set of objects locked. Every heap write
//! made by the body is undo-logged; when an object lock cannot be taken within
//! the thread's adaptive timeout the attempt rolls back and the body runs
//! again.
//!
//! Transaction Lifecycle:
//! ```text
//! Inactive ──run──▶ Active ──Ok──▶ Committing ──▶ Inactive
//!                     │  ▲
//!                     │  └── RetryRequested: rollback, next attempt
//!                     └──Err / panic──▶ Aborting ──▶ Inactive
//! ```
//!
//! Composition is flat: a transaction started while another is active on the
//! thread only locks its objects and runs its body; the outermost transaction
//! commits or rolls back everything.
//!
//! On a file-backed heap with `flush_on_commit` set, every before-image is
//! also appended to the heap's [`Journal`](crate::heap::Journal) and synced
//! before the range is overwritten, so a crash at any point leaves the image
//! recoverable to the state before the attempt. Ranges inside blocks the
//! attempt allocated are not journaled; recovery releases those blocks.
//!
//! Commit order:
//! 1. commit hooks (cache evictions, candidate updates, freed markers)
//! 2. flush of every written range when `flush_on_commit` is set
//! 3. journal commit record
//! 4. deferred frees
//! 5. lock release
//!
//! Rollback order:
//! 1. undo log, newest first
//! 2. flush of the restored ranges and journal abort record
//! 3. abort hooks (evicting representatives created by the attempt)
//! 4. release of blocks allocated by the attempt
//! 5. lock release

pub mod undo;

pub use undo::{UndoLog, UndoRecord};

use crate::context::PersistentContext;
use crate::error::{PobjError, Result};
use crate::logging::{log_event, ObjectEvent};
use crate::object::PersistentObject;
use crate::sync::Acquire;
use indexmap::IndexMap;
use rustc_hash::FxHashSet;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

thread_local! {
    static CURRENT: RefCell<Option<TransactionInfo>> = const { RefCell::new(None) };
}

type Hook = Box<dyn FnOnce()>;

/// State of the calling thread's transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Inactive,
    Active,
    Committing,
    Aborting,
}

/// Per-thread bookkeeping of the active transaction attempt
struct TransactionInfo {
    ctx: Arc<PersistentContext>,
    state: TransactionState,
    /// Nested `run` calls currently executing inside the outermost one
    depth: u32,
    /// 1-based attempt number of the outermost transaction
    attempt: u32,
    undo: UndoLog,
    /// Blocks allocated by this attempt: address to end of the requested size
    allocated: BTreeMap<u64, u64>,
    /// Journal identity, assigned on the first journaled record
    txid: Option<u64>,
    /// Whether before-images go to the heap journal
    journaling: bool,
    /// Ranges already journaled by this attempt
    journaled: FxHashSet<(u64, usize)>,
    deferred_frees: Vec<u64>,
    on_commit: Vec<Hook>,
    on_abort: Vec<Hook>,
    /// Objects locked by this attempt, in acquisition order
    locked: IndexMap<u64, Arc<PersistentObject>>,
    /// Whether this attempt holds the root slot monitor
    root_locked: bool,
}

impl TransactionInfo {
    fn new(ctx: Arc<PersistentContext>, attempt: u32) -> Self {
        let journaling = ctx.config().flush_on_commit && ctx.heap().journal().is_some();
        Self {
            ctx,
            state: TransactionState::Active,
            depth: 0,
            attempt,
            undo: UndoLog::new(),
            allocated: BTreeMap::new(),
            txid: None,
            journaling,
            journaled: FxHashSet::default(),
            deferred_frees: Vec::new(),
            on_commit: Vec::new(),
            on_abort: Vec::new(),
            locked: IndexMap::new(),
            root_locked: false,
        }
    }

    fn heap_id(&self) -> u64 {
        self.ctx.heap().id()
    }

    /// Whether `[address, address + len)` lies in a block this attempt allocated
    fn in_own_allocation(&self, address: u64, len: usize) -> bool {
        self.allocated
            .range(..=address)
            .next_back()
            .map_or(false, |(_, &end)| address + len as u64 <= end)
    }

    /// Journal the before-image of a range about to be overwritten
    fn journal_undo(&mut self, address: u64, old: &[u8]) -> Result<()> {
        if !self.journaling
            || self.in_own_allocation(address, old.len())
            || self.journaled.contains(&(address, old.len()))
        {
            return Ok(());
        }

        let ctx = Arc::clone(&self.ctx);
        let Some(journal) = ctx.heap().journal() else {
            return Ok(());
        };
        let txid = *self.txid.get_or_insert_with(|| journal.begin());
        journal.record_undo(txid, address, old)?;
        self.journaled.insert((address, old.len()));
        Ok(())
    }

    fn journal_alloc(&mut self, address: u64) -> Result<()> {
        if !self.journaling {
            return Ok(());
        }

        let ctx = Arc::clone(&self.ctx);
        let Some(journal) = ctx.heap().journal() else {
            return Ok(());
        };
        let txid = *self.txid.get_or_insert_with(|| journal.begin());
        journal.record_alloc(txid, address)
    }

    /// Write the finish record of this attempt, if it journaled anything
    fn finish_journal(&mut self, committed: bool) -> Result<()> {
        let Some(txid) = self.txid.take() else {
            return Ok(());
        };
        match self.ctx.heap().journal() {
            Some(journal) => journal.finish(txid, committed),
            None => Ok(()),
        }
    }

    fn release_locks(&mut self) {
        for (_, object) in std::mem::take(&mut self.locked).into_iter().rev() {
            object.monitor().exit();
        }
        if std::mem::take(&mut self.root_locked) {
            self.ctx.root_monitor().exit();
        }
    }

    fn commit(mut self) -> Result<()> {
        self.state = TransactionState::Committing;
        let ctx = Arc::clone(&self.ctx);
        let heap = ctx.heap();

        for hook in self.on_commit.drain(..) {
            hook();
        }

        let mut first_error = None;
        if ctx.config().flush_on_commit && heap.path().is_some() {
            let flushes = self
                .undo
                .ranges()
                .map(|(address, len)| heap.flush_range(address, len))
                .chain(self.allocated.keys().map(|&address| heap.flush_block(address)))
                .chain(std::iter::once(heap.flush_superblock()));
            for result in flushes {
                if let Err(e) = result {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Err(e) = self.finish_journal(true) {
            log::error!("writing journal commit record failed: {}", e);
            first_error.get_or_insert(e);
        }

        for address in self.deferred_frees.drain(..) {
            if let Err(e) = heap.free_detached(address) {
                log::error!(
                    "deferred free of {} failed: {}",
                    crate::util::format_address(address),
                    e
                );
                first_error.get_or_insert(e);
            }
        }

        self.release_locks();
        ctx.stats().record_commit();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn rollback(mut self) {
        self.state = TransactionState::Aborting;
        let ctx = Arc::clone(&self.ctx);
        let heap = ctx.heap();

        let undo = std::mem::take(&mut self.undo);
        let restored: Vec<(u64, usize)> = if self.txid.is_some() {
            undo.ranges().collect()
        } else {
            Vec::new()
        };
        undo.rollback(heap);

        for (address, len) in restored {
            if let Err(e) = heap.flush_range(address, len) {
                log::error!(
                    "flushing restored range at {} failed: {}",
                    crate::util::format_address(address),
                    e
                );
            }
        }
        if let Err(e) = self.finish_journal(false) {
            log::error!("writing journal abort record failed: {}", e);
        }

        self.on_commit.clear();
        self.deferred_frees.clear();
        for hook in self.on_abort.drain(..) {
            hook();
        }

        for address in std::mem::take(&mut self.allocated).into_keys() {
            if let Err(e) = heap.free_detached(address) {
                log::error!(
                    "releasing {} on rollback failed: {}",
                    crate::util::format_address(address),
                    e
                );
            }
        }

        self.release_locks();
    }
}

/// Rolls back the attempt if the body unwinds
struct AttemptGuard;

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if let Some(info) = take_current() {
            info.rollback();
        }
    }
}

fn take_current() -> Option<TransactionInfo> {
    CURRENT.with(|current| current.borrow_mut().take())
}

fn with_current<R>(f: impl FnOnce(Option<&mut TransactionInfo>) -> R) -> R {
    CURRENT.with(|current| f(current.borrow_mut().as_mut()))
}

/// Transaction driver
///
/// # Examples
///
/// ```rust
/// use pobj::{HeapConfig, PersistentContext, PersistentObject, Transaction};
/// use pobj::types::{kind::Long, ObjectType};
///
/// let ctx = PersistentContext::open(HeapConfig::volatile(1 << 20)).unwrap();
/// let mut b = ObjectType::record("Counter");
/// let value = b.field::<Long>();
/// let counter_type = ctx.register_type(b.build()).unwrap();
///
/// let counter = PersistentObject::new(&ctx, &counter_type).unwrap();
/// Transaction::run(&ctx, &[&counter], || {
///     let n = counter.get(value)?;
///     counter.set(value, n + 1)
/// })
/// .unwrap();
///
/// assert_eq!(counter.get(value).unwrap(), 1);
/// ```
pub struct Transaction;

impl Transaction {
    /// Run `body` with `objects` locked
    ///
    /// Outermost calls retry the body whenever it fails with
    /// `RetryRequested`; any other error rolls the attempt back and is
    /// returned. A closed context refuses with `InvalidState`. The body may run several times and must not have effects
    /// outside the heap that cannot be repeated.
    pub fn run<T, F>(
        ctx: &Arc<PersistentContext>,
        objects: &[&Arc<PersistentObject>],
        mut body: F,
    ) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        ctx.ensure_open()?;
        let nested = with_current(|info| match info {
            Some(info) if info.heap_id() == ctx.heap().id() => {
                info.depth += 1;
                Ok(true)
            }
            Some(_) => Err(PobjError::InvalidState {
                expected: "transaction on this context".to_string(),
                actual: "transaction active on another context".to_string(),
            }),
            None => Ok(false),
        })?;

        if nested {
            let result = Self::lock_all(objects).and_then(|_| body());
            with_current(|info| {
                if let Some(info) = info {
                    info.depth -= 1;
                }
            });
            return result;
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            CURRENT.with(|current| {
                *current.borrow_mut() = Some(TransactionInfo::new(Arc::clone(ctx), attempt));
            });
            let guard = AttemptGuard;

            let result = Self::lock_all(objects).and_then(|_| body());
            let info = take_current();
            drop(guard);
            let Some(info) = info else {
                return Err(PobjError::InvalidState {
                    expected: "active transaction".to_string(),
                    actual: "transaction state lost".to_string(),
                });
            };

            match result {
                Ok(value) => {
                    info.commit()?;
                    return Ok(value);
                }
                Err(PobjError::RetryRequested { address, .. }) => {
                    info.rollback();
                    ctx.stats().record_retry();
                    log_event(ObjectEvent::TransactionRetry { attempt, address });

                    if let Some(max) = ctx.config().max_transaction_retries {
                        if attempt >= max {
                            ctx.stats().record_abort();
                            log_event(ObjectEvent::RetriesExhausted { attempts: attempt });
                            return Err(PobjError::RetriesExhausted { attempts: attempt });
                        }
                    }
                }
                Err(e) => {
                    info.rollback();
                    ctx.stats().record_abort();
                    return Err(e);
                }
            }
        }
    }

    fn lock_all(objects: &[&Arc<PersistentObject>]) -> Result<()> {
        for object in objects {
            lock_object(object)?;
        }
        Ok(())
    }

    /// Whether a transaction is active on the calling thread
    pub fn is_active() -> bool {
        with_current(|info| info.is_some())
    }

    pub fn state() -> TransactionState {
        with_current(|info| info.map_or(TransactionState::Inactive, |info| info.state))
    }

    /// Attempt number of the active transaction (0 when inactive)
    pub fn attempts() -> u32 {
        with_current(|info| info.map_or(0, |info| info.attempt))
    }

    /// Nesting depth below the outermost transaction (0 when inactive)
    pub fn depth() -> u32 {
        with_current(|info| info.map_or(0, |info| info.depth))
    }
}

// ============================================================================
// Hooks used by the heap and object layers
// ============================================================================

/// Lock `object` for the active transaction using the timed protocol
///
/// Objects already locked by the transaction are not entered again. A timeout
/// yields `RetryRequested`.
pub(crate) fn lock_object(object: &Arc<PersistentObject>) -> Result<()> {
    let address = object.address();
    let active = with_current(|info| info.map(|info| info.locked.contains_key(&address)));
    match active {
        None => {
            return Err(PobjError::InvalidState {
                expected: "active transaction".to_string(),
                actual: "no transaction".to_string(),
            })
        }
        Some(true) => return Ok(()),
        Some(false) => {}
    }

    let ctx = object.context();
    match ctx.backoff().acquire(object.monitor()) {
        Acquire::Acquired => {
            ctx.stats().record_lock_acquired();
            with_current(|info| {
                if let Some(info) = info {
                    info.locked.insert(address, Arc::clone(object));
                }
            });
            Ok(())
        }
        Acquire::TimedOut { waited } => {
            ctx.stats().record_lock_timeout();
            log_event(ObjectEvent::LockTimeout {
                address,
                waited_ms: waited.as_millis() as u64,
                in_transaction: true,
            });
            Err(PobjError::RetryRequested {
                address,
                waited_ms: waited.as_millis() as u64,
            })
        }
    }
}

/// Lock the root slot of `ctx` for the active transaction
pub(crate) fn lock_root(ctx: &Arc<PersistentContext>) -> Result<()> {
    let held = with_current(|info| info.map(|info| info.root_locked));
    match held {
        None => {
            return Err(PobjError::InvalidState {
                expected: "active transaction".to_string(),
                actual: "no transaction".to_string(),
            })
        }
        Some(true) => return Ok(()),
        Some(false) => {}
    }

    match ctx.backoff().acquire(ctx.root_monitor()) {
        Acquire::Acquired => {
            with_current(|info| {
                if let Some(info) = info {
                    info.root_locked = true;
                }
            });
            Ok(())
        }
        Acquire::TimedOut { waited } => {
            ctx.stats().record_lock_timeout();
            Err(PobjError::RetryRequested {
                address: 0,
                waited_ms: waited.as_millis() as u64,
            })
        }
    }
}

/// Whether the active transaction holds the lock of `address`
pub(crate) fn holds_lock(address: u64) -> bool {
    with_current(|info| info.map_or(false, |info| info.locked.contains_key(&address)))
}

/// Run `hook` when the active transaction commits, or now if none is active
pub(crate) fn on_commit(hook: impl FnOnce() + 'static) {
    let pending = with_current(|info| match info {
        Some(info) => {
            info.on_commit.push(Box::new(hook));
            None
        }
        None => Some(hook),
    });
    if let Some(hook) = pending {
        hook();
    }
}

/// Run `hook` if the active transaction rolls back
pub(crate) fn on_abort(hook: impl FnOnce() + 'static) {
    with_current(|info| {
        if let Some(info) = info {
            info.on_abort.push(Box::new(hook));
        }
    });
}

/// Record the before-image of a write about to happen on heap `heap_id`
pub(crate) fn log_write(
    heap_id: u64,
    address: u64,
    len: usize,
    capture: impl FnOnce() -> Result<Vec<u8>>,
) -> Result<()> {
    with_current(|info| match info {
        None => Ok(()),
        Some(info) if info.heap_id() != heap_id => Err(PobjError::InvalidState {
            expected: "write to the transaction's heap".to_string(),
            actual: format!(
                "write of {} bytes at {} to another heap",
                len,
                crate::util::format_address(address)
            ),
        }),
        Some(info) => {
            let old = capture()?;
            info.journal_undo(address, &old)?;
            info.undo.push(address, old);
            Ok(())
        }
    })
}

/// Remember a block of `size` bytes allocated by the active attempt on heap `heap_id`
pub(crate) fn track_allocation(heap_id: u64, address: u64, size: usize) -> Result<()> {
    with_current(|info| match info {
        Some(info) if info.heap_id() == heap_id => {
            info.journal_alloc(address)?;
            info.allocated.insert(address, address + size as u64);
            Ok(())
        }
        _ => Ok(()),
    })
}

/// Defer a free to commit; returns `false` if no transaction on `heap_id` is active
pub(crate) fn defer_free(heap_id: u64, address: u64) -> bool {
    with_current(|info| match info {
        Some(info) if info.heap_id() == heap_id => {
            info.deferred_frees.push(address);
            true
        }
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::types::{kind::Long, ObjectType};

    fn setup() -> (Arc<PersistentContext>, Arc<crate::types::ObjectType>) {
        let ctx = PersistentContext::open(HeapConfig::volatile(1 << 20)).unwrap();
        let mut b = ObjectType::record("Cell");
        b.field::<Long>();
        let ty = ctx.register_type(b.build()).unwrap();
        (ctx, ty)
    }

    #[test]
    fn test_inactive_outside_run() {
        assert!(!Transaction::is_active());
        assert_eq!(Transaction::state(), TransactionState::Inactive);
        assert_eq!(Transaction::attempts(), 0);
    }

    #[test]
    fn test_error_rolls_back_writes() {
        let (ctx, ty) = setup();
        let cell = PersistentObject::new(&ctx, &ty).unwrap();
        let value = crate::types::Field::<Long>::at(4);

        let result: Result<()> = Transaction::run(&ctx, &[&cell], || {
            cell.set(value, 7)?;
            Err(PobjError::InvalidArgument("stop".to_string()))
        });

        assert!(matches!(result, Err(PobjError::InvalidArgument(_))));
        assert_eq!(cell.get(value).unwrap(), 0);
        assert!(!cell.monitor().is_locked());
        assert_eq!(ctx.stats().snapshot().transactions_aborted, 1);
    }

    #[test]
    fn test_nested_is_flat() {
        let (ctx, ty) = setup();
        let a = PersistentObject::new(&ctx, &ty).unwrap();
        let b = PersistentObject::new(&ctx, &ty).unwrap();
        let value = crate::types::Field::<Long>::at(4);

        let result: Result<()> = Transaction::run(&ctx, &[&a], || {
            a.set(value, 1)?;
            Transaction::run(&ctx, &[&b], || {
                assert_eq!(Transaction::depth(), 1);
                b.set(value, 2)
            })?;
            assert!(b.monitor().is_held_by_current_thread());
            Err(PobjError::InvalidArgument("abort outer".to_string()))
        });

        assert!(result.is_err());
        assert_eq!(a.get(value).unwrap(), 0);
        assert_eq!(b.get(value).unwrap(), 0);
        assert!(!b.monitor().is_locked());
    }

    #[test]
    fn test_allocation_released_on_rollback() {
        let (ctx, ty) = setup();
        let before = ctx.heap_stats().unwrap().live_blocks;

        let result: Result<()> = Transaction::run(&ctx, &[], || {
            PersistentObject::new(&ctx, &ty)?;
            Err(PobjError::InvalidArgument("discard".to_string()))
        });

        assert!(result.is_err());
        assert_eq!(ctx.heap_stats().unwrap().live_blocks, before);
    }

    #[test]
    fn test_panic_rolls_back() {
        let (ctx, ty) = setup();
        let cell = PersistentObject::new(&ctx, &ty).unwrap();
        let value = crate::types::Field::<Long>::at(4);

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<()> = Transaction::run(&ctx, &[&cell], || {
                cell.set(value, 9)?;
                panic!("body failed");
            });
        }));

        assert!(outcome.is_err());
        assert!(!Transaction::is_active());
        assert_eq!(cell.get(value).unwrap(), 0);
        assert!(!cell.monitor().is_locked());
    }

    #[test]
    fn test_retry_bound() {
        let ctx = PersistentContext::open(HeapConfig {
            max_transaction_retries: Some(3),
            ..HeapConfig::volatile(1 << 20)
        })
        .unwrap();

        let mut runs = 0;
        let result: Result<()> = Transaction::run(&ctx, &[], || {
            runs += 1;
            Err(PobjError::RetryRequested {
                address: 0x208,
                waited_ms: 1,
            })
        });

        assert!(matches!(result, Err(PobjError::RetriesExhausted { attempts: 3 })));
        assert_eq!(runs, 3);
        assert_eq!(ctx.stats().snapshot().transaction_retries, 3);
    }
}
