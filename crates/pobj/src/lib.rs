//! # pobj - Durable Persistent Objects
//!
//! pobj stores objects in a memory-mapped persistent heap and gives them a
//! transactional, reference-counted object model:
//!
//! - **Typed field access**: every read and write checks the field's declared
//!   kind against the accessor used
//! - **Transactions**: writes are undo-logged; a failed or panicking body is
//!   rolled back, lock contention retries the body
//! - **Adaptive locking**: per-object reentrant monitors acquired with a
//!   per-thread timeout that grows with jitter under contention
//! - **Reference counting**: counts live in the object header; reclamation
//!   uses an explicit worklist so long chains never recurse
//! - **Cycle handoff**: objects whose count stays positive become cycle
//!   candidates for an external collector
//!
//! ## Quick Start
//!
//! ```rust
//! use pobj::types::{kind::Long, ObjectType};
//! use pobj::{HeapConfig, PersistentContext, PersistentObject};
//!
//! fn main() -> pobj::Result<()> {
//!     let ctx = PersistentContext::open(HeapConfig::volatile(1 << 20))?;
//!
//!     let mut node = ObjectType::record("Node");
//!     let value = node.field::<Long>();
//!     let next = node.object_field(Some("Node"));
//!     let node_type = ctx.register_type(node.build())?;
//!
//!     let head = PersistentObject::new(&ctx, &node_type)?;
//!     let tail = PersistentObject::new(&ctx, &node_type)?;
//!     head.set(value, 1)?;
//!     head.set_object_field(&next, Some(&tail))?;
//!     tail.delete_reference()?; // head now owns tail
//!
//!     ctx.set_root(Some(&head))?;
//!     head.delete_reference()?; // the root owns head
//!
//!     let root = ctx.root()?.expect("root was set");
//!     assert_eq!(root.get(value)?, 1);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    PersistentContext                      │
//! │   TypeRegistry   ObjectCache   CycleCandidates   Stats    │
//! └──────────────────────────┬───────────────────────────────┘
//!                            │
//! ┌──────────────────────────┼───────────────────────────────┐
//! │  PersistentObject        ▼          Transaction           │
//! │  (monitor, header,   field access ──▶ undo log, locks,    │
//! │   refcount)                          retry with backoff   │
//! └──────────────────────────┬───────────────────────────────┘
//!                            │
//! ┌──────────────────────────▼───────────────────────────────┐
//! │ PersistentHeap: superblock, size-class free lists, root   │
//! │ HeapMapping: memmap2 over a file or anonymous memory      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ### Object Layout
//!
//! ```text
//! offset  0  type name (address of a length-prefixed UTF-8 block)
//! offset  8  version (i32, 99)
//! offset 12  reference count (i32)
//! offset 16  colour (i8)
//! offset 24  user fields, naturally aligned
//! ```
//!
//! Arrays store their length at offset 24 and elements from offset 32.
//!
//! ## Modules
//!
//! - [`cache`]: one representative per heap address
//! - [`collector`]: cycle candidates handed to an external collector
//! - [`config`]: heap and locking parameters
//! - [`context`]: the entry point owning heap, registry and caches
//! - [`error`]: error types
//! - [`heap`]: mapping, allocator and raw regions
//! - [`logging`]: structured object-layer events
//! - [`object`]: persistent objects, arrays and values
//! - [`stats`]: counters
//! - [`sync`]: monitors and adaptive backoff
//! - [`transaction`]: undo-logged transactions with retry
//! - [`types`]: type descriptors and registry
//! - [`util`]: helpers
//!
//! ## Limitations
//!
//! - **Cycles**: reference counting alone never frees cycles; an external
//!   collector must discharge them
//! - **Single heap per transaction**: a transaction cannot span contexts
//! - **Crash atomicity needs `flush_on_commit`**: only file-backed heaps with
//!   it set journal before-images; writes outside transactions are never
//!   journaled
//! - **Allocator metadata is written in place**: a crash inside the allocator
//!   or between a commit record and its deferred frees can leak blocks

// Storage
pub mod heap;
pub mod types;

// Objects and transactions
pub mod object;
pub mod sync;
pub mod transaction;

// Context-level services
pub mod cache;
pub mod collector;
pub mod context;

// Configuration and monitoring
pub mod config;
pub mod error;
pub mod logging;
pub mod stats;

// Utilities
pub mod util;

// Re-export main types for convenience
pub use collector::CycleCandidates;
pub use config::{HeapConfig, InvariantPolicy};
pub use context::PersistentContext;
pub use error::{PobjError, Result};
pub use heap::HeapStats;
pub use object::{GcColor, PersistentObject, PersistentValue};
pub use transaction::{Transaction, TransactionState};

/// pobj version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Open a context configured from the environment
///
/// See [`HeapConfig::from_env`] for the variables read.
///
/// # Examples
///
/// ```rust
/// let ctx = pobj::open()?;
/// println!("heap capacity: {} bytes", ctx.heap().capacity());
/// # Ok::<(), pobj::PobjError>(())
/// ```
pub fn open() -> Result<std::sync::Arc<PersistentContext>> {
    PersistentContext::open(HeapConfig::from_env())
}

/// Open a context with an explicit configuration
pub fn open_with_config(config: HeapConfig) -> Result<std::sync::Arc<PersistentContext>> {
    PersistentContext::open(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_with_config() {
        let ctx = open_with_config(HeapConfig::volatile(1 << 20)).unwrap();
        assert!(ctx.heap().path().is_none());
        assert_eq!(ctx.heap_stats().unwrap().live_blocks, 0);
    }

    #[test]
    fn test_version_not_empty() {
        assert!(!VERSION.is_empty());
    }
}
