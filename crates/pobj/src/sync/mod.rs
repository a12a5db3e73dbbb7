//! Sync Module - Object Locking Primitives
//!
//! - [`Monitor`]: reentrant per-object lock with timed entry
//! - [`LockBackoff`]: per-thread adaptive timeout with jitter

pub mod backoff;
pub mod monitor;

pub use backoff::{Acquire, LockBackoff};
pub use monitor::Monitor;
