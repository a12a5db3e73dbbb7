//! Error Module - pobj Error Types
//!
//! Defines all error types used by the object layer.
//!
//! # Error Categories
//!
//! ## Contention
//! - `RetryRequested` - timed lock acquisition failed inside a transaction;
//!   the transaction driver rolls back and re-runs the body
//! - `LockTimeout` - bounded blocking acquisition failed outside a transaction
//! - `RetriesExhausted` - a configured retry bound was reached
//!
//! ## Programmer Errors
//! - `TypeMismatch` - accessor kind does not match the declared field kind
//! - `FieldIndexOutOfBounds` / `ElementIndexOutOfBounds`
//! - `ReservedField` - attempted write to a header field
//!
//! ## Heap Errors
//! - `OutOfMemory`, `InvalidAddress`, `ObjectFreed`, `CorruptHeap`, `Io`
//!
//! Invariant violations (negative reference counts, residual count mismatches)
//! are not represented here: they halt the process through
//! [`invariant_violation`].

use crate::config::InvariantPolicy;
use crate::logging::{log_event, ObjectEvent};
use thiserror::Error;

/// Main error type for all pobj operations
///
/// # Examples
///
/// ```rust
/// use pobj::PobjError;
///
/// fn handle_error(err: PobjError) {
///     match err {
///         PobjError::TypeMismatch { index, .. } => {
///             eprintln!("wrong accessor for field {}", index);
///         }
///         err if err.is_retryable() => {
///             eprintln!("contention: {}", err);
///         }
///         _ => eprintln!("other error: {}", err),
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum PobjError {
    /// Timed lock acquisition failed inside an active transaction
    ///
    /// **When returned:** a field access or a transaction's object list could not
    /// lock an object within the thread's current adaptive timeout
    ///
    /// **Recovery strategy:** none needed by callers; the outermost transaction
    /// rolls back and re-executes its body
    #[error("Lock on object {address:#x} not acquired within {waited_ms}ms, transaction must retry")]
    RetryRequested { address: u64, waited_ms: u64 },

    /// Bounded blocking acquisition failed outside a transaction
    ///
    /// **When returned:** a non-transactional object-reference read waited longer
    /// than `blocking_lock_timeout_ms`
    ///
    /// **Recovery strategy:** none; there is no transactional context to retry in
    #[error("Failed to acquire lock on object {address:#x} (timeout after {waited_ms}ms)")]
    LockTimeout { address: u64, waited_ms: u64 },

    /// Transaction retried more often than `max_transaction_retries`
    #[error("Transaction gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// Field accessor does not match the declared field type
    ///
    /// **When returned:** e.g. `get::<Int>` on a field declared `Long`, or an object
    /// accessor whose requested type is not a supertype of the declared type
    ///
    /// **Recovery strategy:** fix the caller; never retried
    #[error("Type mismatch in {type_name} at index {index}: expected {expected}, found {found}")]
    TypeMismatch {
        type_name: String,
        index: usize,
        expected: String,
        found: String,
    },

    /// Field index outside the descriptor's field list
    #[error("No such field index {index} in {type_name} ({count} fields)")]
    FieldIndexOutOfBounds {
        type_name: String,
        index: usize,
        count: usize,
    },

    /// Array element index outside the array's length
    #[error("Element index {index} out of bounds for array of length {length}")]
    ElementIndexOutOfBounds { index: usize, length: usize },

    /// Write attempted on a header field
    #[error("Field index {index} belongs to the object header and cannot be written")]
    ReservedField { index: usize },

    /// No descriptor registered under this name
    #[error("Unknown type: {0}")]
    UnknownType(String),

    /// A different descriptor is already registered under this name
    #[error("Type {name} is already registered with a different layout")]
    TypeConflict { name: String },

    /// Heap exhaustion
    #[error("Out of memory: requested {requested} bytes, heap capacity {capacity} bytes")]
    OutOfMemory { requested: u64, capacity: u64 },

    /// Address does not denote a live block of this heap
    #[error("Invalid heap address {address:#x}: {reason}")]
    InvalidAddress { address: u64, reason: String },

    /// Representative used after its object was reclaimed
    #[error("Object {address:#x} has been freed")]
    ObjectFreed { address: u64 },

    /// Heap image failed validation when opened
    #[error("Corrupt heap image: {0}")]
    CorruptHeap(String),

    /// Mapping or file operation failed
    #[error("Heap I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal state machine violation
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },
}

impl PobjError {
    /// Only lock contention inside a transaction is retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, PobjError::RetryRequested { .. })
    }

    /// Errors the caller cannot meaningfully recover from
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PobjError::LockTimeout { .. }
                | PobjError::CorruptHeap(_)
                | PobjError::RetriesExhausted { .. }
        )
    }

    /// Check if this error indicates a bug in the calling code
    pub fn is_bug(&self) -> bool {
        matches!(
            self,
            PobjError::TypeMismatch { .. }
                | PobjError::FieldIndexOutOfBounds { .. }
                | PobjError::ElementIndexOutOfBounds { .. }
                | PobjError::ReservedField { .. }
                | PobjError::ObjectFreed { .. }
                | PobjError::InvalidState { .. }
        )
    }
}

impl From<crate::config::ConfigError> for PobjError {
    fn from(err: crate::config::ConfigError) -> Self {
        PobjError::Configuration(err.to_string())
    }
}

/// Result type alias for pobj operations
pub type Result<T> = std::result::Result<T, PobjError>;

/// Halt on corrupted reference-count bookkeeping
///
/// Persistent state could otherwise be durably corrupted, so this never returns.
/// Under [`InvariantPolicy::Panic`] the panic unwinds through the transaction
/// driver, which rolls the attempt back before the panic leaves `run`.
#[cold]
pub fn invariant_violation(policy: InvariantPolicy, address: u64, detail: String) -> ! {
    log_event(ObjectEvent::InvariantViolation {
        address,
        detail: detail.clone(),
    });

    match policy {
        InvariantPolicy::Abort => {
            eprintln!(
                "pobj: invariant violation at {}: {}",
                crate::util::format_address(address),
                detail
            );
            std::process::abort()
        }
        InvariantPolicy::Panic => panic!(
            "invariant violation at {}: {}",
            crate::util::format_address(address),
            detail
        ),
    }
}
