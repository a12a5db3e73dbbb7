//! Configuration Module - Heap and Locking Parameters
//!
//! Manages all configuration parameters for a persistent heap context.
//! The lock timeouts control the adaptive backoff used by transactions; the
//! defaults favour short waits with quick growth under contention.

use crate::util::constants::{KB, MB};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// What to do when reference-count bookkeeping is found corrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvariantPolicy {
    /// Abort the process immediately
    Abort,
    /// Panic; the transaction in progress is rolled back while unwinding
    Panic,
}

/// Main configuration for a persistent heap context
///
/// # Examples
///
/// ```rust
/// use pobj::HeapConfig;
///
/// // Volatile heap for tests
/// let config = HeapConfig {
///     heap_size: 4 * 1024 * 1024,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    /// Backing file of the heap
    ///
    /// `None` maps anonymous memory: the heap behaves identically but does not
    /// survive the process.
    /// Default: None
    pub path: Option<PathBuf>,

    /// Heap size in bytes
    ///
    /// Rounded up to the page size. Ignored when reopening an existing file,
    /// whose superblock records the size it was created with.
    /// Default: 64MB
    pub heap_size: usize,

    /// Base lock timeout in milliseconds
    ///
    /// Every successful timed acquisition resets the thread's timeout to this.
    /// Default: 10ms
    pub lock_timeout_ms: u64,

    /// Upper bound for the adaptive lock timeout in milliseconds
    ///
    /// Default: 500ms
    pub max_lock_timeout_ms: u64,

    /// Growth factor applied to the thread's timeout after a failed acquisition
    ///
    /// Default: 1.5
    pub lock_timeout_growth: f64,

    /// Bound for blocking acquisitions outside a transaction, in milliseconds
    ///
    /// Exceeding it is reported as a fatal `LockTimeout`.
    /// Default: 5000ms
    pub blocking_lock_timeout_ms: u64,

    /// Maximum attempts of one transaction
    ///
    /// `None` retries until the body succeeds.
    /// Default: None
    pub max_transaction_retries: Option<u32>,

    /// Flush dirty ranges to the backing file when a transaction commits
    ///
    /// Also enables the undo journal of file-backed heaps; without it a crash
    /// can leave part of a transaction in the file.
    ///
    /// Default: true
    pub flush_on_commit: bool,

    /// Reaction to corrupted reference counts
    ///
    /// Default: Abort
    pub invariant_policy: InvariantPolicy,

    /// Print object-layer events to the console
    ///
    /// Default: false
    pub verbose: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            path: None,
            heap_size: 64 * MB,

            // Locking
            lock_timeout_ms: 10,
            max_lock_timeout_ms: 500,
            lock_timeout_growth: 1.5,
            blocking_lock_timeout_ms: 5000,

            // Transactions
            max_transaction_retries: None,
            flush_on_commit: true,

            // Debug
            invariant_policy: InvariantPolicy::Abort,
            verbose: false,
        }
    }
}

impl HeapConfig {
    /// Anonymous heap of the given size with default locking parameters
    pub fn volatile(heap_size: usize) -> Self {
        HeapConfig {
            heap_size,
            ..Default::default()
        }
    }

    /// Validate configuration
    ///
    /// Checks if all values are in valid ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heap_size < MIN_HEAP_SIZE {
            return Err(ConfigError::InvalidHeapSize(format!(
                "heap_size must be at least {} bytes",
                MIN_HEAP_SIZE
            )));
        }

        if self.lock_timeout_ms == 0 {
            return Err(ConfigError::InvalidLockTimeout(
                "lock_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.max_lock_timeout_ms < self.lock_timeout_ms {
            return Err(ConfigError::InvalidLockTimeout(
                "max_lock_timeout_ms must be >= lock_timeout_ms".to_string(),
            ));
        }

        if self.lock_timeout_growth.is_nan() || self.lock_timeout_growth < 1.0 {
            return Err(ConfigError::InvalidLockTimeout(
                "lock_timeout_growth must be >= 1.0".to_string(),
            ));
        }

        if self.blocking_lock_timeout_ms == 0 {
            return Err(ConfigError::InvalidLockTimeout(
                "blocking_lock_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.max_transaction_retries == Some(0) {
            return Err(ConfigError::InvalidRetryBound(
                "max_transaction_retries must be > 0 when set".to_string(),
            ));
        }

        Ok(())
    }

    /// Build configuration from environment variables
    ///
    /// Overrides defaults with environment variables:
    /// - POBJ_HEAP_PATH
    /// - POBJ_HEAP_SIZE
    /// - POBJ_LOCK_TIMEOUT_MS
    /// - POBJ_MAX_LOCK_TIMEOUT_MS
    /// - POBJ_MAX_RETRIES
    /// - POBJ_VERBOSE
    ///
    /// ```bash
    /// export POBJ_HEAP_PATH=/mnt/pmem0/app.heap
    /// export POBJ_HEAP_SIZE=1073741824  # 1GB
    /// export POBJ_VERBOSE=1
    /// ```
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("POBJ_HEAP_PATH") {
            if !val.is_empty() {
                config.path = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = std::env::var("POBJ_HEAP_SIZE") {
            if let Ok(size) = val.parse::<usize>() {
                config.heap_size = size;
            }
        }

        if let Ok(val) = std::env::var("POBJ_LOCK_TIMEOUT_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.lock_timeout_ms = ms;
            }
        }

        if let Ok(val) = std::env::var("POBJ_MAX_LOCK_TIMEOUT_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.max_lock_timeout_ms = ms;
            }
        }

        if let Ok(val) = std::env::var("POBJ_MAX_RETRIES") {
            if let Ok(retries) = val.parse::<u32>() {
                config.max_transaction_retries = Some(retries);
            }
        }

        if let Ok(val) = std::env::var("POBJ_VERBOSE") {
            config.verbose = val == "1" || val.eq_ignore_ascii_case("true");
        }

        config
    }

    /// Parse configuration from TOML
    ///
    /// Missing keys keep their defaults.
    ///
    /// ```rust
    /// let config = pobj::HeapConfig::from_toml_str("heap_size = 8388608\nverbose = true").unwrap();
    /// assert_eq!(config.heap_size, 8 * 1024 * 1024);
    /// ```
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Base lock timeout
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Maximum adaptive lock timeout
    pub fn max_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.max_lock_timeout_ms)
    }

    /// Bound for non-transactional acquisitions
    pub fn blocking_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.blocking_lock_timeout_ms)
    }
}

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid heap size: {0}")]
    InvalidHeapSize(String),

    #[error("Invalid lock timeout: {0}")]
    InvalidLockTimeout(String),

    #[error("Invalid retry bound: {0}")]
    InvalidRetryBound(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

// ============================================================================
// CONSTANTS
// ============================================================================

/// Smallest heap that fits the superblock and a handful of objects
pub const MIN_HEAP_SIZE: usize = 64 * KB;
