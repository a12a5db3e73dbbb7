//! Object Layer Logging and Tracing
//!
//! Structured events for the persistent object layer, useful for:
//! - Diagnosing lock contention and retry storms
//! - Auditing reclamation and cycle-candidate handoff
//! - Post-mortem of invariant violations
//!
//! Every event is forwarded to the `log` facade at the event's level and kept
//! in a bounded in-memory buffer. Console output (human or JSON) is opt-in.
//!
//! Log Levels:
//! - ERROR: invariant violations
//! - WARN: lock timeouts outside transactions, exhausted retries, journal recovery
//! - INFO: heap open/close
//! - DEBUG: transaction retries, residual discharges
//! - TRACE: per-object events (frees, candidates, timed-out acquisitions)

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::util::format_address;

/// Log level for object-layer events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

/// Object layer event types
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectEvent {
    /// Heap mapped and validated
    HeapOpened {
        path: Option<String>,
        capacity: u64,
        formatted: bool,
    },

    /// Context torn down
    HeapClosed { live_blocks: u64 },

    /// Unfinished transactions rolled back from the journal on open
    JournalRecovered {
        path: String,
        transactions: u64,
        restored_ranges: u64,
    },

    /// Object block and its type-name block released
    ObjectFreed { address: u64, type_name: String },

    /// Address registered as a possible member of an orphaned cycle
    CandidateAdded { address: u64 },

    /// External collector discharged internal cycle references
    ResidualDischarge { address: u64, count: u32 },

    /// Timed or bounded acquisition gave up
    LockTimeout {
        address: u64,
        waited_ms: u64,
        in_transaction: bool,
    },

    /// Transaction attempt rolled back for retry
    TransactionRetry { attempt: u32, address: u64 },

    /// Retry bound reached
    RetriesExhausted { attempts: u32 },

    /// Corrupted reference-count bookkeeping
    InvariantViolation { address: u64, detail: String },
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct EventLoggerConfig {
    /// Minimum log level
    pub level: LogLevel,

    /// Enable console output
    pub console: bool,

    /// Enable JSON format
    pub json: bool,

    /// Enable timestamps
    pub timestamps: bool,

    /// Events kept in memory; oldest are dropped first
    pub capacity: usize,
}

impl Default for EventLoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Debug,
            console: false,
            json: false,
            timestamps: true,
            capacity: 4096,
        }
    }
}

/// Event logger - centralized logging for object-layer events
pub struct EventLogger {
    config: EventLoggerConfig,
    events: Mutex<VecDeque<(Instant, ObjectEvent)>>,
    enabled: AtomicBool,
}

impl EventLogger {
    /// Create new logger
    pub fn new(config: EventLoggerConfig) -> Self {
        Self {
            config,
            events: Mutex::new(VecDeque::new()),
            enabled: AtomicBool::new(true),
        }
    }

    /// Enable logging
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Disable logging
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Check if logging is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Log an event
    pub fn log(&self, event: ObjectEvent) {
        if !self.is_enabled() {
            return;
        }

        let event_level = Self::event_level(&event);
        if event_level > self.config.level {
            return;
        }

        log::log!(target: "pobj", event_level.into(), "{}", Self::describe(&event));

        if self.config.console {
            self.output_console(&event);
        }

        if let Ok(mut events) = self.events.lock() {
            if events.len() >= self.config.capacity {
                events.pop_front();
            }
            events.push_back((Instant::now(), event));
        }
    }

    /// Get log level for event
    fn event_level(event: &ObjectEvent) -> LogLevel {
        match event {
            ObjectEvent::InvariantViolation { .. } => LogLevel::Error,
            ObjectEvent::RetriesExhausted { .. } | ObjectEvent::JournalRecovered { .. } => {
                LogLevel::Warn
            },
            ObjectEvent::LockTimeout { in_transaction, .. } => {
                if *in_transaction {
                    LogLevel::Trace
                } else {
                    LogLevel::Warn
                }
            },
            ObjectEvent::HeapOpened { .. } | ObjectEvent::HeapClosed { .. } => LogLevel::Info,
            ObjectEvent::TransactionRetry { .. } | ObjectEvent::ResidualDischarge { .. } => {
                LogLevel::Debug
            },
            ObjectEvent::ObjectFreed { .. } | ObjectEvent::CandidateAdded { .. } => {
                LogLevel::Trace
            },
        }
    }

    /// Human-readable form of an event
    fn describe(event: &ObjectEvent) -> String {
        match event {
            ObjectEvent::HeapOpened {
                path,
                capacity,
                formatted,
            } => format!(
                "heap {} opened ({} bytes{})",
                path.as_deref().unwrap_or("<anonymous>"),
                capacity,
                if *formatted { ", formatted" } else { "" }
            ),
            ObjectEvent::HeapClosed { live_blocks } => {
                format!("heap closed with {} live blocks", live_blocks)
            },
            ObjectEvent::JournalRecovered {
                path,
                transactions,
                restored_ranges,
            } => format!(
                "heap {} recovered: {} unfinished transaction(s), {} range(s) restored",
                path, transactions, restored_ranges
            ),
            ObjectEvent::ObjectFreed { address, type_name } => {
                format!("freed {} at {}", type_name, format_address(*address))
            },
            ObjectEvent::CandidateAdded { address } => {
                format!("cycle candidate {}", format_address(*address))
            },
            ObjectEvent::ResidualDischarge { address, count } => format!(
                "discharging {} residual references of {}",
                count,
                format_address(*address)
            ),
            ObjectEvent::LockTimeout {
                address,
                waited_ms,
                in_transaction,
            } => format!(
                "lock on {} timed out after {}ms (in transaction: {})",
                format_address(*address),
                waited_ms,
                in_transaction
            ),
            ObjectEvent::TransactionRetry { attempt, address } => format!(
                "transaction attempt {} rolled back on {}",
                attempt,
                format_address(*address)
            ),
            ObjectEvent::RetriesExhausted { attempts } => {
                format!("transaction gave up after {} attempts", attempts)
            },
            ObjectEvent::InvariantViolation { address, detail } => format!(
                "invariant violation at {}: {}",
                format_address(*address),
                detail
            ),
        }
    }

    /// Output to console
    fn output_console(&self, event: &ObjectEvent) {
        let prefix = if self.config.timestamps {
            format!("[{}] ", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
        } else {
            String::new()
        };

        if self.config.json {
            if let Ok(json_str) = serde_json::to_string(&Self::to_json(event)) {
                println!("{}{}", prefix, json_str);
            }
        } else {
            println!("{}[pobj] {}", prefix, Self::describe(event));
        }
    }

    /// JSON form of an event
    fn to_json(event: &ObjectEvent) -> serde_json::Value {
        match event {
            ObjectEvent::HeapOpened {
                path,
                capacity,
                formatted,
            } => serde_json::json!({
                "type": "heap_opened",
                "path": path,
                "capacity": capacity,
                "formatted": formatted
            }),
            ObjectEvent::HeapClosed { live_blocks } => serde_json::json!({
                "type": "heap_closed",
                "live_blocks": live_blocks
            }),
            ObjectEvent::JournalRecovered {
                path,
                transactions,
                restored_ranges,
            } => serde_json::json!({
                "type": "journal_recovered",
                "path": path,
                "transactions": transactions,
                "restored_ranges": restored_ranges
            }),
            ObjectEvent::ObjectFreed { address, type_name } => serde_json::json!({
                "type": "object_freed",
                "address": address,
                "type_name": type_name
            }),
            ObjectEvent::CandidateAdded { address } => serde_json::json!({
                "type": "candidate_added",
                "address": address
            }),
            ObjectEvent::ResidualDischarge { address, count } => serde_json::json!({
                "type": "residual_discharge",
                "address": address,
                "count": count
            }),
            ObjectEvent::LockTimeout {
                address,
                waited_ms,
                in_transaction,
            } => serde_json::json!({
                "type": "lock_timeout",
                "address": address,
                "waited_ms": waited_ms,
                "in_transaction": in_transaction
            }),
            ObjectEvent::TransactionRetry { attempt, address } => serde_json::json!({
                "type": "transaction_retry",
                "attempt": attempt,
                "address": address
            }),
            ObjectEvent::RetriesExhausted { attempts } => serde_json::json!({
                "type": "retries_exhausted",
                "attempts": attempts
            }),
            ObjectEvent::InvariantViolation { address, detail } => serde_json::json!({
                "type": "invariant_violation",
                "address": address,
                "detail": detail
            }),
        }
    }

    /// Get all buffered events
    pub fn get_events(&self) -> Vec<(Instant, ObjectEvent)> {
        if let Ok(events) = self.events.lock() {
            events.iter().cloned().collect()
        } else {
            Vec::new()
        }
    }

    /// Clear all events
    pub fn clear_events(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    /// Get event count
    pub fn event_count(&self) -> usize {
        if let Ok(events) = self.events.lock() {
            events.len()
        } else {
            0
        }
    }
}

impl Default for EventLogger {
    fn default() -> Self {
        Self::new(EventLoggerConfig::default())
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL_LOGGER: Mutex<EventLogger> = Mutex::new(EventLogger::default());
}

/// Log an event to the global logger
pub fn log_event(event: ObjectEvent) {
    if let Ok(logger) = GLOBAL_LOGGER.lock() {
        logger.log(event);
    }
}

/// Configure global logger
pub fn configure_logger(config: EventLoggerConfig) {
    if let Ok(mut logger) = GLOBAL_LOGGER.lock() {
        *logger = EventLogger::new(config);
    }
}

/// Get global logger event count
pub fn get_event_count() -> usize {
    if let Ok(logger) = GLOBAL_LOGGER.lock() {
        logger.event_count()
    } else {
        0
    }
}

/// Snapshot of the global logger's buffered events
pub fn recent_events() -> Vec<ObjectEvent> {
    if let Ok(logger) = GLOBAL_LOGGER.lock() {
        logger.get_events().into_iter().map(|(_, e)| e).collect()
    } else {
        Vec::new()
    }
}
