//! Stats Module - Object Layer Counters
//!
//! Collects counters for:
//! - Contention tuning (lock timeouts, transaction retries)
//! - Reclamation monitoring (constructions vs frees)
//!
//! All counters are relaxed atomics; a snapshot is not a consistent cut.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// ObjectStats - counters for one persistent context
pub struct ObjectStats {
    /// Fresh object constructions (committed or not)
    constructions: AtomicU64,
    /// Representatives rebuilt from existing addresses
    reconstructions: AtomicU64,
    /// Objects reclaimed at commit
    frees: AtomicU64,
    /// Successful monitor acquisitions through the locking protocol
    lock_acquisitions: AtomicU64,
    /// Timed or bounded acquisitions that gave up
    lock_timeouts: AtomicU64,
    /// Outermost transactions committed
    transactions_committed: AtomicU64,
    /// Attempts rolled back for retry
    transaction_retries: AtomicU64,
    /// Outermost transactions rolled back with an error
    transactions_aborted: AtomicU64,
    /// Start time
    start_time: Instant,
}

impl ObjectStats {
    /// Create new stats collector
    pub fn new() -> Self {
        Self {
            constructions: AtomicU64::new(0),
            reconstructions: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            lock_acquisitions: AtomicU64::new(0),
            lock_timeouts: AtomicU64::new(0),
            transactions_committed: AtomicU64::new(0),
            transaction_retries: AtomicU64::new(0),
            transactions_aborted: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_construction(&self) {
        self.constructions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconstruction(&self) {
        self.reconstructions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_free(&self) {
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_acquired(&self) {
        self.lock_acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.transaction_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abort(&self) {
        self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// Get summary statistics
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            constructions: self.constructions.load(Ordering::Relaxed),
            reconstructions: self.reconstructions.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            lock_acquisitions: self.lock_acquisitions.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            transactions_committed: self.transactions_committed.load(Ordering::Relaxed),
            transaction_retries: self.transaction_retries.load(Ordering::Relaxed),
            transactions_aborted: self.transactions_aborted.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    /// Reset statistics
    pub fn reset(&self) {
        for counter in [
            &self.constructions,
            &self.reconstructions,
            &self.frees,
            &self.lock_acquisitions,
            &self.lock_timeouts,
            &self.transactions_committed,
            &self.transaction_retries,
            &self.transactions_aborted,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for ObjectStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary statistics
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub constructions: u64,
    pub reconstructions: u64,
    pub frees: u64,
    pub lock_acquisitions: u64,
    pub lock_timeouts: u64,
    pub transactions_committed: u64,
    pub transaction_retries: u64,
    pub transactions_aborted: u64,
    /// Uptime (seconds)
    pub uptime_secs: u64,
}

impl StatsSnapshot {
    /// Objects constructed but not yet reclaimed, as far as this process saw
    pub fn live_constructions(&self) -> u64 {
        self.constructions.saturating_sub(self.frees)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = ObjectStats::new();
        stats.record_construction();
        stats.record_construction();
        stats.record_free();
        stats.record_retry();

        let snap = stats.snapshot();
        assert_eq!(snap.constructions, 2);
        assert_eq!(snap.live_constructions(), 1);
        assert_eq!(snap.transaction_retries, 1);
    }

    #[test]
    fn test_reset() {
        let stats = ObjectStats::new();
        stats.record_lock_timeout();
        stats.reset();
        assert_eq!(stats.snapshot().lock_timeouts, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = ObjectStats::new();
        stats.record_commit();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["transactions_committed"], 1);
    }
}
