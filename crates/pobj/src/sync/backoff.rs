//! Adaptive lock timeout with jitter
//!
//! Locks are taken in no global order; deadlock is avoided by giving up on a
//! timed acquisition and retrying the whole transaction. Each thread carries
//! its own timeout:
//!
//! - the wait for one attempt is `current + random[0, current)`
//! - a successful acquisition resets `current` to the base timeout
//! - a timeout grows `current` by the growth factor, clamped to the maximum
//!
//! The thread's timeout persists across attempts and transactions.

use super::Monitor;
use crate::config::HeapConfig;
use rand::Rng;
use std::cell::Cell;
use std::time::Duration;

thread_local! {
    static CURRENT_TIMEOUT: Cell<Option<Duration>> = const { Cell::new(None) };
}

/// Result of one timed acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Acquired,
    TimedOut { waited: Duration },
}

/// LockBackoff - timeout parameters of one context
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockBackoff {
    base: Duration,
    max: Duration,
    growth: f64,
}

impl LockBackoff {
    pub fn new(base: Duration, max: Duration, growth: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            growth: growth.max(1.0),
        }
    }

    pub fn from_config(config: &HeapConfig) -> Self {
        Self::new(
            config.lock_timeout(),
            config.max_lock_timeout(),
            config.lock_timeout_growth,
        )
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// The calling thread's current timeout
    pub fn current(&self) -> Duration {
        CURRENT_TIMEOUT
            .with(|cell| cell.get())
            .unwrap_or(self.base)
            .clamp(self.base, self.max)
    }

    /// Timeout after one acquisition outcome
    pub fn next_timeout(&self, current: Duration, acquired: bool) -> Duration {
        if acquired {
            self.base
        } else {
            current.mul_f64(self.growth).min(self.max)
        }
    }

    /// Wait bound for one attempt: `current` plus jitter in `[0, current)`
    pub fn sample_wait(&self, current: Duration) -> Duration {
        let nanos = current.as_nanos().min(u64::MAX as u128) as u64;
        if nanos == 0 {
            return current;
        }
        current + Duration::from_nanos(rand::thread_rng().gen_range(0..nanos))
    }

    pub fn record_success(&self) {
        CURRENT_TIMEOUT.with(|cell| cell.set(Some(self.base)));
    }

    pub fn record_timeout(&self) {
        let next = self.next_timeout(self.current(), false);
        CURRENT_TIMEOUT.with(|cell| cell.set(Some(next)));
    }

    /// Timed entry of `monitor` using the thread's adaptive timeout
    pub fn acquire(&self, monitor: &Monitor) -> Acquire {
        let wait = self.sample_wait(self.current());

        if monitor.try_enter_for(wait) {
            self.record_success();
            Acquire::Acquired
        } else {
            self.record_timeout();
            Acquire::TimedOut { waited: wait }
        }
    }
}

impl Default for LockBackoff {
    fn default() -> Self {
        Self::from_config(&HeapConfig::default())
    }
}
