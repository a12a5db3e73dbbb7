//! Reentrant monitor
//!
//! Every in-process representative owns one monitor. A thread may enter a
//! monitor it already holds; it is released when the thread has exited as
//! many times as it entered.
//!
//! Monitor States:
//! ```text
//! Free ──enter──▶ Held(owner, 1) ──enter (owner)──▶ Held(owner, n + 1)
//!   ▲                  │
//!   └──exit (depth 1)──┘
//! ```

use parking_lot::{Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct MonitorState {
    owner: Option<ThreadId>,
    depth: u32,
}

/// Monitor - reentrant mutual exclusion with timed entry
#[derive(Debug, Default)]
pub struct Monitor {
    state: Mutex<MonitorState>,
    released: Condvar,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the monitor is held by the calling thread
    pub fn enter(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();

        loop {
            if Self::try_claim(&mut state, me) {
                return;
            }
            self.released.wait(&mut state);
        }
    }

    /// Enter without waiting
    pub fn try_enter(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        Self::try_claim(&mut state, me)
    }

    /// Enter, waiting at most `timeout`
    ///
    /// Returns `false` if the monitor was still held by another thread when the
    /// timeout elapsed.
    pub fn try_enter_for(&self, timeout: Duration) -> bool {
        let me = thread::current().id();
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        loop {
            if Self::try_claim(&mut state, me) {
                return true;
            }
            if self.released.wait_until(&mut state, deadline).timed_out() {
                return Self::try_claim(&mut state, me);
            }
        }
    }

    fn try_claim(state: &mut MonitorState, me: ThreadId) -> bool {
        match state.owner {
            None => {
                state.owner = Some(me);
                state.depth = 1;
                true
            }
            Some(owner) if owner == me => {
                state.depth += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Exit once
    ///
    /// Returns `false` if the calling thread does not hold the monitor.
    pub fn exit(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.owner != Some(me) {
            return false;
        }

        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            // Timed waiters may give up after a wakeup, so wake them all.
            self.released.notify_all();
        }
        true
    }

    /// Held by any thread
    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    /// Entry count of the calling thread (0 if it does not hold the monitor)
    pub fn hold_count(&self) -> u32 {
        let state = self.state.lock();
        if state.owner == Some(thread::current().id()) {
            state.depth
        } else {
            0
        }
    }
}
