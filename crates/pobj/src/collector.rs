//! Cycle Candidates - Handoff to an External Cycle Collector
//!
//! Reference counting alone cannot reclaim cycles. Every object whose count
//! is decremented but stays positive is recorded here; a collector running
//! outside this crate inspects the candidates (using the header colours) and
//! discharges the internal references of garbage cycles with
//! `delete_residual_references`.
//!
//! The set only holds addresses. Reclaiming an object removes it from the
//! set, so a candidate address always names a live object.

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

/// CycleCandidates - addresses of possible cycle members
pub struct CycleCandidates {
    addresses: Mutex<FxHashSet<u64>>,
}

impl CycleCandidates {
    pub fn new() -> Self {
        Self {
            addresses: Mutex::new(FxHashSet::default()),
        }
    }

    /// Record `address`; returns `false` if it was already a candidate
    pub fn add_candidate(&self, address: u64) -> bool {
        let added = self.addresses.lock().insert(address);
        if added {
            log::trace!("candidate {}", crate::util::format_address(address));
        }
        added
    }

    /// Forget `address`; returns `false` if it was not a candidate
    pub fn remove_from_candidates(&self, address: u64) -> bool {
        self.addresses.lock().remove(&address)
    }

    pub fn contains(&self, address: u64) -> bool {
        self.addresses.lock().contains(&address)
    }

    pub fn len(&self) -> usize {
        self.addresses.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.lock().is_empty()
    }

    /// Current candidates in address order
    pub fn snapshot(&self) -> Vec<u64> {
        let mut addresses: Vec<u64> = self.addresses.lock().iter().copied().collect();
        addresses.sort_unstable();
        addresses
    }

    /// Take every candidate, leaving the set empty
    pub fn drain(&self) -> Vec<u64> {
        let mut addresses: Vec<u64> = self.addresses.lock().drain().collect();
        addresses.sort_unstable();
        addresses
    }
}

impl Default for CycleCandidates {
    fn default() -> Self {
        Self::new()
    }
}
