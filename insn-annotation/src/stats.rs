//! Dispatch counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the dispatcher, shared with registered return annotations
#[derive(Debug, Default)]
pub struct DispatchCounters {
    hits: AtomicU64,
    forks: AtomicU64,
    suppressed_forks: AtomicU64,
    return_registrations: AtomicU64,
    returns_fired: AtomicU64,
    terminations: AtomicU64,
    skips: AtomicU64,
}

/// Snapshot of [`DispatchCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Annotated instructions reached by tracked states
    pub hits: u64,
    pub forks: u64,
    /// Forks not performed because the state was a child or the annotation already forked
    pub suppressed_forks: u64,
    pub return_registrations: u64,
    pub returns_fired: u64,
    /// Steps aborted, including those aborted by a skip
    pub terminations: u64,
    pub skips: u64,
}

impl DispatchCounters {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fork(&self) {
        self.forks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suppressed_fork(&self) {
        self.suppressed_forks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_return_registration(&self) {
        self.return_registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_return_fired(&self) {
        self.returns_fired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_termination(&self) {
        self.terminations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skip(&self) {
        self.skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            hits: self.hits.load(Ordering::Relaxed),
            forks: self.forks.load(Ordering::Relaxed),
            suppressed_forks: self.suppressed_forks.load(Ordering::Relaxed),
            return_registrations: self.return_registrations.load(Ordering::Relaxed),
            returns_fired: self.returns_fired.load(Ordering::Relaxed),
            terminations: self.terminations.load(Ordering::Relaxed),
            skips: self.skips.load(Ordering::Relaxed),
        }
    }
}
