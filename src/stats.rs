//! Lightweight queue counters.
//!
//! Plain atomics readable at any time; wiring them into a metrics exporter
//! is left to the host application.

use std::sync::atomic::{AtomicU64, Ordering};

/// Internal counters incremented by the flush worker and the coalescer.
#[derive(Debug, Default)]
pub(crate) struct QueueStats {
    pub flush_cycles: AtomicU64,
    pub batch_calls: AtomicU64,
    pub batch_failures: AtomicU64,
    pub persisted: AtomicU64,
    pub item_failures: AtomicU64,
    pub requeued: AtomicU64,
    pub quarantined: AtomicU64,
}

impl QueueStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            flush_cycles: self.flush_cycles.load(Ordering::Relaxed),
            batch_calls: self.batch_calls.load(Ordering::Relaxed),
            batch_failures: self.batch_failures.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            item_failures: self.item_failures.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            quarantined: self.quarantined.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn bump_by(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

/// Point-in-time view of the queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Completed periodic flush cycles.
    pub flush_cycles: u64,
    /// Bulk calls issued to backends.
    pub batch_calls: u64,
    /// Bulk calls that failed and fell back to single-item retries.
    pub batch_failures: u64,
    /// Records confirmed persisted (bulk or fallback).
    pub persisted: u64,
    /// Single-item fallback operations that failed.
    pub item_failures: u64,
    /// Failed items merged back into the active buffer.
    pub requeued: u64,
    /// Items moved to quarantine after exhausting their retry budget.
    pub quarantined: u64,
}
