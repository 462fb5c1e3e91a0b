//! Per-process counters of the deferred engine.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct DeferredStats {
    runs: AtomicU64,
    retries_scheduled: AtomicU64,
    results: AtomicU64,
    finished_with_error: AtomicU64,
    cancelled: AtomicU64,
    requeued_no_slot: AtomicU64,
}

/// Point-in-time copy of [`DeferredStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredStatsSnapshot {
    pub runs: u64,
    pub retries_scheduled: u64,
    pub results: u64,
    pub finished_with_error: u64,
    pub cancelled: u64,
    pub requeued_no_slot: u64,
}

impl DeferredStats {
    pub(crate) fn record_run(&self) {
        self.runs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_result(&self) {
        self.results.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_finished_with_error(&self) {
        self.finished_with_error.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_requeued_no_slot(&self) {
        self.requeued_no_slot.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DeferredStatsSnapshot {
        DeferredStatsSnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            results: self.results.load(Ordering::Relaxed),
            finished_with_error: self.finished_with_error.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            requeued_no_slot: self.requeued_no_slot.load(Ordering::Relaxed),
        }
    }
}
