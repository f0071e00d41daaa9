//! Process-local scheduling counters
//!
//! Exporting these to a metrics backend is an external concern; the engine
//! only keeps the counts.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the scheduler
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    pub jobs_submitted: AtomicU64,
    pub jobs_scheduled: AtomicU64,
    pub jobs_preempted: AtomicU64,
    pub jobs_cancelled: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub scheduling_cycles: AtomicU64,
}

impl SchedulerMetrics {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_submitted(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_scheduled(&self) {
        self.jobs_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_preempted(&self) {
        self.jobs_preempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_cancelled(&self) {
        self.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_cycles(&self) {
        self.scheduling_cycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_scheduled: self.jobs_scheduled.load(Ordering::Relaxed),
            jobs_preempted: self.jobs_preempted.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            scheduling_cycles: self.scheduling_cycles.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time view of [`SchedulerMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_scheduled: u64,
    pub jobs_preempted: u64,
    pub jobs_cancelled: u64,
    pub jobs_failed: u64,
    pub scheduling_cycles: u64,
}
