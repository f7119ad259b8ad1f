//! Lock-free pipeline counters and serialisable snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-pipeline event counters.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    events_in: AtomicU64,
    events_out: AtomicU64,
    events_dropped: AtomicU64,
    errors: AtomicU64,
    suppressed: AtomicU64,
}

impl PipelineMetrics {
    pub(crate) fn record_in(&self) {
        self.events_in.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_out(&self) {
        self.events_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_drop(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_suppressed(&self) {
        self.suppressed.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of top-level `process` calls.
    pub fn events_in(&self) -> u64 {
        self.events_in.load(Ordering::Relaxed)
    }

    /// Number of events consumed by sinks.
    pub fn events_out(&self) -> u64 {
        self.events_out.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_in: self.events_in(),
            events_out: self.events_out(),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub events_in: u64,
    pub events_out: u64,
    pub events_dropped: u64,
    pub errors: u64,
    pub suppressed: u64,
}

/// Point-in-time view of a pipeline, for monitoring and administration.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub id: String,
    pub ready: bool,
    /// Description of the active error, if any.
    pub error: Option<String>,
    pub throttles: Vec<String>,
    pub depths: usize,
    pub metrics: MetricsSnapshot,
}
