//! Per-stage counters.
//!
//! Workers bump [`StageMetricsStorage`] lock-free; callers read a
//! [`PipelineMetrics`] snapshot. Counters are monotonic and never reset.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Snapshot of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageMetrics {
    pub index: usize,
    pub name: String,
    pub parallelism: usize,
    /// Inputs the step was invoked on.
    pub items_processed: u64,
    /// Outputs pushed downstream, dead markers excluded.
    pub items_emitted: u64,
    /// Invocations that failed or panicked.
    pub failures: u64,
    /// Dead markers forwarded without invoking the step.
    pub skipped: u64,
    /// Wall time spent handling live items, summed over workers.
    pub duration_ms: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineMetrics {
    pub stages: Vec<StageMetrics>,
}

impl PipelineMetrics {
    pub fn stage(&self, name: &str) -> Option<&StageMetrics> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    pub fn total_failures(&self) -> u64 {
        self.stages.iter().map(|stage| stage.failures).sum()
    }
}

#[derive(Debug, Default)]
pub(crate) struct StageMetricsStorage {
    processed: AtomicU64,
    emitted: AtomicU64,
    failures: AtomicU64,
    skipped: AtomicU64,
    busy_micros: AtomicU64,
}

impl StageMetricsStorage {
    pub fn record_processed(&self, elapsed: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.busy_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn record_emitted(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, index: usize, name: &str, parallelism: usize) -> StageMetrics {
        StageMetrics {
            index,
            name: name.to_string(),
            parallelism,
            items_processed: self.processed.load(Ordering::Relaxed),
            items_emitted: self.emitted.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            duration_ms: u128::from(self.busy_micros.load(Ordering::Relaxed)) / 1000,
        }
    }
}
