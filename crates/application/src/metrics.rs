//! In-process worker counters and timings.
//!
//! The registry is process-local and advisory: it feeds the health
//! composition and the `/metrics` exposition, and is never persisted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Shared counters updated by the worker loop.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    records_claimed: AtomicU64,
    records_completed: AtomicU64,
    records_failed: AtomicU64,
    orphans_reaped: AtomicU64,
    claim_errors: AtomicU64,
    report_errors: AtomicU64,
    processing_ms_total: AtomicU64,
    processing_samples: AtomicU64,
}

impl WorkerMetrics {
    /// Creates a zeroed registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds claimed records.
    pub fn add_claimed(&self, count: u64) {
        self.records_claimed.fetch_add(count, Ordering::Relaxed);
    }

    /// Counts one completed record.
    pub fn record_completed(&self) {
        self.records_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one failed record.
    pub fn record_failed(&self) {
        self.records_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds reaped orphans.
    pub fn add_reaped(&self, count: u64) {
        self.orphans_reaped.fetch_add(count, Ordering::Relaxed);
    }

    /// Counts one failed claim attempt.
    pub fn claim_error(&self) {
        self.claim_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one failed completion/failure report.
    pub fn report_error(&self) {
        self.report_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one handler invocation duration.
    pub fn observe_processing(&self, elapsed: Duration) {
        let millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.processing_ms_total.fetch_add(millis, Ordering::Relaxed);
        self.processing_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Consistent-enough point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let samples = self.processing_samples.load(Ordering::Relaxed);
        let total_ms = self.processing_ms_total.load(Ordering::Relaxed);

        MetricsSnapshot {
            records_claimed: self.records_claimed.load(Ordering::Relaxed),
            records_completed: self.records_completed.load(Ordering::Relaxed),
            records_failed: self.records_failed.load(Ordering::Relaxed),
            orphans_reaped: self.orphans_reaped.load(Ordering::Relaxed),
            claim_errors: self.claim_errors.load(Ordering::Relaxed),
            report_errors: self.report_errors.load(Ordering::Relaxed),
            avg_processing_ms: if samples == 0 {
                0.0
            } else {
                total_ms as f64 / samples as f64
            },
        }
    }
}

/// Point-in-time copy of the worker counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Records claimed since startup.
    pub records_claimed: u64,
    /// Records completed since startup.
    pub records_completed: u64,
    /// Records failed since startup.
    pub records_failed: u64,
    /// Orphans reaped since startup.
    pub orphans_reaped: u64,
    /// Claim attempts that hit a store error.
    pub claim_errors: u64,
    /// Completion/failure reports that hit a store error.
    pub report_errors: u64,
    /// Mean handler duration across all invocations, in milliseconds.
    pub avg_processing_ms: f64,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::WorkerMetrics;

    #[test]
    fn snapshot_reflects_counter_updates() {
        let metrics = WorkerMetrics::new();
        metrics.add_claimed(5);
        metrics.record_completed();
        metrics.record_completed();
        metrics.record_failed();
        metrics.add_reaped(2);
        metrics.claim_error();
        metrics.report_error();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.records_claimed, 5);
        assert_eq!(snapshot.records_completed, 2);
        assert_eq!(snapshot.records_failed, 1);
        assert_eq!(snapshot.orphans_reaped, 2);
        assert_eq!(snapshot.claim_errors, 1);
        assert_eq!(snapshot.report_errors, 1);
    }

    #[test]
    fn average_processing_time_is_the_sample_mean() {
        let metrics = WorkerMetrics::new();
        assert_eq!(metrics.snapshot().avg_processing_ms, 0.0);

        metrics.observe_processing(Duration::from_millis(10));
        metrics.observe_processing(Duration::from_millis(30));

        let snapshot = metrics.snapshot();
        assert!((snapshot.avg_processing_ms - 20.0).abs() < f64::EPSILON);
    }
}
