//! Counter block for queue-client observability.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics shared by the producer, the processing loops, the quorum locks,
/// and the visibility watchdogs. All counters are monotonic.
#[derive(Debug, Default)]
pub struct ClientMetrics {
    // Job lifecycle
    pub jobs_fetched: AtomicU64,
    pub jobs_processed: AtomicU64,
    pub handler_errors: AtomicU64,
    pub jobs_acked: AtomicU64,
    pub ack_failures: AtomicU64,
    pub unroutable_jobs: AtomicU64,

    // Distributed lock
    pub lock_conflicts: AtomicU64,
    pub locks_lost: AtomicU64,
    pub lock_release_failures: AtomicU64,
    pub lock_renewals: AtomicU64,
    pub lock_renewal_failures: AtomicU64,

    // Visibility watchdog
    pub visibility_extensions: AtomicU64,
    pub visibility_extend_failures: AtomicU64,

    // Producer retry
    pub retry_attempts: AtomicU64,
    pub retry_successes: AtomicU64,
}

impl ClientMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_jobs_fetched(&self) {
        self.jobs_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_jobs_processed(&self) {
        self.jobs_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_handler_errors(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_jobs_acked(&self) {
        self.jobs_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_ack_failures(&self) {
        self.ack_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_unroutable_jobs(&self) {
        self.unroutable_jobs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_lock_conflicts(&self) {
        self.lock_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_locks_lost(&self) {
        self.locks_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_lock_release_failures(&self) {
        self.lock_release_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_lock_renewals(&self, count: u64) {
        self.lock_renewals.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_lock_renewal_failures(&self, count: u64) {
        self.lock_renewal_failures.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_visibility_extensions(&self) {
        self.visibility_extensions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_visibility_extend_failures(&self) {
        self.visibility_extend_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_retry_attempts(&self) {
        self.retry_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_retry_successes(&self) {
        self.retry_successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_fetched: self.jobs_fetched.load(Ordering::Relaxed),
            jobs_processed: self.jobs_processed.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            jobs_acked: self.jobs_acked.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            unroutable_jobs: self.unroutable_jobs.load(Ordering::Relaxed),
            lock_conflicts: self.lock_conflicts.load(Ordering::Relaxed),
            locks_lost: self.locks_lost.load(Ordering::Relaxed),
            lock_release_failures: self.lock_release_failures.load(Ordering::Relaxed),
            lock_renewals: self.lock_renewals.load(Ordering::Relaxed),
            lock_renewal_failures: self.lock_renewal_failures.load(Ordering::Relaxed),
            visibility_extensions: self.visibility_extensions.load(Ordering::Relaxed),
            visibility_extend_failures: self.visibility_extend_failures.load(Ordering::Relaxed),
            retry_attempts: self.retry_attempts.load(Ordering::Relaxed),
            retry_successes: self.retry_successes.load(Ordering::Relaxed),
        }
    }
}

/// Serializable view of [`ClientMetrics`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub jobs_fetched: u64,
    pub jobs_processed: u64,
    pub handler_errors: u64,
    pub jobs_acked: u64,
    pub ack_failures: u64,
    pub unroutable_jobs: u64,
    pub lock_conflicts: u64,
    pub locks_lost: u64,
    pub lock_release_failures: u64,
    pub lock_renewals: u64,
    pub lock_renewal_failures: u64,
    pub visibility_extensions: u64,
    pub visibility_extend_failures: u64,
    pub retry_attempts: u64,
    pub retry_successes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let metrics = ClientMetrics::new();
        metrics.increment_jobs_fetched();
        metrics.increment_jobs_fetched();
        metrics.add_lock_renewals(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.jobs_fetched, 2);
        assert_eq!(snapshot.lock_renewals, 3);
        assert_eq!(snapshot.jobs_acked, 0);
    }

    #[test]
    fn snapshot_serializes() {
        let metrics = ClientMetrics::new();
        metrics.increment_jobs_acked();
        let json = serde_json::to_string(&metrics.snapshot()).expect("serializable");
        assert!(json.contains("\"jobs_acked\":1"));
    }
}
