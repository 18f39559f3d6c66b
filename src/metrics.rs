//! Runtime counters surfaced through the health endpoint.
//!
//! An explicitly constructed component injected into the store, admission
//! controller, and reconciliation service. No global state; tests build
//! their own instance.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomic counters shared across runtime components.
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    pub jobs_admitted: AtomicU64,
    pub jobs_deduplicated: AtomicU64,
    pub jobs_rejected: AtomicU64,
    pub files_processed: AtomicU64,
    pub files_failed: AtomicU64,
    pub busy_retries: AtomicU64,
    pub reconcile_repairs: AtomicU64,
}

/// Point-in-time copy of the counters, serialized into health responses.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_admitted: u64,
    pub jobs_deduplicated: u64,
    pub jobs_rejected: u64,
    pub files_processed: u64,
    pub files_failed: u64,
    pub busy_retries: u64,
    pub reconcile_repairs: u64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_admitted: self.jobs_admitted.load(Ordering::Relaxed),
            jobs_deduplicated: self.jobs_deduplicated.load(Ordering::Relaxed),
            jobs_rejected: self.jobs_rejected.load(Ordering::Relaxed),
            files_processed: self.files_processed.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            busy_retries: self.busy_retries.load(Ordering::Relaxed),
            reconcile_repairs: self.reconcile_repairs.load(Ordering::Relaxed),
        }
    }
}
