//! Reconciliation service — startup repair of state left behind by an
//! unclean shutdown.
//!
//! Runs once, before admission accepts work. Jobs found dispatched or
//! running with a dispatch-sync timestamp predating process start are
//! resolved from their file evidence. Ambiguous evidence (a file still
//! marked processing with no terminal event) resolves to failed and
//! retry-eligible: a false-positive completion is worse than one extra
//! retry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::jobs::model::{JobStatus, event_types};
use crate::metrics::RuntimeMetrics;
use crate::store::{JobStore, NewEvent};

/// Setting key tracking repair streaks across consecutive startups.
const STREAK_KEY: &str = "reconcile.consecutive_repairs";

/// What a reconciliation pass found and did.
#[derive(Debug, Clone, Copy, Default)]
pub struct RepairReport {
    /// Orphaned jobs examined.
    pub scanned: u64,
    /// Jobs resolved to failed (had unresolved files).
    pub repaired: u64,
    /// Jobs resolved to a terminal status from complete file evidence.
    pub completed: u64,
}

/// Resolves jobs orphaned by an unclean shutdown.
pub struct ReconciliationService {
    store: Arc<dyn JobStore>,
    metrics: Arc<RuntimeMetrics>,
    /// Streak length that triggers an instability warning.
    streak_warn: i64,
}

impl ReconciliationService {
    pub fn new(store: Arc<dyn JobStore>, metrics: Arc<RuntimeMetrics>, streak_warn: i64) -> Self {
        Self {
            store,
            metrics,
            streak_warn,
        }
    }

    /// Run one reconciliation pass. `process_start` is the current boot
    /// time; only jobs whose dispatch-sync timestamp predates it are
    /// considered orphaned.
    pub async fn run(&self, process_start: DateTime<Utc>) -> Result<RepairReport, StoreError> {
        let orphans = self.store.list_orphaned_jobs(process_start).await?;
        let mut report = RepairReport {
            scanned: orphans.len() as u64,
            ..Default::default()
        };

        for job in &orphans {
            let counts = self.store.count_files(job.id).await?;

            if counts.pending == 0 && counts.processing == 0 {
                // Every file reached a terminal state; the job just never
                // got its closing update.
                let status = counts.aggregate_status().unwrap_or(JobStatus::Failed);
                let payload = serde_json::json!({
                    "done": counts.done,
                    "failed": counts.failed,
                    "skipped": counts.skipped,
                    "resolved_status": status,
                });
                self.store
                    .repair_job(
                        job.id,
                        status,
                        NewEvent::new(
                            event_types::REPAIRED,
                            format!("Resolved to {status} from complete file evidence"),
                        )
                        .with_payload(payload),
                    )
                    .await?;
                report.completed += 1;
                info!(job_id = %job.id, status = %status, "Orphaned job resolved from file evidence");
            } else {
                let reset = self.store.fail_inflight_files(job.id).await?;
                let payload = serde_json::json!({
                    "pending": counts.pending,
                    "processing": counts.processing,
                    "reset_to_failed": reset,
                });
                self.store
                    .repair_job(
                        job.id,
                        JobStatus::Failed,
                        NewEvent::new(
                            event_types::REPAIRED,
                            format!(
                                "Repaired after unclean shutdown: {} pending, {} processing file(s) unresolved",
                                counts.pending, counts.processing
                            ),
                        )
                        .with_payload(payload),
                    )
                    .await?;
                report.repaired += 1;
                info!(
                    job_id = %job.id,
                    pending = counts.pending,
                    processing = counts.processing,
                    "Orphaned job repaired to failed"
                );
            }
        }

        RuntimeMetrics::add(&self.metrics.reconcile_repairs, report.repaired);
        self.track_streak(&report).await?;
        Ok(report)
    }

    /// Repeated repairs across consecutive startups signal instability
    /// deeper than one bad shutdown; surface it instead of silently
    /// auto-repairing forever.
    async fn track_streak(&self, report: &RepairReport) -> Result<(), StoreError> {
        let streak = if report.repaired > 0 {
            let previous: i64 = self
                .store
                .get_setting(STREAK_KEY)
                .await?
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            previous + 1
        } else {
            0
        };
        self.store
            .set_setting(STREAK_KEY, &streak.to_string())
            .await?;

        if streak >= self.streak_warn {
            warn!(
                streak,
                "Reconciliation repaired jobs on {streak} consecutive startups; investigate shutdown behavior"
            );
        }
        Ok(())
    }
}
