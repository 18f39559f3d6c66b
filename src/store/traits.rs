//! The `JobStore` trait — single async interface for all persistence.
//!
//! Every in-process writer serializes through this component. Multi-row
//! mutations (status update + event append) are transactional on the
//! backend; partial updates are never observable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::jobs::model::{Job, JobEvent, JobFile, JobStatus, RetryRun, Session};

/// An event to append, before the store assigns its sequence number.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: String,
    pub message: String,
    pub payload: serde_json::Value,
}

impl NewEvent {
    pub fn new(event_type: &str, message: impl Into<String>) -> Self {
        Self {
            event_type: event_type.to_string(),
            message: message.into(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Per-status file counts for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub done: i64,
    pub failed: i64,
    pub skipped: i64,
}

impl FileStatusCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.done + self.failed + self.skipped
    }

    /// Terminal job status implied by these counts, or `None` while any
    /// file is still pending/processing.
    pub fn aggregate_status(&self) -> Option<JobStatus> {
        if self.pending > 0 || self.processing > 0 {
            return None;
        }
        Some(if self.failed == 0 {
            JobStatus::Completed
        } else if self.done > 0 {
            JobStatus::PartiallyFailed
        } else {
            JobStatus::Failed
        })
    }
}

/// Backend-agnostic store covering the whole durable state model.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), StoreError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a job with its file rows and an admission event, atomically.
    async fn insert_job(
        &self,
        job: &Job,
        files: &[JobFile],
        event: NewEvent,
    ) -> Result<(), StoreError>;

    /// Get a job by id.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// List jobs, most recent first.
    async fn list_jobs(&self, limit: u32, offset: u32) -> Result<Vec<Job>, StoreError>;

    /// Find the non-superseded job carrying this idempotency hash, if any.
    /// A job counts as superseded only once it has fully failed.
    async fn find_job_by_hash(&self, hash: Uuid) -> Result<Option<Job>, StoreError>;

    /// Count jobs in a non-terminal status (the admission backlog).
    async fn count_active_jobs(&self) -> Result<u64, StoreError>;

    /// Claim the oldest queued job: mark it dispatched with a fresh
    /// dispatch-sync timestamp and return it. `None` when the queue is empty.
    async fn claim_next_queued(&self) -> Result<Option<Job>, StoreError>;

    /// Transition a dispatched job to running.
    async fn mark_job_running(&self, id: Uuid, event: NewEvent) -> Result<(), StoreError>;

    /// Record a job's terminal status and finish timestamp, with its
    /// closing event, atomically.
    async fn finish_job(
        &self,
        id: Uuid,
        status: JobStatus,
        event: NewEvent,
    ) -> Result<(), StoreError>;

    /// Set the artifact-sync flag.
    async fn set_artifact_synced(&self, id: Uuid, synced: bool) -> Result<(), StoreError>;

    /// Jobs left dispatched/running with a dispatch-sync timestamp before
    /// `cutoff` — orphans of an unclean shutdown.
    async fn list_orphaned_jobs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError>;

    /// Jobs belonging to a session, most recent first.
    async fn list_jobs_by_session(&self, session_id: Uuid) -> Result<Vec<Job>, StoreError>;

    /// The most recent job with at least one failed file.
    async fn most_recent_job_with_failures(&self) -> Result<Option<Job>, StoreError>;

    /// Force a job's status (reconciliation repair), with event, atomically.
    async fn repair_job(
        &self,
        id: Uuid,
        status: JobStatus,
        event: NewEvent,
    ) -> Result<(), StoreError>;

    // ── Job files ───────────────────────────────────────────────────

    /// All file rows of a job, ordered by source path.
    async fn list_files(&self, job_id: Uuid) -> Result<Vec<JobFile>, StoreError>;

    /// Paginated file rows of a job.
    async fn list_files_page(
        &self,
        job_id: Uuid,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<JobFile>, StoreError>;

    /// Failed file rows of a job.
    async fn list_failed_files(&self, job_id: Uuid) -> Result<Vec<JobFile>, StoreError>;

    /// Mark a file as processing.
    async fn mark_file_processing(&self, file_id: Uuid) -> Result<(), StoreError>;

    /// Persist a file's processing outcome and append its event, atomically.
    async fn record_file_result(
        &self,
        file: &JobFile,
        event: NewEvent,
    ) -> Result<(), StoreError>;

    /// Reset the given failed files to pending (retry_count incremented,
    /// error fields cleared), requeue the job, and append the retry event,
    /// all atomically. Returns the number of files reset.
    async fn reset_files_for_retry(
        &self,
        job_id: Uuid,
        file_ids: &[Uuid],
        event: NewEvent,
    ) -> Result<u64, StoreError>;

    /// Reset orphaned processing files of a job to failed (reconciliation).
    /// Returns the number of rows changed.
    async fn fail_inflight_files(&self, job_id: Uuid) -> Result<u64, StoreError>;

    /// Per-status file counts for a job.
    async fn count_files(&self, job_id: Uuid) -> Result<FileStatusCounts, StoreError>;

    // ── Events ──────────────────────────────────────────────────────

    /// Append an event to a job's timeline. Returns the stored event with
    /// its assigned sequence number.
    async fn append_event(&self, job_id: Uuid, event: NewEvent) -> Result<JobEvent, StoreError>;

    /// A job's events in append order, paginated.
    async fn list_events(
        &self,
        job_id: Uuid,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<JobEvent>, StoreError>;

    // ── Sessions ────────────────────────────────────────────────────

    /// Insert or replace a session projection row.
    async fn upsert_session(&self, session: &Session) -> Result<(), StoreError>;

    /// Get a session projection row.
    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, StoreError>;

    /// Distinct (session_id, source_dir) pairs present in the job table.
    async fn list_session_dirs(&self) -> Result<Vec<(Uuid, String)>, StoreError>;

    // ── Retry runs ──────────────────────────────────────────────────

    /// Insert a retry run record.
    async fn insert_retry_run(&self, run: &RetryRun) -> Result<(), StoreError>;

    /// Mark a retry run completed with its resulting status.
    async fn complete_retry_run(
        &self,
        id: Uuid,
        status: JobStatus,
    ) -> Result<(), StoreError>;

    /// Retry runs for a job, most recent first.
    async fn list_retry_runs(&self, job_id: Uuid) -> Result<Vec<RetryRun>, StoreError>;

    // ── Settings ────────────────────────────────────────────────────

    /// Read a setting value.
    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a setting value.
    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_status_rules() {
        let mut counts = FileStatusCounts {
            done: 4,
            ..Default::default()
        };
        assert_eq!(counts.aggregate_status(), Some(JobStatus::Completed));

        counts.failed = 1;
        assert_eq!(counts.aggregate_status(), Some(JobStatus::PartiallyFailed));

        counts.done = 0;
        assert_eq!(counts.aggregate_status(), Some(JobStatus::Failed));

        counts.pending = 1;
        assert_eq!(counts.aggregate_status(), None);
    }

    #[test]
    fn skipped_files_do_not_fail_a_job() {
        let counts = FileStatusCounts {
            done: 2,
            skipped: 1,
            ..Default::default()
        };
        assert_eq!(counts.aggregate_status(), Some(JobStatus::Completed));
    }
}
