//! Retry orchestrator — scoped re-dispatch of previously failed file units.
//!
//! A retry never touches succeeded files and never rewrites history: the
//! failed rows are reset to pending with their retry counters bumped, a
//! RetryRun records the invocation, and the job re-enters the normal
//! dispatch cycle.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::artifacts::ArtifactManager;
use crate::dispatch::DispatcherHandle;
use crate::error::RetryError;
use crate::jobs::model::{Job, JobStatus, RetryRun, RetrySelector, event_types};
use crate::store::{JobStore, NewEvent};

/// Result of a retry invocation.
#[derive(Debug, Clone)]
pub enum RetryOutcome {
    /// Nothing under the selector had failed files. A distinct no-op,
    /// not an error.
    NoFailures,
    /// One retry run per targeted job was scheduled.
    Scheduled { runs: Vec<RetryRun> },
}

/// Re-dispatches exactly the failed file units under a target selector.
pub struct RetryOrchestrator {
    store: Arc<dyn JobStore>,
    artifacts: Arc<ArtifactManager>,
    dispatcher: DispatcherHandle,
}

impl RetryOrchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        artifacts: Arc<ArtifactManager>,
        dispatcher: DispatcherHandle,
    ) -> Self {
        Self {
            store,
            artifacts,
            dispatcher,
        }
    }

    /// Retry the failed files under `selector`.
    pub async fn retry(&self, selector: RetrySelector) -> Result<RetryOutcome, RetryError> {
        let targets = self.resolve_targets(selector).await?;

        let mut runs = Vec::new();
        for job in targets {
            // Jobs still in flight are left alone; their failed files will
            // be aggregated when they finish.
            if !job.status.is_terminal() {
                continue;
            }
            if let Some(run) = self.schedule_job_retry(&job, selector).await? {
                runs.push(run);
            }
        }

        if runs.is_empty() {
            return Ok(RetryOutcome::NoFailures);
        }

        self.dispatcher.wake();
        Ok(RetryOutcome::Scheduled { runs })
    }

    async fn resolve_targets(&self, selector: RetrySelector) -> Result<Vec<Job>, RetryError> {
        match selector {
            RetrySelector::Job(id) => {
                let job = self
                    .store
                    .get_job(id)
                    .await?
                    .ok_or(RetryError::JobNotFound { id })?;
                Ok(vec![job])
            }
            RetrySelector::Session(id) => {
                let jobs = self.store.list_jobs_by_session(id).await?;
                if jobs.is_empty() {
                    return Err(RetryError::SessionNotFound { id });
                }
                Ok(jobs)
            }
            RetrySelector::MostRecent => {
                Ok(self
                    .store
                    .most_recent_job_with_failures()
                    .await?
                    .into_iter()
                    .collect())
            }
        }
    }

    /// Reset one job's failed files and record the retry run. Returns
    /// `None` when the job has no failed files.
    async fn schedule_job_retry(
        &self,
        job: &Job,
        selector: RetrySelector,
    ) -> Result<Option<RetryRun>, RetryError> {
        let failed = self.store.list_failed_files(job.id).await?;
        if failed.is_empty() {
            return Ok(None);
        }

        let run = RetryRun {
            id: Uuid::new_v4(),
            job_id: job.id,
            selector: selector.to_string(),
            file_count: failed.len() as i64,
            status: JobStatus::Queued,
            requested_at: Utc::now(),
            completed_at: None,
        };
        self.store.insert_retry_run(&run).await?;

        let file_ids: Vec<Uuid> = failed.iter().map(|f| f.id).collect();
        let paths: Vec<&str> = failed.iter().map(|f| f.source_path.as_str()).collect();
        let payload = serde_json::json!({
            "retry_run": run.id,
            "selector": selector.to_string(),
            "files": paths,
        });
        let reset = self
            .store
            .reset_files_for_retry(
                job.id,
                &file_ids,
                NewEvent::new(
                    event_types::RETRY_REQUESTED,
                    format!("Retrying {} failed file(s)", file_ids.len()),
                )
                .with_payload(payload.clone()),
            )
            .await?;

        self.artifacts
            .mirror_event(
                job.id,
                event_types::RETRY_REQUESTED,
                "Retry requested",
                &payload,
            )
            .await;

        info!(
            job_id = %job.id,
            retry_run = %run.id,
            files = reset,
            selector = %selector,
            "Retry scheduled"
        );
        Ok(Some(run))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{FileStatus, JobFile, ProcessOptions, ProcessRequest};
    use crate::metrics::RuntimeMetrics;
    use crate::store::LibSqlStore;
    use tokio::sync::Notify;

    fn handle() -> DispatcherHandle {
        // A bare handle; nothing listens in these tests
        DispatcherHandle::from_notify(Arc::new(Notify::new()))
    }

    async fn setup() -> (tempfile::TempDir, Arc<dyn JobStore>, RetryOrchestrator) {
        let tmp = tempfile::tempdir().unwrap();
        let metrics = Arc::new(RuntimeMetrics::new());
        let store: Arc<dyn JobStore> =
            Arc::new(LibSqlStore::new_memory(metrics).await.unwrap());
        let artifacts = Arc::new(ArtifactManager::new(tmp.path().to_path_buf()));
        let orchestrator = RetryOrchestrator::new(Arc::clone(&store), artifacts, handle());
        (tmp, store, orchestrator)
    }

    /// Insert a terminal job with the given file statuses.
    async fn terminal_job(
        store: &Arc<dyn JobStore>,
        statuses: &[(&str, FileStatus)],
        job_status: JobStatus,
    ) -> Job {
        let request = ProcessRequest {
            source_dir: "/data/docs".to_string(),
            files: statuses.iter().map(|(n, _)| n.to_string()).collect(),
            options: ProcessOptions::default(),
            idempotency_key: Some(Uuid::new_v4().to_string()),
        };
        let job = Job::new(&request);
        let rows: Vec<JobFile> = job
            .request
            .files
            .iter()
            .map(|f| JobFile::new(job.id, f))
            .collect();
        store
            .insert_job(&job, &rows, NewEvent::new(event_types::SUBMITTED, "submitted"))
            .await
            .unwrap();

        for file in store.list_files(job.id).await.unwrap() {
            let (_, status) = statuses
                .iter()
                .find(|(n, _)| *n == file.source_path)
                .unwrap();
            let mut updated = file.clone();
            updated.status = *status;
            if *status == FileStatus::Failed {
                updated.error_type = Some("parse_error".to_string());
            }
            store
                .record_file_result(&updated, NewEvent::new("test", "set status"))
                .await
                .unwrap();
        }
        store
            .finish_job(
                job.id,
                job_status,
                NewEvent::new(event_types::JOB_FINISHED, "finished"),
            )
            .await
            .unwrap();
        job
    }

    #[tokio::test]
    async fn retry_targets_only_failed_files() {
        let (_tmp, store, orchestrator) = setup().await;
        let job = terminal_job(
            &store,
            &[
                ("a.txt", FileStatus::Done),
                ("b.txt", FileStatus::Failed),
                ("c.txt", FileStatus::Done),
            ],
            JobStatus::PartiallyFailed,
        )
        .await;

        let outcome = orchestrator
            .retry(RetrySelector::Job(job.id))
            .await
            .unwrap();
        let runs = match outcome {
            RetryOutcome::Scheduled { runs } => runs,
            other => panic!("expected Scheduled, got {other:?}"),
        };
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].file_count, 1);

        let files = store.list_files(job.id).await.unwrap();
        let a = files.iter().find(|f| f.source_path == "a.txt").unwrap();
        let b = files.iter().find(|f| f.source_path == "b.txt").unwrap();
        assert_eq!(a.status, FileStatus::Done);
        assert_eq!(a.retry_count, 0);
        assert_eq!(b.status, FileStatus::Pending);
        assert_eq!(b.retry_count, 1);

        // Job is back in the queue
        let requeued = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn no_failed_files_is_a_noop() {
        let (_tmp, store, orchestrator) = setup().await;
        let job = terminal_job(
            &store,
            &[("a.txt", FileStatus::Done)],
            JobStatus::Completed,
        )
        .await;

        let outcome = orchestrator
            .retry(RetrySelector::Job(job.id))
            .await
            .unwrap();
        assert!(matches!(outcome, RetryOutcome::NoFailures));

        // No retry run was recorded
        assert!(store.list_retry_runs(job.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_job_is_an_error() {
        let (_tmp, _store, orchestrator) = setup().await;
        let err = orchestrator
            .retry(RetrySelector::Job(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, RetryError::JobNotFound { .. }));
    }

    #[tokio::test]
    async fn session_selector_covers_all_its_jobs() {
        let (_tmp, store, orchestrator) = setup().await;
        let job1 = terminal_job(
            &store,
            &[("a.txt", FileStatus::Failed)],
            JobStatus::Failed,
        )
        .await;
        let job2 = terminal_job(
            &store,
            &[("b.txt", FileStatus::Failed), ("c.txt", FileStatus::Done)],
            JobStatus::PartiallyFailed,
        )
        .await;
        assert_eq!(job1.session_id, job2.session_id);

        let outcome = orchestrator
            .retry(RetrySelector::Session(job1.session_id))
            .await
            .unwrap();
        match outcome {
            RetryOutcome::Scheduled { runs } => assert_eq!(runs.len(), 2),
            other => panic!("expected Scheduled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn most_recent_selector_picks_latest_failure() {
        let (_tmp, store, orchestrator) = setup().await;
        terminal_job(&store, &[("a.txt", FileStatus::Done)], JobStatus::Completed).await;
        let failed = terminal_job(
            &store,
            &[("b.txt", FileStatus::Failed)],
            JobStatus::Failed,
        )
        .await;

        let outcome = orchestrator.retry(RetrySelector::MostRecent).await.unwrap();
        match outcome {
            RetryOutcome::Scheduled { runs } => {
                assert_eq!(runs.len(), 1);
                assert_eq!(runs[0].job_id, failed.id);
            }
            other => panic!("expected Scheduled, got {other:?}"),
        }
    }
}
