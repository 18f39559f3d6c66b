//! Dispatcher / worker pool — claims queued jobs and fans file units out
//! to the pipeline.
//!
//! Jobs run one at a time; file units within a job run concurrently up to
//! the worker limit. A single file failure never aborts the job: per-file
//! outcomes are values, aggregated into the terminal job status at the
//! end. Only a fatal pipeline-level outcome fails the job immediately,
//! leaving unprocessed files pending and retry-eligible.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::artifacts::ArtifactManager;
use crate::error::DispatchError;
use crate::jobs::model::{FileStatus, Job, JobFile, JobStatus, event_types};
use crate::metrics::RuntimeMetrics;
use crate::pipeline::{FileOutcome, FileProcessor, FileUnit};
use crate::store::{JobStore, NewEvent};

/// Dispatcher limits.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum concurrent file units.
    pub worker_concurrency: usize,
    /// How long to sleep when the queue is empty and no wakeup arrives.
    pub poll_interval: Duration,
}

/// Cheap handle other components use to wake the dispatcher.
#[derive(Clone)]
pub struct DispatcherHandle {
    notify: Arc<Notify>,
}

impl DispatcherHandle {
    /// Build a handle around an existing notifier (tests, wiring before
    /// the dispatcher itself exists).
    pub fn from_notify(notify: Arc<Notify>) -> Self {
        Self { notify }
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }
}

/// Claims queued jobs and drives their file units through the pipeline.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    processor: Arc<dyn FileProcessor>,
    artifacts: Arc<ArtifactManager>,
    metrics: Arc<RuntimeMetrics>,
    semaphore: Arc<Semaphore>,
    notify: Arc<Notify>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        processor: Arc<dyn FileProcessor>,
        artifacts: Arc<ArtifactManager>,
        metrics: Arc<RuntimeMetrics>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            processor,
            artifacts,
            metrics,
            semaphore: Arc::new(Semaphore::new(config.worker_concurrency.max(1))),
            notify: Arc::new(Notify::new()),
            config,
        }
    }

    /// Handle for waking the claim loop.
    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            notify: Arc::clone(&self.notify),
        }
    }

    /// Claim loop. Runs until `shutdown` flips to true; the job in flight
    /// at that point is drained to completion first.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Dispatcher started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.store.claim_next_queued().await {
                Ok(Some(job)) => {
                    if let Err(e) = self.run_job(&job).await {
                        error!(job_id = %job.id, error = %e, "Job dispatch failed");
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to claim next queued job");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
        info!("Dispatcher stopped");
    }

    /// Process one claimed job to a terminal status.
    pub async fn run_job(&self, job: &Job) -> Result<JobStatus, DispatchError> {
        self.store
            .mark_job_running(
                job.id,
                NewEvent::new(event_types::JOB_STARTED, "Processing started"),
            )
            .await?;
        self.artifacts
            .mirror_event(
                job.id,
                event_types::JOB_STARTED,
                "Processing started",
                &serde_json::Value::Null,
            )
            .await;

        if let Err(e) = self.artifacts.init_job_dirs(job.id).await {
            let reason = format!("Cannot create artifact directories: {e}");
            self.finish(job, JobStatus::Failed, &reason).await?;
            return Err(DispatchError::Fatal {
                id: job.id,
                reason,
            });
        }

        let files = self.store.list_files(job.id).await?;
        let mut queue: VecDeque<JobFile> = files
            .into_iter()
            .filter(|f| f.status == FileStatus::Pending)
            .collect();

        let mut workers: JoinSet<(JobFile, FileOutcome)> = JoinSet::new();
        let mut fatal: Option<String> = None;

        while (!queue.is_empty() && fatal.is_none()) || !workers.is_empty() {
            // Biased: drain finished workers before launching the next file,
            // so a fatal outcome stops the launch of everything behind it
            tokio::select! {
                biased;
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    match joined {
                        Ok((file, outcome)) => {
                            self.record_outcome(job, file, outcome, &mut fatal).await?;
                        }
                        Err(e) => {
                            warn!(job_id = %job.id, error = %e, "Worker task panicked");
                            fatal = Some(format!("Worker task panicked: {e}"));
                        }
                    }
                }
                permit = Arc::clone(&self.semaphore).acquire_owned(),
                    if !queue.is_empty() && fatal.is_none() =>
                {
                    let Ok(permit) = permit else { break };
                    let Some(file) = queue.pop_front() else { continue };
                    self.store.mark_file_processing(file.id).await?;
                    let processor = Arc::clone(&self.processor);
                    let unit = self.file_unit(job, &file);
                    workers.spawn(async move {
                        let outcome = processor.process(unit).await;
                        drop(permit);
                        (file, outcome)
                    });
                }
            }
        }

        let final_status = match fatal {
            Some(reason) => {
                self.finish(job, JobStatus::Failed, &format!("Job failed: {reason}"))
                    .await?;
                JobStatus::Failed
            }
            None => {
                let counts = self.store.count_files(job.id).await?;
                // No pending/processing files remain here, so this is Some
                let status = counts.aggregate_status().unwrap_or(JobStatus::Failed);
                let message = format!(
                    "Job finished: {} done, {} failed, {} skipped",
                    counts.done, counts.failed, counts.skipped
                );
                self.finish(job, status, &message).await?;
                status
            }
        };

        // Outputs are flushed; record whether disk matches the database
        let expected: Vec<String> = self
            .store
            .list_files(job.id)
            .await?
            .into_iter()
            .filter_map(|f| f.output_path)
            .collect();
        let synced = self.artifacts.verify_sync(job.id, &expected).await;
        self.store.set_artifact_synced(job.id, synced).await?;

        // Close any retry run that targeted this job
        for run in self.store.list_retry_runs(job.id).await? {
            if run.completed_at.is_none() {
                self.store.complete_retry_run(run.id, final_status).await?;
            }
        }

        info!(job_id = %job.id, status = %final_status, "Job reached terminal status");
        Ok(final_status)
    }

    async fn finish(
        &self,
        job: &Job,
        status: JobStatus,
        message: &str,
    ) -> Result<(), DispatchError> {
        let payload = serde_json::json!({ "status": status });
        self.store
            .finish_job(
                job.id,
                status,
                NewEvent::new(event_types::JOB_FINISHED, message).with_payload(payload.clone()),
            )
            .await?;
        self.artifacts
            .mirror_event(job.id, event_types::JOB_FINISHED, message, &payload)
            .await;
        Ok(())
    }

    /// Persist one file outcome and its event.
    async fn record_outcome(
        &self,
        job: &Job,
        mut file: JobFile,
        outcome: FileOutcome,
        fatal: &mut Option<String>,
    ) -> Result<(), DispatchError> {
        let (event_type, message, payload) = match outcome {
            FileOutcome::Done {
                output_path,
                chunk_count,
            } => {
                file.status = FileStatus::Done;
                file.output_path = Some(output_path.clone());
                file.chunk_count = chunk_count;
                file.error_type = None;
                file.error_message = None;
                RuntimeMetrics::incr(&self.metrics.files_processed);
                (
                    event_types::FILE_DONE,
                    format!("Processed {}", file.source_path),
                    serde_json::json!({
                        "file": file.source_path,
                        "output": output_path,
                        "chunks": chunk_count,
                    }),
                )
            }
            FileOutcome::Skipped { reason } => {
                file.status = FileStatus::Skipped;
                (
                    event_types::FILE_SKIPPED,
                    format!("Skipped {}: {reason}", file.source_path),
                    serde_json::json!({ "file": file.source_path, "reason": reason }),
                )
            }
            FileOutcome::Failed {
                error_type,
                message,
            } => {
                file.status = FileStatus::Failed;
                file.error_type = Some(error_type.clone());
                file.error_message = Some(message.clone());
                RuntimeMetrics::incr(&self.metrics.files_failed);
                (
                    event_types::FILE_FAILED,
                    format!("Failed {}: {message}", file.source_path),
                    serde_json::json!({
                        "file": file.source_path,
                        "error_type": error_type,
                        "error": message,
                    }),
                )
            }
            FileOutcome::Fatal { message } => {
                file.status = FileStatus::Failed;
                file.error_type = Some("fatal".to_string());
                file.error_message = Some(message.clone());
                RuntimeMetrics::incr(&self.metrics.files_failed);
                *fatal = Some(message.clone());
                (
                    event_types::FILE_FAILED,
                    format!("Fatal error on {}: {message}", file.source_path),
                    serde_json::json!({
                        "file": file.source_path,
                        "error_type": "fatal",
                        "error": message,
                    }),
                )
            }
        };

        self.store
            .record_file_result(
                &file,
                NewEvent::new(event_type, message.clone()).with_payload(payload.clone()),
            )
            .await?;
        self.artifacts
            .mirror_event(job.id, event_type, &message, &payload)
            .await;
        Ok(())
    }

    fn file_unit(&self, job: &Job, file: &JobFile) -> FileUnit {
        let source = Path::new(&file.source_path);
        let source_path = if source.is_absolute() {
            source.to_path_buf()
        } else {
            Path::new(&job.request.source_dir).join(source)
        };
        FileUnit {
            job_id: job.id,
            file_id: file.id,
            source_path,
            output_dir: self.artifacts.outputs_dir(job.id),
            options: job.request.options.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;

    use crate::jobs::model::{ProcessOptions, ProcessRequest};
    use crate::store::LibSqlStore;

    /// Scripted processor: maps file names to fixed outcomes.
    struct StubProcessor {
        outcomes: HashMap<String, FileOutcome>,
    }

    #[async_trait]
    impl FileProcessor for StubProcessor {
        async fn process(&self, unit: FileUnit) -> FileOutcome {
            let name = unit
                .source_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            self.outcomes
                .get(name)
                .cloned()
                .unwrap_or(FileOutcome::Done {
                    output_path: format!("{name}.jsonl"),
                    chunk_count: 1,
                })
        }
    }

    fn done(name: &str) -> FileOutcome {
        FileOutcome::Done {
            output_path: format!("{name}.jsonl"),
            chunk_count: 2,
        }
    }

    async fn setup(
        outcomes: HashMap<String, FileOutcome>,
        concurrency: usize,
    ) -> (tempfile::TempDir, Arc<dyn JobStore>, Dispatcher) {
        let tmp = tempfile::tempdir().unwrap();
        let metrics = Arc::new(RuntimeMetrics::new());
        let store: Arc<dyn JobStore> =
            Arc::new(LibSqlStore::new_memory(Arc::clone(&metrics)).await.unwrap());
        let artifacts = Arc::new(ArtifactManager::new(tmp.path().to_path_buf()));
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            Arc::new(StubProcessor { outcomes }),
            artifacts,
            metrics,
            DispatchConfig {
                worker_concurrency: concurrency,
                poll_interval: Duration::from_millis(10),
            },
        );
        (tmp, store, dispatcher)
    }

    async fn submit(store: &Arc<dyn JobStore>, files: &[&str]) -> Job {
        let request = ProcessRequest {
            source_dir: "/data/docs".to_string(),
            files: files.iter().map(|s| s.to_string()).collect(),
            options: ProcessOptions::default(),
            idempotency_key: None,
        };
        let job = Job::new(&request);
        let rows: Vec<JobFile> = job
            .request
            .files
            .iter()
            .map(|f| JobFile::new(job.id, f))
            .collect();
        store
            .insert_job(
                &job,
                &rows,
                NewEvent::new(event_types::SUBMITTED, "submitted"),
            )
            .await
            .unwrap();
        job
    }

    #[tokio::test]
    async fn continue_on_error_yields_partially_failed() {
        let mut outcomes = HashMap::new();
        outcomes.insert(
            "f3.txt".to_string(),
            FileOutcome::Failed {
                error_type: "parse_error".to_string(),
                message: "fatal parse error".to_string(),
            },
        );
        for name in ["f1.txt", "f2.txt", "f4.txt", "f5.txt"] {
            outcomes.insert(name.to_string(), done(name));
        }

        let (_tmp, store, dispatcher) = setup(outcomes, 2).await;
        let job = submit(&store, &["f1.txt", "f2.txt", "f3.txt", "f4.txt", "f5.txt"]).await;

        let claimed = store.claim_next_queued().await.unwrap().unwrap();
        let status = dispatcher.run_job(&claimed).await.unwrap();
        assert_eq!(status, JobStatus::PartiallyFailed);

        let files = store.list_files(job.id).await.unwrap();
        for f in &files {
            if f.source_path == "f3.txt" {
                assert_eq!(f.status, FileStatus::Failed);
                assert_eq!(f.error_type.as_deref(), Some("parse_error"));
            } else {
                assert_eq!(f.status, FileStatus::Done, "{}", f.source_path);
            }
        }

        // Every file has at least one event
        let events = store.list_events(job.id, 100, 0).await.unwrap();
        for f in &files {
            assert!(
                events.iter().any(|e| {
                    e.payload.get("file").and_then(|v| v.as_str()) == Some(f.source_path.as_str())
                }),
                "no event for {}",
                f.source_path
            );
        }

        let loaded = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::PartiallyFailed);
        assert!(loaded.finished_at.is_some());
    }

    #[tokio::test]
    async fn all_files_succeeding_completes_the_job() {
        let (_tmp, store, dispatcher) = setup(HashMap::new(), 4).await;
        let job = submit(&store, &["a.txt", "b.txt"]).await;

        let claimed = store.claim_next_queued().await.unwrap().unwrap();
        let status = dispatcher.run_job(&claimed).await.unwrap();
        assert_eq!(status, JobStatus::Completed);

        let loaded = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn fatal_outcome_fails_job_and_leaves_rest_pending() {
        let mut outcomes = HashMap::new();
        outcomes.insert(
            "boom.txt".to_string(),
            FileOutcome::Fatal {
                message: "pipeline exploded".to_string(),
            },
        );

        // Concurrency 1 so files after the fatal one are never launched
        let (_tmp, store, dispatcher) = setup(outcomes, 1).await;
        let job = submit(&store, &["a_first.txt", "boom.txt", "z_last.txt"]).await;

        let claimed = store.claim_next_queued().await.unwrap().unwrap();
        let status = dispatcher.run_job(&claimed).await.unwrap();
        assert_eq!(status, JobStatus::Failed);

        let files = store.list_files(job.id).await.unwrap();
        let by_name = |n: &str| files.iter().find(|f| f.source_path == n).unwrap();
        assert_eq!(by_name("a_first.txt").status, FileStatus::Done);
        assert_eq!(by_name("boom.txt").status, FileStatus::Failed);
        assert_eq!(by_name("z_last.txt").status, FileStatus::Pending);
    }

    #[tokio::test]
    async fn all_failed_files_fail_the_job() {
        let mut outcomes = HashMap::new();
        for name in ["x.txt", "y.txt"] {
            outcomes.insert(
                name.to_string(),
                FileOutcome::Failed {
                    error_type: "parse_error".to_string(),
                    message: "bad".to_string(),
                },
            );
        }
        let (_tmp, store, dispatcher) = setup(outcomes, 2).await;
        let job = submit(&store, &["x.txt", "y.txt"]).await;

        let claimed = store.claim_next_queued().await.unwrap().unwrap();
        let status = dispatcher.run_job(&claimed).await.unwrap();
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(
            store.get_job(job.id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }
}
