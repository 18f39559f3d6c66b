//! Admission controller — validation, idempotent dedup, and backpressure.
//!
//! The capacity ceiling here is the system's only backpressure mechanism:
//! submissions over the backlog limit are rejected with a retry hint
//! instead of queuing unboundedly.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use uuid::Uuid;

use crate::artifacts::ArtifactManager;
use crate::dispatch::DispatcherHandle;
use crate::error::AdmissionError;
use crate::jobs::model::{Job, JobFile, ProcessRequest, event_types};
use crate::metrics::RuntimeMetrics;
use crate::store::{JobStore, NewEvent};

/// Admission limits.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub backlog_capacity: u64,
    pub retry_after: Duration,
}

/// Outcome of a successful submission.
#[derive(Debug, Clone)]
pub struct Admitted {
    pub job_id: Uuid,
    /// True when an existing job was returned instead of creating one.
    pub deduplicated: bool,
}

/// Validates, deduplicates, and persists incoming processing requests.
pub struct AdmissionController {
    store: Arc<dyn JobStore>,
    artifacts: Arc<ArtifactManager>,
    metrics: Arc<RuntimeMetrics>,
    dispatcher: DispatcherHandle,
    config: AdmissionConfig,
}

impl AdmissionController {
    pub fn new(
        store: Arc<dyn JobStore>,
        artifacts: Arc<ArtifactManager>,
        metrics: Arc<RuntimeMetrics>,
        dispatcher: DispatcherHandle,
        config: AdmissionConfig,
    ) -> Self {
        Self {
            store,
            artifacts,
            metrics,
            dispatcher,
            config,
        }
    }

    /// Submit a processing request.
    ///
    /// Idempotent: a request hashing to an existing non-superseded job
    /// returns that job's id without creating anything. Over capacity,
    /// the submission is rejected before any state mutation.
    pub async fn submit(&self, request: ProcessRequest) -> Result<Admitted, AdmissionError> {
        validate(&request)?;

        let normalized = request.normalized();
        let hash = normalized.idempotency_hash();

        if let Some(existing) = self.store.find_job_by_hash(hash).await? {
            debug!(job_id = %existing.id, "Resubmission deduplicated");
            RuntimeMetrics::incr(&self.metrics.jobs_deduplicated);
            return Ok(Admitted {
                job_id: existing.id,
                deduplicated: true,
            });
        }

        let active = self.store.count_active_jobs().await?;
        if active >= self.config.backlog_capacity {
            RuntimeMetrics::incr(&self.metrics.jobs_rejected);
            return Err(AdmissionError::BacklogFull {
                active,
                capacity: self.config.backlog_capacity,
                retry_after: self.config.retry_after,
            });
        }

        let job = Job::new(&normalized);
        let files: Vec<JobFile> = job
            .request
            .files
            .iter()
            .map(|f| JobFile::new(job.id, f))
            .collect();

        let payload = serde_json::json!({
            "source_dir": job.request.source_dir,
            "file_count": files.len(),
            "idempotency_hash": job.idempotency_hash,
        });
        let event = NewEvent::new(
            event_types::SUBMITTED,
            format!("Job submitted with {} file(s)", files.len()),
        )
        .with_payload(payload.clone());

        match self.store.insert_job(&job, &files, event).await {
            Ok(()) => {}
            Err(e) => {
                // Two identical submissions can race past the hash lookup;
                // the partial unique index turns the loser into a dedup hit.
                if e.to_string().to_ascii_lowercase().contains("unique")
                    && let Some(existing) = self.store.find_job_by_hash(hash).await?
                {
                    RuntimeMetrics::incr(&self.metrics.jobs_deduplicated);
                    return Ok(Admitted {
                        job_id: existing.id,
                        deduplicated: true,
                    });
                }
                return Err(e.into());
            }
        }

        self.artifacts
            .mirror_event(
                job.id,
                event_types::SUBMITTED,
                "Job submitted",
                &payload,
            )
            .await;

        RuntimeMetrics::incr(&self.metrics.jobs_admitted);
        info!(
            job_id = %job.id,
            files = files.len(),
            source_dir = %job.request.source_dir,
            "Job admitted"
        );

        self.dispatcher.wake();
        Ok(Admitted {
            job_id: job.id,
            deduplicated: false,
        })
    }
}

/// Reject malformed requests before anything is persisted.
fn validate(request: &ProcessRequest) -> Result<(), AdmissionError> {
    let normalized = request.normalized();
    if normalized.source_dir.is_empty() {
        return Err(AdmissionError::Invalid {
            reason: "source_dir must not be empty".to_string(),
        });
    }
    if normalized.files.is_empty() {
        return Err(AdmissionError::Invalid {
            reason: "at least one file is required".to_string(),
        });
    }
    if normalized.options.chunk_size == 0 {
        return Err(AdmissionError::Invalid {
            reason: "chunk_size must be greater than zero".to_string(),
        });
    }
    if !matches!(normalized.options.output_format.as_str(), "jsonl" | "json") {
        return Err(AdmissionError::Invalid {
            reason: format!(
                "unsupported output_format: {}",
                normalized.options.output_format
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::ProcessOptions;

    fn request(files: &[&str]) -> ProcessRequest {
        ProcessRequest {
            source_dir: "/data/docs".to_string(),
            files: files.iter().map(|s| s.to_string()).collect(),
            options: ProcessOptions::default(),
            idempotency_key: None,
        }
    }

    #[test]
    fn empty_file_list_is_invalid() {
        let err = validate(&request(&[])).unwrap_err();
        assert!(matches!(err, AdmissionError::Invalid { .. }));
    }

    #[test]
    fn blank_source_dir_is_invalid() {
        let mut r = request(&["a.pdf"]);
        r.source_dir = "   ".to_string();
        assert!(validate(&r).is_err());
    }

    #[test]
    fn zero_chunk_size_is_invalid() {
        let mut r = request(&["a.pdf"]);
        r.options.chunk_size = 0;
        assert!(validate(&r).is_err());
    }

    #[test]
    fn default_request_is_valid() {
        assert!(validate(&request(&["a.pdf"])).is_ok());
    }
}
