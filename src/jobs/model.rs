//! Job data model — processing requests, job/file statuses, events, and
//! read-side projections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deterministic (v5) identifiers: idempotency hashes and
/// session ids. Fixed forever; changing it would orphan every existing hash.
const DOCMILL_NAMESPACE: Uuid = Uuid::from_u128(0x8f6a_32d1_55c4_4b0e_9a17_d3e8_41f2_7c09);

/// Well-known JobEvent type strings.
pub mod event_types {
    pub const SUBMITTED: &str = "submitted";
    pub const JOB_STARTED: &str = "job_started";
    pub const FILE_DONE: &str = "file_done";
    pub const FILE_FAILED: &str = "file_failed";
    pub const FILE_SKIPPED: &str = "file_skipped";
    pub const JOB_FINISHED: &str = "job_finished";
    pub const REPAIRED: &str = "repaired";
    pub const RETRY_REQUESTED: &str = "retry_requested";
    pub const ARTIFACTS_DELETED: &str = "artifacts_deleted";
}

// ── Statuses ────────────────────────────────────────────────────────

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Admitted, waiting for a dispatch slot.
    Queued,
    /// Claimed by the dispatcher, workers not yet running.
    Dispatched,
    /// File units are being processed.
    Running,
    /// Every file succeeded.
    Completed,
    /// Every file failed, or a fatal pipeline error occurred.
    Failed,
    /// Some files succeeded, some failed.
    PartiallyFailed,
}

impl JobStatus {
    /// Terminal statuses never transition again (except via retry reset).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::PartiallyFailed)
    }

    /// In-flight statuses counted against the admission backlog.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Dispatched => write!(f, "dispatched"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::PartiallyFailed => write!(f, "partially_failed"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "dispatched" => Ok(Self::Dispatched),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "partially_failed" => Ok(Self::PartiallyFailed),
            _ => Err(format!("Unknown job status: {s}")),
        }
    }
}

/// Processing status of a single file unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Not yet picked up by a worker.
    Pending,
    /// A worker is running the stage chain on it.
    Processing,
    /// Stage chain completed.
    Done,
    /// Stage chain reported a failure.
    Failed,
    /// Deliberately not processed (unsupported format, empty file).
    Skipped,
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for FileStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Unknown file status: {s}")),
        }
    }
}

// ── Requests ────────────────────────────────────────────────────────

/// Pipeline options carried with a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessOptions {
    /// Target chunk size in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Run the semantic stage (vectorization, topics, quality scores).
    #[serde(default = "default_true")]
    pub enable_semantic: bool,
    /// Output serialization format.
    #[serde(default = "default_output_format")]
    pub output_format: String,
}

fn default_chunk_size() -> usize {
    1200
}

fn default_true() -> bool {
    true
}

fn default_output_format() -> String {
    "jsonl".to_string()
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            enable_semantic: true,
            output_format: default_output_format(),
        }
    }
}

/// A document-processing request as submitted by a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRequest {
    /// Source directory the files belong to (session scope).
    pub source_dir: String,
    /// Files to process, relative to `source_dir` or absolute.
    pub files: Vec<String>,
    /// Pipeline options.
    #[serde(default)]
    pub options: ProcessOptions,
    /// Optional caller-supplied idempotency key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl ProcessRequest {
    /// Normalize the request: trim paths, drop empties, sort and dedupe the
    /// file list. Two requests that differ only in file order or surrounding
    /// whitespace normalize identically.
    pub fn normalized(&self) -> Self {
        let mut files: Vec<String> = self
            .files
            .iter()
            .map(|f| normalize_path(f))
            .filter(|f| !f.is_empty())
            .collect();
        files.sort();
        files.dedup();
        Self {
            source_dir: normalize_path(&self.source_dir),
            files,
            options: self.options.clone(),
            idempotency_key: self
                .idempotency_key
                .as_ref()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty()),
        }
    }

    /// Deterministic fingerprint of the normalized request.
    ///
    /// A v5 UUID over a canonical rendering, so resubmissions hash
    /// identically regardless of file order or path whitespace.
    pub fn idempotency_hash(&self) -> Uuid {
        let n = self.normalized();
        let canonical = format!(
            "{}\n{}\n{}|{}|{}\n{}",
            n.source_dir,
            n.files.join("\n"),
            n.options.chunk_size,
            n.options.enable_semantic,
            n.options.output_format,
            n.idempotency_key.as_deref().unwrap_or(""),
        );
        Uuid::new_v5(&DOCMILL_NAMESPACE, canonical.as_bytes())
    }

    /// Session id for this request's source directory.
    pub fn session_id(&self) -> Uuid {
        session_id_for_dir(&self.source_dir)
    }
}

/// Normalize a path string: trim whitespace and trailing separators.
pub fn normalize_path(path: &str) -> String {
    path.trim().trim_end_matches('/').to_string()
}

/// Deterministic session id for a source directory.
pub fn session_id_for_dir(dir: &str) -> Uuid {
    Uuid::new_v5(&DOCMILL_NAMESPACE, normalize_path(dir).as_bytes())
}

// ── Records ─────────────────────────────────────────────────────────

/// One processing request spanning one or more file units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub idempotency_hash: Uuid,
    pub status: JobStatus,
    pub request: ProcessRequest,
    pub session_id: Uuid,
    /// Whether the dispatcher's view of this job is in sync with the store.
    pub dispatch_synced: bool,
    pub dispatch_synced_at: Option<DateTime<Utc>>,
    /// Whether the on-disk artifact tree matches the store's output records.
    pub artifact_synced: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a queued job from a request. The request is normalized so the
    /// stored payload matches the hash it was admitted under.
    pub fn new(request: &ProcessRequest) -> Self {
        let normalized = request.normalized();
        Self {
            id: Uuid::new_v4(),
            idempotency_hash: normalized.idempotency_hash(),
            status: JobStatus::Queued,
            session_id: normalized.session_id(),
            request: normalized,
            dispatch_synced: false,
            dispatch_synced_at: None,
            artifact_synced: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// The per-file processing record within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFile {
    pub id: Uuid,
    pub job_id: Uuid,
    /// Normalized source path, unique within the job.
    pub source_path: String,
    pub output_path: Option<String>,
    pub status: FileStatus,
    pub chunk_count: i64,
    pub retry_count: i64,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl JobFile {
    /// A fresh pending file record for `job_id`.
    pub fn new(job_id: Uuid, source_path: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            source_path: normalize_path(source_path),
            output_path: None,
            status: FileStatus::Pending,
            chunk_count: 0,
            retry_count: 0,
            error_type: None,
            error_message: None,
            updated_at: Utc::now(),
        }
    }
}

/// An immutable, time-ordered audit entry for a job.
///
/// `seq` is assigned by the store on append and is strictly increasing;
/// rows are never mutated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub seq: i64,
    pub job_id: Uuid,
    pub event_type: String,
    pub message: String,
    pub payload: serde_json::Value,
    pub event_time: DateTime<Utc>,
}

/// Read-optimized aggregate over all jobs for one source directory.
///
/// Rebuildable from Job/JobFile rows at any time; a cache, not a source
/// of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub source_dir: String,
    pub job_count: i64,
    pub active_jobs: i64,
    pub files_total: i64,
    pub files_done: i64,
    pub files_failed: i64,
    /// Rolled-up status across the session's jobs.
    pub status: JobStatus,
    pub last_activity: DateTime<Utc>,
}

/// Which failed files a retry targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "selector", content = "id")]
pub enum RetrySelector {
    /// All failed files of one job.
    Job(Uuid),
    /// All failed files across a session's jobs.
    Session(Uuid),
    /// The most recent job with at least one failed file.
    MostRecent,
}

impl std::fmt::Display for RetrySelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Job(id) => write!(f, "job:{id}"),
            Self::Session(id) => write!(f, "session:{id}"),
            Self::MostRecent => write!(f, "most_recent"),
        }
    }
}

/// One record per retry invocation. Immutable after completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRun {
    pub id: Uuid,
    pub job_id: Uuid,
    pub selector: String,
    pub file_count: i64,
    pub status: JobStatus,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(files: &[&str]) -> ProcessRequest {
        ProcessRequest {
            source_dir: "/data/docs".to_string(),
            files: files.iter().map(|s| s.to_string()).collect(),
            options: ProcessOptions::default(),
            idempotency_key: None,
        }
    }

    #[test]
    fn hash_ignores_file_order_and_whitespace() {
        let a = request(&["b.pdf", "a.pdf"]);
        let b = request(&[" a.pdf ", "b.pdf"]);
        assert_eq!(a.idempotency_hash(), b.idempotency_hash());
    }

    #[test]
    fn hash_differs_for_different_options() {
        let a = request(&["a.pdf"]);
        let mut b = request(&["a.pdf"]);
        b.options.chunk_size = 400;
        assert_ne!(a.idempotency_hash(), b.idempotency_hash());
    }

    #[test]
    fn hash_differs_for_different_idempotency_key() {
        let a = request(&["a.pdf"]);
        let mut b = request(&["a.pdf"]);
        b.idempotency_key = Some("run-2".to_string());
        assert_ne!(a.idempotency_hash(), b.idempotency_hash());
    }

    #[test]
    fn normalized_dedupes_files() {
        let r = request(&["a.pdf", "a.pdf", "b.pdf"]).normalized();
        assert_eq!(r.files, vec!["a.pdf", "b.pdf"]);
    }

    #[test]
    fn job_status_round_trips() {
        for s in [
            JobStatus::Queued,
            JobStatus::Dispatched,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::PartiallyFailed,
        ] {
            assert_eq!(s.to_string().parse::<JobStatus>().unwrap(), s);
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::PartiallyFailed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Queued.is_active());
    }

    #[test]
    fn session_id_is_stable() {
        assert_eq!(
            session_id_for_dir("/data/docs"),
            session_id_for_dir("/data/docs/"),
        );
    }
}
