//! libSQL backend — async `JobStore` implementation.
//!
//! One connection, shared by all components; writes contend at the SQLite
//! layer and are retried with bounded exponential backoff. Multi-row
//! mutations run inside a single transaction.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::params::IntoParams;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::BusyRetryPolicy;
use crate::error::StoreError;
use crate::jobs::model::{
    FileStatus, Job, JobEvent, JobFile, JobStatus, ProcessRequest, RetryRun, Session,
};
use crate::metrics::RuntimeMetrics;
use crate::store::migrations;
use crate::store::traits::{FileStatusCounts, JobStore, NewEvent};

/// libSQL store backend.
///
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use;
/// SQLite serializes the actual writes.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    policy: BusyRetryPolicy,
    metrics: Arc<RuntimeMetrics>,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(
        path: &Path,
        policy: BusyRetryPolicy,
        metrics: Arc<RuntimeMetrics>,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("Failed to create database directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
            policy,
            metrics,
        };
        store.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory(metrics: Arc<RuntimeMetrics>) -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
            policy: BusyRetryPolicy::default(),
            metrics,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    // ── Busy-retry plumbing ─────────────────────────────────────────

    /// Execute a write, retrying on busy/locked up to the policy's limit.
    async fn execute_retry<P>(
        &self,
        ctx: &'static str,
        sql: &str,
        params: P,
    ) -> Result<u64, StoreError>
    where
        P: IntoParams + Send,
    {
        let params = params
            .into_params()
            .map_err(|e| StoreError::Query(format!("{ctx}: {e}")))?;
        let mut attempt = 0u32;
        loop {
            match self.conn.execute(sql, params.clone()).await {
                Ok(n) => return Ok(n),
                Err(e) if is_busy(&e) => {
                    attempt += 1;
                    if attempt >= self.policy.max_attempts {
                        error!(ctx, attempts = attempt, "Database busy, retries exhausted");
                        return Err(StoreError::Busy { attempts: attempt });
                    }
                    RuntimeMetrics::incr(&self.metrics.busy_retries);
                    tokio::time::sleep(self.policy.delay_for(attempt)).await;
                }
                Err(e) => return Err(StoreError::Query(format!("{ctx}: {e}"))),
            }
        }
    }

    /// Run a query, retrying on busy/locked up to the policy's limit.
    async fn query_retry<P>(
        &self,
        ctx: &'static str,
        sql: &str,
        params: P,
    ) -> Result<libsql::Rows, StoreError>
    where
        P: IntoParams + Send,
    {
        let params = params
            .into_params()
            .map_err(|e| StoreError::Query(format!("{ctx}: {e}")))?;
        let mut attempt = 0u32;
        loop {
            match self.conn.query(sql, params.clone()).await {
                Ok(rows) => return Ok(rows),
                Err(e) if is_busy(&e) => {
                    attempt += 1;
                    if attempt >= self.policy.max_attempts {
                        error!(ctx, attempts = attempt, "Database busy, retries exhausted");
                        return Err(StoreError::Busy { attempts: attempt });
                    }
                    RuntimeMetrics::incr(&self.metrics.busy_retries);
                    tokio::time::sleep(self.policy.delay_for(attempt)).await;
                }
                Err(e) => return Err(StoreError::Query(format!("{ctx}: {e}"))),
            }
        }
    }

    /// Begin a transaction, retrying on busy/locked.
    async fn begin(&self, ctx: &'static str) -> Result<libsql::Transaction, StoreError> {
        let mut attempt = 0u32;
        loop {
            match self.conn.transaction().await {
                Ok(tx) => return Ok(tx),
                Err(e) if is_busy(&e) => {
                    attempt += 1;
                    if attempt >= self.policy.max_attempts {
                        error!(ctx, attempts = attempt, "Database busy, retries exhausted");
                        return Err(StoreError::Busy { attempts: attempt });
                    }
                    RuntimeMetrics::incr(&self.metrics.busy_retries);
                    tokio::time::sleep(self.policy.delay_for(attempt)).await;
                }
                Err(e) => return Err(StoreError::Transaction(format!("{ctx}: {e}"))),
            }
        }
    }

    /// Collect all rows of a query through a row mapper.
    async fn collect_rows<T>(
        ctx: &'static str,
        mut rows: libsql::Rows,
        map: fn(&libsql::Row) -> Result<T, libsql::Error>,
    ) -> Result<Vec<T>, StoreError> {
        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("{ctx}: {e}")))?
        {
            match map(&row) {
                Ok(item) => out.push(item),
                Err(e) => {
                    tracing::warn!(ctx, "Skipping unreadable row: {e}");
                }
            }
        }
        Ok(out)
    }
}

/// Busy/locked errors are transient; everything else is fatal.
fn is_busy(e: &libsql::Error) -> bool {
    let msg = e.to_string().to_ascii_lowercase();
    msg.contains("busy") || msg.contains("locked")
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

/// Convert `Option<String>` to libsql Value.
fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

const JOB_COLUMNS: &str = "id, idempotency_hash, status, request, source_dir, session_id, \
     dispatch_synced, dispatch_synced_at, artifact_synced, created_at, started_at, finished_at";

const FILE_COLUMNS: &str = "id, job_id, source_path, output_path, status, chunk_count, \
     retry_count, error_type, error_message, updated_at";

const EVENT_COLUMNS: &str = "seq, job_id, event_type, message, payload, event_time";

const SESSION_COLUMNS: &str = "id, source_dir, job_count, active_jobs, files_total, \
     files_done, files_failed, status, last_activity";

const RETRY_COLUMNS: &str = "id, job_id, selector, file_count, status, requested_at, completed_at";

/// Map a libsql Row to a Job. Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<Job, libsql::Error> {
    let id: String = row.get(0)?;
    let hash: String = row.get(1)?;
    let status: String = row.get(2)?;
    let request_json: String = row.get(3)?;
    let session_id: String = row.get(5)?;
    let dispatch_synced: i64 = row.get(6)?;
    let dispatch_synced_at: Option<String> = row.get(7).ok();
    let artifact_synced: i64 = row.get(8)?;
    let created_at: String = row.get(9)?;
    let started_at: Option<String> = row.get(10).ok();
    let finished_at: Option<String> = row.get(11).ok();

    let request: ProcessRequest = serde_json::from_str(&request_json).unwrap_or(ProcessRequest {
        source_dir: String::new(),
        files: Vec::new(),
        options: Default::default(),
        idempotency_key: None,
    });

    Ok(Job {
        id: parse_uuid(&id),
        idempotency_hash: parse_uuid(&hash),
        status: status.parse().unwrap_or(JobStatus::Queued),
        request,
        session_id: parse_uuid(&session_id),
        dispatch_synced: dispatch_synced != 0,
        dispatch_synced_at: parse_optional_datetime(&dispatch_synced_at),
        artifact_synced: artifact_synced != 0,
        created_at: parse_datetime(&created_at),
        started_at: parse_optional_datetime(&started_at),
        finished_at: parse_optional_datetime(&finished_at),
    })
}

/// Map a libsql Row to a JobFile. Column order matches FILE_COLUMNS.
fn row_to_file(row: &libsql::Row) -> Result<JobFile, libsql::Error> {
    let id: String = row.get(0)?;
    let job_id: String = row.get(1)?;
    let status: String = row.get(4)?;
    let updated_at: String = row.get(9)?;

    Ok(JobFile {
        id: parse_uuid(&id),
        job_id: parse_uuid(&job_id),
        source_path: row.get(2)?,
        output_path: row.get(3).ok(),
        status: status.parse().unwrap_or(FileStatus::Pending),
        chunk_count: row.get(5)?,
        retry_count: row.get(6)?,
        error_type: row.get(7).ok(),
        error_message: row.get(8).ok(),
        updated_at: parse_datetime(&updated_at),
    })
}

/// Map a libsql Row to a JobEvent. Column order matches EVENT_COLUMNS.
fn row_to_event(row: &libsql::Row) -> Result<JobEvent, libsql::Error> {
    let job_id: String = row.get(1)?;
    let payload: String = row.get(4)?;
    let event_time: String = row.get(5)?;

    Ok(JobEvent {
        seq: row.get(0)?,
        job_id: parse_uuid(&job_id),
        event_type: row.get(2)?,
        message: row.get(3)?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        event_time: parse_datetime(&event_time),
    })
}

/// Map a libsql Row to a Session. Column order matches SESSION_COLUMNS.
fn row_to_session(row: &libsql::Row) -> Result<Session, libsql::Error> {
    let id: String = row.get(0)?;
    let status: String = row.get(7)?;
    let last_activity: String = row.get(8)?;

    Ok(Session {
        id: parse_uuid(&id),
        source_dir: row.get(1)?,
        job_count: row.get(2)?,
        active_jobs: row.get(3)?,
        files_total: row.get(4)?,
        files_done: row.get(5)?,
        files_failed: row.get(6)?,
        status: status.parse().unwrap_or(JobStatus::Completed),
        last_activity: parse_datetime(&last_activity),
    })
}

/// Map a libsql Row to a RetryRun. Column order matches RETRY_COLUMNS.
fn row_to_retry_run(row: &libsql::Row) -> Result<RetryRun, libsql::Error> {
    let id: String = row.get(0)?;
    let job_id: String = row.get(1)?;
    let status: String = row.get(4)?;
    let requested_at: String = row.get(5)?;
    let completed_at: Option<String> = row.get(6).ok();

    Ok(RetryRun {
        id: parse_uuid(&id),
        job_id: parse_uuid(&job_id),
        selector: row.get(2)?,
        file_count: row.get(3)?,
        status: status.parse().unwrap_or(JobStatus::Queued),
        requested_at: parse_datetime(&requested_at),
        completed_at: parse_optional_datetime(&completed_at),
    })
}

/// Append an event inside an open transaction.
async fn insert_event_tx(
    tx: &libsql::Transaction,
    job_id: Uuid,
    event: &NewEvent,
) -> Result<(), libsql::Error> {
    tx.execute(
        "INSERT INTO job_events (job_id, event_type, message, payload, event_time) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            job_id.to_string(),
            event.event_type.clone(),
            event.message.clone(),
            event.payload.to_string(),
            Utc::now().to_rfc3339(),
        ],
    )
    .await?;
    Ok(())
}

fn tx_err(ctx: &'static str, e: libsql::Error) -> StoreError {
    StoreError::Transaction(format!("{ctx}: {e}"))
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), StoreError> {
        migrations::run_migrations(&self.conn).await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(
        &self,
        job: &Job,
        files: &[JobFile],
        event: NewEvent,
    ) -> Result<(), StoreError> {
        let request_json = serde_json::to_string(&job.request)
            .map_err(|e| StoreError::Serialization(format!("insert_job request: {e}")))?;

        let tx = self.begin("insert_job").await?;

        tx.execute(
            "INSERT INTO jobs (id, idempotency_hash, status, request, source_dir, session_id, \
             dispatch_synced, dispatch_synced_at, artifact_synced, created_at, started_at, finished_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                job.id.to_string(),
                job.idempotency_hash.to_string(),
                job.status.to_string(),
                request_json,
                job.request.source_dir.clone(),
                job.session_id.to_string(),
                job.dispatch_synced as i64,
                opt_text(job.dispatch_synced_at.map(|t| t.to_rfc3339())),
                job.artifact_synced as i64,
                job.created_at.to_rfc3339(),
                opt_text(job.started_at.map(|t| t.to_rfc3339())),
                opt_text(job.finished_at.map(|t| t.to_rfc3339())),
            ],
        )
        .await
        .map_err(|e| tx_err("insert_job", e))?;

        for file in files {
            tx.execute(
                "INSERT INTO job_files (id, job_id, source_path, output_path, status, chunk_count, \
                 retry_count, error_type, error_message, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    file.id.to_string(),
                    file.job_id.to_string(),
                    file.source_path.clone(),
                    opt_text(file.output_path.clone()),
                    file.status.to_string(),
                    file.chunk_count,
                    file.retry_count,
                    opt_text(file.error_type.clone()),
                    opt_text(file.error_message.clone()),
                    file.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| tx_err("insert_job files", e))?;
        }

        insert_event_tx(&tx, job.id, &event)
            .await
            .map_err(|e| tx_err("insert_job event", e))?;

        tx.commit().await.map_err(|e| tx_err("insert_job commit", e))?;
        debug!(job_id = %job.id, files = files.len(), "Job inserted");
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let mut rows = self
            .query_retry(
                "get_job",
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;

        match rows.next().await {
            Ok(Some(row)) => {
                let job = row_to_job(&row)
                    .map_err(|e| StoreError::Query(format!("get_job row parse: {e}")))?;
                Ok(Some(job))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_job: {e}"))),
        }
    }

    async fn list_jobs(&self, limit: u32, offset: u32) -> Result<Vec<Job>, StoreError> {
        let rows = self
            .query_retry(
                "list_jobs",
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
                ),
                params![limit as i64, offset as i64],
            )
            .await?;
        Self::collect_rows("list_jobs", rows, row_to_job).await
    }

    async fn find_job_by_hash(&self, hash: Uuid) -> Result<Option<Job>, StoreError> {
        let mut rows = self
            .query_retry(
                "find_job_by_hash",
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs \
                     WHERE idempotency_hash = ?1 AND status != 'failed' \
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![hash.to_string()],
            )
            .await?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row).map_err(|e| {
                StoreError::Query(format!("find_job_by_hash row parse: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("find_job_by_hash: {e}"))),
        }
    }

    async fn count_active_jobs(&self) -> Result<u64, StoreError> {
        let mut rows = self
            .query_retry(
                "count_active_jobs",
                "SELECT COUNT(*) FROM jobs WHERE status IN ('queued', 'dispatched', 'running')",
                (),
            )
            .await?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("count_active_jobs: {e}")))?;
                Ok(count as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(StoreError::Query(format!("count_active_jobs: {e}"))),
        }
    }

    async fn claim_next_queued(&self) -> Result<Option<Job>, StoreError> {
        let tx = self.begin("claim_next_queued").await?;

        let mut rows = tx
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'queued' \
                     ORDER BY created_at ASC LIMIT 1"
                ),
                (),
            )
            .await
            .map_err(|e| tx_err("claim_next_queued", e))?;

        let job = match rows.next().await {
            Ok(Some(row)) => {
                row_to_job(&row).map_err(|e| tx_err("claim_next_queued row", e))?
            }
            Ok(None) => {
                tx.commit()
                    .await
                    .map_err(|e| tx_err("claim_next_queued commit", e))?;
                return Ok(None);
            }
            Err(e) => return Err(tx_err("claim_next_queued", e)),
        };

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "UPDATE jobs SET status = 'dispatched', dispatch_synced = 1, \
             dispatch_synced_at = ?1 WHERE id = ?2",
            params![now.clone(), job.id.to_string()],
        )
        .await
        .map_err(|e| tx_err("claim_next_queued update", e))?;

        tx.commit()
            .await
            .map_err(|e| tx_err("claim_next_queued commit", e))?;

        let mut claimed = job;
        claimed.status = JobStatus::Dispatched;
        claimed.dispatch_synced = true;
        claimed.dispatch_synced_at = Some(parse_datetime(&now));
        Ok(Some(claimed))
    }

    async fn mark_job_running(&self, id: Uuid, event: NewEvent) -> Result<(), StoreError> {
        let tx = self.begin("mark_job_running").await?;
        tx.execute(
            "UPDATE jobs SET status = 'running', started_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id.to_string()],
        )
        .await
        .map_err(|e| tx_err("mark_job_running", e))?;
        insert_event_tx(&tx, id, &event)
            .await
            .map_err(|e| tx_err("mark_job_running event", e))?;
        tx.commit()
            .await
            .map_err(|e| tx_err("mark_job_running commit", e))
    }

    async fn finish_job(
        &self,
        id: Uuid,
        status: JobStatus,
        event: NewEvent,
    ) -> Result<(), StoreError> {
        let tx = self.begin("finish_job").await?;
        tx.execute(
            "UPDATE jobs SET status = ?1, finished_at = ?2 WHERE id = ?3",
            params![status.to_string(), Utc::now().to_rfc3339(), id.to_string()],
        )
        .await
        .map_err(|e| tx_err("finish_job", e))?;
        insert_event_tx(&tx, id, &event)
            .await
            .map_err(|e| tx_err("finish_job event", e))?;
        tx.commit().await.map_err(|e| tx_err("finish_job commit", e))?;
        debug!(job_id = %id, status = %status, "Job finished");
        Ok(())
    }

    async fn set_artifact_synced(&self, id: Uuid, synced: bool) -> Result<(), StoreError> {
        self.execute_retry(
            "set_artifact_synced",
            "UPDATE jobs SET artifact_synced = ?1 WHERE id = ?2",
            params![synced as i64, id.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn list_orphaned_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let rows = self
            .query_retry(
                "list_orphaned_jobs",
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs \
                     WHERE status IN ('dispatched', 'running') \
                     AND (dispatch_synced_at IS NULL OR dispatch_synced_at < ?1)"
                ),
                params![cutoff.to_rfc3339()],
            )
            .await?;
        Self::collect_rows("list_orphaned_jobs", rows, row_to_job).await
    }

    async fn list_jobs_by_session(&self, session_id: Uuid) -> Result<Vec<Job>, StoreError> {
        let rows = self
            .query_retry(
                "list_jobs_by_session",
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE session_id = ?1 \
                     ORDER BY created_at DESC"
                ),
                params![session_id.to_string()],
            )
            .await?;
        Self::collect_rows("list_jobs_by_session", rows, row_to_job).await
    }

    async fn most_recent_job_with_failures(&self) -> Result<Option<Job>, StoreError> {
        let mut rows = self
            .query_retry(
                "most_recent_job_with_failures",
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs j \
                     WHERE j.status IN ('failed', 'partially_failed') \
                     AND EXISTS (SELECT 1 FROM job_files f \
                                 WHERE f.job_id = j.id AND f.status = 'failed') \
                     ORDER BY COALESCE(j.finished_at, j.created_at) DESC LIMIT 1"
                ),
                (),
            )
            .await?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row).map_err(|e| {
                StoreError::Query(format!("most_recent_job_with_failures row: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!(
                "most_recent_job_with_failures: {e}"
            ))),
        }
    }

    async fn repair_job(
        &self,
        id: Uuid,
        status: JobStatus,
        event: NewEvent,
    ) -> Result<(), StoreError> {
        let tx = self.begin("repair_job").await?;
        tx.execute(
            "UPDATE jobs SET status = ?1, finished_at = COALESCE(finished_at, ?2) WHERE id = ?3",
            params![status.to_string(), Utc::now().to_rfc3339(), id.to_string()],
        )
        .await
        .map_err(|e| tx_err("repair_job", e))?;
        insert_event_tx(&tx, id, &event)
            .await
            .map_err(|e| tx_err("repair_job event", e))?;
        tx.commit().await.map_err(|e| tx_err("repair_job commit", e))
    }

    // ── Job files ───────────────────────────────────────────────────

    async fn list_files(&self, job_id: Uuid) -> Result<Vec<JobFile>, StoreError> {
        let rows = self
            .query_retry(
                "list_files",
                &format!(
                    "SELECT {FILE_COLUMNS} FROM job_files WHERE job_id = ?1 \
                     ORDER BY source_path ASC"
                ),
                params![job_id.to_string()],
            )
            .await?;
        Self::collect_rows("list_files", rows, row_to_file).await
    }

    async fn list_files_page(
        &self,
        job_id: Uuid,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<JobFile>, StoreError> {
        let rows = self
            .query_retry(
                "list_files_page",
                &format!(
                    "SELECT {FILE_COLUMNS} FROM job_files WHERE job_id = ?1 \
                     ORDER BY source_path ASC LIMIT ?2 OFFSET ?3"
                ),
                params![job_id.to_string(), limit as i64, offset as i64],
            )
            .await?;
        Self::collect_rows("list_files_page", rows, row_to_file).await
    }

    async fn list_failed_files(&self, job_id: Uuid) -> Result<Vec<JobFile>, StoreError> {
        let rows = self
            .query_retry(
                "list_failed_files",
                &format!(
                    "SELECT {FILE_COLUMNS} FROM job_files \
                     WHERE job_id = ?1 AND status = 'failed' ORDER BY source_path ASC"
                ),
                params![job_id.to_string()],
            )
            .await?;
        Self::collect_rows("list_failed_files", rows, row_to_file).await
    }

    async fn mark_file_processing(&self, file_id: Uuid) -> Result<(), StoreError> {
        self.execute_retry(
            "mark_file_processing",
            "UPDATE job_files SET status = 'processing', updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), file_id.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn record_file_result(
        &self,
        file: &JobFile,
        event: NewEvent,
    ) -> Result<(), StoreError> {
        let tx = self.begin("record_file_result").await?;
        tx.execute(
            "UPDATE job_files SET output_path = ?1, status = ?2, chunk_count = ?3, \
             error_type = ?4, error_message = ?5, updated_at = ?6 WHERE id = ?7",
            params![
                opt_text(file.output_path.clone()),
                file.status.to_string(),
                file.chunk_count,
                opt_text(file.error_type.clone()),
                opt_text(file.error_message.clone()),
                Utc::now().to_rfc3339(),
                file.id.to_string(),
            ],
        )
        .await
        .map_err(|e| tx_err("record_file_result", e))?;
        insert_event_tx(&tx, file.job_id, &event)
            .await
            .map_err(|e| tx_err("record_file_result event", e))?;
        tx.commit()
            .await
            .map_err(|e| tx_err("record_file_result commit", e))
    }

    async fn reset_files_for_retry(
        &self,
        job_id: Uuid,
        file_ids: &[Uuid],
        event: NewEvent,
    ) -> Result<u64, StoreError> {
        let tx = self.begin("reset_files_for_retry").await?;
        let now = Utc::now().to_rfc3339();

        let mut reset = 0u64;
        for file_id in file_ids {
            reset += tx
                .execute(
                    "UPDATE job_files SET status = 'pending', retry_count = retry_count + 1, \
                     error_type = NULL, error_message = NULL, updated_at = ?1 \
                     WHERE id = ?2 AND job_id = ?3 AND status = 'failed'",
                    params![now.clone(), file_id.to_string(), job_id.to_string()],
                )
                .await
                .map_err(|e| tx_err("reset_files_for_retry", e))?;
        }

        if reset > 0 {
            tx.execute(
                "UPDATE jobs SET status = 'queued', finished_at = NULL, \
                 dispatch_synced = 0, dispatch_synced_at = NULL WHERE id = ?1",
                params![job_id.to_string()],
            )
            .await
            .map_err(|e| tx_err("reset_files_for_retry requeue", e))?;

            insert_event_tx(&tx, job_id, &event)
                .await
                .map_err(|e| tx_err("reset_files_for_retry event", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| tx_err("reset_files_for_retry commit", e))?;
        Ok(reset)
    }

    async fn fail_inflight_files(&self, job_id: Uuid) -> Result<u64, StoreError> {
        self.execute_retry(
            "fail_inflight_files",
            "UPDATE job_files SET status = 'failed', error_type = 'interrupted', \
             error_message = 'Processing interrupted by unclean shutdown', updated_at = ?1 \
             WHERE job_id = ?2 AND status = 'processing'",
            params![Utc::now().to_rfc3339(), job_id.to_string()],
        )
        .await
    }

    async fn count_files(&self, job_id: Uuid) -> Result<FileStatusCounts, StoreError> {
        let mut rows = self
            .query_retry(
                "count_files",
                "SELECT status, COUNT(*) FROM job_files WHERE job_id = ?1 GROUP BY status",
                params![job_id.to_string()],
            )
            .await?;

        let mut counts = FileStatusCounts::default();
        while let Ok(Some(row)) = rows.next().await {
            let status: String = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("count_files: {e}")))?;
            let count: i64 = row
                .get(1)
                .map_err(|e| StoreError::Query(format!("count_files: {e}")))?;
            match status.as_str() {
                "pending" => counts.pending = count,
                "processing" => counts.processing = count,
                "done" => counts.done = count,
                "failed" => counts.failed = count,
                "skipped" => counts.skipped = count,
                other => tracing::warn!(status = other, "Unknown file status in count"),
            }
        }
        Ok(counts)
    }

    // ── Events ──────────────────────────────────────────────────────

    async fn append_event(&self, job_id: Uuid, event: NewEvent) -> Result<JobEvent, StoreError> {
        let event_time = Utc::now();
        self.execute_retry(
            "append_event",
            "INSERT INTO job_events (job_id, event_type, message, payload, event_time) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                job_id.to_string(),
                event.event_type.clone(),
                event.message.clone(),
                event.payload.to_string(),
                event_time.to_rfc3339(),
            ],
        )
        .await?;

        Ok(JobEvent {
            seq: self.conn.last_insert_rowid(),
            job_id,
            event_type: event.event_type,
            message: event.message,
            payload: event.payload,
            event_time,
        })
    }

    async fn list_events(
        &self,
        job_id: Uuid,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<JobEvent>, StoreError> {
        let rows = self
            .query_retry(
                "list_events",
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM job_events WHERE job_id = ?1 \
                     ORDER BY seq ASC LIMIT ?2 OFFSET ?3"
                ),
                params![job_id.to_string(), limit as i64, offset as i64],
            )
            .await?;
        Self::collect_rows("list_events", rows, row_to_event).await
    }

    // ── Sessions ────────────────────────────────────────────────────

    async fn upsert_session(&self, session: &Session) -> Result<(), StoreError> {
        self.execute_retry(
            "upsert_session",
            "INSERT INTO sessions (id, source_dir, job_count, active_jobs, files_total, \
             files_done, files_failed, status, last_activity) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(id) DO UPDATE SET \
             job_count = excluded.job_count, active_jobs = excluded.active_jobs, \
             files_total = excluded.files_total, files_done = excluded.files_done, \
             files_failed = excluded.files_failed, status = excluded.status, \
             last_activity = excluded.last_activity",
            params![
                session.id.to_string(),
                session.source_dir.clone(),
                session.job_count,
                session.active_jobs,
                session.files_total,
                session.files_done,
                session.files_failed,
                session.status.to_string(),
                session.last_activity.to_rfc3339(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        let mut rows = self
            .query_retry(
                "get_session",
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_session(&row).map_err(|e| {
                StoreError::Query(format!("get_session row parse: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_session: {e}"))),
        }
    }

    async fn list_session_dirs(&self) -> Result<Vec<(Uuid, String)>, StoreError> {
        let mut rows = self
            .query_retry(
                "list_session_dirs",
                "SELECT DISTINCT session_id, source_dir FROM jobs",
                (),
            )
            .await?;

        let mut dirs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id: String = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("list_session_dirs: {e}")))?;
            let dir: String = row
                .get(1)
                .map_err(|e| StoreError::Query(format!("list_session_dirs: {e}")))?;
            dirs.push((parse_uuid(&id), dir));
        }
        Ok(dirs)
    }

    // ── Retry runs ──────────────────────────────────────────────────

    async fn insert_retry_run(&self, run: &RetryRun) -> Result<(), StoreError> {
        self.execute_retry(
            "insert_retry_run",
            "INSERT INTO retry_runs (id, job_id, selector, file_count, status, \
             requested_at, completed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.id.to_string(),
                run.job_id.to_string(),
                run.selector.clone(),
                run.file_count,
                run.status.to_string(),
                run.requested_at.to_rfc3339(),
                opt_text(run.completed_at.map(|t| t.to_rfc3339())),
            ],
        )
        .await?;
        Ok(())
    }

    async fn complete_retry_run(&self, id: Uuid, status: JobStatus) -> Result<(), StoreError> {
        self.execute_retry(
            "complete_retry_run",
            "UPDATE retry_runs SET status = ?1, completed_at = ?2 \
             WHERE id = ?3 AND completed_at IS NULL",
            params![status.to_string(), Utc::now().to_rfc3339(), id.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn list_retry_runs(&self, job_id: Uuid) -> Result<Vec<RetryRun>, StoreError> {
        let rows = self
            .query_retry(
                "list_retry_runs",
                &format!(
                    "SELECT {RETRY_COLUMNS} FROM retry_runs WHERE job_id = ?1 \
                     ORDER BY requested_at DESC"
                ),
                params![job_id.to_string()],
            )
            .await?;
        Self::collect_rows("list_retry_runs", rows, row_to_retry_run).await
    }

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut rows = self
            .query_retry(
                "get_setting",
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
            )
            .await?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value: String = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("get_setting: {e}")))?;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_setting: {e}"))),
        }
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.execute_retry(
            "set_setting",
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, \
             updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )
        .await?;
        Ok(())
    }
}
