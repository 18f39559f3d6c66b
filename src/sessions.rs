//! Session projection — per-source-directory aggregates derived from
//! job rows on read.
//!
//! The sessions table is a cache, never a source of truth: every read
//! recomputes from Job/JobFile rows and upserts the result. When the
//! database holds no job history at all (fresh DB, artifacts surviving
//! a data loss), a filesystem scan over the artifact root reconstructs
//! an approximate summary, trading a small accuracy window for
//! availability.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::artifacts::ArtifactManager;
use crate::error::StoreError;
use crate::jobs::model::{JobStatus, Session, event_types, session_id_for_dir};
use crate::store::JobStore;

/// TTL cache for computed projections.
///
/// Explicitly constructed and injected; `reset()` gives tests a clean
/// slate without process restarts.
pub struct ProjectionCache {
    ttl: Duration,
    entries: RwLock<HashMap<Uuid, (Instant, Session)>>,
}

impl ProjectionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, id: Uuid) -> Option<Session> {
        let entries = self.entries.read().await;
        entries.get(&id).and_then(|(at, session)| {
            (at.elapsed() < self.ttl).then(|| session.clone())
        })
    }

    pub async fn put(&self, session: Session) {
        let mut entries = self.entries.write().await;
        // Expired entries are dropped on write so the map stays bounded
        entries.retain(|_, (at, _)| at.elapsed() < self.ttl);
        entries.insert(session.id, (Instant::now(), session));
    }

    /// Drop everything. For tests and explicit invalidation.
    pub async fn reset(&self) {
        self.entries.write().await.clear();
    }
}

/// Computes session aggregates on read.
pub struct SessionProjection {
    store: Arc<dyn JobStore>,
    artifacts: Arc<ArtifactManager>,
    cache: Arc<ProjectionCache>,
}

impl SessionProjection {
    pub fn new(
        store: Arc<dyn JobStore>,
        artifacts: Arc<ArtifactManager>,
        cache: Arc<ProjectionCache>,
    ) -> Self {
        Self {
            store,
            artifacts,
            cache,
        }
    }

    /// All sessions, recomputed, most recently active first.
    pub async fn list(&self) -> Result<Vec<Session>, StoreError> {
        let dirs = self.store.list_session_dirs().await?;
        if dirs.is_empty() {
            return Ok(self.fallback_scan().await);
        }

        let mut sessions = Vec::with_capacity(dirs.len());
        for (id, dir) in dirs {
            sessions.push(self.compute(id, &dir).await?);
        }
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(sessions)
    }

    /// One session by id, served from cache inside the TTL window.
    pub async fn get(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        if let Some(cached) = self.cache.get(id).await {
            return Ok(Some(cached));
        }

        let dirs = self.store.list_session_dirs().await?;
        let Some((_, dir)) = dirs.into_iter().find(|(session_id, _)| *session_id == id) else {
            // Not in job history; a stale projection row may still exist
            return self.store.get_session(id).await;
        };

        let session = self.compute(id, &dir).await?;
        self.cache.put(session.clone()).await;
        Ok(Some(session))
    }

    /// Recompute one session from job rows and persist the projection.
    async fn compute(&self, id: Uuid, source_dir: &str) -> Result<Session, StoreError> {
        let jobs = self.store.list_jobs_by_session(id).await?;

        let mut session = Session {
            id,
            source_dir: source_dir.to_string(),
            job_count: jobs.len() as i64,
            active_jobs: 0,
            files_total: 0,
            files_done: 0,
            files_failed: 0,
            status: JobStatus::Completed,
            last_activity: chrono::DateTime::<Utc>::MIN_UTC,
        };

        for job in &jobs {
            if job.status.is_active() {
                session.active_jobs += 1;
            }
            let counts = self.store.count_files(job.id).await?;
            session.files_total += counts.total();
            session.files_done += counts.done + counts.skipped;
            session.files_failed += counts.failed;

            let activity = job.finished_at.unwrap_or(job.created_at);
            if activity > session.last_activity {
                session.last_activity = activity;
            }
        }

        session.status = if session.active_jobs > 0 {
            JobStatus::Running
        } else if session.files_failed == 0 {
            JobStatus::Completed
        } else if session.files_done > 0 {
            JobStatus::PartiallyFailed
        } else {
            JobStatus::Failed
        };

        self.store.upsert_session(&session).await?;
        Ok(session)
    }

    /// Approximate reconstruction from the on-disk event-log mirrors.
    async fn fallback_scan(&self) -> Vec<Session> {
        debug!("No job history in store; scanning artifact root for sessions");
        let mut by_dir: HashMap<String, Session> = HashMap::new();

        for job_id in self.artifacts.list_job_dirs().await {
            let log = self.artifacts.read_event_log(job_id).await;
            let Some(source_dir) = log.iter().find_map(|line| {
                (line["event_type"] == event_types::SUBMITTED)
                    .then(|| line["payload"]["source_dir"].as_str().map(str::to_string))
                    .flatten()
            }) else {
                continue;
            };

            let done = log
                .iter()
                .filter(|l| l["event_type"] == event_types::FILE_DONE)
                .count() as i64;
            let failed = log
                .iter()
                .filter(|l| l["event_type"] == event_types::FILE_FAILED)
                .count() as i64;

            let session = by_dir.entry(source_dir.clone()).or_insert_with(|| Session {
                id: session_id_for_dir(&source_dir),
                source_dir: source_dir.clone(),
                job_count: 0,
                active_jobs: 0,
                files_total: 0,
                files_done: 0,
                files_failed: 0,
                status: JobStatus::Completed,
                last_activity: Utc::now(),
            });
            session.job_count += 1;
            session.files_total += done + failed;
            session.files_done += done;
            session.files_failed += failed;
            if failed > 0 {
                session.status = if done > 0 {
                    JobStatus::PartiallyFailed
                } else {
                    JobStatus::Failed
                };
            }
        }

        by_dir.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{
        FileStatus, Job, JobFile, ProcessOptions, ProcessRequest,
    };
    use crate::metrics::RuntimeMetrics;
    use crate::store::{LibSqlStore, NewEvent};

    async fn setup() -> (tempfile::TempDir, Arc<dyn JobStore>, SessionProjection) {
        let tmp = tempfile::tempdir().unwrap();
        let metrics = Arc::new(RuntimeMetrics::new());
        let store: Arc<dyn JobStore> =
            Arc::new(LibSqlStore::new_memory(metrics).await.unwrap());
        let artifacts = Arc::new(ArtifactManager::new(tmp.path().to_path_buf()));
        let cache = Arc::new(ProjectionCache::new(Duration::from_secs(30)));
        let projection = SessionProjection::new(Arc::clone(&store), artifacts, cache);
        (tmp, store, projection)
    }

    async fn insert_job(store: &Arc<dyn JobStore>, dir: &str, files: &[(&str, FileStatus)]) -> Job {
        let request = ProcessRequest {
            source_dir: dir.to_string(),
            files: files.iter().map(|(n, _)| n.to_string()).collect(),
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
            let (_, status) = files.iter().find(|(n, _)| *n == file.source_path).unwrap();
            let mut updated = file.clone();
            updated.status = *status;
            store
                .record_file_result(&updated, NewEvent::new("test", "status"))
                .await
                .unwrap();
        }
        store
            .finish_job(
                job.id,
                JobStatus::Completed,
                NewEvent::new(event_types::JOB_FINISHED, "finished"),
            )
            .await
            .unwrap();
        job
    }

    #[tokio::test]
    async fn aggregates_jobs_by_source_dir() {
        let (_tmp, store, projection) = setup().await;
        insert_job(
            &store,
            "/data/a",
            &[("x.txt", FileStatus::Done), ("y.txt", FileStatus::Failed)],
        )
        .await;
        insert_job(&store, "/data/a", &[("z.txt", FileStatus::Done)]).await;
        insert_job(&store, "/data/b", &[("w.txt", FileStatus::Done)]).await;

        let sessions = projection.list().await.unwrap();
        assert_eq!(sessions.len(), 2);

        let a = sessions
            .iter()
            .find(|s| s.source_dir == "/data/a")
            .unwrap();
        assert_eq!(a.job_count, 2);
        assert_eq!(a.files_total, 3);
        assert_eq!(a.files_done, 2);
        assert_eq!(a.files_failed, 1);
        assert_eq!(a.status, JobStatus::PartiallyFailed);
    }

    #[tokio::test]
    async fn get_serves_from_cache_until_reset() {
        let (_tmp, store, projection) = setup().await;
        let job = insert_job(&store, "/data/a", &[("x.txt", FileStatus::Done)]).await;

        let first = projection.get(job.session_id).await.unwrap().unwrap();
        assert_eq!(first.job_count, 1);

        // A second job lands; the cached projection is stale until reset
        insert_job(&store, "/data/a", &[("y.txt", FileStatus::Done)]).await;
        let cached = projection.get(job.session_id).await.unwrap().unwrap();
        assert_eq!(cached.job_count, 1);

        projection.cache.reset().await;
        let fresh = projection.get(job.session_id).await.unwrap().unwrap();
        assert_eq!(fresh.job_count, 2);
    }

    #[tokio::test]
    async fn unknown_session_is_none() {
        let (_tmp, _store, projection) = setup().await;
        assert!(projection.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fallback_scans_event_log_mirrors() {
        let tmp = tempfile::tempdir().unwrap();
        let metrics = Arc::new(RuntimeMetrics::new());
        let store: Arc<dyn JobStore> =
            Arc::new(LibSqlStore::new_memory(metrics).await.unwrap());
        let artifacts = Arc::new(ArtifactManager::new(tmp.path().to_path_buf()));

        // Artifact trees survive, the database does not
        let job_id = Uuid::new_v4();
        artifacts
            .mirror_event(
                job_id,
                event_types::SUBMITTED,
                "Job submitted",
                &serde_json::json!({"source_dir": "/data/recovered", "file_count": 2}),
            )
            .await;
        artifacts
            .mirror_event(job_id, event_types::FILE_DONE, "done", &serde_json::Value::Null)
            .await;
        artifacts
            .mirror_event(job_id, event_types::FILE_FAILED, "failed", &serde_json::Value::Null)
            .await;

        let projection = SessionProjection::new(
            store,
            artifacts,
            Arc::new(ProjectionCache::new(Duration::from_secs(30))),
        );
        let sessions = projection.list().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].source_dir, "/data/recovered");
        assert_eq!(sessions[0].files_done, 1);
        assert_eq!(sessions[0].files_failed, 1);
        assert_eq!(sessions[0].status, JobStatus::PartiallyFailed);
    }
}
