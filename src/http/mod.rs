//! HTTP surface — versioned REST endpoints over the runtime components.
//!
//! Internal errors are mapped into the error taxonomy before crossing
//! this boundary; callers never see raw error detail, only a category,
//! a reason, and (for capacity rejections) a retry hint.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequest, Multipart, Path, Query, Request, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{error, warn};
use uuid::Uuid;

use crate::admission::AdmissionController;
use crate::artifacts::ArtifactManager;
use crate::error::{AdmissionError, ArtifactError, RetryError};
use crate::jobs::model::{ProcessOptions, ProcessRequest, RetrySelector, event_types};
use crate::metrics::RuntimeMetrics;
use crate::retry::{RetryOrchestrator, RetryOutcome};
use crate::sessions::SessionProjection;
use crate::store::{JobStore, NewEvent};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub admission: Arc<AdmissionController>,
    pub retry: Arc<RetryOrchestrator>,
    pub artifacts: Arc<ArtifactManager>,
    pub sessions: Arc<SessionProjection>,
    pub metrics: Arc<RuntimeMetrics>,
}

/// Build the Axum router.
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/jobs/process", post(submit_job))
        .route("/api/v1/jobs", get(list_jobs))
        .route("/api/v1/jobs/{id}", get(get_job))
        .route("/api/v1/jobs/{id}/retry-failures", post(retry_failures))
        .route(
            "/api/v1/jobs/{id}/artifacts",
            get(list_artifacts).delete(delete_artifacts),
        )
        .route("/api/v1/jobs/{id}/artifacts/{*path}", get(download_artifact))
        .route("/api/v1/sessions", get(list_sessions))
        .route("/api/v1/sessions/{id}", get(get_session))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Error mapping ───────────────────────────────────────────────────

fn error_body(status: StatusCode, reason: &str) -> Response {
    (status, Json(serde_json::json!({ "error": reason }))).into_response()
}

fn internal_error(context: &str, e: impl std::fmt::Display) -> Response {
    error!("{context}: {e}");
    error_body(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

fn admission_error(e: AdmissionError) -> Response {
    match e {
        AdmissionError::Invalid { reason } => error_body(StatusCode::BAD_REQUEST, &reason),
        AdmissionError::BacklogFull {
            active,
            capacity,
            retry_after,
        } => {
            let secs = retry_after.as_secs();
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [(header::RETRY_AFTER, secs.to_string())],
                Json(serde_json::json!({
                    "error": "backlog full",
                    "active": active,
                    "capacity": capacity,
                    "retry_after_secs": secs,
                })),
            )
                .into_response()
        }
        AdmissionError::Store(e) => internal_error("admission store error", e),
    }
}

fn artifact_error(e: ArtifactError) -> Response {
    match e {
        ArtifactError::PathEscape { path } => {
            warn!(path = %path, "Rejected artifact path escaping job root");
            error_body(StatusCode::BAD_REQUEST, "path escapes job artifact root")
        }
        ArtifactError::NotFound { path } => {
            error_body(StatusCode::NOT_FOUND, &format!("artifact not found: {path}"))
        }
        ArtifactError::Io(e) => internal_error("artifact io error", e),
    }
}

fn retry_error(e: RetryError) -> Response {
    match e {
        RetryError::JobNotFound { id } => {
            error_body(StatusCode::NOT_FOUND, &format!("job not found: {id}"))
        }
        RetryError::SessionNotFound { id } => {
            error_body(StatusCode::NOT_FOUND, &format!("session not found: {id}"))
        }
        RetryError::Store(e) => internal_error("retry store error", e),
    }
}

// ── Health ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct HealthQuery {
    #[serde(default)]
    detailed: bool,
}

async fn health(State(state): State<AppState>, Query(q): Query<HealthQuery>) -> Response {
    if !q.detailed {
        return Json(serde_json::json!({ "status": "ok" })).into_response();
    }
    let backlog = match state.store.count_active_jobs().await {
        Ok(n) => n,
        Err(e) => return internal_error("health backlog query", e),
    };
    Json(serde_json::json!({
        "status": "ok",
        "backlog": backlog,
        "metrics": state.metrics.snapshot(),
    }))
    .into_response()
}

// ── Jobs ────────────────────────────────────────────────────────────

async fn submit_job(State(state): State<AppState>, req: Request) -> Response {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let request = if content_type.starts_with("multipart/form-data") {
        match Multipart::from_request(req, &()).await {
            Ok(multipart) => match stage_multipart(&state, multipart).await {
                Ok(request) => request,
                Err(response) => return response,
            },
            Err(e) => return error_body(StatusCode::BAD_REQUEST, &format!("bad multipart: {e}")),
        }
    } else {
        match Json::<ProcessRequest>::from_request(req, &()).await {
            Ok(Json(request)) => request,
            Err(e) => return error_body(StatusCode::BAD_REQUEST, &format!("bad request: {e}")),
        }
    };

    match state.admission.submit(request).await {
        Ok(admitted) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "job_id": admitted.job_id,
                "deduplicated": admitted.deduplicated,
            })),
        )
            .into_response(),
        Err(e) => admission_error(e),
    }
}

/// Write uploaded parts into a staging directory and synthesize the
/// equivalent JSON request. A `config` part carries options; everything
/// with a filename is staged as an input file.
async fn stage_multipart(
    state: &AppState,
    mut multipart: Multipart,
) -> Result<ProcessRequest, Response> {
    let staging = state
        .artifacts
        .root()
        .join("incoming")
        .join(Uuid::new_v4().to_string());
    if let Err(e) = tokio::fs::create_dir_all(&staging).await {
        return Err(internal_error("create staging dir", e));
    }

    let mut options = ProcessOptions::default();
    let mut idempotency_key = None;
    let mut files = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return Err(error_body(StatusCode::BAD_REQUEST, &format!("bad part: {e}"))),
        };

        let name = field.name().unwrap_or("").to_string();
        if let Some(file_name) = field.file_name().map(str::to_string) {
            // Only the final path component; uploads cannot name directories
            let safe_name = std::path::Path::new(&file_name)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("upload.bin")
                .to_string();
            let bytes = match field.bytes().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    return Err(error_body(
                        StatusCode::BAD_REQUEST,
                        &format!("upload read failed: {e}"),
                    ));
                }
            };
            if let Err(e) = tokio::fs::write(staging.join(&safe_name), &bytes).await {
                return Err(internal_error("stage upload", e));
            }
            files.push(safe_name);
        } else if name == "config" {
            let text = field.text().await.unwrap_or_default();
            match serde_json::from_str(&text) {
                Ok(parsed) => options = parsed,
                Err(e) => {
                    return Err(error_body(
                        StatusCode::BAD_REQUEST,
                        &format!("bad config part: {e}"),
                    ));
                }
            }
        } else if name == "idempotency_key" {
            idempotency_key = field.text().await.ok().filter(|k| !k.is_empty());
        }
    }

    Ok(ProcessRequest {
        source_dir: staging.to_string_lossy().into_owned(),
        files,
        options,
        idempotency_key,
    })
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default)]
    offset: u32,
}

fn default_limit() -> u32 {
    50
}

async fn list_jobs(State(state): State<AppState>, Query(page): Query<PageQuery>) -> Response {
    let limit = page.limit.min(200);
    let jobs = match state.store.list_jobs(limit, page.offset).await {
        Ok(jobs) => jobs,
        Err(e) => return internal_error("list jobs", e),
    };

    let mut summaries = Vec::with_capacity(jobs.len());
    for job in jobs {
        let counts = match state.store.count_files(job.id).await {
            Ok(counts) => counts,
            Err(e) => return internal_error("list jobs counts", e),
        };
        summaries.push(serde_json::json!({
            "id": job.id,
            "status": job.status,
            "source_dir": job.request.source_dir,
            "session_id": job.session_id,
            "created_at": job.created_at,
            "finished_at": job.finished_at,
            "files": {
                "total": counts.total(),
                "done": counts.done,
                "failed": counts.failed,
                "skipped": counts.skipped,
            },
        }));
    }

    Json(serde_json::json!({
        "jobs": summaries,
        "limit": limit,
        "offset": page.offset,
    }))
    .into_response()
}

#[derive(Deserialize)]
struct JobDetailQuery {
    #[serde(default = "default_limit")]
    files_limit: u32,
    #[serde(default)]
    files_offset: u32,
    #[serde(default = "default_limit")]
    events_limit: u32,
    #[serde(default)]
    events_offset: u32,
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(q): Query<JobDetailQuery>,
) -> Response {
    let job = match state.store.get_job(id).await {
        Ok(Some(job)) => job,
        Ok(None) => return error_body(StatusCode::NOT_FOUND, &format!("job not found: {id}")),
        Err(e) => return internal_error("get job", e),
    };

    let files = match state
        .store
        .list_files_page(id, q.files_limit.min(500), q.files_offset)
        .await
    {
        Ok(files) => files,
        Err(e) => return internal_error("get job files", e),
    };
    let events = match state
        .store
        .list_events(id, q.events_limit.min(500), q.events_offset)
        .await
    {
        Ok(events) => events,
        Err(e) => return internal_error("get job events", e),
    };

    Json(serde_json::json!({
        "job": job,
        "files": files,
        "events": events,
    }))
    .into_response()
}

async fn retry_failures(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.retry.retry(RetrySelector::Job(id)).await {
        Ok(RetryOutcome::NoFailures) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "no_failures" })),
        )
            .into_response(),
        Ok(RetryOutcome::Scheduled { runs }) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "status": "scheduled",
                "retry_runs": runs,
            })),
        )
            .into_response(),
        Err(e) => retry_error(e),
    }
}

// ── Artifacts ───────────────────────────────────────────────────────

async fn list_artifacts(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.store.get_job(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_body(StatusCode::NOT_FOUND, &format!("job not found: {id}")),
        Err(e) => return internal_error("list artifacts job lookup", e),
    }
    match state.artifacts.list_outputs(id).await {
        Ok(entries) => Json(serde_json::json!({ "artifacts": entries })).into_response(),
        Err(e) => artifact_error(e),
    }
}

async fn download_artifact(
    State(state): State<AppState>,
    Path((id, path)): Path<(Uuid, String)>,
) -> Response {
    match state.artifacts.read_output(id, &path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Err(e) => artifact_error(e),
    }
}

async fn delete_artifacts(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.store.get_job(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_body(StatusCode::NOT_FOUND, &format!("job not found: {id}")),
        Err(e) => return internal_error("delete artifacts job lookup", e),
    }

    let report = match state.artifacts.delete_outputs(id).await {
        Ok(report) => report,
        Err(e) => return artifact_error(e),
    };

    let payload = serde_json::json!({ "removed_files": report.removed_files });
    if let Err(e) = state
        .store
        .append_event(
            id,
            NewEvent::new(
                event_types::ARTIFACTS_DELETED,
                format!("Deleted {} artifact file(s)", report.removed_files),
            )
            .with_payload(payload.clone()),
        )
        .await
    {
        return internal_error("delete artifacts event", e);
    }
    state
        .artifacts
        .mirror_event(id, event_types::ARTIFACTS_DELETED, "Artifacts deleted", &payload)
        .await;

    // Disk no longer matches the database's output records
    if let Err(e) = state.store.set_artifact_synced(id, false).await {
        return internal_error("delete artifacts sync flag", e);
    }

    Json(payload).into_response()
}

// ── Sessions ────────────────────────────────────────────────────────

async fn list_sessions(State(state): State<AppState>) -> Response {
    match state.sessions.list().await {
        Ok(sessions) => Json(serde_json::json!({ "sessions": sessions })).into_response(),
        Err(e) => internal_error("list sessions", e),
    }
}

async fn get_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.sessions.get(id).await {
        Ok(Some(session)) => Json(session).into_response(),
        Ok(None) => error_body(StatusCode::NOT_FOUND, &format!("session not found: {id}")),
        Err(e) => internal_error("get session", e),
    }
}
