//! Integration tests for the job runtime HTTP surface.
//!
//! Each test builds the full component graph over an in-memory store and
//! a temp artifact root, then drives the real router with tower's
//! `oneshot` while a live dispatcher processes jobs in the background.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tower::ServiceExt;

use docmill::admission::{AdmissionConfig, AdmissionController};
use docmill::artifacts::ArtifactManager;
use docmill::dispatch::{DispatchConfig, Dispatcher};
use docmill::http::{AppState, api_routes};
use docmill::metrics::RuntimeMetrics;
use docmill::pipeline::{FileOutcome, FileProcessor, FileUnit, StageChainProcessor};
use docmill::retry::RetryOrchestrator;
use docmill::sessions::{ProjectionCache, SessionProjection};
use docmill::store::{JobStore, LibSqlStore};

/// Maximum time any polled condition may take before the test fails.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Fails listed files on their first attempt, succeeds afterwards.
struct FlakyProcessor {
    fail_once: Mutex<HashSet<String>>,
}

impl FlakyProcessor {
    fn new(names: &[&str]) -> Self {
        Self {
            fail_once: Mutex::new(names.iter().map(|s| s.to_string()).collect()),
        }
    }
}

#[async_trait]
impl FileProcessor for FlakyProcessor {
    async fn process(&self, unit: FileUnit) -> FileOutcome {
        let name = unit
            .source_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        if self.fail_once.lock().await.remove(&name) {
            return FileOutcome::Failed {
                error_type: "parse_error".to_string(),
                message: format!("simulated parse failure on {name}"),
            };
        }
        FileOutcome::Done {
            output_path: format!("{name}.jsonl"),
            chunk_count: 1,
        }
    }
}

struct TestApp {
    app: Router,
    store: Arc<dyn JobStore>,
    _artifact_dir: tempfile::TempDir,
    source_dir: tempfile::TempDir,
    // Keeps the dispatcher's shutdown channel alive for the test duration
    _shutdown_tx: tokio::sync::watch::Sender<bool>,
}

async fn spawn_app(
    processor: Arc<dyn FileProcessor>,
    backlog_capacity: u64,
    run_dispatcher: bool,
) -> TestApp {
    let artifact_dir = tempfile::tempdir().unwrap();
    let source_dir = tempfile::tempdir().unwrap();

    let metrics = Arc::new(RuntimeMetrics::new());
    let store: Arc<dyn JobStore> =
        Arc::new(LibSqlStore::new_memory(Arc::clone(&metrics)).await.unwrap());
    let artifacts = Arc::new(ArtifactManager::new(artifact_dir.path().to_path_buf()));

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        processor,
        Arc::clone(&artifacts),
        Arc::clone(&metrics),
        DispatchConfig {
            worker_concurrency: 2,
            poll_interval: Duration::from_millis(20),
        },
    ));
    let handle = dispatcher.handle();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    if run_dispatcher {
        tokio::spawn(Arc::clone(&dispatcher).run(shutdown_rx));
    }

    let admission = Arc::new(AdmissionController::new(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        Arc::clone(&metrics),
        handle.clone(),
        AdmissionConfig {
            backlog_capacity,
            retry_after: Duration::from_secs(30),
        },
    ));
    let retry = Arc::new(RetryOrchestrator::new(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        handle,
    ));
    let sessions = Arc::new(SessionProjection::new(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        Arc::new(ProjectionCache::new(Duration::from_millis(50))),
    ));

    let app = api_routes(AppState {
        store: Arc::clone(&store),
        admission,
        retry,
        artifacts,
        sessions,
        metrics,
    });

    TestApp {
        app,
        store,
        _artifact_dir: artifact_dir,
        source_dir,
        _shutdown_tx: shutdown_tx,
    }
}

impl TestApp {
    /// Write a source file the pipeline can read.
    fn write_source(&self, name: &str, content: &str) {
        std::fs::write(self.source_dir.path().join(name), content).unwrap();
    }

    fn submit_body(&self, files: &[&str]) -> Value {
        json!({
            "source_dir": self.source_dir.path().to_string_lossy(),
            "files": files,
        })
    }
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            builder.body(Body::from(value.to_string())).unwrap()
        }
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

/// Poll the job detail endpoint until the job reaches a terminal status.
async fn wait_terminal(app: &Router, job_id: &str) -> Value {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    loop {
        let (status, body) = send(app, "GET", &format!("/api/v1/jobs/{job_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let job_status = body["job"]["status"].as_str().unwrap_or_default().to_string();
        if ["completed", "failed", "partially_failed"].contains(&job_status.as_str()) {
            return body;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} stuck in status {job_status}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

// ── End to end ──────────────────────────────────────────────────────

#[tokio::test]
async fn submit_process_and_download() {
    let test = spawn_app(Arc::new(StageChainProcessor), 32, true).await;
    test.write_source("report.txt", "quarterly report body text");
    test.write_source("notes.txt", "meeting notes text");

    let (status, body) = send(
        &test.app,
        "POST",
        "/api/v1/jobs/process",
        Some(test.submit_body(&["report.txt", "notes.txt"])),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["deduplicated"], false);
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let detail = wait_terminal(&test.app, &job_id).await;
    assert_eq!(detail["job"]["status"], "completed");
    assert_eq!(detail["files"].as_array().unwrap().len(), 2);
    assert!(detail["job"]["artifact_synced"].as_bool().unwrap());

    // Events exist, are seq-ordered, and timestamps never go backwards
    let events = detail["events"].as_array().unwrap();
    assert!(events.len() >= 4, "expected submitted/started/file/finished");
    let mut last_seq = 0;
    let mut last_time = chrono::DateTime::<chrono::Utc>::MIN_UTC;
    for event in events {
        let seq = event["seq"].as_i64().unwrap();
        let time = event["event_time"]
            .as_str()
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            .unwrap()
            .with_timezone(&chrono::Utc);
        assert!(seq > last_seq);
        assert!(time >= last_time);
        last_seq = seq;
        last_time = time;
    }

    // Artifact listing reflects the on-disk snapshot
    let (status, body) = send(
        &test.app,
        "GET",
        &format!("/api/v1/jobs/{job_id}/artifacts"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let artifacts = body["artifacts"].as_array().unwrap();
    assert_eq!(artifacts.len(), 2);

    // Download one artifact
    let first = artifacts[0]["path"].as_str().unwrap();
    let (status, _) = send(
        &test.app,
        "GET",
        &format!("/api/v1/jobs/{job_id}/artifacts/{first}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Session projection picked the job up
    let (status, body) = send(&test.app, "GET", "/api/v1/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessions"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn identical_submissions_are_idempotent() {
    let test = spawn_app(Arc::new(StageChainProcessor), 32, false).await;
    test.write_source("a.txt", "text");

    let body = test.submit_body(&["a.txt"]);
    let (status, first) = send(&test.app, "POST", "/api/v1/jobs/process", Some(body.clone())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(first["deduplicated"], false);

    let (status, second) = send(&test.app, "POST", "/api/v1/jobs/process", Some(body)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(second["deduplicated"], true);
    assert_eq!(first["job_id"], second["job_id"]);

    // No duplicate row was created
    let (_, listing) = send(&test.app, "GET", "/api/v1/jobs", None).await;
    assert_eq!(listing["jobs"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn backlog_rejections_carry_a_retry_hint() {
    // Capacity 1, no dispatcher: the first job stays queued
    let test = spawn_app(Arc::new(StageChainProcessor), 1, false).await;
    test.write_source("a.txt", "text");
    test.write_source("b.txt", "text");

    let (status, _) = send(
        &test.app,
        "POST",
        "/api/v1/jobs/process",
        Some(test.submit_body(&["a.txt"])),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/v1/jobs/process");
    builder = builder.header(header::CONTENT_TYPE, "application/json");
    let request = builder
        .body(Body::from(test.submit_body(&["b.txt"]).to_string()))
        .unwrap();
    let response = test.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let retry_after = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    assert_eq!(retry_after, "30");
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["retry_after_secs"], 30);

    // The existing job is unaffected
    let (_, listing) = send(&test.app, "GET", "/api/v1/jobs", None).await;
    assert_eq!(listing["jobs"].as_array().unwrap().len(), 1);
    assert_eq!(listing["jobs"][0]["status"], "queued");
}

#[tokio::test]
async fn retry_redispatches_only_failed_files() {
    let processor = Arc::new(FlakyProcessor::new(&["f3.txt"]));
    let test = spawn_app(processor, 32, true).await;
    for name in ["f1.txt", "f2.txt", "f3.txt", "f4.txt", "f5.txt"] {
        test.write_source(name, "content");
    }

    let (status, body) = send(
        &test.app,
        "POST",
        "/api/v1/jobs/process",
        Some(test.submit_body(&["f1.txt", "f2.txt", "f3.txt", "f4.txt", "f5.txt"])),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let detail = wait_terminal(&test.app, &job_id).await;
    assert_eq!(detail["job"]["status"], "partially_failed");
    for file in detail["files"].as_array().unwrap() {
        if file["source_path"] == "f3.txt" {
            assert_eq!(file["status"], "failed");
        } else {
            assert_eq!(file["status"], "done");
        }
    }

    let (status, body) = send(
        &test.app,
        "POST",
        &format!("/api/v1/jobs/{job_id}/retry-failures"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "scheduled");
    assert_eq!(body["retry_runs"].as_array().unwrap().len(), 1);
    assert_eq!(body["retry_runs"][0]["file_count"], 1);

    // The flaky file succeeds on its second attempt
    let detail = wait_terminal(&test.app, &job_id).await;
    assert_eq!(detail["job"]["status"], "completed");
    for file in detail["files"].as_array().unwrap() {
        if file["source_path"] == "f3.txt" {
            assert_eq!(file["retry_count"], 1);
            assert_eq!(file["status"], "done");
        } else {
            assert_eq!(file["retry_count"], 0, "{}", file["source_path"]);
        }
    }

    // A second retry has nothing to do
    let (status, body) = send(
        &test.app,
        "POST",
        &format!("/api/v1/jobs/{job_id}/retry-failures"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "no_failures");
}

#[tokio::test]
async fn artifact_path_traversal_is_rejected() {
    let test = spawn_app(Arc::new(StageChainProcessor), 32, true).await;
    test.write_source("a.txt", "text");

    let (status, body) = send(
        &test.app,
        "POST",
        "/api/v1/jobs/process",
        Some(test.submit_body(&["a.txt"])),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = body["job_id"].as_str().unwrap().to_string();
    wait_terminal(&test.app, &job_id).await;

    let (status, body) = send(
        &test.app,
        "GET",
        &format!("/api/v1/jobs/{job_id}/artifacts/..%2F..%2Fetc%2Fpasswd"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "path escapes job artifact root");

    // A safe but absent path is a plain 404
    let (status, _) = send(
        &test.app,
        "GET",
        &format!("/api/v1/jobs/{job_id}/artifacts/missing.jsonl"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deleting_artifacts_clears_the_sync_flag() {
    let test = spawn_app(Arc::new(StageChainProcessor), 32, true).await;
    test.write_source("a.txt", "text to process");

    let (_, body) = send(
        &test.app,
        "POST",
        "/api/v1/jobs/process",
        Some(test.submit_body(&["a.txt"])),
    )
    .await;
    let job_id = body["job_id"].as_str().unwrap().to_string();
    wait_terminal(&test.app, &job_id).await;

    let (status, body) = send(
        &test.app,
        "DELETE",
        &format!("/api/v1/jobs/{job_id}/artifacts"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed_files"], 1);

    let (_, body) = send(
        &test.app,
        "GET",
        &format!("/api/v1/jobs/{job_id}/artifacts"),
        None,
    )
    .await;
    assert!(body["artifacts"].as_array().unwrap().is_empty());

    let (_, detail) = send(&test.app, "GET", &format!("/api/v1/jobs/{job_id}"), None).await;
    assert_eq!(detail["job"]["artifact_synced"], false);

    // The cleanup landed in the job's timeline
    let events = detail["events"].as_array().unwrap();
    assert!(
        events
            .iter()
            .any(|e| e["event_type"] == "artifacts_deleted")
    );
}

#[tokio::test]
async fn multipart_upload_is_staged_and_processed() {
    let test = spawn_app(Arc::new(StageChainProcessor), 32, true).await;

    let boundary = "docmill-test-boundary";
    let body = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"config\"\r\n\r\n\
         {{\"chunk_size\": 500}}\r\n\
         --{boundary}\r\n\
         Content-Disposition: form-data; name=\"files\"; filename=\"upload.txt\"\r\n\
         Content-Type: text/plain\r\n\r\n\
         uploaded document body\r\n\
         --{boundary}--\r\n"
    );

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/jobs/process")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap();
    let response = test.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let detail = wait_terminal(&test.app, &job_id).await;
    assert_eq!(detail["job"]["status"], "completed");
    assert_eq!(detail["files"][0]["source_path"], "upload.txt");

    let (_, listing) = send(
        &test.app,
        "GET",
        &format!("/api/v1/jobs/{job_id}/artifacts"),
        None,
    )
    .await;
    assert_eq!(listing["artifacts"][0]["path"], "upload.jsonl");
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_persistence() {
    let test = spawn_app(Arc::new(StageChainProcessor), 32, false).await;

    let (status, body) = send(
        &test.app,
        "POST",
        "/api/v1/jobs/process",
        Some(json!({ "source_dir": "/data", "files": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("at least one file"));

    // Nothing was persisted
    let (_, listing) = send(&test.app, "GET", "/api/v1/jobs", None).await;
    assert!(listing["jobs"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn health_reports_backlog_and_metrics() {
    let test = spawn_app(Arc::new(StageChainProcessor), 32, false).await;
    test.write_source("a.txt", "text");

    let (status, body) = send(&test.app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body.get("metrics").is_none());

    send(
        &test.app,
        "POST",
        "/api/v1/jobs/process",
        Some(test.submit_body(&["a.txt"])),
    )
    .await;

    let (status, body) = send(&test.app, "GET", "/health?detailed=true", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["backlog"], 1);
    assert_eq!(body["metrics"]["jobs_admitted"], 1);

    // The store's view agrees
    assert_eq!(test.store.count_active_jobs().await.unwrap(), 1);
}
