use std::sync::Arc;
use std::time::Duration;

use docmill::admission::{AdmissionConfig, AdmissionController};
use docmill::artifacts::ArtifactManager;
use docmill::config::{BusyRetryPolicy, RuntimeConfig};
use docmill::dispatch::{DispatchConfig, Dispatcher};
use docmill::http::{AppState, api_routes};
use docmill::metrics::RuntimeMetrics;
use docmill::pipeline::StageChainProcessor;
use docmill::reconcile::ReconciliationService;
use docmill::retry::RetryOrchestrator;
use docmill::sessions::{ProjectionCache, SessionProjection};
use docmill::store::{JobStore, LibSqlStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; DOCMILL_LOG_DIR switches to a daily rolling file
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _log_guard = if let Ok(log_dir) = std::env::var("DOCMILL_LOG_DIR") {
        let appender = tracing_appender::rolling::daily(log_dir, "docmill.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
        None
    };

    let process_start = chrono::Utc::now();
    let config = RuntimeConfig::from_env()?;

    eprintln!("📄 docmill v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Artifacts: {}", config.artifact_root.display());
    eprintln!(
        "   Backlog: {} jobs, {} workers",
        config.backlog_capacity, config.worker_concurrency
    );
    eprintln!("   API: http://0.0.0.0:{}/api/v1\n", config.port);

    // ── Store ────────────────────────────────────────────────────────────
    let metrics = Arc::new(RuntimeMetrics::new());
    let store: Arc<dyn JobStore> = Arc::new(
        LibSqlStore::new_local(
            &config.db_path,
            BusyRetryPolicy::default(),
            Arc::clone(&metrics),
        )
        .await?,
    );

    // ── Startup reconciliation, before admission opens ───────────────────
    let reconciler = ReconciliationService::new(
        Arc::clone(&store),
        Arc::clone(&metrics),
        config.repair_streak_warn,
    );
    let report = reconciler.run(process_start).await?;
    if report.scanned > 0 {
        eprintln!(
            "   Reconciled {} orphaned job(s): {} repaired, {} resolved from file evidence",
            report.scanned, report.repaired, report.completed
        );
    }

    // ── Components ───────────────────────────────────────────────────────
    let artifacts = Arc::new(ArtifactManager::new(config.artifact_root.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::new(StageChainProcessor),
        Arc::clone(&artifacts),
        Arc::clone(&metrics),
        DispatchConfig {
            worker_concurrency: config.worker_concurrency,
            poll_interval: config.poll_interval,
        },
    ));
    let handle = dispatcher.handle();

    let admission = Arc::new(AdmissionController::new(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        Arc::clone(&metrics),
        handle.clone(),
        AdmissionConfig {
            backlog_capacity: config.backlog_capacity,
            retry_after: config.retry_after,
        },
    ));
    let retry = Arc::new(RetryOrchestrator::new(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        handle.clone(),
    ));
    let sessions = Arc::new(SessionProjection::new(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        Arc::new(ProjectionCache::new(Duration::from_secs(10))),
    ));

    // ── Dispatcher loop ──────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let dispatcher_task = tokio::spawn(Arc::clone(&dispatcher).run(shutdown_rx));

    // ── HTTP server ──────────────────────────────────────────────────────
    let state = AppState {
        store,
        admission,
        retry,
        artifacts,
        sessions,
        metrics,
    };
    let app = api_routes(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(port = config.port, "HTTP server started");
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    // ── Graceful shutdown ────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, draining dispatcher");
    let _ = shutdown_tx.send(true);
    let _ = dispatcher_task.await;
    server.abort();

    Ok(())
}
