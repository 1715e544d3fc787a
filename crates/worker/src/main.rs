use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use conductor_backend::{ArtifactStore, HttpBackendClient, MemoryArtifactStore, S3ArtifactStore};
use conductor_core::clock::{Clock, SystemClock};
use conductor_db::repositories::PgStore;
use conductor_db::Stores;
use conductor_events::ProgressHub;
use conductor_pipeline::OrchestratorMetrics;
use conductor_worker::maintenance::{run_idempotency_purge, PURGE_INTERVAL};
use conductor_worker::server::{self, ServerState};
use conductor_worker::{WorkerConfig, WorkerDeps, WorkerPool};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conductor_worker=info,conductor_db=info,tower_http=info".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();

    // --- Configuration ---
    let config = WorkerConfig::from_env()?;
    tracing::info!(
        concurrency = config.concurrency,
        recovery_policy = %config.recovery_policy,
        "Loaded worker configuration",
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // --- Shared state ---
    let stores = match &config.database_url {
        Some(url) => {
            let pool = conductor_db::create_pool(url)
                .await
                .context("Failed to connect to database")?;
            conductor_db::health_check(&pool)
                .await
                .context("Database health check failed")?;
            conductor_db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            tracing::info!("Database ready, migrations applied");
            Stores::postgres(PgStore::new(pool).with_visibility_timeout(config.queue_visibility_timeout))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory stores (single process only)");
            Stores::in_memory(config.queue_visibility_timeout)
        }
    };

    // --- Backend and artifacts ---
    let backend_url = config
        .backend_url
        .clone()
        .context("BACKEND_URL must be set")?;
    let backend = Arc::new(HttpBackendClient::new(backend_url, config.backend_call_timeout)?);

    let artifacts: Arc<dyn ArtifactStore> = match &config.artifact_bucket {
        Some(bucket) => {
            tracing::info!(bucket = %bucket, "Using S3 artifact store");
            Arc::new(S3ArtifactStore::from_env(bucket.clone(), config.artifact_url_ttl, clock.clone()).await)
        }
        None => {
            tracing::warn!("ARTIFACT_BUCKET not set, artifacts are kept in memory");
            Arc::new(MemoryArtifactStore::new(config.artifact_url_ttl, clock.clone()))
        }
    };

    let metrics = OrchestratorMetrics::new()?;
    let hub = ProgressHub::new(conductor_events::DEFAULT_CAPACITY, config.progress_linger);

    // --- Worker pool ---
    let deps = WorkerDeps {
        stores: stores.clone(),
        backend,
        artifacts,
        hub,
        clock: clock.clone(),
        metrics: metrics.clone(),
    };
    let pool = WorkerPool::start(deps, config.pool_config()).await?;
    tracing::info!(workers = ?pool.worker_ids(), "Worker pool running");

    // --- Maintenance ---
    let maintenance_cancel = CancellationToken::new();
    let purge_handle = tokio::spawn(run_idempotency_purge(
        stores.idempotency.clone(),
        clock,
        PURGE_INTERVAL,
        maintenance_cancel.clone(),
    ));

    // --- Metrics server ---
    let addr = SocketAddr::new(
        config
            .metrics_host
            .parse()
            .with_context(|| format!("Invalid METRICS_HOST {}", config.metrics_host))?,
        config.metrics_port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(%addr, "Serving /health and /metrics");

    axum::serve(listener, server::router(ServerState { stores, metrics }))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Metrics server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Shutdown signal received, draining worker pool");
    pool.shutdown().await;

    maintenance_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), purge_handle).await;

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
