//! Axum API server binary.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rmerge_api::{create_router, metrics, ApiConfig, AppState, QueueBackend};
use rmerge_ledger::{AssetScanner, DocumentStore, JsonFileStore, LedgerConfig};
use rmerge_media::{check_ffmpeg, check_ffprobe, MediaConfig};
use rmerge_queue::{JobDispatcher, JobQueue, MemoryBatchLock, MemoryQueue};
use rmerge_worker::{LocalExecutor, WorkerConfig, WorkerContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,rmerge=info,tower_http=info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(true))
            .with(env_filter)
            .init();
    }

    info!("Starting rmerge-api");

    let config = ApiConfig::from_env();
    let ledger = LedgerConfig::from_env();
    info!(
        "API config: host={}, port={}, queue={:?}",
        config.host, config.port, config.queue_backend
    );

    let shutdown = CancellationToken::new();
    let mut local_worker = None;

    let dispatcher: Arc<dyn JobDispatcher> = match config.queue_backend {
        QueueBackend::Redis => {
            let queue: Arc<dyn JobDispatcher> =
                Arc::new(JobQueue::from_env().context("failed to create job queue")?);
            queue
        }
        QueueBackend::Memory => {
            // Single node: batches run inside this process
            check_ffmpeg().context("ffmpeg is required for the memory backend")?;
            check_ffprobe().context("ffprobe is required for the memory backend")?;

            let queue = Arc::new(MemoryQueue::new());
            let ctx = WorkerContext::ffmpeg(
                WorkerConfig::from_env(),
                MediaConfig::from_env(),
                &ledger,
                queue.clone(),
                Arc::new(MemoryBatchLock::new()),
                shutdown.clone(),
            );
            let executor = LocalExecutor::new(Arc::new(ctx), queue.clone(), shutdown.clone());
            local_worker = Some(tokio::spawn(async move { executor.run().await }));
            let queue: Arc<dyn JobDispatcher> = queue;
            queue
        }
    };

    let store: Arc<dyn DocumentStore> = Arc::new(JsonFileStore::from_config(&ledger));
    let state = AppState::new(
        config.clone(),
        store,
        AssetScanner::from_config(&ledger),
        dispatcher,
    );

    let metrics_handle = if config.metrics_enabled {
        info!("Prometheus metrics enabled at /metrics");
        Some(metrics::init_metrics().context("failed to install Prometheus recorder")?)
    } else {
        None
    };

    let app = create_router(state, metrics_handle);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid bind address")?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("server error")?;

    shutdown.cancel();
    if let Some(handle) = local_worker {
        if let Err(e) = handle.await {
            warn!("Local executor task failed: {}", e);
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => {
            warn!("Could not listen for shutdown signal: {}", e);
            shutdown.cancelled().await;
        }
    }
}
