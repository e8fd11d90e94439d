//! Merge worker binary.

use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rmerge_ledger::LedgerConfig;
use rmerge_media::{check_ffmpeg, check_ffprobe, MediaConfig};
use rmerge_queue::{AccountLock, JobDispatcher, JobQueue};
use rmerge_worker::{JobExecutor, WorkerConfig, WorkerContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,rmerge=info"));

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

    info!("Starting rmerge-worker");

    let config = WorkerConfig::from_env();
    let media = MediaConfig::from_env();
    let ledger = LedgerConfig::from_env();
    info!("Worker config: {:?}", config);

    let ffmpeg = check_ffmpeg().context("ffmpeg is required")?;
    let ffprobe = check_ffprobe().context("ffprobe is required")?;
    info!("Using {} and {}", ffmpeg.display(), ffprobe.display());

    if let Some(port) = config.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()
            .context("failed to install Prometheus exporter")?;
        info!("Prometheus metrics exposed on port {}", port);
    }

    let queue = Arc::new(JobQueue::from_env().context("failed to create job queue")?);
    let lock = Arc::new(AccountLock::new(queue.client().clone(), config.batch_lock_ttl));

    let shutdown = CancellationToken::new();
    let dispatcher: Arc<dyn JobDispatcher> = queue.clone();
    let ctx = WorkerContext::ffmpeg(config, media, &ledger, dispatcher, lock, shutdown.clone());
    let executor = JobExecutor::new(Arc::new(ctx), queue, shutdown.clone());

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                signal.cancel();
            }
            Err(e) => warn!("Could not listen for shutdown signal: {}", e),
        }
    });

    executor.run().await.context("executor failed")?;

    info!("Worker shutdown complete");
    Ok(())
}
