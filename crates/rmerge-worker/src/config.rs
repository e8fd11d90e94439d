//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent standardize jobs
    pub max_concurrent_jobs: usize,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Work directory for standardized intermediates (one subdirectory per batch)
    pub work_dir: PathBuf,
    /// How often the worker should scan for orphaned pending jobs
    pub claim_interval: Duration,
    /// Minimum idle time before a pending job can be claimed (crash recovery)
    pub claim_min_idle: Duration,
    /// How often the orchestrator polls job outcomes
    pub barrier_poll_interval: Duration,
    /// How long the orchestrator waits for a batch's standardize jobs
    pub barrier_timeout: Duration,
    /// Run a recent reconciliation before selecting assets
    pub sync_before_merge: bool,
    /// Re-probe standardized outputs and check their geometry
    pub verify_standardized: bool,
    /// Expiry of the per-account batch lock
    pub batch_lock_ttl: Duration,
    /// Port for the Prometheus scrape endpoint, if any
    pub metrics_port: Option<u16>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            shutdown_timeout: Duration::from_secs(60),
            work_dir: PathBuf::from("/tmp/rmerge"),
            claim_interval: Duration::from_secs(30),
            claim_min_idle: Duration::from_secs(300), // 5 minutes
            barrier_poll_interval: Duration::from_millis(2000),
            barrier_timeout: Duration::from_secs(3600), // 1 hour
            sync_before_merge: true,
            verify_standardized: false,
            batch_lock_ttl: Duration::from_secs(7200),
            metrics_port: None,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent_jobs: env_parse("WORKER_MAX_JOBS").unwrap_or(defaults.max_concurrent_jobs),
            shutdown_timeout: env_parse("WORKER_SHUTDOWN_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            work_dir: std::env::var("WORKER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            claim_interval: env_parse("WORKER_CLAIM_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_interval),
            claim_min_idle: env_parse("WORKER_CLAIM_MIN_IDLE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_min_idle),
            barrier_poll_interval: env_parse("BARRIER_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.barrier_poll_interval),
            barrier_timeout: env_parse("BARRIER_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.barrier_timeout),
            sync_before_merge: env_flag("SYNC_BEFORE_MERGE").unwrap_or(defaults.sync_before_merge),
            verify_standardized: env_flag("VERIFY_STANDARDIZED")
                .unwrap_or(defaults.verify_standardized),
            batch_lock_ttl: env_parse("BATCH_LOCK_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.batch_lock_ttl),
            metrics_port: env_parse("WORKER_METRICS_PORT"),
        }
    }

    /// How often running messages are refreshed.
    ///
    /// Three refreshes fit in `claim_min_idle`, so a message whose job is
    /// still running never looks abandoned to another worker.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.claim_min_idle / 3).max(Duration::from_millis(100))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .and_then(|v| parse_flag(&v))
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
