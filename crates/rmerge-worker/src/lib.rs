//! Standardization worker and merge orchestrator.
//!
//! This crate provides:
//! - The standardize job handler that publishes per-asset outcomes
//! - The merge orchestrator (selection, fan-out, barrier, concat, commit)
//! - Redis and in-process job executors with graceful shutdown

pub mod barrier;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod logging;
pub mod orchestrator;
pub mod retry;
pub mod standardize_job;

pub use barrier::Barrier;
pub use config::WorkerConfig;
pub use context::WorkerContext;
pub use error::{WorkerError, WorkerResult};
pub use executor::{process_job, JobExecutor, LocalExecutor};
pub use logging::JobLogger;
pub use orchestrator::{BatchOutcome, MergeOrchestrator, SelectedAsset, Selection};
pub use standardize_job::process_standardize_job;
