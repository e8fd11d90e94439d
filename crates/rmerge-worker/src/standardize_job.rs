//! Standardize job processing.
//!
//! A job normalizes one asset into its batch's work directory and publishes
//! the terminal outcome for the orchestrator's barrier. A failed encode is a
//! normal outcome: the asset is reported as failed and left out of the
//! batch. Only a failure to publish the outcome fails the job itself.
//!
//! A job whose batch has already ended (timed out, failed or cancelled)
//! does no work, and one that finishes after its batch ended deletes what
//! it wrote.

use std::path::Path;

use tracing::{debug, warn, Instrument};

use rmerge_media::fs_utils::remove_if_exists;
use rmerge_media::MediaError;
use rmerge_models::JobOutcome;
use rmerge_queue::StandardizeJob;

use crate::context::WorkerContext;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::retry::{retry_async, RetryConfig};

pub async fn process_standardize_job(
    ctx: &WorkerContext,
    job: &StandardizeJob,
) -> WorkerResult<JobOutcome> {
    let logger = JobLogger::new(&job.job_id, "standardize", &job.account);
    run(ctx, job, &logger).instrument(logger.span()).await
}

async fn run(
    ctx: &WorkerContext,
    job: &StandardizeJob,
    logger: &JobLogger,
) -> WorkerResult<JobOutcome> {
    logger.log_start(&format!(
        "{} -> {} at {}",
        job.input_path.display(),
        job.output_path.display(),
        job.target()
    ));

    if batch_closed(ctx, job).await {
        logger.log_warning("batch already ended, skipping");
        return Ok(closed_outcome());
    }

    let options = ctx.media.options.clone().with_target(job.target());
    let result = ctx
        .standardizer
        .standardize(&job.input_path, &job.output_path, &options)
        .await;
    if let Ok(output_path) = &result {
        if batch_closed(ctx, job).await {
            logger.log_warning("batch ended during encode, discarding output");
            discard_output(output_path).await;
            return Ok(closed_outcome());
        }
    }

    let outcome = match result {
        Ok(output_path) => JobOutcome::Done { output_path },
        // Shutdown: leave the message pending so another worker picks it up.
        Err(MediaError::Cancelled) => return Err(WorkerError::Media(MediaError::Cancelled)),
        Err(e) => {
            logger.log_error(&format!("{} excluded from batch: {}", job.identifier, e));
            JobOutcome::Failed {
                error: e.to_string(),
            }
        }
    };

    metrics::counter!("rmerge_standardize_total", "result" => outcome.as_str()).increment(1);

    let retry = RetryConfig::new("record_outcome");
    retry_async(&retry, || ctx.dispatcher.record_outcome(&job.job_id, &outcome))
        .await
        .map_err(|(e, attempts)| {
            WorkerError::queue_failed(format!(
                "could not publish outcome of {} after {} attempts: {}",
                job.job_id, attempts, e
            ))
        })?;

    logger.log_completion(outcome.as_str());
    Ok(outcome)
}

/// An unreadable marker counts as open; the orchestrator's own cleanup
/// still covers everything written before it closed the batch.
async fn batch_closed(ctx: &WorkerContext, job: &StandardizeJob) -> bool {
    match ctx.dispatcher.batch_closed(&job.batch_id).await {
        Ok(closed) => closed,
        Err(e) => {
            warn!("Could not read state of batch {}: {}", job.batch_id, e);
            false
        }
    }
}

fn closed_outcome() -> JobOutcome {
    JobOutcome::Failed {
        error: "batch already ended".to_string(),
    }
}

/// Remove a late output and its batch directory once that is empty.
async fn discard_output(output: &Path) {
    if let Err(e) = remove_if_exists(output).await {
        warn!("Failed to remove late output {}: {}", output.display(), e);
    }
    if let Some(dir) = output.parent() {
        // Fails harmlessly while other late jobs of the batch still have files there.
        if tokio::fs::remove_dir(dir).await.is_ok() {
            debug!("Removed batch work directory {}", dir.display());
        }
    }
}
