//! Completion barrier for a batch's standardize jobs.
//!
//! The orchestrator never blocks on a worker directly. It polls the outcome
//! side-channel at a fixed interval until every job has a terminal outcome,
//! the deadline passes, or the batch is cancelled.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use rmerge_models::{JobId, JobOutcome};
use rmerge_queue::JobDispatcher;

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::retry::FailureTracker;

#[derive(Debug, Clone, Copy)]
pub struct Barrier {
    poll_interval: Duration,
    timeout: Duration,
}

impl Barrier {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            timeout,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.barrier_poll_interval, config.barrier_timeout)
    }

    /// Wait until every job in `job_ids` has an outcome.
    ///
    /// Outcomes are returned aligned with `job_ids`. Fails with
    /// [`WorkerError::BarrierTimeout`] once the deadline passes and with
    /// [`WorkerError::Cancelled`] if `cancel` fires first.
    pub async fn wait(
        &self,
        dispatcher: &dyn JobDispatcher,
        job_ids: &[JobId],
        cancel: &CancellationToken,
    ) -> WorkerResult<Vec<JobOutcome>> {
        let total = job_ids.len();
        let deadline = Instant::now() + self.timeout;
        let mut failures = FailureTracker::new(3);
        let mut completed = 0;

        loop {
            match dispatcher.outcomes(job_ids).await {
                Ok(current) => {
                    failures.record_success();
                    let done = current.iter().filter(|o| o.is_some()).count();
                    if done != completed {
                        debug!(completed = done, total = total, "Barrier progress");
                        completed = done;
                    }
                    if done == total {
                        return Ok(current.into_iter().flatten().collect());
                    }
                }
                Err(e) => {
                    // A missed poll only delays the batch; the deadline still holds.
                    if failures.record_failure() {
                        warn!("Failed to poll job outcomes: {}", e);
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(WorkerError::BarrierTimeout { completed, total });
            }

            let wake = (now + self.poll_interval).min(deadline);
            tokio::select! {
                _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    use rmerge_queue::MemoryQueue;

    fn done(path: &str) -> JobOutcome {
        JobOutcome::Done {
            output_path: PathBuf::from(path),
        }
    }

    #[tokio::test]
    async fn test_returns_outcomes_in_job_order() {
        let queue = Arc::new(MemoryQueue::new());
        let ids = vec![JobId::new(), JobId::new()];

        let writer = Arc::clone(&queue);
        let (first, second) = (ids[0].clone(), ids[1].clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.record_outcome(&second, &done("/b.mp4")).await.unwrap();
            writer
                .record_outcome(
                    &first,
                    &JobOutcome::Failed {
                        error: "bad input".into(),
                    },
                )
                .await
                .unwrap();
        });

        let barrier = Barrier::new(Duration::from_millis(5), Duration::from_secs(5));
        let outcomes = barrier
            .wait(queue.as_ref(), &ids, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcomes[0].is_done());
        assert_eq!(outcomes[1], done("/b.mp4"));
    }

    #[tokio::test]
    async fn test_timeout_reports_progress() {
        let queue = MemoryQueue::new();
        let ids: Vec<JobId> = (0..5).map(|_| JobId::new()).collect();
        for id in &ids[..3] {
            queue.record_outcome(id, &done("/x.mp4")).await.unwrap();
        }

        let barrier = Barrier::new(Duration::from_millis(5), Duration::from_millis(50));
        let err = barrier
            .wait(&queue, &ids, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            WorkerError::BarrierTimeout {
                completed: 3,
                total: 5
            }
        ));
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting() {
        let queue = MemoryQueue::new();
        let ids = vec![JobId::new()];
        let cancel = CancellationToken::new();
        cancel.cancel();

        let barrier = Barrier::new(Duration::from_secs(1), Duration::from_secs(60));
        let err = barrier.wait(&queue, &ids, &cancel).await.unwrap_err();
        assert!(matches!(err, WorkerError::Cancelled));
    }

    #[tokio::test]
    async fn test_empty_batch_is_immediately_complete() {
        let queue = MemoryQueue::new();
        let barrier = Barrier::new(Duration::from_secs(1), Duration::from_secs(1));
        let outcomes = barrier
            .wait(&queue, &[], &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcomes.is_empty());
    }
}
