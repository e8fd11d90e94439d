//! Job executors.
//!
//! [`JobExecutor`] consumes the Redis stream with retry and DLQ handling.
//! [`LocalExecutor`] drains an in-process [`MemoryQueue`] for single-node
//! runs. Both bound concurrent standardize jobs with a semaphore; merge
//! requests run outside it so a batch waiting on its barrier never holds a
//! slot its own jobs need.
//!
//! A message stays pending for as long as its job runs, which for a merge
//! request includes the whole barrier wait. The Redis executor keeps those
//! messages fresh with a heartbeat so the claim loop of any worker only
//! picks up messages whose consumer is really gone.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use rmerge_queue::{JobQueue, MemoryQueue, QueueJob};

use crate::context::WorkerContext;
use crate::error::{WorkerError, WorkerResult};
use crate::orchestrator::MergeOrchestrator;
use crate::retry::FailureTracker;
use crate::standardize_job::process_standardize_job;

/// Process a single job of either kind.
pub async fn process_job(
    orchestrator: &MergeOrchestrator,
    job: QueueJob,
    cancel: &CancellationToken,
) -> WorkerResult<()> {
    match job {
        QueueJob::Standardize(j) => {
            process_standardize_job(orchestrator.context(), &j).await?;
            Ok(())
        }
        QueueJob::MergeRequest(j) => {
            let outcome = orchestrator.run(&j, cancel).await?;
            info!(
                account = %j.account,
                state = outcome.state().as_str(),
                "Merge request finished"
            );
            Ok(())
        }
    }
}

/// Job executor that processes jobs from the Redis queue.
pub struct JobExecutor {
    ctx: Arc<WorkerContext>,
    orchestrator: Arc<MergeOrchestrator>,
    queue: Arc<JobQueue>,
    job_semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    consumer_name: String,
    in_flight: Arc<InFlight>,
}

impl JobExecutor {
    /// `shutdown` should be the token the context's FFmpeg tools were
    /// built with, so stopping the executor also stops running encodes.
    pub fn new(ctx: Arc<WorkerContext>, queue: Arc<JobQueue>, shutdown: CancellationToken) -> Self {
        let job_semaphore = Arc::new(Semaphore::new(ctx.config.max_concurrent_jobs));
        let consumer_name = format!("worker-{}", Uuid::new_v4());

        Self {
            orchestrator: Arc::new(MergeOrchestrator::new(Arc::clone(&ctx))),
            ctx,
            queue,
            job_semaphore,
            tracker: TaskTracker::new(),
            shutdown,
            consumer_name,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Start the executor; returns once shutdown has drained in-flight jobs.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            "Starting job executor '{}' with {} max concurrent jobs",
            self.consumer_name, self.ctx.config.max_concurrent_jobs
        );

        self.queue.init().await?;

        let claim_task = {
            let this = self.handles();
            let interval = self.ctx.config.claim_interval;
            let min_idle_ms = self.ctx.config.claim_min_idle.as_millis() as u64;
            tokio::spawn(async move { this.claim_loop(interval, min_idle_ms).await })
        };

        let heartbeat_task = {
            let this = self.handles();
            let interval = self.ctx.config.heartbeat_interval();
            tokio::spawn(async move { this.heartbeat_loop(interval).await })
        };

        let mut failures = FailureTracker::new(5);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping executor");
                    break;
                }
                result = self.consume_jobs() => match result {
                    Ok(()) => failures.record_success(),
                    Err(e) => {
                        if failures.record_failure() {
                            error!("Error consuming jobs: {}", e);
                        }
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }

        claim_task.abort();
        heartbeat_task.abort();

        info!("Waiting for in-flight jobs to complete...");
        self.tracker.close();
        if tokio::time::timeout(self.ctx.config.shutdown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("In-flight jobs did not finish before the shutdown timeout");
        }

        info!("Job executor stopped");
        Ok(())
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn handles(&self) -> ExecutorHandles {
        ExecutorHandles {
            orchestrator: Arc::clone(&self.orchestrator),
            queue: Arc::clone(&self.queue),
            job_semaphore: Arc::clone(&self.job_semaphore),
            tracker: self.tracker.clone(),
            shutdown: self.shutdown.clone(),
            consumer_name: self.consumer_name.clone(),
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    async fn consume_jobs(&self) -> WorkerResult<()> {
        let available = self.job_semaphore.available_permits();
        if available == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let jobs = self
            .queue
            .consume(&self.consumer_name, 1000, available.min(5))
            .await?;
        if jobs.is_empty() {
            return Ok(());
        }
        debug!("Consumed {} jobs from queue", jobs.len());

        let handles = self.handles();
        for (message_id, job) in jobs {
            handles.dispatch(message_id, job).await?;
        }
        Ok(())
    }
}

/// Clonable pieces of a [`JobExecutor`] for its background tasks.
#[derive(Clone)]
struct ExecutorHandles {
    orchestrator: Arc<MergeOrchestrator>,
    queue: Arc<JobQueue>,
    job_semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    consumer_name: String,
    in_flight: Arc<InFlight>,
}

impl ExecutorHandles {
    async fn claim_loop(&self, interval: Duration, min_idle_ms: u64) {
        let mut ticker = tokio::time::interval(interval);
        let mut failures = FailureTracker::new(3);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.queue.claim_pending(&self.consumer_name, min_idle_ms, 5).await {
                Ok(jobs) => {
                    failures.record_success();
                    if !jobs.is_empty() {
                        info!("Claimed {} pending jobs", jobs.len());
                    }
                    for (message_id, job) in jobs {
                        if self.dispatch(message_id, job).await.is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    if failures.record_failure() {
                        warn!("Failed to claim pending jobs: {}", e);
                    }
                }
            }
        }
    }

    /// Refresh the idle time of every message this process is running.
    async fn heartbeat_loop(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        let mut failures = FailureTracker::new(3);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let ids = self.in_flight.snapshot();
            match self.queue.touch(&self.consumer_name, &ids).await {
                Ok(()) => failures.record_success(),
                Err(e) => {
                    if failures.record_failure() {
                        warn!("Failed to refresh {} in-flight messages: {}", ids.len(), e);
                    }
                }
            }
        }
    }

    /// Spawn a job, taking a semaphore slot for standardize work.
    ///
    /// A message this process is already running is skipped; that happens
    /// when the claim loop sees it before a heartbeat refreshed it.
    async fn dispatch(&self, message_id: String, job: QueueJob) -> WorkerResult<()> {
        let Some(guard) = self.in_flight.enter(&message_id) else {
            debug!("Message {} already running here, not claiming it again", message_id);
            return Ok(());
        };
        let permit = match job {
            QueueJob::Standardize(_) => Some(
                Arc::clone(&self.job_semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| WorkerError::job_failed("Semaphore closed"))?,
            ),
            QueueJob::MergeRequest(_) => None,
        };
        let this = self.clone();
        self.tracker.spawn(async move {
            let _guard = guard;
            this.execute_job(message_id, job, permit).await;
        });
        Ok(())
    }

    /// Execute a single job with retry and DLQ handling.
    async fn execute_job(
        &self,
        message_id: String,
        job: QueueJob,
        _permit: Option<OwnedSemaphorePermit>,
    ) {
        let job_id = job.job_id().to_string();
        debug!("Executing {} job {}", job.kind(), job_id);

        match process_job(&self.orchestrator, job.clone(), &self.shutdown).await {
            Ok(()) => {
                if let Err(e) = self.queue.ack(&message_id).await {
                    error!("Failed to ack job {}: {}", job_id, e);
                }
            }
            Err(e) if self.shutdown.is_cancelled() && e.is_retryable() => {
                info!("Job {} interrupted by shutdown, left for redelivery", job_id);
            }
            Err(e) => {
                error!("Job {} failed: {}", job_id, e);

                let retry_count = self.queue.increment_retry(&message_id).await.unwrap_or(u32::MAX);
                let max_retries = self.queue.max_retries();

                if !e.is_retryable() || retry_count >= max_retries {
                    warn!("Moving job {} to DLQ after {} attempts", job_id, retry_count);
                    if let Err(dlq_err) = self.queue.dlq(&message_id, &job, &e.to_string()).await {
                        error!("Failed to move job {} to DLQ: {}", job_id, dlq_err);
                    }
                } else {
                    info!(
                        "Job {} will be retried (attempt {}/{})",
                        job_id, retry_count, max_retries
                    );
                }
            }
        }
    }
}

/// Message ids of jobs running in this process.
#[derive(Debug, Default)]
struct InFlight {
    ids: Mutex<HashSet<String>>,
}

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a message, or `None` if it is already running.
    fn enter(self: &Arc<Self>, message_id: &str) -> Option<InFlightGuard> {
        if !self.lock().insert(message_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            registry: Arc::clone(self),
            message_id: message_id.to_string(),
        })
    }

    fn snapshot(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }
}

/// Removes its message from [`InFlight`] when the job ends.
struct InFlightGuard {
    registry: Arc<InFlight>,
    message_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.message_id);
    }
}

/// Executor draining an in-process queue.
///
/// The queue has no redelivery, so failed jobs are logged and dropped.
pub struct LocalExecutor {
    orchestrator: Arc<MergeOrchestrator>,
    queue: Arc<MemoryQueue>,
    job_semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    shutdown_timeout: Duration,
}

impl LocalExecutor {
    pub fn new(ctx: Arc<WorkerContext>, queue: Arc<MemoryQueue>, shutdown: CancellationToken) -> Self {
        Self {
            job_semaphore: Arc::new(Semaphore::new(ctx.config.max_concurrent_jobs)),
            shutdown_timeout: ctx.config.shutdown_timeout,
            orchestrator: Arc::new(MergeOrchestrator::new(ctx)),
            queue,
            tracker: TaskTracker::new(),
            shutdown,
        }
    }

    /// The orchestrator merge requests run on.
    pub fn orchestrator(&self) -> Arc<MergeOrchestrator> {
        Arc::clone(&self.orchestrator)
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn run(&self) {
        info!("Starting local executor");
        loop {
            let (message_id, job) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                entry = self.queue.pop() => entry,
            };

            let permit = match job {
                QueueJob::Standardize(_) => {
                    match Arc::clone(&self.job_semaphore).acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    }
                }
                QueueJob::MergeRequest(_) => None,
            };

            let orchestrator = Arc::clone(&self.orchestrator);
            let cancel = self.shutdown.clone();
            self.tracker.spawn(async move {
                let _permit = permit;
                let job_id = job.job_id().to_string();
                if let Err(e) = process_job(&orchestrator, job, &cancel).await {
                    error!("Job {} ({}) failed: {}", job_id, message_id, e);
                }
            });
        }

        self.tracker.close();
        if tokio::time::timeout(self.shutdown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("In-flight jobs did not finish before the shutdown timeout");
        }
        info!("Local executor stopped");
    }
}
