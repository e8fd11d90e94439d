//! In-process queue.
//!
//! Implements the same dispatcher contract as the Redis queue for
//! single-node runs, where the worker loop and the orchestrator share one
//! process. Idempotency keys, outcomes and batch markers expire like their
//! Redis counterparts so a long-lived process does not accumulate them.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use rmerge_models::{BatchId, JobId, JobOutcome};

use crate::error::{QueueError, QueueResult};
use crate::job::QueueJob;
use crate::queue::JobDispatcher;

const DEFAULT_KEY_TTL: Duration = Duration::from_secs(3600);
const DEFAULT_OUTCOME_TTL: Duration = Duration::from_secs(86_400);

/// Values with an expiry instant.
struct Expiring<K, V> {
    entries: HashMap<K, (V, Instant)>,
}

impl<K: Eq + Hash, V> Default for Expiring<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash, V> Expiring<K, V> {
    fn insert(&mut self, key: K, value: V, expires: Instant) {
        self.entries.insert(key, (value, expires));
    }

    fn get(&self, key: &K, now: Instant) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|(_, expires)| *expires > now)
            .map(|(value, _)| value)
    }

    fn contains(&self, key: &K, now: Instant) -> bool {
        self.get(key, now).is_some()
    }

    fn prune(&mut self, now: Instant) {
        self.entries.retain(|_, (_, expires)| *expires > now);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Default)]
struct State {
    pending: VecDeque<(String, QueueJob)>,
    keys: Expiring<String, ()>,
    outcomes: Expiring<JobId, JobOutcome>,
    closed: Expiring<BatchId, ()>,
}

impl State {
    fn prune(&mut self, now: Instant) {
        self.keys.prune(now);
        self.outcomes.prune(now);
        self.closed.prune(now);
    }
}

pub struct MemoryQueue {
    state: Mutex<State>,
    notify: Notify,
    next_id: AtomicU64,
    unavailable: AtomicBool,
    key_ttl: Duration,
    outcome_ttl: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::with_ttls(DEFAULT_KEY_TTL, DEFAULT_OUTCOME_TTL)
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue whose idempotency keys live for `key_ttl` and whose outcomes
    /// and batch markers live for `outcome_ttl`.
    pub fn with_ttls(key_ttl: Duration, outcome_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            next_id: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
            key_ttl,
            outcome_ttl,
        }
    }

    /// Make `health` and `enqueue` fail, as if the broker were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Take the next job without waiting.
    pub async fn try_pop(&self) -> Option<(String, QueueJob)> {
        self.state.lock().await.pending.pop_front()
    }

    /// Wait for the next job.
    pub async fn pop(&self) -> (String, QueueJob) {
        loop {
            let notified = self.notify.notified();
            if let Some(entry) = self.try_pop().await {
                return entry;
            }
            notified.await;
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_available(&self) -> QueueResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(QueueError::unavailable("in-memory queue marked unavailable"))
        } else {
            Ok(())
        }
    }

    fn next_message_id(&self) -> String {
        format!("{}-0", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl JobDispatcher for MemoryQueue {
    async fn health(&self) -> QueueResult<()> {
        self.check_available()
    }

    async fn enqueue(&self, job: QueueJob) -> QueueResult<String> {
        let mut ids = self.enqueue_all(vec![job]).await?;
        ids.pop()
            .ok_or_else(|| QueueError::unavailable("enqueue produced no message id"))
    }

    async fn enqueue_all(&self, jobs: Vec<QueueJob>) -> QueueResult<Vec<String>> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.prune(now);

        let keys: Vec<String> = jobs.iter().map(QueueJob::idempotency_key).collect();
        for (i, key) in keys.iter().enumerate() {
            if state.keys.contains(key, now) || keys[..i].contains(key) {
                return Err(QueueError::Duplicate(key.clone()));
            }
        }

        let mut message_ids = Vec::with_capacity(jobs.len());
        for (key, job) in keys.into_iter().zip(jobs) {
            state.keys.insert(key, (), now + self.key_ttl);
            let message_id = self.next_message_id();
            state.pending.push_back((message_id.clone(), job));
            message_ids.push(message_id);
        }
        drop(state);
        self.notify.notify_one();
        Ok(message_ids)
    }

    async fn close_batch(&self, batch_id: &BatchId) -> QueueResult<()> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.prune(now);
        state.closed.insert(batch_id.clone(), (), now + self.outcome_ttl);
        Ok(())
    }

    async fn batch_closed(&self, batch_id: &BatchId) -> QueueResult<bool> {
        Ok(self.state.lock().await.closed.contains(batch_id, Instant::now()))
    }

    async fn record_outcome(&self, job_id: &JobId, outcome: &JobOutcome) -> QueueResult<()> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.prune(now);
        state
            .outcomes
            .insert(job_id.clone(), outcome.clone(), now + self.outcome_ttl);
        Ok(())
    }

    async fn outcome(&self, job_id: &JobId) -> QueueResult<Option<JobOutcome>> {
        Ok(self
            .state
            .lock()
            .await
            .outcomes
            .get(job_id, Instant::now())
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::MergeRequestJob;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fifo_and_duplicates() {
        let queue = MemoryQueue::new();
        let a = QueueJob::MergeRequest(MergeRequestJob::new("a"));
        let b = QueueJob::MergeRequest(MergeRequestJob::new("b"));
        queue.enqueue(a.clone()).await.unwrap();
        queue.enqueue(b).await.unwrap();
        assert!(matches!(queue.enqueue(a).await, Err(QueueError::Duplicate(_))));

        assert_eq!(queue.pop().await.1.account(), "a");
        assert_eq!(queue.pop().await.1.account(), "b");
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_pop_waits_for_enqueue() {
        let queue = Arc::new(MemoryQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue
            .enqueue(QueueJob::MergeRequest(MergeRequestJob::new("late")))
            .await
            .unwrap();
        let (_, job) = waiter.await.unwrap();
        assert_eq!(job.account(), "late");
    }

    #[tokio::test]
    async fn test_unavailable_and_outcomes() {
        let queue = MemoryQueue::new();
        queue.set_unavailable(true);
        assert!(queue.health().await.is_err());
        assert!(queue
            .enqueue(QueueJob::MergeRequest(MergeRequestJob::new("a")))
            .await
            .is_err());

        let id = JobId::new();
        assert!(queue.outcome(&id).await.unwrap().is_none());
        queue
            .record_outcome(&id, &JobOutcome::Done { output_path: "/o.mp4".into() })
            .await
            .unwrap();
        let outcomes = queue.outcomes(&[id, JobId::new()]).await.unwrap();
        assert!(outcomes[0].as_ref().unwrap().is_done());
        assert!(outcomes[1].is_none());
    }

    #[tokio::test]
    async fn test_enqueue_all_is_all_or_nothing() {
        let queue = MemoryQueue::new();
        let a = QueueJob::MergeRequest(MergeRequestJob::new("a"));
        let b = QueueJob::MergeRequest(MergeRequestJob::new("b"));
        queue.enqueue(b.clone()).await.unwrap();
        queue.try_pop().await.unwrap();

        // b is still inside its idempotency window, so a must not land either.
        let result = queue.enqueue_all(vec![a.clone(), b]).await;
        assert!(matches!(result, Err(QueueError::Duplicate(_))));
        assert!(queue.is_empty().await);

        let c = QueueJob::MergeRequest(MergeRequestJob::new("c"));
        let ids = queue.enqueue_all(vec![a, c]).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(queue.pop().await.1.account(), "a");
        assert_eq!(queue.pop().await.1.account(), "c");
    }

    #[tokio::test]
    async fn test_batch_markers() {
        let queue = MemoryQueue::new();
        let batch = BatchId::new();
        assert!(!queue.batch_closed(&batch).await.unwrap());
        queue.close_batch(&batch).await.unwrap();
        assert!(queue.batch_closed(&batch).await.unwrap());
        assert!(!queue.batch_closed(&BatchId::new()).await.unwrap());
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let ttl = Duration::from_millis(50);
        let queue = MemoryQueue::with_ttls(ttl, ttl);
        let job = QueueJob::MergeRequest(MergeRequestJob::new("a"));
        let id = JobId::new();
        let batch = BatchId::new();

        queue.enqueue(job.clone()).await.unwrap();
        queue.try_pop().await.unwrap();
        queue
            .record_outcome(&id, &JobOutcome::Failed { error: "x".into() })
            .await
            .unwrap();
        queue.close_batch(&batch).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(queue.outcome(&id).await.unwrap().is_none());
        assert!(!queue.batch_closed(&batch).await.unwrap());

        // Any write prunes expired entries.
        queue.enqueue(job).await.unwrap();
        let state = queue.state.lock().await;
        assert_eq!(state.keys.len(), 1);
        assert_eq!(state.outcomes.len(), 0);
        assert_eq!(state.closed.len(), 0);
    }
}
