//! Job queue using Redis Streams.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use rmerge_models::{BatchId, JobId, JobOutcome};

use crate::error::{QueueError, QueueResult};
use crate::job::QueueJob;

/// How long an enqueue idempotency key blocks duplicates.
const DEDUP_TTL_SECS: u64 = 3600;

/// How long retry counters live.
const RETRY_TTL_SECS: i64 = 86_400;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Stream name for jobs
    pub stream_name: String,
    /// Consumer group name
    pub consumer_group: String,
    /// Dead letter queue stream name
    pub dlq_stream_name: String,
    /// Max retries before DLQ
    pub max_retries: u32,
    /// Job visibility timeout
    pub visibility_timeout: Duration,
    /// How long job outcomes stay readable
    pub outcome_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            stream_name: "rmerge:jobs".to_string(),
            consumer_group: "rmerge:workers".to_string(),
            dlq_stream_name: "rmerge:dlq".to_string(),
            max_retries: 3,
            visibility_timeout: Duration::from_secs(600),
            outcome_ttl: Duration::from_secs(86_400),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            stream_name: std::env::var("QUEUE_STREAM").unwrap_or(defaults.stream_name),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP")
                .unwrap_or(defaults.consumer_group),
            dlq_stream_name: std::env::var("QUEUE_DLQ_STREAM").unwrap_or(defaults.dlq_stream_name),
            max_retries: std::env::var("QUEUE_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
            visibility_timeout: std::env::var("QUEUE_VISIBILITY_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.visibility_timeout),
            outcome_ttl: std::env::var("JOB_OUTCOME_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.outcome_ttl),
        }
    }
}

/// The producer/consumer contract the orchestrator relies on.
///
/// Delivery is at-least-once; consumers make reprocessing harmless by
/// writing to deterministic output paths.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Fail fast if the queue cannot accept jobs.
    async fn health(&self) -> QueueResult<()>;

    /// Enqueue a job, returning its message id.
    async fn enqueue(&self, job: QueueJob) -> QueueResult<String>;

    /// Enqueue every job or none of them.
    async fn enqueue_all(&self, jobs: Vec<QueueJob>) -> QueueResult<Vec<String>>;

    /// Publish a job's terminal state.
    async fn record_outcome(&self, job_id: &JobId, outcome: &JobOutcome) -> QueueResult<()>;

    /// Read a job's terminal state, if it has one.
    async fn outcome(&self, job_id: &JobId) -> QueueResult<Option<JobOutcome>>;

    /// Mark a batch as finished so late jobs discard their work.
    async fn close_batch(&self, batch_id: &BatchId) -> QueueResult<()>;

    /// Whether [`close_batch`](Self::close_batch) was called for a batch.
    async fn batch_closed(&self, batch_id: &BatchId) -> QueueResult<bool>;

    /// Read several outcomes, aligned with `job_ids`.
    async fn outcomes(&self, job_ids: &[JobId]) -> QueueResult<Vec<Option<JobOutcome>>> {
        let mut out = Vec::with_capacity(job_ids.len());
        for id in job_ids {
            out.push(self.outcome(id).await?);
        }
        Ok(out)
    }
}

fn outcome_key(job_id: &JobId) -> String {
    format!("rmerge:job:{}:outcome", job_id)
}

fn closed_key(batch_id: &BatchId) -> String {
    format!("rmerge:batch:{}:closed", batch_id)
}

fn dedup_key(job: &QueueJob) -> String {
    format!("rmerge:dedup:{}", job.idempotency_key())
}

/// Job queue client.
pub struct JobQueue {
    client: redis::Client,
    config: QueueConfig,
}

impl JobQueue {
    /// Create a new job queue.
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn client(&self) -> &redis::Client {
        &self.client
    }

    async fn conn(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))
    }

    /// Initialize the queue (create consumer group if not exists).
    pub async fn init(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!("Created consumer group: {}", self.config.consumer_group),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists: {}", self.config.consumer_group);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    /// Acknowledge and delete a message.
    pub async fn ack(&self, message_id: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;

        redis::cmd("XACK")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        redis::cmd("XDEL")
            .arg(&self.config.stream_name)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        debug!("Acknowledged message: {}", message_id);
        Ok(())
    }

    /// Move a job to the dead letter stream and ack the original.
    pub async fn dlq(&self, message_id: &str, job: &QueueJob, error: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(job)?;

        redis::cmd("XADD")
            .arg(&self.config.dlq_stream_name)
            .arg("*")
            .arg("job")
            .arg(&payload)
            .arg("error")
            .arg(error)
            .arg("original_id")
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        self.ack(message_id).await?;

        warn!("Moved job {} to DLQ: {}", job.job_id(), error);
        Ok(())
    }

    /// Get queue length.
    pub async fn len(&self) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.xlen(&self.config.stream_name).await?)
    }

    /// Get DLQ length.
    pub async fn dlq_len(&self) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.xlen(&self.config.dlq_stream_name).await?)
    }

    /// Read new messages for this consumer.
    pub async fn consume(
        &self,
        consumer_name: &str,
        block_ms: u64,
        count: usize,
    ) -> QueueResult<Vec<(String, QueueJob)>> {
        let mut conn = self.conn().await?;

        let reply: redis::streams::StreamReadReply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer_name)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.config.stream_name)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        let entries = reply.keys.into_iter().flat_map(|k| k.ids).collect();
        Ok(self.decode_entries(entries, "Consumed").await)
    }

    /// Claim messages left pending by crashed consumers.
    pub async fn claim_pending(
        &self,
        consumer_name: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> QueueResult<Vec<(String, QueueJob)>> {
        let mut conn = self.conn().await?;

        let pending: redis::streams::StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(consumer_name)
            .arg(min_idle_ms);
        for entry in &pending.ids {
            cmd.arg(&entry.id);
        }
        let claimed: redis::streams::StreamClaimReply = cmd.query_async(&mut conn).await?;

        Ok(self.decode_entries(claimed.ids, "Claimed pending").await)
    }

    /// Reset the idle time of messages this consumer is still working on,
    /// so `claim_pending` elsewhere never takes them.
    pub async fn touch(&self, consumer_name: &str, message_ids: &[String]) -> QueueResult<()> {
        if message_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(consumer_name)
            .arg(0)
            .arg(message_ids)
            .arg("JUSTID");
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    /// Decode stream entries, acking any that are not valid jobs.
    async fn decode_entries(
        &self,
        entries: Vec<redis::streams::StreamId>,
        verb: &str,
    ) -> Vec<(String, QueueJob)> {
        let mut jobs = Vec::with_capacity(entries.len());
        for entry in entries {
            let payload: Option<String> = entry.get("job");
            match payload.map(|p| serde_json::from_str::<QueueJob>(&p)) {
                Some(Ok(job)) => {
                    debug!("{} job {} ({})", verb, job.job_id(), job.kind());
                    jobs.push((entry.id, job));
                }
                Some(Err(e)) => {
                    warn!("Dropping malformed job payload {}: {}", entry.id, e);
                    self.ack(&entry.id).await.ok();
                }
                None => {
                    warn!("Dropping stream entry without payload: {}", entry.id);
                    self.ack(&entry.id).await.ok();
                }
            }
        }
        jobs
    }

    /// Get retry count for a message.
    pub async fn get_retry_count(&self, message_id: &str) -> QueueResult<u32> {
        let mut conn = self.conn().await?;
        let count: Option<u32> = conn.get(format!("rmerge:retry:{}", message_id)).await?;
        Ok(count.unwrap_or(0))
    }

    /// Increment retry count for a message.
    pub async fn increment_retry(&self, message_id: &str) -> QueueResult<u32> {
        let mut conn = self.conn().await?;
        let key = format!("rmerge:retry:{}", message_id);
        let count: u32 = conn.incr(&key, 1).await?;
        conn.expire::<_, ()>(&key, RETRY_TTL_SECS).await?;
        Ok(count)
    }

    /// Get max retries from config.
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }
}

#[async_trait]
impl JobDispatcher for JobQueue {
    async fn health(&self) -> QueueResult<()> {
        let mut conn = self
            .conn()
            .await
            .map_err(|e| QueueError::unavailable(e.to_string()))?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| QueueError::unavailable(e.to_string()))?;
        Ok(())
    }

    async fn enqueue(&self, job: QueueJob) -> QueueResult<String> {
        let mut conn = self.conn().await?;

        let payload = serde_json::to_string(&job)?;
        let idempotency_key = job.idempotency_key();

        // SET NX claims the key atomically, so two producers cannot both pass.
        let claimed: Option<String> = redis::cmd("SET")
            .arg(dedup_key(&job))
            .arg(job.job_id().as_str())
            .arg("NX")
            .arg("EX")
            .arg(DEDUP_TTL_SECS)
            .query_async(&mut conn)
            .await?;
        if claimed.is_none() {
            warn!("Duplicate job rejected: {}", idempotency_key);
            return Err(QueueError::Duplicate(idempotency_key));
        }

        let message_id: String = redis::cmd("XADD")
            .arg(&self.config.stream_name)
            .arg("*")
            .arg("job")
            .arg(&payload)
            .arg("key")
            .arg(&idempotency_key)
            .query_async(&mut conn)
            .await?;

        info!(
            "Enqueued {} job {} with message ID {}",
            job.kind(),
            job.job_id(),
            message_id
        );
        Ok(message_id)
    }

    async fn enqueue_all(&self, jobs: Vec<QueueJob>) -> QueueResult<Vec<String>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let payloads = jobs
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        let keys: Vec<String> = jobs.iter().map(dedup_key).collect();
        let mut conn = self.conn().await?;

        let mut claim = redis::pipe();
        for (key, job) in keys.iter().zip(&jobs) {
            claim
                .cmd("SET")
                .arg(key)
                .arg(job.job_id().as_str())
                .arg("NX")
                .arg("EX")
                .arg(DEDUP_TTL_SECS);
        }
        let claimed: Vec<Option<String>> = claim.query_async(&mut conn).await?;

        let taken: Vec<&String> = keys
            .iter()
            .zip(&claimed)
            .filter_map(|(key, c)| c.as_ref().map(|_| key))
            .collect();
        if let Some(position) = claimed.iter().position(Option::is_none) {
            release_keys(&mut conn, &taken).await;
            let duplicate = jobs[position].idempotency_key();
            warn!("Duplicate job rejected, batch not enqueued: {}", duplicate);
            return Err(QueueError::Duplicate(duplicate));
        }

        // MULTI/EXEC: either every message lands on the stream or none does.
        let mut add = redis::pipe();
        add.atomic();
        for (job, payload) in jobs.iter().zip(&payloads) {
            add.cmd("XADD")
                .arg(&self.config.stream_name)
                .arg("*")
                .arg("job")
                .arg(payload)
                .arg("key")
                .arg(job.idempotency_key());
        }
        let message_ids: Vec<String> = match add.query_async(&mut conn).await {
            Ok(ids) => ids,
            Err(e) => {
                release_keys(&mut conn, &taken).await;
                return Err(e.into());
            }
        };

        info!("Enqueued {} jobs atomically", message_ids.len());
        Ok(message_ids)
    }

    async fn close_batch(&self, batch_id: &BatchId) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(closed_key(batch_id), 1, self.config.outcome_ttl.as_secs())
            .await?;
        Ok(())
    }

    async fn batch_closed(&self, batch_id: &BatchId) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        Ok(conn.exists(closed_key(batch_id)).await?)
    }

    async fn record_outcome(&self, job_id: &JobId, outcome: &JobOutcome) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(outcome)?;
        conn.set_ex::<_, _, ()>(outcome_key(job_id), payload, self.config.outcome_ttl.as_secs())
            .await?;
        Ok(())
    }

    async fn outcome(&self, job_id: &JobId) -> QueueResult<Option<JobOutcome>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(outcome_key(job_id)).await?;
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    async fn outcomes(&self, job_ids: &[JobId]) -> QueueResult<Vec<Option<JobOutcome>>> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let keys: Vec<String> = job_ids.iter().map(outcome_key).collect();
        let raw: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;
        raw.into_iter()
            .map(|r| r.map(|s| serde_json::from_str(&s)).transpose().map_err(Into::into))
            .collect()
    }
}

/// Drop idempotency keys claimed for a batch that was not enqueued.
async fn release_keys(conn: &mut redis::aio::MultiplexedConnection, keys: &[&String]) {
    if keys.is_empty() {
        return;
    }
    if let Err(e) = redis::cmd("DEL").arg(keys).query_async::<()>(conn).await {
        warn!("Failed to release {} idempotency keys: {}", keys.len(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::MergeRequestJob;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.stream_name, "rmerge:jobs");
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_keys() {
        assert_eq!(
            outcome_key(&JobId::from_string("abc")),
            "rmerge:job:abc:outcome"
        );
        assert_eq!(
            closed_key(&BatchId("b1".into())),
            "rmerge:batch:b1:closed"
        );
        let job = QueueJob::MergeRequest(MergeRequestJob::new("acct"));
        assert_eq!(
            dedup_key(&job),
            format!("rmerge:dedup:merge:acct:{}", job.job_id())
        );
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_redis_roundtrip() {
        let queue = JobQueue::new(QueueConfig {
            stream_name: format!("rmerge:test:{}", uuid::Uuid::new_v4()),
            ..QueueConfig::default()
        })
        .unwrap();
        queue.init().await.unwrap();
        queue.health().await.unwrap();

        let job = QueueJob::MergeRequest(MergeRequestJob::new("acct"));
        let job_id = job.job_id().clone();
        queue.enqueue(job.clone()).await.unwrap();
        assert!(matches!(
            queue.enqueue(job).await,
            Err(QueueError::Duplicate(_))
        ));

        let consumed = queue.consume("test-consumer", 100, 10).await.unwrap();
        assert_eq!(consumed.len(), 1);
        queue.ack(&consumed[0].0).await.unwrap();

        queue
            .record_outcome(&job_id, &JobOutcome::Failed { error: "x".into() })
            .await
            .unwrap();
        let outcomes = queue
            .outcomes(&[job_id, JobId::from_string("missing")])
            .await
            .unwrap();
        assert!(matches!(outcomes[0], Some(JobOutcome::Failed { .. })));
        assert!(outcomes[1].is_none());
    }
}
