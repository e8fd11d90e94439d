//! Per-account batch locks.
//!
//! At most one merge batch runs per account at a time; batches for
//! different accounts never contend.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};

/// Proof of holding an account's lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub account: String,
    pub token: String,
}

#[async_trait]
pub trait BatchLock: Send + Sync {
    /// Take the account's lock, or `None` if another batch holds it.
    async fn try_acquire(&self, account: &str) -> QueueResult<Option<LockToken>>;

    /// Release a lock taken by `try_acquire`.
    async fn release(&self, token: &LockToken) -> QueueResult<()>;
}

/// Lock shared by every process through Redis.
///
/// `SET NX EX` takes the lock; release only deletes the key if it still
/// holds our token, so an expired and re-taken lock is left alone.
pub struct AccountLock {
    client: redis::Client,
    ttl: Duration,
}

impl AccountLock {
    pub fn new(client: redis::Client, ttl: Duration) -> Self {
        Self { client, ttl }
    }

    fn key(account: &str) -> String {
        format!("rmerge:lock:merge:{account}")
    }

    async fn conn(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))
    }
}

#[async_trait]
impl BatchLock for AccountLock {
    async fn try_acquire(&self, account: &str) -> QueueResult<Option<LockToken>> {
        let mut conn = self.conn().await?;
        let token = format!("batch:{}", Uuid::new_v4());

        let result: Option<String> = redis::cmd("SET")
            .arg(Self::key(account))
            .arg(&token)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        Ok(result.map(|_| LockToken {
            account: account.to_string(),
            token,
        }))
    }

    async fn release(&self, token: &LockToken) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let script = Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            else
                return 0
            end
            "#,
        );
        let deleted: i32 = script
            .key(Self::key(&token.account))
            .arg(&token.token)
            .invoke_async(&mut conn)
            .await?;

        if deleted == 0 {
            warn!(account = %token.account, "Batch lock had already expired");
        } else {
            debug!(account = %token.account, "Released batch lock");
        }
        Ok(())
    }
}

/// Process-local lock for single-node runs.
#[derive(Default)]
pub struct MemoryBatchLock {
    held: Mutex<HashMap<String, String>>,
}

impl MemoryBatchLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchLock for MemoryBatchLock {
    async fn try_acquire(&self, account: &str) -> QueueResult<Option<LockToken>> {
        let mut held = self.held.lock().await;
        if held.contains_key(account) {
            return Ok(None);
        }
        let token = Uuid::new_v4().to_string();
        held.insert(account.to_string(), token.clone());
        Ok(Some(LockToken {
            account: account.to_string(),
            token,
        }))
    }

    async fn release(&self, token: &LockToken) -> QueueResult<()> {
        let mut held = self.held.lock().await;
        if held.get(&token.account) == Some(&token.token) {
            held.remove(&token.account);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_lock_per_account() {
        let lock = MemoryBatchLock::new();
        let a = lock.try_acquire("a").await.unwrap().unwrap();
        assert!(lock.try_acquire("a").await.unwrap().is_none());
        assert!(lock.try_acquire("b").await.unwrap().is_some());

        lock.release(&a).await.unwrap();
        assert!(lock.try_acquire("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_token_does_not_release() {
        let lock = MemoryBatchLock::new();
        let first = lock.try_acquire("a").await.unwrap().unwrap();
        lock.release(&first).await.unwrap();
        let _second = lock.try_acquire("a").await.unwrap().unwrap();

        lock.release(&first).await.unwrap();
        assert!(lock.try_acquire("a").await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_redis_lock() {
        let client = redis::Client::open("redis://localhost:6379").unwrap();
        let lock = AccountLock::new(client, Duration::from_secs(30));
        let account = format!("test-{}", Uuid::new_v4());
        let token = lock.try_acquire(&account).await.unwrap().unwrap();
        assert!(lock.try_acquire(&account).await.unwrap().is_none());
        lock.release(&token).await.unwrap();
        assert!(lock.try_acquire(&account).await.unwrap().is_some());
    }
}
