//! Most recent batch status per account.

use std::sync::Arc;

use rmerge_models::asset::validate_account;
use rmerge_models::BatchStatus;

use crate::error::LedgerResult;
use crate::store::{self, DocumentStore};

#[derive(Clone)]
pub struct StatusStore {
    store: Arc<dyn DocumentStore>,
}

impl StatusStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    fn key(account: &str) -> LedgerResult<String> {
        validate_account(account)?;
        Ok(format!("status/{account}"))
    }

    /// Replace the account's status with `status`.
    pub async fn save(&self, status: &BatchStatus) -> LedgerResult<()> {
        let key = Self::key(&status.account)?;
        self.store.upsert(&key, serde_json::to_value(status)?).await
    }

    pub async fn get(&self, account: &str) -> LedgerResult<Option<BatchStatus>> {
        store::load(self.store.as_ref(), &Self::key(account)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use rmerge_models::{BatchId, BatchState};

    #[tokio::test]
    async fn test_save_and_get() {
        let statuses = StatusStore::new(Arc::new(MemoryStore::new()));
        assert!(statuses.get("acct").await.unwrap().is_none());

        let mut status = BatchStatus::running(BatchId::new(), "acct");
        status.merged = 4;
        status.failed = 1;
        statuses.save(&status.finish(BatchState::Partial)).await.unwrap();

        let loaded = statuses.get("acct").await.unwrap().unwrap();
        assert_eq!(loaded.state, BatchState::Partial);
        assert_eq!(loaded.merged, 4);
    }
}
