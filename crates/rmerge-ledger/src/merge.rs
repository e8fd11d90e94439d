//! Merge ledger: the at-most-once record of consumed inputs.
//!
//! A commit here is the single point after which a batch has happened.
//! Every input path appears in at most one committed record.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use rmerge_models::asset::validate_account;
use rmerge_models::MergeRecord;

use crate::error::{LedgerError, LedgerResult};
use crate::store::{self, DocumentStore};

const MERGES_KEY: &str = "merges";

/// The merge ledger document, keyed by account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeLedgerDocument {
    #[serde(default)]
    pub accounts: BTreeMap<String, Vec<MergeRecord>>,
}

#[derive(Clone)]
pub struct MergeLedger {
    store: Arc<dyn DocumentStore>,
}

impl MergeLedger {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    async fn document(&self) -> LedgerResult<MergeLedgerDocument> {
        Ok(store::load(self.store.as_ref(), MERGES_KEY)
            .await?
            .unwrap_or_default())
    }

    /// Commit a merge record.
    ///
    /// Refuses a record whose output is already recorded or that consumes a
    /// path some earlier record already consumed.
    pub async fn commit(&self, account: &str, record: MergeRecord) -> LedgerResult<()> {
        validate_account(account)?;
        let owner = account.to_string();
        let count = record.count;
        let output = record.output_path.clone();

        store::update::<MergeLedgerDocument, (), _>(self.store.as_ref(), MERGES_KEY, move |doc| {
            if doc
                .accounts
                .values()
                .flatten()
                .any(|r| r.output_path == record.output_path)
            {
                return Err(LedgerError::OutputExists(record.output_path));
            }

            let history = doc.accounts.entry(owner).or_default();
            if let Some(path) = record
                .input_paths
                .iter()
                .find(|p| history.iter().any(|r| r.consumed(p)))
            {
                return Err(LedgerError::AlreadyConsumed(path.clone()));
            }

            history.push(record);
            Ok(())
        })
        .await?;

        info!(account = account, count = count, output = %output.display(), "Committed merge");
        Ok(())
    }

    /// Records for an account, oldest first.
    pub async fn history(&self, account: &str) -> LedgerResult<Vec<MergeRecord>> {
        validate_account(account)?;
        Ok(self
            .document()
            .await?
            .accounts
            .remove(account)
            .unwrap_or_default())
    }

    /// Every input path an account has consumed.
    pub async fn consumed_paths(&self, account: &str) -> LedgerResult<HashSet<PathBuf>> {
        Ok(self
            .history(account)
            .await?
            .into_iter()
            .flat_map(|r| r.input_paths)
            .collect())
    }

    pub async fn is_consumed(&self, account: &str, path: &Path) -> LedgerResult<bool> {
        Ok(self.find_consuming(account, path).await?.is_some())
    }

    /// The record that consumed `path`, if any.
    pub async fn find_consuming(
        &self,
        account: &str,
        path: &Path,
    ) -> LedgerResult<Option<MergeRecord>> {
        Ok(self
            .history(account)
            .await?
            .into_iter()
            .find(|r| r.consumed(path)))
    }

    /// Accounts with at least one committed merge, sorted.
    pub async fn accounts(&self) -> LedgerResult<Vec<String>> {
        Ok(self.document().await?.accounts.into_keys().collect())
    }

    /// True if any account's record already names this output.
    pub async fn output_recorded(&self, output: &Path) -> LedgerResult<bool> {
        Ok(self
            .document()
            .await?
            .accounts
            .values()
            .flatten()
            .any(|r| r.output_path == output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn record(output: &str, inputs: &[&str]) -> MergeRecord {
        MergeRecord::new(
            output,
            inputs.iter().map(|s| s.to_string()).collect(),
            inputs.iter().map(|s| PathBuf::from(format!("/in/{s}.mp4"))).collect(),
        )
    }

    #[tokio::test]
    async fn test_commit_and_query() {
        let ledger = MergeLedger::new(Arc::new(MemoryStore::new()));
        ledger.commit("acct", record("/out/1.mp4", &["a", "b"])).await.unwrap();

        assert!(ledger.is_consumed("acct", Path::new("/in/a.mp4")).await.unwrap());
        assert!(!ledger.is_consumed("acct", Path::new("/in/c.mp4")).await.unwrap());
        assert!(!ledger.is_consumed("other", Path::new("/in/a.mp4")).await.unwrap());
        assert!(ledger.output_recorded(Path::new("/out/1.mp4")).await.unwrap());
        assert_eq!(ledger.consumed_paths("acct").await.unwrap().len(), 2);
        assert_eq!(ledger.history("acct").await.unwrap().len(), 1);
        assert_eq!(ledger.accounts().await.unwrap(), vec!["acct".to_string()]);
    }

    #[tokio::test]
    async fn test_commit_refuses_reuse() {
        let ledger = MergeLedger::new(Arc::new(MemoryStore::new()));
        ledger.commit("acct", record("/out/1.mp4", &["a"])).await.unwrap();

        let err = ledger
            .commit("acct", record("/out/1.mp4", &["z"]))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::OutputExists(_)));

        let err = ledger
            .commit("acct", record("/out/2.mp4", &["b", "a"]))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyConsumed(p) if p == Path::new("/in/a.mp4")));

        assert_eq!(ledger.history("acct").await.unwrap().len(), 1);
    }
}
