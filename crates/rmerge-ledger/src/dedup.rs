//! Dedup ledger: per-account download state and merged flags.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use rmerge_models::asset::{validate_account, validate_identifier};
use rmerge_models::{DownloadRecord, DownloadStatus, MergeRecord, RecordOrigin};

use crate::error::{LedgerError, LedgerResult};
use crate::scan::{AssetScanner, SyncScope};
use crate::store::{self, DocumentStore};

/// The per-account dedup document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupDocument {
    #[serde(default)]
    pub account: String,
    /// At most one record per identifier, in insertion order
    #[serde(default)]
    pub downloads: Vec<DownloadRecord>,
    /// Merge records appended by `mark_merged`
    #[serde(default)]
    pub merges: Vec<MergeRecord>,
}

impl DedupDocument {
    fn position(&self, identifier: &str) -> Option<usize> {
        self.downloads
            .iter()
            .position(|r| r.identifier == identifier)
    }

    pub fn record(&self, identifier: &str) -> Option<&DownloadRecord> {
        self.position(identifier).map(|i| &self.downloads[i])
    }

    /// Success records not yet merged, newest first.
    ///
    /// Equal timestamps resolve to the later-inserted record first.
    pub fn unmerged(&self) -> Vec<DownloadRecord> {
        let mut candidates: Vec<(usize, &DownloadRecord)> = self
            .downloads
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_merge_candidate())
            .collect();
        candidates.sort_by(|a, b| b.1.timestamp.cmp(&a.1.timestamp).then(b.0.cmp(&a.0)));
        candidates.into_iter().map(|(_, r)| r.clone()).collect()
    }
}

/// Result of a reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Asset files found in scope
    pub scanned: usize,
    /// Sync records inserted
    pub added: usize,
    /// Files whose identifier was already recorded
    pub already_known: usize,
}

/// Result of `mark_merged`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkMergedReport {
    /// Identifiers whose flag went from false to true
    pub transitioned: Vec<String>,
    /// Identifiers that were already merged (no-op)
    pub already_merged: Vec<String>,
    /// Identifiers with no success record
    pub unknown: Vec<String>,
    /// The appended merge record, if anything transitioned
    pub record: Option<MergeRecord>,
}

/// Per-account counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub success: usize,
    pub merged: usize,
    pub unmerged: usize,
    pub failed: usize,
    pub skipped: usize,
    pub merges: usize,
}

/// Durable mapping of identifier to download/merge state.
#[derive(Clone)]
pub struct DedupLedger {
    store: Arc<dyn DocumentStore>,
    scanner: AssetScanner,
}

impl DedupLedger {
    pub fn new(store: Arc<dyn DocumentStore>, scanner: AssetScanner) -> Self {
        Self { store, scanner }
    }

    pub fn scanner(&self) -> &AssetScanner {
        &self.scanner
    }

    fn key(account: &str) -> LedgerResult<String> {
        validate_account(account)?;
        Ok(format!("dedup/{account}"))
    }

    /// Load an account's document (empty if it does not exist yet).
    pub async fn document(&self, account: &str) -> LedgerResult<DedupDocument> {
        let key = Self::key(account)?;
        let mut document: DedupDocument = store::load(self.store.as_ref(), &key)
            .await?
            .unwrap_or_default();
        if document.account.is_empty() {
            document.account = account.to_string();
        }
        Ok(document)
    }

    /// Typed read-modify-write on an account's document.
    async fn update<R, F>(&self, account: &str, f: F) -> LedgerResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut DedupDocument) -> LedgerResult<R> + Send + 'static,
    {
        let key = Self::key(account)?;
        let owner = account.to_string();
        store::update::<DedupDocument, R, _>(self.store.as_ref(), &key, move |document| {
            if document.account.is_empty() {
                document.account = owner;
            }
            f(document)
        })
        .await
    }

    /// True iff a success record exists for the identifier.
    ///
    /// Any ledger entry is authoritative. The download directory is only
    /// consulted when the ledger has never heard of the identifier.
    pub async fn is_downloaded(&self, account: &str, identifier: &str) -> LedgerResult<bool> {
        validate_identifier(identifier)?;
        let document = self.document(account).await?;
        if let Some(record) = document.record(identifier) {
            return Ok(record.status == DownloadStatus::Success);
        }

        let scanner = self.scanner.clone();
        let (account, id) = (account.to_string(), identifier.to_string());
        let found = tokio::task::spawn_blocking(move || scanner.find(&account, &id))
            .await
            .map_err(|e| LedgerError::scan(e.to_string()))??;

        if found.is_some() {
            debug!(identifier = identifier, "Download found on disk but not in ledger");
        }
        Ok(found.is_some())
    }

    /// Insert or overwrite the record for an identifier.
    ///
    /// The `merged` flag of an existing record is preserved.
    pub async fn record_download(
        &self,
        account: &str,
        identifier: &str,
        status: DownloadStatus,
        path: Option<PathBuf>,
    ) -> LedgerResult<DownloadRecord> {
        validate_identifier(identifier)?;
        let source_folder = path
            .as_deref()
            .and_then(|p| self.scanner.source_folder_of(account, p))
            .unwrap_or_default();
        let fresh = DownloadRecord::new(identifier, status, path, source_folder);

        self.update(account, move |document| {
            let record = match document.position(&fresh.identifier) {
                Some(i) => {
                    let existing = &mut document.downloads[i];
                    existing.status = fresh.status;
                    existing.timestamp = fresh.timestamp;
                    existing.origin = RecordOrigin::Download;
                    if fresh.path.is_some() {
                        existing.path = fresh.path;
                    }
                    if !fresh.source_folder.is_empty() {
                        existing.source_folder = fresh.source_folder;
                    }
                    existing.clone()
                }
                None => {
                    document.downloads.push(fresh.clone());
                    fresh
                }
            };
            Ok(record)
        })
        .await
    }

    /// Insert sync records for assets on disk that the ledger lacks.
    ///
    /// Additive only: existing records are never changed or removed.
    pub async fn reconcile(&self, account: &str, scope: SyncScope) -> LedgerResult<SyncReport> {
        validate_account(account)?;
        let scanner = self.scanner.clone();
        let owner = account.to_string();
        let scanned = tokio::task::spawn_blocking(move || scanner.scan(&owner, scope, Utc::now()))
            .await
            .map_err(|e| LedgerError::scan(e.to_string()))??;

        let report = self
            .update(account, move |document| {
                let mut report = SyncReport {
                    scanned: scanned.len(),
                    ..Default::default()
                };
                for asset in scanned {
                    if document.position(&asset.identifier).is_some() {
                        report.already_known += 1;
                        continue;
                    }
                    document.downloads.push(DownloadRecord::synced(
                        asset.identifier,
                        asset.path,
                        asset.source_folder,
                        asset.modified,
                    ));
                    report.added += 1;
                }
                Ok(report)
            })
            .await?;

        info!(
            account = account,
            scope = ?scope,
            scanned = report.scanned,
            added = report.added,
            "Reconciled download ledger"
        );
        Ok(report)
    }

    /// Unmerged success records, newest first.
    pub async fn unmerged(&self, account: &str) -> LedgerResult<Vec<DownloadRecord>> {
        Ok(self.document(account).await?.unmerged())
    }

    /// Unmerged success identifiers, newest first.
    pub async fn unmerged_identifiers(&self, account: &str) -> LedgerResult<Vec<String>> {
        Ok(self
            .unmerged(account)
            .await?
            .into_iter()
            .map(|r| r.identifier)
            .collect())
    }

    /// Flag identifiers as merged and append one merge record.
    ///
    /// Runs as a single read-modify-write, so no identifier can be selected
    /// as unmerged once this returns. Already merged identifiers are left
    /// alone, and no record is appended when nothing transitions.
    pub async fn mark_merged(
        &self,
        account: &str,
        identifiers: &[String],
        output_path: &Path,
    ) -> LedgerResult<MarkMergedReport> {
        let identifiers = identifiers.to_vec();
        let output_path = output_path.to_path_buf();

        let report = self
            .update(account, move |document| {
                let mut report = MarkMergedReport::default();
                let mut seen = HashSet::new();
                let mut paths = Vec::new();

                for identifier in identifiers {
                    if !seen.insert(identifier.clone()) {
                        continue;
                    }
                    let Some(i) = document.position(&identifier) else {
                        report.unknown.push(identifier);
                        continue;
                    };
                    let record = &mut document.downloads[i];
                    if record.status != DownloadStatus::Success {
                        report.unknown.push(identifier);
                    } else if record.merged {
                        report.already_merged.push(identifier);
                    } else {
                        record.merged = true;
                        if let Some(path) = &record.path {
                            paths.push(path.clone());
                        }
                        report.transitioned.push(identifier);
                    }
                }

                if !report.transitioned.is_empty() {
                    let merge = MergeRecord::new(output_path, report.transitioned.clone(), paths);
                    document.merges.push(merge.clone());
                    report.record = Some(merge);
                }
                Ok(report)
            })
            .await?;

        info!(
            account = account,
            transitioned = report.transitioned.len(),
            already_merged = report.already_merged.len(),
            unknown = report.unknown.len(),
            "Marked assets merged"
        );
        Ok(report)
    }

    /// Set `merged` on identifiers without appending a merge record.
    ///
    /// Used when the merge ledger already shows the assets as consumed but
    /// the dedup flag was never written. Returns how many flags changed.
    pub async fn heal_merged(&self, account: &str, identifiers: &[String]) -> LedgerResult<usize> {
        if identifiers.is_empty() {
            return Ok(0);
        }
        let identifiers: HashSet<String> = identifiers.iter().cloned().collect();
        self.update(account, move |document| {
            let mut healed = 0;
            for record in document.downloads.iter_mut() {
                if identifiers.contains(&record.identifier) && record.is_merge_candidate() {
                    record.merged = true;
                    healed += 1;
                }
            }
            Ok(healed)
        })
        .await
    }

    pub async fn records(&self, account: &str) -> LedgerResult<Vec<DownloadRecord>> {
        Ok(self.document(account).await?.downloads)
    }

    pub async fn record(
        &self,
        account: &str,
        identifier: &str,
    ) -> LedgerResult<Option<DownloadRecord>> {
        Ok(self.document(account).await?.record(identifier).cloned())
    }

    pub async fn merge_history(&self, account: &str) -> LedgerResult<Vec<MergeRecord>> {
        Ok(self.document(account).await?.merges)
    }

    pub async fn summary(&self, account: &str) -> LedgerResult<LedgerSummary> {
        let document = self.document(account).await?;
        let mut summary = LedgerSummary {
            merges: document.merges.len(),
            ..Default::default()
        };
        for record in &document.downloads {
            match record.status {
                DownloadStatus::Success if record.merged => {
                    summary.success += 1;
                    summary.merged += 1;
                }
                DownloadStatus::Success => {
                    summary.success += 1;
                    summary.unmerged += 1;
                }
                DownloadStatus::Failed => summary.failed += 1,
                DownloadStatus::Skipped => summary.skipped += 1,
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{JsonFileStore, MemoryStore};
    use tempfile::TempDir;

    fn ledger(downloads: &Path) -> DedupLedger {
        DedupLedger::new(Arc::new(MemoryStore::new()), AssetScanner::new(downloads, 7))
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    async fn record_all(ledger: &DedupLedger, list: &[&str]) {
        for id in list {
            ledger
                .record_download(
                    "acct",
                    id,
                    DownloadStatus::Success,
                    Some(PathBuf::from(format!("/dl/acct/{id}.mp4"))),
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_record_download_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(dir.path());

        for _ in 0..3 {
            ledger
                .record_download("acct", "abc", DownloadStatus::Success, None)
                .await
                .unwrap();
            assert!(ledger.is_downloaded("acct", "abc").await.unwrap());
        }
        assert_eq!(ledger.records("acct").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ledger_entry_short_circuits_disk() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("acct/2024-05-01")).unwrap();
        std::fs::write(dir.path().join("acct/2024-05-01/abc.mp4"), b"x").unwrap();
        let ledger = ledger(dir.path());

        // No entry: the disk fallback finds the file.
        assert!(ledger.is_downloaded("acct", "abc").await.unwrap());

        // A failed entry is authoritative even though the file exists.
        ledger
            .record_download("acct", "abc", DownloadStatus::Failed, None)
            .await
            .unwrap();
        assert!(!ledger.is_downloaded("acct", "abc").await.unwrap());
        assert!(!ledger.is_downloaded("acct", "zzz").await.unwrap());
    }

    #[tokio::test]
    async fn test_rerecord_preserves_merged() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(dir.path());
        record_all(&ledger, &["a"]).await;
        ledger
            .mark_merged("acct", &ids(&["a"]), Path::new("/out/1.mp4"))
            .await
            .unwrap();

        record_all(&ledger, &["a"]).await;
        let record = ledger.record("acct", "a").await.unwrap().unwrap();
        assert!(record.merged);
    }

    #[tokio::test]
    async fn test_reconcile_is_additive() {
        let dir = TempDir::new().unwrap();
        for id in ["a", "b", "c"] {
            let path = dir.path().join(format!("acct/2001-01-01/{id}.mp4"));
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"x").unwrap();
        }
        let ledger = ledger(dir.path());
        ledger
            .record_download("acct", "a", DownloadStatus::Failed, None)
            .await
            .unwrap();
        ledger
            .record_download("acct", "gone", DownloadStatus::Success, None)
            .await
            .unwrap();

        // Old folder is outside the recent window.
        let recent = ledger.reconcile("acct", SyncScope::Recent).await.unwrap();
        assert_eq!(recent.added, 0);

        let report = ledger.reconcile("acct", SyncScope::Full).await.unwrap();
        assert_eq!(report.scanned, 3);
        assert_eq!(report.added, 2);
        assert_eq!(report.already_known, 1);

        let records = ledger.records("acct").await.unwrap();
        assert_eq!(records.len(), 4);
        // Existing records untouched, absent file never removed.
        assert_eq!(
            ledger.record("acct", "a").await.unwrap().unwrap().status,
            DownloadStatus::Failed
        );
        assert!(ledger.record("acct", "gone").await.unwrap().is_some());
        assert!(records.iter().all(|r| !r.merged));
        let synced = ledger.record("acct", "b").await.unwrap().unwrap();
        assert_eq!(synced.origin, RecordOrigin::Sync);
        assert_eq!(synced.source_folder, "2001-01-01");

        let again = ledger.reconcile("acct", SyncScope::Full).await.unwrap();
        assert_eq!(again.added, 0);
    }

    #[tokio::test]
    async fn test_unmerged_newest_first() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(dir.path());
        record_all(&ledger, &["old", "mid", "new"]).await;
        ledger
            .record_download("acct", "bad", DownloadStatus::Failed, None)
            .await
            .unwrap();

        assert_eq!(
            ledger.unmerged_identifiers("acct").await.unwrap(),
            ids(&["new", "mid", "old"])
        );
    }

    #[test]
    fn test_unmerged_tie_prefers_later_insert() {
        let ts = Utc::now();
        let mut first = DownloadRecord::new("first", DownloadStatus::Success, None, "");
        let mut second = DownloadRecord::new("second", DownloadStatus::Success, None, "");
        first.timestamp = ts;
        second.timestamp = ts;
        let document = DedupDocument {
            account: "acct".into(),
            downloads: vec![first, second],
            merges: vec![],
        };
        let order: Vec<_> = document.unmerged().into_iter().map(|r| r.identifier).collect();
        assert_eq!(order, vec!["second", "first"]);
    }

    #[tokio::test]
    async fn test_mark_merged_set_difference() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(dir.path());
        record_all(&ledger, &["a", "b", "c", "d"]).await;

        let report = ledger
            .mark_merged("acct", &ids(&["b", "d"]), Path::new("/out/1.mp4"))
            .await
            .unwrap();
        assert_eq!(report.transitioned, ids(&["b", "d"]));

        let mut unmerged = ledger.unmerged_identifiers("acct").await.unwrap();
        unmerged.sort();
        assert_eq!(unmerged, ids(&["a", "c"]));

        let summary = ledger.summary("acct").await.unwrap();
        assert_eq!(summary.success, 4);
        assert_eq!(summary.merged + summary.unmerged, summary.success);
        assert_eq!(summary.merges, 1);

        let history = ledger.merge_history("acct").await.unwrap();
        assert_eq!(history[0].count, 2);
        assert_eq!(
            history[0].input_paths,
            vec![PathBuf::from("/dl/acct/b.mp4"), PathBuf::from("/dl/acct/d.mp4")]
        );
    }

    #[tokio::test]
    async fn test_mark_merged_overlapping_calls() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(dir.path());
        record_all(&ledger, &["a", "b", "c"]).await;

        ledger
            .mark_merged("acct", &ids(&["a", "b"]), Path::new("/out/1.mp4"))
            .await
            .unwrap();
        let second = ledger
            .mark_merged("acct", &ids(&["b", "c", "nope"]), Path::new("/out/2.mp4"))
            .await
            .unwrap();

        assert_eq!(second.transitioned, ids(&["c"]));
        assert_eq!(second.already_merged, ids(&["b"]));
        assert_eq!(second.unknown, ids(&["nope"]));
        assert!(ledger.unmerged_identifiers("acct").await.unwrap().is_empty());

        // Fully overlapping call appends nothing.
        let third = ledger
            .mark_merged("acct", &ids(&["a"]), Path::new("/out/3.mp4"))
            .await
            .unwrap();
        assert!(third.record.is_none());
        assert_eq!(ledger.merge_history("acct").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_heal_merged() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(dir.path());
        record_all(&ledger, &["a", "b"]).await;

        assert_eq!(ledger.heal_merged("acct", &ids(&["a"])).await.unwrap(), 1);
        assert_eq!(ledger.unmerged_identifiers("acct").await.unwrap(), ids(&["b"]));
        assert!(ledger.merge_history("acct").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persists_through_file_store() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn DocumentStore> = Arc::new(JsonFileStore::new(dir.path().join("ledger")));
        let ledger = DedupLedger::new(Arc::clone(&store), AssetScanner::new(dir.path(), 7));
        record_all(&ledger, &["a"]).await;

        let reopened = DedupLedger::new(
            Arc::new(JsonFileStore::new(dir.path().join("ledger"))),
            AssetScanner::new(dir.path(), 7),
        );
        assert!(reopened.is_downloaded("acct", "a").await.unwrap());
        assert!(dir.path().join("ledger/dedup/acct.json").exists());
    }

    #[tokio::test]
    async fn test_invalid_names_rejected() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(dir.path());
        assert!(matches!(
            ledger.is_downloaded("../x", "a").await,
            Err(LedgerError::InvalidName(_))
        ));
        assert!(ledger
            .record_download("acct", "bad id", DownloadStatus::Success, None)
            .await
            .is_err());
    }
}
