//! Merge orchestrator.
//!
//! A batch runs select, enqueue, wait, concatenate and commit in that order.
//! Any step can end the batch as failed; nothing is committed unless every
//! earlier step succeeded. The merge ledger commit is the point after which
//! the batch has happened. The dedup flags are written after it and are
//! healed on the next selection if that write is lost.
//!
//! Every batch that got past selection is closed on the queue when it ends,
//! so standardize jobs still running for it discard their output instead of
//! leaving it in the removed work directory.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use rmerge_ledger::scan::folder_date;
use rmerge_ledger::{LedgerError, SyncScope};
use rmerge_media::fs_utils::remove_if_exists;
use rmerge_media::{analyze, merged_output_path, standardized_output_path};
use rmerge_models::asset::validate_account;
use rmerge_models::{
    BatchId, BatchState, BatchStatus, DownloadRecord, JobId, JobOutcome, MergeRecord,
    TargetResolution,
};
use rmerge_queue::{MergeRequestJob, QueueJob, StandardizeJob};

use crate::barrier::Barrier;
use crate::context::WorkerContext;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;

/// Result of one merge batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum BatchOutcome {
    /// Nothing was eligible
    NoOp,
    /// Output written and committed; `excluded` assets were left out
    Completed {
        merged: usize,
        excluded: usize,
        output: PathBuf,
    },
    /// Nothing committed
    Failed { reason: String },
}

impl BatchOutcome {
    pub fn state(&self) -> BatchState {
        match self {
            BatchOutcome::NoOp => BatchState::Noop,
            BatchOutcome::Completed { excluded: 0, .. } => BatchState::Completed,
            BatchOutcome::Completed { .. } => BatchState::Partial,
            BatchOutcome::Failed { .. } => BatchState::Failed,
        }
    }
}

/// An asset chosen for a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedAsset {
    pub identifier: String,
    pub path: PathBuf,
}

/// Assets chosen for a batch, newest first.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub assets: Vec<SelectedAsset>,
    /// Candidates whose file is missing
    pub skipped: usize,
    /// Candidates the merge ledger had already consumed
    pub healed: usize,
}

/// Runs merge batches, at most one per account at a time.
pub struct MergeOrchestrator {
    ctx: Arc<WorkerContext>,
    active: Mutex<HashSet<String>>,
}

/// Marks an account busy in this process until dropped.
struct ActiveBatch<'a> {
    active: &'a Mutex<HashSet<String>>,
    account: String,
}

impl Drop for ActiveBatch<'_> {
    fn drop(&mut self) {
        lock_set(self.active).remove(&self.account);
    }
}

fn lock_set(set: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MergeOrchestrator {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self {
            ctx,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    fn enter(&self, account: &str) -> WorkerResult<ActiveBatch<'_>> {
        if !lock_set(&self.active).insert(account.to_string()) {
            return Err(WorkerError::BatchInProgress(account.to_string()));
        }
        Ok(ActiveBatch {
            active: &self.active,
            account: account.to_string(),
        })
    }

    /// Run one merge batch for the request's account.
    ///
    /// Returns [`WorkerError::BatchInProgress`] without touching any state
    /// if another batch holds the account, and [`WorkerError::Cancelled`]
    /// (after recording the batch as failed) if `cancel` fires. Every other
    /// failure is reported as [`BatchOutcome::Failed`].
    pub async fn run(
        &self,
        request: &MergeRequestJob,
        cancel: &CancellationToken,
    ) -> WorkerResult<BatchOutcome> {
        let account = request.account.as_str();
        validate_account(account).map_err(LedgerError::from)?;

        let _active = self.enter(account)?;
        let token = self
            .ctx
            .lock
            .try_acquire(account)
            .await?
            .ok_or_else(|| WorkerError::BatchInProgress(account.to_string()))?;

        let batch_id = BatchId::new();
        let logger = JobLogger::for_batch(&batch_id, account);
        logger.log_start(&format!(
            "limit={:?} date={:?} folder={:?}",
            request.limit, request.date, request.source_folder
        ));

        let mut status = BatchStatus::running(batch_id.clone(), account);
        if let Err(e) = self.ctx.status.save(&status).await {
            logger.log_warning(&format!("could not record running status: {e}"));
        }

        let result = self
            .execute(&batch_id, request, cancel, &mut status, &logger)
            .instrument(logger.span())
            .await;
        if !matches!(result, Ok(BatchOutcome::NoOp)) {
            if let Err(e) = self.ctx.dispatcher.close_batch(&batch_id).await {
                logger.log_warning(&format!("could not close batch on the queue: {e}"));
            }
        }
        self.discard_intermediates(&batch_id).await;

        let cancelled = matches!(result, Err(WorkerError::Cancelled));
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => BatchOutcome::Failed {
                reason: e.to_string(),
            },
        };

        let mut status = status.finish(outcome.state());
        match &outcome {
            BatchOutcome::Failed { reason } => {
                logger.log_error(reason);
                status.reason = Some(reason.clone());
            }
            other => logger.log_completion(other.state().as_str()),
        }
        if let Err(e) = self.ctx.status.save(&status).await {
            logger.log_warning(&format!("could not record final status: {e}"));
        }
        if let Err(e) = self.ctx.lock.release(&token).await {
            logger.log_warning(&format!("could not release batch lock: {e}"));
        }
        metrics::counter!("rmerge_batches_total", "state" => outcome.state().as_str())
            .increment(1);

        if cancelled {
            return Err(WorkerError::Cancelled);
        }
        Ok(outcome)
    }

    async fn execute(
        &self,
        batch_id: &BatchId,
        request: &MergeRequestJob,
        cancel: &CancellationToken,
        status: &mut BatchStatus,
        logger: &JobLogger,
    ) -> WorkerResult<BatchOutcome> {
        let account = request.account.as_str();

        if self.ctx.config.sync_before_merge {
            let report = self.ctx.dedup.reconcile(account, SyncScope::Recent).await?;
            if report.added > 0 {
                logger.log_progress(&format!("sync added {} assets", report.added));
            }
        }

        let selection = self.select(request).await?;
        status.skipped = selection.skipped;
        if selection.assets.is_empty() {
            return Ok(BatchOutcome::NoOp);
        }
        logger.log_progress(&format!(
            "selected {} assets ({} skipped, {} already consumed)",
            selection.assets.len(),
            selection.skipped,
            selection.healed
        ));

        // Named before any work is queued so a clash costs nothing.
        let output = merged_output_path(
            &self.ctx.media.merged_root,
            account,
            status.started_at,
            batch_id.as_str(),
        );
        if self.ctx.merges.output_recorded(&output).await? {
            return Err(LedgerError::OutputExists(output).into());
        }

        let paths: Vec<PathBuf> = selection.assets.iter().map(|a| a.path.clone()).collect();
        let report = analyze(self.ctx.probe.as_ref(), &paths).await;
        logger.log_progress(&format!(
            "target {} from {} votes",
            report.target,
            paths.len() - report.unprobed.len()
        ));

        let jobs = self.build_jobs(batch_id, account, &selection.assets, report.target);
        self.enqueue(&jobs).await?;

        let job_ids: Vec<JobId> = jobs.iter().map(|j| j.job_id.clone()).collect();
        let outcomes = Barrier::from_config(&self.ctx.config)
            .wait(self.ctx.dispatcher.as_ref(), &job_ids, cancel)
            .await?;

        // Outcomes are aligned with the selection, so this keeps its order.
        let mut merged: Vec<(&SelectedAsset, PathBuf)> = Vec::new();
        for (asset, outcome) in selection.assets.iter().zip(outcomes) {
            match outcome {
                JobOutcome::Done { output_path } => merged.push((asset, output_path)),
                JobOutcome::Failed { error } => {
                    status.failed += 1;
                    logger.log_warning(&format!("excluding {}: {}", asset.identifier, error));
                }
            }
        }
        if merged.is_empty() {
            return Ok(BatchOutcome::Failed {
                reason: format!("all {} standardize jobs failed", jobs.len()),
            });
        }

        let inputs: Vec<PathBuf> = merged.iter().map(|(_, p)| p.clone()).collect();
        self.ctx.concatenator.concatenate(&inputs, &output).await?;

        let identifiers: Vec<String> = merged.iter().map(|(a, _)| a.identifier.clone()).collect();
        let sources: Vec<PathBuf> = merged.iter().map(|(a, _)| a.path.clone()).collect();
        let record = MergeRecord::new(output.clone(), identifiers.clone(), sources);
        if let Err(e) = self.ctx.merges.commit(account, record).await {
            if let Err(cleanup) = remove_if_exists(&output).await {
                warn!("Failed to remove uncommitted output {}: {}", output.display(), cleanup);
            }
            return Err(e.into());
        }

        match self.ctx.dedup.mark_merged(account, &identifiers, &output).await {
            Ok(report) if !report.unknown.is_empty() => logger.log_warning(&format!(
                "merged identifiers missing from dedup ledger: {:?}",
                report.unknown
            )),
            Ok(_) => {}
            Err(e) => logger.log_warning(&format!(
                "merge committed but dedup flags not written, next selection heals them: {e}"
            )),
        }

        status.merged = identifiers.len();
        status.output_file = Some(output.clone());
        Ok(BatchOutcome::Completed {
            merged: identifiers.len(),
            excluded: status.failed + status.skipped,
            output,
        })
    }

    /// Choose the batch's assets.
    ///
    /// Unmerged success records are filtered by the request, records whose
    /// file the merge ledger already consumed are healed and dropped,
    /// records whose file is missing are skipped, and at most `limit` assets
    /// are taken, newest first.
    pub async fn select(&self, request: &MergeRequestJob) -> WorkerResult<Selection> {
        let account = request.account.as_str();
        let candidates = self.ctx.dedup.unmerged(account).await?;
        let consumed = self.ctx.merges.consumed_paths(account).await?;
        let limit = request.limit.unwrap_or(usize::MAX);

        let mut selection = Selection::default();
        let mut heal = Vec::new();

        for record in candidates {
            if selection.assets.len() >= limit {
                break;
            }
            if !matches_request(&record, request) {
                continue;
            }

            let path = match record.path.clone() {
                Some(path) => Some(path),
                None => self.locate(account, &record.identifier).await?,
            };
            let Some(path) = path else {
                debug!(identifier = %record.identifier, "No file recorded or found on disk");
                selection.skipped += 1;
                continue;
            };

            if consumed.contains(&path) {
                heal.push(record.identifier);
                continue;
            }
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                debug!(identifier = %record.identifier, "Skipping missing file {}", path.display());
                selection.skipped += 1;
                continue;
            }

            selection.assets.push(SelectedAsset {
                identifier: record.identifier,
                path,
            });
        }

        if !heal.is_empty() {
            selection.healed = self.ctx.dedup.heal_merged(account, &heal).await?;
            warn!(
                account = account,
                healed = selection.healed,
                "Merge ledger had consumed unflagged assets"
            );
        }
        Ok(selection)
    }

    async fn locate(&self, account: &str, identifier: &str) -> WorkerResult<Option<PathBuf>> {
        let scanner = self.ctx.dedup.scanner().clone();
        let (owner, id) = (account.to_string(), identifier.to_string());
        let found = tokio::task::spawn_blocking(move || scanner.find(&owner, &id))
            .await
            .map_err(|e| LedgerError::scan(e.to_string()))??;
        Ok(found.map(|asset| asset.path))
    }

    fn build_jobs(
        &self,
        batch_id: &BatchId,
        account: &str,
        assets: &[SelectedAsset],
        target: TargetResolution,
    ) -> Vec<StandardizeJob> {
        assets
            .iter()
            .map(|asset| {
                let output = standardized_output_path(
                    &self.ctx.config.work_dir,
                    batch_id.as_str(),
                    &asset.identifier,
                );
                StandardizeJob::new(
                    batch_id.clone(),
                    account,
                    asset.identifier.clone(),
                    asset.path.clone(),
                    target,
                    output,
                )
            })
            .collect()
    }

    /// Send every job or none, after checking the queue can take them.
    async fn enqueue(&self, jobs: &[StandardizeJob]) -> WorkerResult<()> {
        self.ctx.dispatcher.health().await?;
        let messages = jobs.iter().cloned().map(QueueJob::Standardize).collect();
        self.ctx.dispatcher.enqueue_all(messages).await?;
        metrics::counter!("rmerge_jobs_enqueued_total", "kind" => "standardize")
            .increment(jobs.len() as u64);
        Ok(())
    }

    async fn discard_intermediates(&self, batch_id: &BatchId) {
        let dir = self.ctx.config.work_dir.join(batch_id.as_str());
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!("Removed batch work directory {}", dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", dir.display(), e),
        }
    }
}

/// True if a record passes the request's folder and date filters.
///
/// The date comes from the folder name when it carries one, otherwise from
/// the record's timestamp.
fn matches_request(record: &DownloadRecord, request: &MergeRequestJob) -> bool {
    if let Some(folder) = &request.source_folder {
        if &record.source_folder != folder {
            return false;
        }
    }
    match request.date {
        Some(date) => {
            folder_date(&record.source_folder).unwrap_or_else(|| record.timestamp.date_naive())
                == date
        }
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use rmerge_models::DownloadStatus;

    fn record(folder: &str, day: u32) -> DownloadRecord {
        let mut record = DownloadRecord::new(
            "abc",
            DownloadStatus::Success,
            Some(PathBuf::from("/dl/acct/abc.mp4")),
            folder,
        );
        record.timestamp = Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap();
        record
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, day).unwrap()
    }

    #[test]
    fn test_filter_by_folder() {
        let request = MergeRequestJob::new("acct").with_source_folder(Some("2024-05-01".into()));
        assert!(matches_request(&record("2024-05-01", 3), &request));
        assert!(!matches_request(&record("2024-05-02", 3), &request));
    }

    #[test]
    fn test_filter_by_date_prefers_folder_name() {
        let request = MergeRequestJob::new("acct").with_date(Some(date(1)));
        // Folder says May 1st even though the record was written on the 3rd.
        assert!(matches_request(&record("20240501", 3), &request));
        assert!(!matches_request(&record("2024-05-02", 1), &request));
        // No date in the folder name: fall back to the record timestamp.
        assert!(matches_request(&record("misc", 1), &request));
        assert!(!matches_request(&record("", 2), &request));
    }

    #[test]
    fn test_no_filters_match_everything() {
        assert!(matches_request(&record("", 9), &MergeRequestJob::new("acct")));
    }

    #[test]
    fn test_outcome_states() {
        assert_eq!(BatchOutcome::NoOp.state(), BatchState::Noop);
        let full = BatchOutcome::Completed {
            merged: 3,
            excluded: 0,
            output: PathBuf::from("/m.mp4"),
        };
        assert_eq!(full.state(), BatchState::Completed);
        let partial = BatchOutcome::Completed {
            merged: 3,
            excluded: 1,
            output: PathBuf::from("/m.mp4"),
        };
        assert_eq!(partial.state(), BatchState::Partial);
        let failed = BatchOutcome::Failed {
            reason: "x".into(),
        };
        assert_eq!(failed.state(), BatchState::Failed);
    }
}
