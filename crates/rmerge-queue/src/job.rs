//! Job types for the queue.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use rmerge_models::{BatchId, JobId, TargetResolution};

/// Normalize one asset for one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardizeJob {
    /// Unique job ID
    pub job_id: JobId,
    /// Batch the asset belongs to
    pub batch_id: BatchId,
    /// Owning account
    pub account: String,
    /// Asset identifier
    pub identifier: String,
    /// Original asset file
    pub input_path: PathBuf,
    pub target_width: u32,
    pub target_height: u32,
    /// Deterministic output file for this batch and asset
    pub output_path: PathBuf,
    /// When the job was created
    pub created_at: DateTime<Utc>,
}

impl StandardizeJob {
    pub fn new(
        batch_id: BatchId,
        account: impl Into<String>,
        identifier: impl Into<String>,
        input_path: impl Into<PathBuf>,
        target: TargetResolution,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            job_id: JobId::new(),
            batch_id,
            account: account.into(),
            identifier: identifier.into(),
            input_path: input_path.into(),
            target_width: target.width,
            target_height: target.height,
            output_path: output_path.into(),
            created_at: Utc::now(),
        }
    }

    pub fn target(&self) -> TargetResolution {
        TargetResolution::new(self.target_width, self.target_height)
    }

    /// Generate idempotency key for deduplication.
    pub fn idempotency_key(&self) -> String {
        format!("standardize:{}:{}", self.batch_id, self.identifier)
    }
}

/// Ask for a merge batch for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequestJob {
    /// Unique job ID
    pub job_id: JobId,
    /// Account to merge
    pub account: String,
    /// Maximum number of assets (newest first)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Only assets from this date
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    /// Only assets from this folder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_folder: Option<String>,
    /// When the job was created
    pub created_at: DateTime<Utc>,
}

impl MergeRequestJob {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            job_id: JobId::new(),
            account: account.into(),
            limit: None,
            date: None,
            source_folder: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_date(mut self, date: Option<NaiveDate>) -> Self {
        self.date = date;
        self
    }

    pub fn with_source_folder(mut self, folder: Option<String>) -> Self {
        self.source_folder = folder;
        self
    }

    /// Generate idempotency key for deduplication.
    pub fn idempotency_key(&self) -> String {
        format!("merge:{}:{}", self.account, self.job_id)
    }
}

/// Generic job wrapper for queue storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueJob {
    /// Normalize a single asset
    Standardize(StandardizeJob),
    /// Run a merge batch for an account
    MergeRequest(MergeRequestJob),
}

impl QueueJob {
    pub fn job_id(&self) -> &JobId {
        match self {
            QueueJob::Standardize(j) => &j.job_id,
            QueueJob::MergeRequest(j) => &j.job_id,
        }
    }

    pub fn account(&self) -> &str {
        match self {
            QueueJob::Standardize(j) => &j.account,
            QueueJob::MergeRequest(j) => &j.account,
        }
    }

    pub fn idempotency_key(&self) -> String {
        match self {
            QueueJob::Standardize(j) => j.idempotency_key(),
            QueueJob::MergeRequest(j) => j.idempotency_key(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            QueueJob::Standardize(_) => "standardize",
            QueueJob::MergeRequest(_) => "merge_request",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standardize_wire_format() {
        let job = StandardizeJob::new(
            BatchId::new(),
            "acct",
            "abc",
            "/dl/acct/abc.mp4",
            TargetResolution::new(1080, 1920),
            "/work/b/abc.mp4",
        );
        let value = serde_json::to_value(QueueJob::Standardize(job.clone())).unwrap();
        assert_eq!(value["type"], "standardize");
        assert_eq!(value["target_width"], 1080);
        assert_eq!(value["output_path"], "/work/b/abc.mp4");

        let decoded: QueueJob = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, QueueJob::Standardize(job));
    }

    #[test]
    fn test_merge_request_optional_fields() {
        let decoded: QueueJob = serde_json::from_str(
            r#"{"type":"merge_request","job_id":"j1","account":"acct","limit":5,
                "created_at":"2024-05-01T00:00:00Z"}"#,
        )
        .unwrap();
        match decoded {
            QueueJob::MergeRequest(j) => {
                assert_eq!(j.limit, Some(5));
                assert!(j.date.is_none());
                assert!(j.source_folder.is_none());
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let result = serde_json::from_str::<QueueJob>(r#"{"type":"render","job_id":"x"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_idempotency_keys() {
        let batch = BatchId::new();
        let a = StandardizeJob::new(
            batch.clone(),
            "acct",
            "abc",
            "/a",
            TargetResolution::default_portrait(),
            "/o",
        );
        let b = StandardizeJob::new(
            batch,
            "acct",
            "abc",
            "/a",
            TargetResolution::default_portrait(),
            "/o",
        );
        assert_ne!(a.job_id, b.job_id);
        assert_eq!(a.idempotency_key(), b.idempotency_key());
    }
}
