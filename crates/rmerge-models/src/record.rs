//! Download and merge ledger records.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Outcome of a download attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Success,
    Failed,
    Skipped,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Success => "success",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("invalid download status: {other}")),
        }
    }
}

/// How a download record entered the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrigin {
    /// Recorded by the downloader
    #[default]
    Download,
    /// Added by reconciliation for a file found on disk
    Sync,
}

/// One download record per (account, identifier).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DownloadRecord {
    /// Asset shortcode
    pub identifier: String,
    /// Download outcome
    pub status: DownloadStatus,
    /// When the asset was downloaded (or discovered, for sync records)
    pub timestamp: DateTime<Utc>,
    /// Folder the asset was stored in, relative to the account directory
    #[serde(default)]
    pub source_folder: String,
    /// Absolute path of the downloaded file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Whether the asset has been consumed by a merge
    #[serde(default)]
    pub merged: bool,
    /// Where the record came from
    #[serde(default)]
    pub origin: RecordOrigin,
}

impl DownloadRecord {
    /// Create a record for a fresh download.
    pub fn new(
        identifier: impl Into<String>,
        status: DownloadStatus,
        path: Option<PathBuf>,
        source_folder: impl Into<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            status,
            timestamp: Utc::now(),
            source_folder: source_folder.into(),
            path,
            merged: false,
            origin: RecordOrigin::Download,
        }
    }

    /// Create a sync-added success record for a file found on disk.
    pub fn synced(
        identifier: impl Into<String>,
        path: PathBuf,
        source_folder: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            status: DownloadStatus::Success,
            timestamp,
            source_folder: source_folder.into(),
            path: Some(path),
            merged: false,
            origin: RecordOrigin::Sync,
        }
    }

    /// True if this record is a success that has not been merged yet.
    pub fn is_merge_candidate(&self) -> bool {
        self.status == DownloadStatus::Success && !self.merged
    }
}

/// One record per completed merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MergeRecord {
    /// When the merge was committed
    pub timestamp: DateTime<Utc>,
    /// Output artifact path
    pub output_path: PathBuf,
    /// Consumed asset paths, in concatenation order
    pub input_paths: Vec<PathBuf>,
    /// Consumed asset identifiers, aligned with `input_paths`
    #[serde(default)]
    pub identifiers: Vec<String>,
    /// Number of consumed assets
    pub count: usize,
}

impl MergeRecord {
    /// Create a merge record for the given output and inputs.
    pub fn new(
        output_path: impl Into<PathBuf>,
        identifiers: Vec<String>,
        input_paths: Vec<PathBuf>,
    ) -> Self {
        let count = input_paths.len().max(identifiers.len());
        Self {
            timestamp: Utc::now(),
            output_path: output_path.into(),
            input_paths,
            identifiers,
            count,
        }
    }

    /// True if the record consumed the given path.
    pub fn consumed(&self, path: &std::path::Path) -> bool {
        self.input_paths.iter().any(|p| p == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        assert_eq!("success".parse::<DownloadStatus>(), Ok(DownloadStatus::Success));
        assert!("done".parse::<DownloadStatus>().is_err());
        assert_eq!(DownloadStatus::Skipped.to_string(), "skipped");
    }

    #[test]
    fn test_record_defaults_from_legacy_json() {
        // Older ledgers carry neither `merged` nor `origin`.
        let json = r#"{"identifier":"abc","status":"success","timestamp":"2024-05-01T10:00:00Z"}"#;
        let record: DownloadRecord = serde_json::from_str(json).unwrap();
        assert!(!record.merged);
        assert_eq!(record.origin, RecordOrigin::Download);
        assert!(record.is_merge_candidate());
    }

    #[test]
    fn test_merge_record_membership() {
        let record = MergeRecord::new(
            "/out/a.mp4",
            vec!["a".into(), "b".into()],
            vec![PathBuf::from("/in/a.mp4"), PathBuf::from("/in/b.mp4")],
        );
        assert_eq!(record.count, 2);
        assert!(record.consumed(std::path::Path::new("/in/b.mp4")));
        assert!(!record.consumed(std::path::Path::new("/in/c.mp4")));
    }
}
