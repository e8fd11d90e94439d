//! Batch status reported to external collaborators.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::job::BatchId;

/// Final state of a merge batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    /// Batch is still running
    Running,
    /// Nothing to merge
    Noop,
    /// Every selected asset was merged
    Completed,
    /// Merged, but some assets were excluded
    Partial,
    /// Batch aborted without committing
    Failed,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Running => "running",
            BatchState::Noop => "noop",
            BatchState::Completed => "completed",
            BatchState::Partial => "partial",
            BatchState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchState::Running)
    }
}

/// Status of the most recent batch for an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BatchStatus {
    pub batch_id: BatchId,
    pub account: String,
    pub state: BatchState,
    /// Assets merged into the output
    pub merged: usize,
    /// Selected assets that were not enqueued (missing source file)
    pub skipped: usize,
    /// Assets whose standardization failed
    pub failed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchStatus {
    /// A freshly started batch.
    pub fn running(batch_id: BatchId, account: impl Into<String>) -> Self {
        Self {
            batch_id,
            account: account.into(),
            state: BatchState::Running,
            merged: 0,
            skipped: 0,
            failed: 0,
            output_file: None,
            reason: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Mark the batch finished with the given state.
    pub fn finish(mut self, state: BatchState) -> Self {
        self.state = state;
        self.finished_at = Some(Utc::now());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_then_finish() {
        let status = BatchStatus::running(BatchId::new(), "acct");
        assert!(!status.state.is_terminal());
        let status = status.finish(BatchState::Noop);
        assert!(status.state.is_terminal());
        assert!(status.finished_at.is_some());
    }

    #[test]
    fn test_output_file_omitted_when_none() {
        let status = BatchStatus::running(BatchId::new(), "acct");
        let json = serde_json::to_string(&status).unwrap();
        assert!(!json.contains("output_file"));
        assert!(json.contains(r#""state":"running""#));
    }
}
