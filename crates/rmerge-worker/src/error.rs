//! Worker error types.

use thiserror::Error;

use rmerge_ledger::LedgerError;
use rmerge_media::MediaError;
use rmerge_queue::QueueError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Queue operation failed: {0}")]
    QueueFailed(String),

    #[error("A merge batch is already running for account {0}")]
    BatchInProgress(String),

    #[error("Barrier timed out: completed {completed} of {total}")]
    BarrierTimeout { completed: usize, total: usize },

    #[error("Batch cancelled")]
    Cancelled,

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self::JobFailed(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn queue_failed(msg: impl Into<String>) -> Self {
        Self::QueueFailed(msg.into())
    }

    /// Check if redelivering the message could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::QueueFailed(_)
            | WorkerError::Queue(_)
            | WorkerError::BatchInProgress(_)
            | WorkerError::Cancelled
            | WorkerError::Io(_) => true,
            WorkerError::Ledger(e) => matches!(e, LedgerError::LockTimeout(_) | LedgerError::Io(_)),
            WorkerError::Media(e) => matches!(e, MediaError::Cancelled),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_barrier_timeout_message() {
        let e = WorkerError::BarrierTimeout {
            completed: 3,
            total: 5,
        };
        assert!(e.to_string().contains("completed 3 of 5"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(WorkerError::BatchInProgress("acct".into()).is_retryable());
        assert!(WorkerError::Ledger(LedgerError::LockTimeout("dedup/acct".into())).is_retryable());
        assert!(!WorkerError::Ledger(LedgerError::corrupt("dedup/acct", "bad")).is_retryable());
        assert!(!WorkerError::job_failed("boom").is_retryable());
        assert!(WorkerError::Media(MediaError::Cancelled).is_retryable());
    }
}
