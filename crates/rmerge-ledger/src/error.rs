//! Ledger error types.

use std::path::PathBuf;
use thiserror::Error;

use rmerge_models::AssetError;

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Errors that can occur while reading or writing ledgers.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger document {key} is corrupt: {message}")]
    Corrupt { key: String, message: String },

    #[error("Invalid document key: {0}")]
    InvalidKey(String),

    #[error("Timed out waiting for lock on {0}")]
    LockTimeout(String),

    #[error("Output already recorded by a merge: {0}")]
    OutputExists(PathBuf),

    #[error("Input already consumed by a merge: {0}")]
    AlreadyConsumed(PathBuf),

    #[error("Invalid name: {0}")]
    InvalidName(#[from] AssetError),

    #[error("Scan failed: {0}")]
    Scan(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LedgerError {
    pub fn corrupt(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn scan(msg: impl Into<String>) -> Self {
        Self::Scan(msg.into())
    }
}
