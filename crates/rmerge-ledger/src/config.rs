//! Ledger configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Ledger configuration.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Directory holding the ledger documents
    pub ledger_dir: PathBuf,
    /// Root of the per-account download directories
    pub downloads_root: PathBuf,
    /// Size of the "recent" reconciliation window, in days
    pub sync_recent_days: u32,
    /// How long a writer waits for the cross-process lock
    pub lock_timeout: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            ledger_dir: PathBuf::from("./data/ledger"),
            downloads_root: PathBuf::from("./data/downloads"),
            sync_recent_days: 7,
            lock_timeout: Duration::from_secs(30),
        }
    }
}

impl LedgerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            ledger_dir: std::env::var("LEDGER_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/ledger")),
            downloads_root: std::env::var("DOWNLOADS_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/downloads")),
            sync_recent_days: std::env::var("SYNC_RECENT_DAYS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(7),
            lock_timeout: Duration::from_secs(
                std::env::var("LEDGER_LOCK_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }
}
