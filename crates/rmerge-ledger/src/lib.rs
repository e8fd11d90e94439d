//! Durable ledgers for downloaded and merged assets.
//!
//! This crate provides:
//! - A document store interface with an explicit read-modify-write contract
//! - JSON-file and in-memory store backends
//! - The dedup ledger (download state, reconciliation, merged flags)
//! - The merge ledger (at-most-once record of consumed inputs)
//! - The per-account batch status document

pub mod config;
pub mod dedup;
pub mod error;
pub mod merge;
pub mod scan;
pub mod status;
pub mod store;

pub use config::LedgerConfig;
pub use dedup::{DedupDocument, DedupLedger, LedgerSummary, MarkMergedReport, SyncReport};
pub use error::{LedgerError, LedgerResult};
pub use merge::MergeLedger;
pub use scan::{AssetScanner, ScannedAsset, SyncScope};
pub use status::StatusStore;
pub use store::{DocumentStore, JsonFileStore, MemoryStore};
