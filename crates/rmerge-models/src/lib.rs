//! Shared data models for the rmerge pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Assets and their per-account identifiers
//! - Download and merge ledger records
//! - Job identifiers and standardize outcomes
//! - Target geometry buckets
//! - Standardization encoding options
//! - Batch status reported to external collaborators

pub mod asset;
pub mod encoding;
pub mod geometry;
pub mod job;
pub mod record;
pub mod status;

// Re-export common types
pub use asset::{Asset, AssetError};
pub use encoding::StandardizeOptions;
pub use geometry::{GeometryBucket, Orientation, TargetResolution};
pub use job::{BatchId, JobId, JobOutcome};
pub use record::{DownloadRecord, DownloadStatus, MergeRecord, RecordOrigin};
pub use status::{BatchState, BatchStatus};
