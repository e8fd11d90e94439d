//! Redis Streams job queue.
//!
//! This crate provides:
//! - Tagged job messages (standardize, merge request)
//! - Job enqueueing and consumption via Redis Streams with retry/DLQ
//! - A side-channel for terminal job outcomes that the orchestrator polls
//! - An in-process queue implementing the same dispatcher contract
//! - Per-account batch locks

pub mod error;
pub mod job;
pub mod lock;
pub mod memory;
pub mod queue;

pub use error::{QueueError, QueueResult};
pub use job::{MergeRequestJob, QueueJob, StandardizeJob};
pub use lock::{AccountLock, BatchLock, LockToken, MemoryBatchLock};
pub use memory::MemoryQueue;
pub use queue::{JobDispatcher, JobQueue, QueueConfig};
