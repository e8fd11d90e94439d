//! HTTP control surface for the merge pipeline.
//!
//! Exposes the dedup ledger to downloaders, accepts merge requests and
//! reports the status of the most recent batch per account.

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::{ApiConfig, QueueBackend};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
