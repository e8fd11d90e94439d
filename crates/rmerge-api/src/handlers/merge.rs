//! Merge request and batch status handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use rmerge_models::asset::validate_account;
use rmerge_models::{BatchStatus, MergeRecord};
use rmerge_queue::{MergeRequestJob, QueueJob};

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;

/// Body of a merge request. Every filter is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeRequestBody {
    /// Maximum number of assets, newest first
    #[serde(default)]
    pub limit: Option<usize>,
    /// Only assets from this day (`YYYY-MM-DD`)
    #[serde(default)]
    pub date: Option<NaiveDate>,
    /// Only assets from this download folder
    #[serde(default)]
    pub source_folder: Option<String>,
}

/// Returned once the request is on the queue.
#[derive(Debug, Serialize)]
pub struct MergeAccepted {
    pub job_id: String,
    pub account: String,
    pub message_id: String,
}

/// Enqueue a merge batch for an account.
///
/// The batch runs on a worker; poll the status endpoint for its result.
pub async fn request_merge(
    State(state): State<AppState>,
    Path(account): Path<String>,
    Json(body): Json<MergeRequestBody>,
) -> ApiResult<(StatusCode, Json<MergeAccepted>)> {
    validate_account(&account)?;
    if body.limit == Some(0) {
        return Err(ApiError::bad_request("limit must be at least 1"));
    }
    let source_folder = body.source_folder.filter(|f| !f.trim().is_empty());

    let job = MergeRequestJob::new(account.clone())
        .with_limit(body.limit)
        .with_date(body.date)
        .with_source_folder(source_folder);
    let job_id = job.job_id.to_string();

    let message_id = state.dispatcher.enqueue(QueueJob::MergeRequest(job)).await?;
    metrics::record_job_enqueued("merge_request");

    info!(account = %account, job_id = %job_id, "Merge request enqueued");

    Ok((
        StatusCode::ACCEPTED,
        Json(MergeAccepted {
            job_id,
            account,
            message_id,
        }),
    ))
}

/// Status of the most recent batch for an account.
pub async fn get_status(
    State(state): State<AppState>,
    Path(account): Path<String>,
) -> ApiResult<Json<BatchStatus>> {
    validate_account(&account)?;
    state
        .status
        .get(&account)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no batch has run for {account}")))
}

/// Committed merges for an account, oldest first.
pub async fn merge_history(
    State(state): State<AppState>,
    Path(account): Path<String>,
) -> ApiResult<Json<Vec<MergeRecord>>> {
    Ok(Json(state.merges.history(&account).await?))
}
