//! Dedup ledger handlers used by downloaders and operators.

use std::path::PathBuf;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use rmerge_ledger::{LedgerSummary, SyncReport, SyncScope};
use rmerge_models::{DownloadRecord, DownloadStatus};

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RecordDownloadBody {
    pub identifier: String,
    pub status: DownloadStatus,
    /// Where the file landed; required for success records
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct DownloadLookup {
    pub identifier: String,
    pub downloaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<DownloadRecord>,
}

#[derive(Debug, Serialize)]
pub struct UnmergedResponse {
    pub account: String,
    pub count: usize,
    pub records: Vec<DownloadRecord>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncBody {
    #[serde(default)]
    pub scope: SyncScope,
}

/// Upsert the download record for an identifier.
pub async fn record_download(
    State(state): State<AppState>,
    Path(account): Path<String>,
    Json(body): Json<RecordDownloadBody>,
) -> ApiResult<Json<DownloadRecord>> {
    if body.status == DownloadStatus::Success && body.path.is_none() {
        return Err(ApiError::bad_request("path is required for success records"));
    }
    if let Some(path) = &body.path {
        if !path.is_absolute() {
            return Err(ApiError::bad_request("path must be absolute"));
        }
    }

    let record = state
        .dedup
        .record_download(&account, &body.identifier, body.status, body.path)
        .await?;
    metrics::record_download(record.status.as_str());

    info!(
        account = %account,
        identifier = %record.identifier,
        status = %record.status,
        "Download recorded"
    );
    Ok(Json(record))
}

/// Whether an identifier has been downloaded successfully.
pub async fn get_download(
    State(state): State<AppState>,
    Path((account, identifier)): Path<(String, String)>,
) -> ApiResult<Json<DownloadLookup>> {
    let downloaded = state.dedup.is_downloaded(&account, &identifier).await?;
    let record = state.dedup.record(&account, &identifier).await?;
    Ok(Json(DownloadLookup {
        identifier,
        downloaded,
        record,
    }))
}

/// Unmerged success records, newest first.
pub async fn list_unmerged(
    State(state): State<AppState>,
    Path(account): Path<String>,
) -> ApiResult<Json<UnmergedResponse>> {
    let records = state.dedup.unmerged(&account).await?;
    Ok(Json(UnmergedResponse {
        account,
        count: records.len(),
        records,
    }))
}

pub async fn get_summary(
    State(state): State<AppState>,
    Path(account): Path<String>,
) -> ApiResult<Json<LedgerSummary>> {
    Ok(Json(state.dedup.summary(&account).await?))
}

/// Record files found on disk that the ledger is missing.
pub async fn sync_downloads(
    State(state): State<AppState>,
    Path(account): Path<String>,
    Json(body): Json<SyncBody>,
) -> ApiResult<Json<SyncReport>> {
    Ok(Json(state.dedup.reconcile(&account, body.scope).await?))
}
