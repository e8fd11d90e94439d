//! API routes.

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::handlers::{
    get_download, get_status, get_summary, health, list_unmerged, merge_history, ready,
    record_download, request_merge, sync_downloads,
};
use crate::metrics::metrics_middleware;
use crate::middleware::{cors_layer, request_id, request_logging};
use crate::state::AppState;

/// Create the API router.
pub fn create_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let account_routes = Router::new()
        // Merge batches
        .route("/accounts/:account/merge", post(request_merge))
        .route("/accounts/:account/status", get(get_status))
        .route("/accounts/:account/merges", get(merge_history))
        // Dedup ledger
        .route("/accounts/:account/downloads", post(record_download))
        .route("/accounts/:account/downloads/:identifier", get(get_download))
        .route("/accounts/:account/unmerged", get(list_unmerged))
        .route("/accounts/:account/summary", get(get_summary))
        .route("/accounts/:account/sync", post(sync_downloads));

    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/ready", get(ready));

    let metrics_routes = if let Some(handle) = metrics_handle {
        Router::new().route("/metrics", get(move || async move { handle.render() }))
    } else {
        Router::new()
    };

    Router::new()
        .nest("/api", account_routes)
        .merge(health_routes)
        .merge(metrics_routes)
        .layer(RequestBodyLimitLayer::new(state.config.max_body_size))
        .layer(TimeoutLayer::new(state.config.request_timeout))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id))
        .layer(middleware::from_fn(request_logging))
        .layer(cors_layer(&state.config.cors_origins))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use rmerge_ledger::{AssetScanner, MemoryStore};
    use rmerge_models::{BatchId, BatchState, BatchStatus};
    use rmerge_queue::{MemoryQueue, QueueJob};

    use crate::config::ApiConfig;

    struct Harness {
        downloads: TempDir,
        queue: Arc<MemoryQueue>,
        state: AppState,
    }

    impl Harness {
        fn new() -> Self {
            let downloads = TempDir::new().unwrap();
            let queue = Arc::new(MemoryQueue::new());
            let state = AppState::new(
                ApiConfig::default(),
                Arc::new(MemoryStore::new()),
                AssetScanner::new(downloads.path(), 7),
                queue.clone(),
            );
            Self {
                downloads,
                queue,
                state,
            }
        }

        fn write_asset(&self, account: &str, folder: &str, name: &str) -> std::path::PathBuf {
            let dir = self.downloads.path().join(account).join(folder);
            std::fs::create_dir_all(&dir).unwrap();
            let path = dir.join(name);
            std::fs::write(&path, b"video").unwrap();
            path
        }

        async fn send(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
            let app = create_router(self.state.clone(), None);
            let request = Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(match body {
                    Some(v) => Body::from(v.to_string()),
                    None => Body::empty(),
                })
                .unwrap();

            let response = app.oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap_or(Value::Null)
            };
            (status, value)
        }
    }

    #[tokio::test]
    async fn test_health() {
        let h = Harness::new();
        let (status, body) = h.send("GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_ready_reports_queue_outage() {
        let h = Harness::new();
        let (status, body) = h.send("GET", "/ready", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");

        h.queue.set_unavailable(true);
        let (status, body) = h.send("GET", "/ready", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["checks"]["queue"]["status"], "error");
        assert_eq!(body["checks"]["ledger"]["status"], "ok");
    }

    #[tokio::test]
    async fn test_merge_request_is_enqueued() {
        let h = Harness::new();
        let (status, body) = h
            .send(
                "POST",
                "/api/accounts/natgeo/merge",
                Some(json!({"limit": 3, "date": "2024-05-01", "source_folder": "2024-05-01"})),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["account"], "natgeo");

        let (_, job) = h.queue.try_pop().await.unwrap();
        match job {
            QueueJob::MergeRequest(j) => {
                assert_eq!(j.job_id.to_string(), body["job_id"].as_str().unwrap());
                assert_eq!(j.account, "natgeo");
                assert_eq!(j.limit, Some(3));
                assert_eq!(j.date.map(|d| d.to_string()).as_deref(), Some("2024-05-01"));
                assert_eq!(j.source_folder.as_deref(), Some("2024-05-01"));
            }
            other => panic!("unexpected job: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_merge_request_validation() {
        let h = Harness::new();
        let (status, _) = h
            .send("POST", "/api/accounts/natgeo/merge", Some(json!({"limit": 0})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = h
            .send("POST", "/api/accounts/bad%20name/merge", Some(json!({})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap().contains("invalid character"));

        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_merge_request_with_queue_down() {
        let h = Harness::new();
        h.queue.set_unavailable(true);
        let (status, _) = h
            .send("POST", "/api/accounts/natgeo/merge", Some(json!({})))
            .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_status_of_last_batch() {
        let h = Harness::new();
        let (status, _) = h.send("GET", "/api/accounts/natgeo/status", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let mut batch = BatchStatus::running(BatchId::new(), "natgeo");
        batch.merged = 4;
        batch.failed = 1;
        h.state
            .status
            .save(&batch.finish(BatchState::Partial))
            .await
            .unwrap();

        let (status, body) = h.send("GET", "/api/accounts/natgeo/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "partial");
        assert_eq!(body["merged"], 4);
        assert_eq!(body["failed"], 1);
    }

    #[tokio::test]
    async fn test_record_and_lookup_download() {
        let h = Harness::new();
        let path = h.write_asset("natgeo", "2024-05-01", "CxYz1.mp4");

        let (status, _) = h
            .send("GET", "/api/accounts/natgeo/downloads/Unknown1", None)
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = h
            .send(
                "POST",
                "/api/accounts/natgeo/downloads",
                Some(json!({"identifier": "CxYz1", "status": "success", "path": path})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source_folder"], "2024-05-01");
        assert_eq!(body["merged"], false);

        let (_, body) = h
            .send("GET", "/api/accounts/natgeo/downloads/CxYz1", None)
            .await;
        assert_eq!(body["downloaded"], true);
        assert_eq!(body["record"]["status"], "success");

        let (_, body) = h.send("GET", "/api/accounts/natgeo/unmerged", None).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["records"][0]["identifier"], "CxYz1");
    }

    #[tokio::test]
    async fn test_record_download_validation() {
        let h = Harness::new();
        let (status, _) = h
            .send(
                "POST",
                "/api/accounts/natgeo/downloads",
                Some(json!({"identifier": "CxYz1", "status": "success"})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = h
            .send(
                "POST",
                "/api/accounts/natgeo/downloads",
                Some(json!({"identifier": "CxYz1", "status": "success", "path": "relative.mp4"})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Failed attempts carry no file
        let (status, body) = h
            .send(
                "POST",
                "/api/accounts/natgeo/downloads",
                Some(json!({"identifier": "CxYz1", "status": "failed"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "failed");

        let (_, body) = h
            .send("GET", "/api/accounts/natgeo/downloads/CxYz1", None)
            .await;
        assert_eq!(body["downloaded"], false);
    }

    #[tokio::test]
    async fn test_sync_and_summary() {
        let h = Harness::new();
        h.write_asset("natgeo", "old-posts", "Aaa1.mp4");
        h.write_asset("natgeo", "old-posts", "Bbb2.mp4");

        let (status, body) = h
            .send("POST", "/api/accounts/natgeo/sync", Some(json!({"scope": "full"})))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["added"], 2);

        let (_, body) = h
            .send("POST", "/api/accounts/natgeo/sync", Some(json!({"scope": "full"})))
            .await;
        assert_eq!(body["added"], 0);
        assert_eq!(body["already_known"], 2);

        let (_, body) = h.send("GET", "/api/accounts/natgeo/summary", None).await;
        assert_eq!(body["success"], 2);
        assert_eq!(body["unmerged"], 2);
        assert_eq!(body["merged"], 0);
    }

    #[tokio::test]
    async fn test_merge_history_empty() {
        let h = Harness::new();
        let (status, body) = h.send("GET", "/api/accounts/natgeo/merges", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn test_request_id_is_echoed() {
        let h = Harness::new();
        let app = create_router(h.state.clone(), None);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("X-Request-ID", "req-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()["X-Request-ID"], "req-42");
    }
}
