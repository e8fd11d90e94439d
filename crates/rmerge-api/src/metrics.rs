//! Prometheus metrics for the API server.

use std::sync::OnceLock;
use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use regex::Regex;

/// Install the Prometheus recorder and return the handle `/metrics` renders.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Metric names as constants for consistency.
pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "rmerge_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "rmerge_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "rmerge_http_requests_in_flight";

    pub const JOBS_ENQUEUED_TOTAL: &str = "rmerge_jobs_enqueued_total";
    pub const DOWNLOADS_RECORDED_TOTAL: &str = "rmerge_downloads_recorded_total";
}

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", sanitize_path(path)),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record job enqueued.
pub fn record_job_enqueued(kind: &'static str) {
    counter!(names::JOBS_ENQUEUED_TOTAL, "kind" => kind).increment(1);
}

/// Record a download reported by a downloader.
pub fn record_download(status: &'static str) {
    counter!(names::DOWNLOADS_RECORDED_TOTAL, "status" => status).increment(1);
}

fn account_segment() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/accounts/[^/]+").expect("valid regex"))
}

fn download_segment() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/downloads/[^/]+").expect("valid regex"))
}

/// Replace account names and identifiers with placeholders so label
/// cardinality stays bounded.
fn sanitize_path(path: &str) -> String {
    let path = account_segment().replace_all(path, "/accounts/:account");
    let path = download_segment().replace_all(&path, "/downloads/:identifier");
    path.into_owned()
}

/// Metrics middleware for HTTP requests.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);
    let response = next.run(request).await;
    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    let status = response.status().as_u16();
    record_http_request(&method, &path, status, start.elapsed().as_secs_f64());

    response
}
