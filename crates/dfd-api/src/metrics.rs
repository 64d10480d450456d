//! Prometheus metrics for the API server.

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

/// Install the global Prometheus recorder.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "dfd_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "dfd_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "dfd_http_requests_in_flight";

    // Upload metrics
    pub const UPLOAD_BYTES: &str = "dfd_upload_bytes";
    pub const UPLOAD_REJECTIONS_TOTAL: &str = "dfd_upload_rejections_total";

    pub const STORE_FAILURES_TOTAL: &str = "dfd_prediction_store_failures_total";
}

/// Record an HTTP request.
pub fn record_http_request(method: &str, route: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("route", route.to_string()),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn record_upload_size(bytes: u64) {
    histogram!(names::UPLOAD_BYTES).record(bytes as f64);
}

/// Record an upload refused before inference.
pub fn record_upload_rejected(reason: &'static str) {
    counter!(names::UPLOAD_REJECTIONS_TOTAL, "reason" => reason).increment(1);
}

pub fn record_store_failure(backend: &'static str) {
    counter!(names::STORE_FAILURES_TOTAL, "backend" => backend).increment(1);
}

/// Metrics middleware for HTTP requests.
///
/// Requests are labelled by route template so unknown paths share one series.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = Instant::now();

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);
    let response = next.run(request).await;
    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    record_http_request(&method, &route, response.status().as_u16(), start.elapsed().as_secs_f64());

    response
}
