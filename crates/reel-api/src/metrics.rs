//! Prometheus metrics for the API server.

use std::sync::LazyLock;
use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use regex::Regex;

/// Initialize the Prometheus metrics recorder.
/// Returns a handle that can be used to render metrics.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Metric names as constants for consistency.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "reel_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "reel_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "reel_http_requests_in_flight";

    // Queue metrics
    pub const JOBS_ENQUEUED_TOTAL: &str = "reel_jobs_enqueued_total";
    pub const QUEUE_DEPTH: &str = "reel_queue_depth";

    // Admission metrics
    pub const RATE_LIMIT_HITS_TOTAL: &str = "reel_rate_limit_hits_total";
    pub const RATE_LIMITER_DEGRADED_TOTAL: &str = "reel_rate_limiter_degraded_total";
    pub const ADMISSION_REJECTIONS_TOTAL: &str = "reel_admission_rejections_total";
    pub const SANITIZED_KEYS_TOTAL: &str = "reel_sanitized_keys_total";
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
pub fn record_job_enqueued() {
    counter!(names::JOBS_ENQUEUED_TOTAL).increment(1);
}

/// Update queue depth gauges.
pub fn set_queue_depth(queued: u64, delayed: u64, dead_lettered: u64) {
    gauge!(names::QUEUE_DEPTH, "state" => "queued").set(queued as f64);
    gauge!(names::QUEUE_DEPTH, "state" => "delayed").set(delayed as f64);
    gauge!(names::QUEUE_DEPTH, "state" => "dead_lettered").set(dead_lettered as f64);
}

/// Record rate limit hit.
pub fn record_rate_limit_hit(limiter: &str) {
    let labels = [("limiter", limiter.to_string())];
    counter!(names::RATE_LIMIT_HITS_TOTAL, &labels).increment(1);
}

/// Record a limiter falling back to local counters.
pub fn record_rate_limiter_degraded(limiter: &str) {
    let labels = [("limiter", limiter.to_string())];
    counter!(names::RATE_LIMITER_DEGRADED_TOTAL, &labels).increment(1);
}

/// Record a request rejected by an admission check.
pub fn record_admission_rejection(code: &'static str) {
    counter!(names::ADMISSION_REJECTIONS_TOTAL, "code" => code).increment(1);
}

/// Record an input key rewritten by sanitization.
pub fn record_sanitized_key(source: &'static str) {
    counter!(names::SANITIZED_KEYS_TOTAL, "source" => source).increment(1);
}

static UUID_SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .expect("valid regex")
});

static NUMERIC_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/[0-9]+(/|$)").expect("valid regex"));

static JOB_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/jobs/[^/]+").expect("valid regex"));

/// Sanitize path for metrics labels (remove IDs, etc.).
fn sanitize_path(path: &str) -> String {
    let path = UUID_SEGMENT.replace_all(path, ":id");
    let path = NUMERIC_SEGMENT.replace_all(&path, "/:id$1");
    let path = JOB_SEGMENT.replace_all(&path, "/jobs/:id");
    path.to_string()
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
    let duration = start.elapsed().as_secs_f64();

    record_http_request(&method, &path, status, duration);

    response
}
