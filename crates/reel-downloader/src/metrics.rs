//! Download metrics.

use metrics::{counter, histogram};
use reel_models::DownloadMethod;

pub mod names {
    /// Strategy attempts by method and outcome.
    pub const ATTEMPTS_TOTAL: &str = "reel_download_attempts_total";

    /// Strategy attempt duration in seconds by method.
    pub const ATTEMPT_DURATION_SECONDS: &str = "reel_download_attempt_duration_seconds";

    /// Bytes written by successful downloads.
    pub const BYTES_TOTAL: &str = "reel_download_bytes_total";
}

/// Record one strategy attempt. `outcome` is `success` or an error kind.
pub fn record_attempt(method: DownloadMethod, outcome: &'static str, elapsed_ms: u64) {
    counter!(
        names::ATTEMPTS_TOTAL,
        "method" => method.as_str(),
        "outcome" => outcome
    )
    .increment(1);

    histogram!(names::ATTEMPT_DURATION_SECONDS, "method" => method.as_str())
        .record(elapsed_ms as f64 / 1000.0);
}

pub fn record_bytes(method: DownloadMethod, bytes: u64) {
    counter!(names::BYTES_TOTAL, "method" => method.as_str()).increment(bytes);
}
