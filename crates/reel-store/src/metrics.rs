//! Store request metrics.

use std::time::Duration;

use metrics::{counter, histogram};

pub const STORE_REQUESTS: &str = "reel_store_requests_total";
pub const STORE_RETRIES: &str = "reel_store_retries_total";
pub const STORE_LATENCY: &str = "reel_store_latency_seconds";

/// One finished HTTP round trip to the document store.
pub fn record_request(operation: &'static str, status: u16, latency: Duration) {
    counter!(STORE_REQUESTS, "operation" => operation, "status" => status.to_string()).increment(1);
    histogram!(STORE_LATENCY, "operation" => operation).record(latency.as_secs_f64());
}

pub fn record_retry(operation: &'static str) {
    counter!(STORE_RETRIES, "operation" => operation).increment(1);
}
