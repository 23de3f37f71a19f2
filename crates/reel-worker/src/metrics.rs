//! Worker metrics.

use metrics::{counter, gauge, histogram};

pub mod names {
    /// Settled deliveries by outcome (succeeded, failed, retried, lease_lost, settle_error).
    pub const JOBS_TOTAL: &str = "reel_worker_jobs_total";

    /// Wall time from dequeue to settle.
    pub const JOB_DURATION_SECONDS: &str = "reel_worker_job_duration_seconds";

    /// Jobs currently being processed.
    pub const JOBS_IN_FLIGHT: &str = "reel_worker_jobs_in_flight";

    /// Queue calls that failed inside the worker loop.
    pub const QUEUE_ERRORS_TOTAL: &str = "reel_worker_queue_errors_total";
}

pub fn record_job(outcome: &'static str, duration_secs: f64) {
    counter!(names::JOBS_TOTAL, "outcome" => outcome).increment(1);
    histogram!(names::JOB_DURATION_SECONDS, "outcome" => outcome).record(duration_secs);
}

pub fn job_started() {
    gauge!(names::JOBS_IN_FLIGHT).increment(1.0);
}

pub fn job_finished() {
    gauge!(names::JOBS_IN_FLIGHT).decrement(1.0);
}

pub fn record_queue_error(operation: &'static str) {
    counter!(names::QUEUE_ERRORS_TOTAL, "operation" => operation).increment(1);
}
