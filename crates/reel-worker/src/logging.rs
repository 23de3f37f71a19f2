//! Per-job structured logging.

use reel_models::JobId;
use tracing::{error, info, warn, Span};

/// Carries the job identity into every event a worker emits for it.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: JobId,
    operation: &'static str,
}

impl JobLogger {
    pub fn new(job_id: &JobId, operation: &'static str) -> Self {
        Self {
            job_id: job_id.clone(),
            operation,
        }
    }

    pub fn log_start(&self, source_url: &str) {
        info!(job_id = %self.job_id, op = self.operation, source_url, "claimed job");
    }

    pub fn log_progress(&self, message: &str) {
        info!(job_id = %self.job_id, op = self.operation, "{}", message);
    }

    pub fn log_warning(&self, message: &str) {
        warn!(job_id = %self.job_id, op = self.operation, "{}", message);
    }

    pub fn log_error(&self, message: &str) {
        error!(job_id = %self.job_id, op = self.operation, "{}", message);
    }

    pub fn log_completion(&self, message: &str) {
        info!(job_id = %self.job_id, op = self.operation, outcome = "succeeded", "{}", message);
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Span wrapping one delivery from claim to settle.
    pub fn create_span(&self, consumer: &str) -> Span {
        tracing::info_span!("job", job_id = %self.job_id, op = self.operation, consumer)
    }
}
