//! The download strategy contract.

use std::path::PathBuf;

use async_trait::async_trait;
use reel_models::DownloadMethod;

use crate::error::{DownloadError, DownloadResult};

/// One download to perform.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub job_id: String,
    pub source_url: String,
    /// Already sanitized and inside the artifact directory
    pub output_path: PathBuf,
}

/// A way of turning a source URL into a local file.
#[async_trait]
pub trait DownloadStrategy: Send + Sync {
    fn method(&self) -> DownloadMethod;

    /// Whether the strategy can run right now (e.g. its credentials exist).
    async fn is_available(&self) -> bool {
        true
    }

    /// Download to `request.output_path` and return the written path.
    async fn attempt(&self, request: &DownloadRequest) -> DownloadResult<PathBuf>;
}

/// Classified result of one strategy attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    Success(PathBuf),
    /// Stop the cascade; no other strategy can succeed
    Terminal(DownloadError),
    /// Record the error and move on to the next strategy
    RetryNext(DownloadError),
}

impl AttemptOutcome {
    /// Unknown errors continue the cascade.
    pub fn classify(result: DownloadResult<PathBuf>) -> Self {
        match result {
            Ok(path) => AttemptOutcome::Success(path),
            Err(e) if e.is_terminal() => AttemptOutcome::Terminal(e),
            Err(e) => AttemptOutcome::RetryNext(e),
        }
    }
}
