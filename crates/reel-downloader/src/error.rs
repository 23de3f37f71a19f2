//! Download error types.

use reel_models::{AttemptRecord, DownloadMethod};
use thiserror::Error;

/// Result type for a single strategy attempt.
pub type DownloadResult<T> = Result<T, DownloadError>;

/// Errors a download strategy can produce.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Video duration exceeds the {max_secs}s limit")]
    DurationExceeded {
        max_secs: u64,
        actual_secs: Option<u64>,
    },

    #[error("Video exceeds the maximum file size of {max_bytes} bytes")]
    FileTooLarge { max_bytes: u64 },

    #[error("Authentication required: {0}")]
    AuthRequired(String),

    #[error("Rate limited by upstream: {0}")]
    RateLimited(String),

    #[error("Content unavailable: {0}")]
    Unavailable(String),

    #[error("Download timed out after {0} seconds")]
    Timeout(u64),

    #[error("Download tool not available: {0}")]
    ToolMissing(String),

    #[error("Download failed: {0}")]
    Failed(String),

    #[error("Invalid output path: {0}")]
    InvalidPath(String),

    #[error("Invalid session cookie: {0}")]
    InvalidCookie(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl DownloadError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Terminal errors abort the whole cascade.
    ///
    /// Policy violations are properties of the source, so no other strategy
    /// can succeed where this one was refused.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadError::DurationExceeded { .. }
                | DownloadError::FileTooLarge { .. }
                | DownloadError::InvalidPath(_)
        )
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DownloadError::DurationExceeded { .. } => "duration_exceeded",
            DownloadError::FileTooLarge { .. } => "file_too_large",
            DownloadError::AuthRequired(_) => "auth_required",
            DownloadError::RateLimited(_) => "rate_limited",
            DownloadError::Unavailable(_) => "unavailable",
            DownloadError::Timeout(_) => "timeout",
            DownloadError::ToolMissing(_) => "tool_missing",
            DownloadError::Failed(_) => "failed",
            DownloadError::InvalidPath(_) => "invalid_path",
            DownloadError::InvalidCookie(_) => "invalid_cookie",
            DownloadError::Io(_) => "io",
            DownloadError::Http(_) => "http",
        }
    }
}

/// Outcome of a whole cascade run that produced no file.
#[derive(Debug, Error)]
pub enum CascadeError {
    #[error("{method} aborted the download: {source}")]
    Terminal {
        method: DownloadMethod,
        #[source]
        source: DownloadError,
        attempts: Vec<AttemptRecord>,
    },

    #[error("All download strategies failed; last error: {last_error}")]
    Exhausted {
        last_error: String,
        attempts: Vec<AttemptRecord>,
    },

    #[error("Cannot prepare output location: {0}")]
    Setup(#[source] DownloadError),
}

impl CascadeError {
    /// Terminal failures must not be retried by the queue either.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CascadeError::Terminal { .. })
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            CascadeError::Terminal { attempts, .. } | CascadeError::Exhausted { attempts, .. } => {
                attempts
            }
            CascadeError::Setup(_) => &[],
        }
    }
}
