//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Notification failed: {0}")]
    NotifyFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("{0} worker task(s) panicked")]
    WorkerPanicked(usize),

    #[error("Store error: {0}")]
    Store(#[from] reel_store::StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] reel_queue::QueueError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn notify_failed(msg: impl Into<String>) -> Self {
        Self::NotifyFailed(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }
}
