//! Queue error types.

use reel_models::TransitionError;
use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend unreachable: {0}")]
    ConnectionFailed(String),

    #[error("could not publish job: {0}")]
    EnqueueFailed(String),

    #[error("could not claim job: {0}")]
    DequeueFailed(String),

    #[error("no record for job {0}")]
    JobNotFound(String),

    /// Another consumer now holds the job.
    #[error("lease on job {0} is no longer held")]
    LeaseLost(String),

    #[error("queue closed")]
    Closed,

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("job payload: {0}")]
    Codec(#[from] serde_json::Error),
}

impl QueueError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    pub fn enqueue_failed(msg: impl Into<String>) -> Self {
        Self::EnqueueFailed(msg.into())
    }

    pub fn dequeue_failed(msg: impl Into<String>) -> Self {
        Self::DequeueFailed(msg.into())
    }

    /// Transport trouble a later call may not hit.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_) | Self::DequeueFailed(_))
            || matches!(self, Self::Redis(e) if e.is_io_error() || e.is_connection_dropped() || e.is_timeout())
    }
}
