//! Queue configuration.

use std::time::Duration;

use crate::backoff::BackoffPolicy;

/// Which queue implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    Redis,
    Memory,
}

impl QueueBackend {
    fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "memory" | "in-memory" | "local" => QueueBackend::Memory,
            _ => QueueBackend::Redis,
        }
    }
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    /// Redis URL
    pub redis_url: String,
    /// Stream name for jobs
    pub stream_name: String,
    /// Consumer group name
    pub consumer_group: String,
    /// Dead letter queue stream name
    pub dlq_stream_name: String,
    /// Prefix for job records and the delayed-retry set
    pub key_prefix: String,
    /// How long a delivery may go without heartbeat before redelivery
    pub visibility_timeout: Duration,
    /// How long terminal job records are kept
    pub job_retention: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Redis,
            redis_url: "redis://localhost:6379".to_string(),
            stream_name: "reel:jobs".to_string(),
            consumer_group: "reel:workers".to_string(),
            dlq_stream_name: "reel:dlq".to_string(),
            key_prefix: "reel".to_string(),
            visibility_timeout: Duration::from_secs(300),
            job_retention: Duration::from_secs(86_400),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            backend: std::env::var("QUEUE_BACKEND")
                .map(|s| QueueBackend::parse(&s))
                .unwrap_or(defaults.backend),
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            stream_name: std::env::var("QUEUE_STREAM").unwrap_or(defaults.stream_name),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP")
                .unwrap_or(defaults.consumer_group),
            dlq_stream_name: std::env::var("QUEUE_DLQ_STREAM").unwrap_or(defaults.dlq_stream_name),
            key_prefix: std::env::var("QUEUE_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            visibility_timeout: Duration::from_secs(
                std::env::var("QUEUE_VISIBILITY_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            job_retention: Duration::from_secs(
                std::env::var("QUEUE_JOB_RETENTION_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(86_400),
            ),
            backoff: BackoffPolicy::from_env(),
        }
    }

    pub(crate) fn job_key(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.key_prefix, job_id)
    }

    pub(crate) fn delayed_key(&self) -> String {
        format!("{}:delayed", self.key_prefix)
    }
}
