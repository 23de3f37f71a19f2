//! Worker configuration.

use std::time::Duration;

use tracing::warn;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent consumers
    pub concurrency: usize,
    /// How often an in-flight job's lease is extended
    pub heartbeat_interval: Duration,
    /// Longest a single dequeue call blocks
    pub poll_block: Duration,
    /// Pause after a queue error before polling again
    pub error_backoff: Duration,
    /// Keep artifacts on disk after completion
    pub retain_artifacts: bool,
    /// Completion webhook; no notifications when unset
    pub webhook_url: Option<String>,
    pub webhook_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            heartbeat_interval: Duration::from_secs(30),
            poll_block: Duration::from_secs(2),
            error_backoff: Duration::from_secs(1),
            retain_artifacts: true,
            webhook_url: None,
            webhook_timeout: Duration::from_secs(10),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            concurrency: std::env::var("WORKER_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.concurrency),
            heartbeat_interval: Duration::from_secs(
                std::env::var("WORKER_HEARTBEAT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .filter(|n: &u64| *n > 0)
                    .unwrap_or(30),
            ),
            poll_block: Duration::from_millis(
                std::env::var("WORKER_POLL_BLOCK_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2000),
            ),
            error_backoff: defaults.error_backoff,
            retain_artifacts: std::env::var("WORKER_RETAIN_ARTIFACTS")
                .ok()
                .map(|s| !matches!(s.to_ascii_lowercase().as_str(), "false" | "0" | "no"))
                .unwrap_or(true),
            webhook_url: std::env::var("NOTIFY_WEBHOOK_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            webhook_timeout: defaults.webhook_timeout,
        }
    }

    /// Keep the heartbeat well inside the queue's visibility timeout.
    ///
    /// A lease that is not extended in time is redelivered while the first
    /// worker is still downloading into the same output path. Intervals at
    /// or above a third of the timeout are clamped to that third.
    pub fn fitted_to_visibility(mut self, visibility_timeout: Duration) -> Self {
        let ceiling = (visibility_timeout / 3).max(Duration::from_millis(1));
        if self.heartbeat_interval > ceiling {
            warn!(
                heartbeat_ms = self.heartbeat_interval.as_millis() as u64,
                visibility_ms = visibility_timeout.as_millis() as u64,
                clamped_ms = ceiling.as_millis() as u64,
                "Heartbeat interval too close to the visibility timeout, clamping"
            );
            self.heartbeat_interval = ceiling;
        }
        self
    }
}
