//! Backoff for transient store failures.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info_span, warn, Instrument};

use crate::error::{StoreError, StoreResult};
use crate::metrics::record_retry;

/// How hard to retry a failed store request.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Extra attempts after the first.
    pub retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// `STORE_RETRY_MAX`, `STORE_RETRY_BASE_MS` and `STORE_RETRY_MAX_MS`
    /// override the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let millis = |key: &str| {
            std::env::var(key)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_millis)
        };
        Self {
            retries: std::env::var("STORE_RETRY_MAX")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.retries),
            base_delay: millis("STORE_RETRY_BASE_MS").unwrap_or(defaults.base_delay),
            max_delay: millis("STORE_RETRY_MAX_MS").unwrap_or(defaults.max_delay),
        }
    }

    /// Wait before retry number `retry` (zero based).
    ///
    /// A server-provided `Retry-After` wins, capped at `max_delay`. Otherwise
    /// the exponential step is halved and the other half jittered, floored at
    /// `base_delay`.
    fn delay(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(after) = retry_after {
            return after.min(self.max_delay);
        }
        let step = self
            .base_delay
            .saturating_mul(1u32.checked_shl(retry).unwrap_or(u32::MAX))
            .min(self.max_delay);
        let half = step / 2;
        (half + half.mul_f64(jitter())).max(self.base_delay)
    }
}

/// Clock noise in `[0, 1)`; enough spread for a handful of clients.
fn jitter() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    f64::from(nanos % 1000) / 1000.0
}

/// Run `op` until it succeeds, fails permanently, or retries run out.
///
/// Only errors reporting [`StoreError::is_retryable`] are retried.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: &'static str, op: F) -> StoreResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut retry = 0;
    loop {
        let span = info_span!("store_attempt", operation, attempt = retry + 1);
        let err = match op().instrument(span).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && retry < config.retries => e,
            Err(e) => return Err(e),
        };

        let wait = config.delay(retry, err.retry_after_ms().map(Duration::from_millis));
        warn!(
            operation,
            attempt = retry + 1,
            wait_ms = wait.as_millis() as u64,
            error = %err,
            "Transient store failure, backing off"
        );
        record_retry(operation);
        tokio::time::sleep(wait).await;
        retry += 1;
    }
}
