//! Sliding-window rate limiting per client address.
//!
//! Each limiter runs in one of two modes:
//! - `Distributed`: a Redis sorted set per key, trimmed and counted by one
//!   Lua script so that every replica shares the same window.
//! - `Local`: an in-process log of request instants per key.
//!
//! The mode is chosen on the first check, not at startup, so a broker that
//! becomes reachable shortly after the listener does is still used. A
//! broker error mid-run degrades the limiter to `Local`; `reevaluate`
//! re-checks on demand.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, Response};
use axum::middleware::Next;
use axum::response::IntoResponse;
use redis::Script;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use super::{client_ip, is_exempt, Admission, Fingerprint};
use crate::broker::Broker;
use crate::error::ApiError;
use crate::metrics;

/// Upper bound on keys tracked by the local fallback.
const MAX_TRACKED_KEYS: usize = 10_000;

/// A broker round-trip slower than this counts as a failure.
const BROKER_TIMEOUT: Duration = Duration::from_secs(1);

/// Evict expired entries, count, and admit when under the limit.
///
/// KEYS[1] = window key
/// ARGV[1] = now (ms), ARGV[2] = window (ms), ARGV[3] = max, ARGV[4] = member
///
/// Returns `{admitted, count, retry_after_ms}`.
static SLIDING_WINDOW_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])
if count < max then
  redis.call('ZADD', KEYS[1], now, ARGV[4])
  redis.call('PEXPIRE', KEYS[1], window)
  return {1, count + 1, 0}
end
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
local retry = window
if oldest[2] then
  retry = tonumber(oldest[2]) + window - now
end
return {0, count, retry}
",
    )
});

/// Where a limiter keeps its counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterMode {
    Distributed,
    Local,
}

impl fmt::Display for LimiterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterMode::Distributed => f.write_str("distributed"),
            LimiterMode::Local => f.write_str("local"),
        }
    }
}

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Requests counted in the window, including this one when admitted
    pub count: u64,
    pub limit: u64,
    /// Time until the oldest counted request leaves the window
    pub retry_after: Duration,
}

impl RateDecision {
    /// `Retry-After` value, rounded up to whole seconds.
    pub fn retry_after_secs(&self) -> u64 {
        let millis = self.retry_after.as_millis() as u64;
        millis.div_ceil(1000).max(1)
    }
}

/// A sliding-window limiter with a lazily selected backend.
pub struct SlidingWindowLimiter {
    name: &'static str,
    window: Duration,
    max: u64,
    broker: Option<Arc<Broker>>,
    /// `None` until the first check
    mode: RwLock<Option<LimiterMode>>,
    local: LocalWindows,
}

impl SlidingWindowLimiter {
    pub fn new(
        name: &'static str,
        window: Duration,
        max: u64,
        broker: Option<Arc<Broker>>,
    ) -> Self {
        Self {
            name,
            window,
            max,
            broker,
            mode: RwLock::new(None),
            local: LocalWindows::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current mode, or `None` if no request has been checked yet.
    pub async fn mode(&self) -> Option<LimiterMode> {
        *self.mode.read().await
    }

    /// Count one request for `key`.
    pub async fn check(&self, key: &str) -> RateDecision {
        match self.resolve_mode().await {
            LimiterMode::Distributed => match self.check_distributed(key).await {
                Ok(decision) => decision,
                Err(e) => {
                    self.degrade(&e).await;
                    self.local.check(key, self.window, self.max, Instant::now())
                }
            },
            LimiterMode::Local => self.local.check(key, self.window, self.max, Instant::now()),
        }
    }

    /// Check the counter store again and switch mode accordingly.
    pub async fn reevaluate(&self) -> LimiterMode {
        let mut mode = self.mode.write().await;
        let selected = self.select_mode().await;
        info!(limiter = self.name, mode = %selected, "Rate limiter re-evaluated");
        *mode = Some(selected);
        selected
    }

    async fn resolve_mode(&self) -> LimiterMode {
        if let Some(mode) = *self.mode.read().await {
            return mode;
        }

        let mut mode = self.mode.write().await;
        // Another request may have resolved it while we waited
        if let Some(selected) = *mode {
            return selected;
        }
        let selected = self.select_mode().await;
        info!(limiter = self.name, mode = %selected, "Rate limiter mode selected");
        *mode = Some(selected);
        selected
    }

    async fn select_mode(&self) -> LimiterMode {
        let Some(broker) = &self.broker else {
            return LimiterMode::Local;
        };

        match tokio::time::timeout(BROKER_TIMEOUT, broker.ping()).await {
            Ok(Ok(_)) => LimiterMode::Distributed,
            Ok(Err(e)) => {
                warn!(
                    limiter = self.name,
                    error = %e,
                    "Counter store unreachable, rate limiter running in degraded local mode"
                );
                metrics::record_rate_limiter_degraded(self.name);
                LimiterMode::Local
            }
            Err(_) => {
                warn!(
                    limiter = self.name,
                    "Counter store timed out, rate limiter running in degraded local mode"
                );
                metrics::record_rate_limiter_degraded(self.name);
                LimiterMode::Local
            }
        }
    }

    async fn degrade(&self, error: &redis::RedisError) {
        let mut mode = self.mode.write().await;
        if *mode == Some(LimiterMode::Distributed) {
            warn!(
                limiter = self.name,
                error = %error,
                "Counter store failed, rate limiter degraded to local mode"
            );
            metrics::record_rate_limiter_degraded(self.name);
            *mode = Some(LimiterMode::Local);
        }
    }

    async fn check_distributed(&self, key: &str) -> redis::RedisResult<RateDecision> {
        let broker = self.broker.as_ref().ok_or_else(broker_closed)?;
        let mut conn = broker.connection().await.ok_or_else(broker_closed)?;

        let now_ms = chrono::Utc::now().timestamp_millis();
        let member = format!("{}-{}", now_ms, Uuid::new_v4().simple());
        let mut invocation = SLIDING_WINDOW_SCRIPT.prepare_invoke();
        invocation
            .key(format!("reel:ratelimit:{}:{}", self.name, key))
            .arg(now_ms)
            .arg(self.window.as_millis() as u64)
            .arg(self.max)
            .arg(member);

        let (admitted, count, retry_ms): (i64, i64, i64) =
            tokio::time::timeout(BROKER_TIMEOUT, invocation.invoke_async(&mut conn))
                .await
                .map_err(|_| {
                    redis::RedisError::from((redis::ErrorKind::IoError, "rate limit script timed out"))
                })??;

        Ok(RateDecision {
            allowed: admitted == 1,
            count: count.max(0) as u64,
            limit: self.max,
            retry_after: Duration::from_millis(retry_ms.max(0) as u64),
        })
    }
}

fn broker_closed() -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::IoError, "broker connection closed"))
}

/// In-process sliding-window log.
#[derive(Default)]
struct LocalWindows {
    entries: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl LocalWindows {
    fn check(&self, key: &str, window: Duration, max: u64, now: Instant) -> RateDecision {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if entries.len() >= MAX_TRACKED_KEYS && !entries.contains_key(key) {
            entries.retain(|_, hits| {
                hits.back()
                    .is_some_and(|last| now.saturating_duration_since(*last) < window)
            });
        }

        let hits = entries.entry(key.to_string()).or_default();
        while let Some(oldest) = hits.front() {
            if now.saturating_duration_since(*oldest) >= window {
                hits.pop_front();
            } else {
                break;
            }
        }

        if (hits.len() as u64) < max {
            hits.push_back(now);
            return RateDecision {
                allowed: true,
                count: hits.len() as u64,
                limit: max,
                retry_after: Duration::ZERO,
            };
        }

        let retry_after = hits
            .front()
            .map(|oldest| window.saturating_sub(now.saturating_duration_since(*oldest)))
            .unwrap_or(window);

        RateDecision {
            allowed: false,
            count: hits.len() as u64,
            limit: max,
            retry_after,
        }
    }
}

/// General per-IP limit for every non-exempt request.
pub async fn rate_limit(
    State(admission): State<Arc<Admission>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    if is_exempt(request.uri().path()) {
        return next.run(request).await;
    }
    enforce(&admission.general, request, next).await
}

/// Stricter per-IP limit for sensitive endpoints, on top of the general one.
pub async fn strict_rate_limit(
    State(admission): State<Arc<Admission>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    enforce(&admission.strict, request, next).await
}

async fn enforce(limiter: &SlidingWindowLimiter, request: Request<Body>, next: Next) -> Response<Body> {
    let ip = client_ip(&request);
    let key = match (ip.0, request.extensions().get::<Fingerprint>()) {
        (Some(addr), _) => format!("ip:{}", addr),
        (None, Some(fp)) => format!("fp:{}", fp.0),
        (None, None) => "ip:unknown".to_string(),
    };

    let decision = limiter.check(&key).await;
    if !decision.allowed {
        warn!(
            ip = %ip,
            limiter = limiter.name(),
            path = %request.uri().path(),
            count = decision.count,
            limit = decision.limit,
            "Rate limit exceeded"
        );
        metrics::record_rate_limit_hit(limiter.name());
        return ApiError::RateLimited {
            retry_after_secs: decision.retry_after_secs(),
        }
        .into_response();
    }

    next.run(request).await
}
