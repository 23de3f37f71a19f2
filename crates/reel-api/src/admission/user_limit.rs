//! Per-user quotas by tier.
//!
//! Identity comes from `X-User-Id` when present, otherwise from the request
//! fingerprint. Users listed in `PREMIUM_USER_IDS` get the premium hourly
//! quota; everyone else gets the free one.

use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, Response};
use axum::middleware::Next;
use axum::response::IntoResponse;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use tracing::{debug, warn};

use super::{client_ip, Admission, Fingerprint};
use crate::error::ApiError;
use crate::metrics;

pub const USER_ID_HEADER: &str = "x-user-id";

const MAX_USER_ID_LENGTH: usize = 128;

/// Prune idle keys once this many are tracked.
const MAX_TRACKED_USERS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Free,
    Premium,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Premium => "premium",
        }
    }
}

/// Keyed hourly limiters, one per tier.
pub struct UserRateLimiter {
    free: DefaultKeyedRateLimiter<String>,
    premium: DefaultKeyedRateLimiter<String>,
    premium_ids: HashSet<String>,
    clock: DefaultClock,
}

impl UserRateLimiter {
    pub fn new(free_per_hour: u32, premium_per_hour: u32, premium_ids: HashSet<String>) -> Self {
        let quota = |n: u32| Quota::per_hour(NonZeroU32::new(n).unwrap_or(NonZeroU32::MIN));
        Self {
            free: RateLimiter::keyed(quota(free_per_hour)),
            premium: RateLimiter::keyed(quota(premium_per_hour)),
            premium_ids,
            clock: DefaultClock::default(),
        }
    }

    pub fn tier_for(&self, user_id: Option<&str>) -> Tier {
        match user_id {
            Some(id) if self.premium_ids.contains(id) => Tier::Premium,
            _ => Tier::Free,
        }
    }

    /// Count one request; on rejection returns the wait until the next slot.
    pub fn check(&self, key: &str, tier: Tier) -> Result<(), Duration> {
        let limiter = match tier {
            Tier::Free => &self.free,
            Tier::Premium => &self.premium,
        };

        if limiter.len() >= MAX_TRACKED_USERS {
            limiter.retain_recent();
        }

        limiter
            .check_key(&key.to_string())
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }
}

/// Caller-supplied user ID, if well formed.
fn user_id(request: &Request<Body>) -> Option<&str> {
    request
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| {
            !id.is_empty()
                && id.len() <= MAX_USER_ID_LENGTH
                && id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
        })
}

/// Enforce the hourly quota of the caller's tier.
pub async fn user_rate_limit(
    State(admission): State<Arc<Admission>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let user = user_id(&request);
    let tier = admission.users.tier_for(user);
    let key = match (user, request.extensions().get::<Fingerprint>()) {
        (Some(id), _) => format!("user:{}", id),
        (None, Some(fp)) => format!("fp:{}", fp.0),
        (None, None) => format!("ip:{}", client_ip(&request)),
    };

    match admission.users.check(&key, tier) {
        Ok(()) => {
            debug!(tier = tier.as_str(), "User quota check passed");
            next.run(request).await
        }
        Err(wait) => {
            warn!(
                ip = %client_ip(&request),
                tier = tier.as_str(),
                user_id = user.unwrap_or("-"),
                "User rate limit exceeded"
            );
            let error = ApiError::UserRateLimited {
                tier: tier.as_str(),
                retry_after_secs: wait.as_secs().max(1),
            };
            metrics::record_admission_rejection(error.code());
            error.into_response()
        }
    }
}
