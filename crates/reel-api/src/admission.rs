//! Admission control.
//!
//! Every request passes, in order: fingerprinting, the general rate limit,
//! the payload-size cap, key sanitization and duplicate-parameter
//! neutralization. Route guards (strict rate limit, API key, beta access,
//! per-user quota) sit in front of individual handlers. Each check
//! short-circuits with a structured error on rejection.

pub mod api_key;
pub mod beta;
pub mod fingerprint;
pub mod hpp;
pub mod rate_limit;
pub mod sanitize;
pub mod size_limit;
pub mod user_limit;

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::http::uri::PathAndQuery;
use axum::http::{Request, Uri};

use crate::broker::Broker;
use crate::config::AdmissionConfig;

pub use api_key::require_api_key;
pub use beta::require_beta_access;
pub use fingerprint::{compute_fingerprint, extract_client_ip, fingerprint};
pub use hpp::hpp;
pub use rate_limit::{rate_limit, strict_rate_limit, LimiterMode, RateDecision, SlidingWindowLimiter};
pub use sanitize::sanitize;
pub use size_limit::size_limit;
pub use user_limit::{user_rate_limit, Tier, UserRateLimiter};

/// Paths that bypass the general rate limiter.
pub const EXEMPT_PATHS: &[&str] = &["/health", "/healthz", "/ready", "/metrics"];

pub fn is_exempt(path: &str) -> bool {
    EXEMPT_PATHS.contains(&path)
}

/// Client address attached by the fingerprint middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub Option<IpAddr>);

impl fmt::Display for ClientIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(ip) => write!(f, "{}", ip),
            None => f.write_str("unknown"),
        }
    }
}

/// One-way client hash attached by the fingerprint middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint(pub String);

/// Shared admission state: configuration plus the limiters.
pub struct Admission {
    pub config: AdmissionConfig,
    /// Applied to every non-exempt request
    pub general: SlidingWindowLimiter,
    /// Applied on top of `general` for sensitive endpoints
    pub strict: SlidingWindowLimiter,
    pub users: UserRateLimiter,
}

impl Admission {
    /// Build the limiters. The distributed counter store is checked lazily,
    /// on the first request each limiter sees.
    pub fn new(config: AdmissionConfig, broker: Option<Arc<Broker>>) -> Self {
        let general = SlidingWindowLimiter::new(
            "general",
            config.rate_limit_window,
            config.rate_limit_max,
            broker.clone(),
        );
        let strict = SlidingWindowLimiter::new(
            "strict",
            config.rate_limit_window,
            config.strict_rate_limit_max,
            broker,
        );
        let users = UserRateLimiter::new(
            config.free_requests_per_hour,
            config.premium_requests_per_hour,
            config.premium_user_ids.clone(),
        );

        Self {
            config,
            general,
            strict,
            users,
        }
    }

    /// Re-check the counter store for both IP limiters.
    pub async fn reevaluate(&self) -> (LimiterMode, LimiterMode) {
        let general = self.general.reevaluate().await;
        let strict = self.strict.reevaluate().await;
        (general, strict)
    }
}

/// Client address for logging and keying, falling back to header parsing
/// when the fingerprint middleware has not run.
pub(crate) fn client_ip(request: &Request<Body>) -> ClientIp {
    request
        .extensions()
        .get::<ClientIp>()
        .copied()
        .unwrap_or_else(|| ClientIp(extract_client_ip(request)))
}

/// Replace the query string of `uri`, keeping everything else.
pub(crate) fn with_query(uri: &Uri, query: &str) -> Option<Uri> {
    let path_and_query = if query.is_empty() {
        uri.path().to_string()
    } else {
        format!("{}?{}", uri.path(), query)
    };

    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(PathAndQuery::try_from(path_and_query).ok()?);
    Uri::from_parts(parts).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exempt_paths() {
        assert!(is_exempt("/health"));
        assert!(is_exempt("/metrics"));
        assert!(!is_exempt("/api/jobs"));
        assert!(!is_exempt("/health/extra"));
    }

    #[test]
    fn test_with_query() {
        let uri: Uri = "/api/jobs?a=1&a=2".parse().unwrap();
        assert_eq!(with_query(&uri, "a=2").unwrap(), "/api/jobs?a=2");
        assert_eq!(with_query(&uri, "").unwrap(), "/api/jobs");

        let absolute: Uri = "http://example.test/api/jobs?x=1".parse().unwrap();
        assert_eq!(
            with_query(&absolute, "y=2").unwrap().to_string(),
            "http://example.test/api/jobs?y=2"
        );
    }

    #[test]
    fn test_client_ip_display() {
        assert_eq!(ClientIp(None).to_string(), "unknown");
        assert_eq!(
            ClientIp(Some("10.1.2.3".parse().unwrap())).to_string(),
            "10.1.2.3"
        );
    }
}
