//! Beta-access gate.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, Response};
use axum::middleware::Next;
use axum::response::IntoResponse;
use tracing::warn;

use super::{client_ip, Admission};
use crate::error::ApiError;
use crate::metrics;

pub const BETA_ACCESS_HEADER: &str = "x-beta-access-code";

/// When beta access is enabled, require a configured access code.
pub async fn require_beta_access(
    State(admission): State<Arc<Admission>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    if !admission.config.beta_access_enabled {
        return next.run(request).await;
    }

    let granted = request
        .headers()
        .get(BETA_ACCESS_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .is_some_and(|code| admission.config.beta_access_codes.contains(code));

    if !granted {
        warn!(
            ip = %client_ip(&request),
            path = %request.uri().path(),
            "Beta access denied"
        );
        let error = ApiError::BetaAccessRequired;
        metrics::record_admission_rejection(error.code());
        return error.into_response();
    }

    next.run(request).await
}
