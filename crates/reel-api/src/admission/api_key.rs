//! API-key gate for protected routes.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, Response};
use axum::middleware::Next;
use axum::response::IntoResponse;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{error, warn};

use super::{client_ip, Admission};
use crate::error::ApiError;
use crate::metrics;

type HmacSha256 = Hmac<Sha256>;

pub const API_KEY_HEADER: &str = "x-api-key";

const COMPARE_CONTEXT: &[u8] = b"reel-admin-api-key";

/// Constant-time key comparison.
///
/// Both keys are MACed and the tags compared with `verify_slice`, so
/// neither content nor length leaks through timing.
pub fn keys_match(provided: &str, expected: &str) -> bool {
    let tag = |key: &str| {
        // HMAC accepts keys of any length
        HmacSha256::new_from_slice(key.as_bytes()).map(|mut mac| {
            mac.update(COMPARE_CONTEXT);
            mac
        })
    };

    match (tag(provided), tag(expected)) {
        (Ok(provided), Ok(expected)) => {
            let expected = expected.finalize().into_bytes();
            provided.verify_slice(&expected).is_ok()
        }
        _ => false,
    }
}

/// Require `X-API-Key` to match `ADMIN_API_KEY`.
///
/// With no key configured, production rejects every request with 500
/// while other environments log and let the request through.
pub async fn require_api_key(
    State(admission): State<Arc<Admission>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let ip = client_ip(&request);
    let path = request.uri().path().to_string();

    let Some(expected) = admission.config.admin_api_key.as_deref() else {
        if admission.config.production {
            error!(ip = %ip, path = %path, "ADMIN_API_KEY is not configured, rejecting protected request");
            let error = ApiError::Misconfigured("admin API key not configured".to_string());
            metrics::record_admission_rejection(error.code());
            return error.into_response();
        }
        warn!(path = %path, "ADMIN_API_KEY is not configured, allowing protected request outside production");
        return next.run(request).await;
    };

    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    let rejection = match provided {
        Some(key) if keys_match(key, expected) => None,
        Some(_) => {
            warn!(ip = %ip, path = %path, "Invalid API key");
            Some(ApiError::unauthorized("Invalid API key"))
        }
        None => {
            warn!(ip = %ip, path = %path, "Missing API key");
            Some(ApiError::unauthorized("Missing API key"))
        }
    };

    match rejection {
        None => next.run(request).await,
        Some(error) => {
            metrics::record_admission_rejection(error.code());
            error.into_response()
        }
    }
}
