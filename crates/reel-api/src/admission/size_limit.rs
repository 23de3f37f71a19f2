//! Payload-size cap.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{header, Request, Response};
use axum::middleware::Next;
use axum::response::IntoResponse;
use tracing::warn;

use super::{client_ip, Admission};
use crate::error::ApiError;
use crate::metrics;

/// Declared length of the request body, if any.
pub fn declared_length(request: &Request<Body>) -> Option<u64> {
    request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

/// Reject bodies larger than `max_body_bytes` with 413.
///
/// A declared `Content-Length` is checked up front; a body without one is
/// buffered up to the limit.
pub async fn size_limit(
    State(admission): State<Arc<Admission>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let limit = admission.config.max_body_bytes;

    match declared_length(&request) {
        Some(declared) if declared > limit => {
            warn!(
                ip = %client_ip(&request),
                declared,
                limit,
                "Rejected oversized request body"
            );
            reject(limit)
        }
        Some(_) => next.run(request).await,
        None => {
            let ip = client_ip(&request);
            let (parts, body) = request.into_parts();
            match to_bytes(body, usize::try_from(limit).unwrap_or(usize::MAX)).await {
                Ok(bytes) => next.run(Request::from_parts(parts, Body::from(bytes))).await,
                Err(e) => {
                    warn!(ip = %ip, limit, error = %e, "Rejected undeclared request body");
                    reject(limit)
                }
            }
        }
    }
}

fn reject(limit: u64) -> Response<Body> {
    let error = ApiError::PayloadTooLarge { limit_bytes: limit };
    metrics::record_admission_rejection(error.code());
    error.into_response()
}
