//! Client fingerprinting.

use std::net::{IpAddr, SocketAddr};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, HeaderName, Request, Response};
use axum::middleware::Next;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{ClientIp, Fingerprint};

/// SHA-256 of `address|user_agent|accept_language`, hex encoded.
///
/// Used as a rate-limit key and in anomaly logs, never as an identity.
pub fn compute_fingerprint(address: &str, user_agent: &str, accept_language: &str) -> String {
    let digest = Sha256::new()
        .chain_update(address.as_bytes())
        .chain_update(b"|")
        .chain_update(user_agent.as_bytes())
        .chain_update(b"|")
        .chain_update(accept_language.as_bytes())
        .finalize();

    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Attach [`ClientIp`] and [`Fingerprint`] to the request.
pub async fn fingerprint(mut request: Request<Body>, next: Next) -> Response<Body> {
    let ip = ClientIp(extract_client_ip(&request));
    let hash = compute_fingerprint(
        &ip.to_string(),
        header_str(&request, header::USER_AGENT),
        header_str(&request, header::ACCEPT_LANGUAGE),
    );
    let short = &hash[..16];
    debug!(ip = %ip, fingerprint = %short, "Request fingerprinted");

    request.extensions_mut().insert(ip);
    request.extensions_mut().insert(Fingerprint(hash));

    next.run(request).await
}

fn header_str(request: &Request<Body>, name: HeaderName) -> &str {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Extract client IP from request headers or connection info.
pub fn extract_client_ip(request: &Request<Body>) -> Option<IpAddr> {
    // Try X-Forwarded-For header first (for proxied requests)
    if let Some(forwarded) = request.headers().get("X-Forwarded-For") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            // Take the first IP in the chain (original client)
            if let Some(first_ip) = forwarded_str.split(',').next() {
                if let Ok(ip) = first_ip.trim().parse() {
                    return Some(ip);
                }
            }
        }
    }

    if let Some(real_ip) = request.headers().get("X-Real-IP") {
        if let Ok(ip_str) = real_ip.to_str() {
            if let Ok(ip) = ip_str.trim().parse() {
                return Some(ip);
            }
        }
    }

    // Requires the router to be served with connect info
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
}
