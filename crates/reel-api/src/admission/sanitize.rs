//! Document-store operator sanitization.
//!
//! `$` and `.` in input keys could be read as query operators or field
//! paths by the document store. They are rewritten to `_` in query-string
//! keys and, recursively, in JSON object keys.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Request, Response};
use axum::middleware::Next;
use axum::response::IntoResponse;
use serde_json::Value;
use tracing::warn;

use super::{client_ip, with_query, Admission};
use crate::error::ApiError;
use crate::metrics;

const PLACEHOLDER: char = '_';

fn is_operator_char(c: char) -> bool {
    c == '$' || c == '.'
}

/// Rewritten key, or `None` when the key is already safe.
pub fn sanitize_key(key: &str) -> Option<String> {
    if !key.chars().any(is_operator_char) {
        return None;
    }
    Some(
        key.chars()
            .map(|c| if is_operator_char(c) { PLACEHOLDER } else { c })
            .collect(),
    )
}

/// Rewrite object keys in place, recording each original key.
pub fn sanitize_json(value: &mut Value, rewritten: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            let entries = std::mem::take(map);
            for (key, mut child) in entries {
                sanitize_json(&mut child, rewritten);
                let key = match sanitize_key(&key) {
                    Some(safe) => {
                        rewritten.push(key);
                        safe
                    }
                    None => key,
                };
                map.insert(key, child);
            }
        }
        Value::Array(items) => {
            for item in items {
                sanitize_json(item, rewritten);
            }
        }
        _ => {}
    }
}

/// Rewrite query-string keys, returning the new query when anything changed.
pub fn sanitize_query(query: &str, rewritten: &mut Vec<String>) -> Option<String> {
    let before = rewritten.len();
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .map(|(key, value)| {
            let key = match sanitize_key(&key) {
                Some(safe) => {
                    rewritten.push(key.into_owned());
                    safe
                }
                None => key.into_owned(),
            };
            (key, value.into_owned())
        })
        .collect();

    if rewritten.len() == before {
        return None;
    }

    Some(
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish(),
    )
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| {
            let ct = ct.to_ascii_lowercase();
            ct.starts_with("application/json") || ct.contains("+json")
        })
        .unwrap_or(false)
}

/// Sanitize query and JSON body keys, logging every rewrite.
pub async fn sanitize(
    State(admission): State<Arc<Admission>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let ip = client_ip(&request);
    let (mut parts, body) = request.into_parts();
    let mut query_keys = Vec::new();
    let mut body_keys = Vec::new();

    if let Some(query) = parts.uri.query() {
        if let Some(safe) = sanitize_query(query, &mut query_keys) {
            if let Some(uri) = with_query(&parts.uri, &safe) {
                parts.uri = uri;
            }
        }
    }

    let body = if is_json(&parts.headers) {
        let limit = usize::try_from(admission.config.max_body_bytes).unwrap_or(usize::MAX);
        let bytes = match to_bytes(body, limit).await {
            Ok(bytes) => bytes,
            Err(_) => {
                return ApiError::PayloadTooLarge {
                    limit_bytes: admission.config.max_body_bytes,
                }
                .into_response()
            }
        };

        // Malformed JSON is left for the handler to reject
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(mut value) => {
                sanitize_json(&mut value, &mut body_keys);
                if body_keys.is_empty() {
                    Body::from(bytes)
                } else {
                    match serde_json::to_vec(&value) {
                        Ok(rewritten) => {
                            parts
                                .headers
                                .insert(header::CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
                            Body::from(rewritten)
                        }
                        Err(_) => Body::from(bytes),
                    }
                }
            }
            Err(_) => Body::from(bytes),
        }
    } else {
        body
    };

    for key in &query_keys {
        warn!(ip = %ip, key = %key, source = "query", "Sanitized operator characters in input key");
        metrics::record_sanitized_key("query");
    }
    for key in &body_keys {
        warn!(ip = %ip, key = %key, source = "body", "Sanitized operator characters in input key");
        metrics::record_sanitized_key("body");
    }

    next.run(Request::from_parts(parts, body)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("url"), None);
        assert_eq!(sanitize_key("$where").as_deref(), Some("_where"));
        assert_eq!(sanitize_key("a.b.$gt").as_deref(), Some("a_b__gt"));
    }

    #[test]
    fn test_sanitize_nested_json() {
        let mut value = json!({
            "url": "https://www.instagram.com/reel/abc",
            "filter": { "$ne": null, "nested.path": [ { "$gt": 1 } ] },
        });
        let mut rewritten = Vec::new();
        sanitize_json(&mut value, &mut rewritten);

        assert_eq!(
            value,
            json!({
                "url": "https://www.instagram.com/reel/abc",
                "filter": { "_ne": null, "nested_path": [ { "_gt": 1 } ] },
            })
        );
        rewritten.sort();
        assert_eq!(rewritten, vec!["$gt", "$ne", "nested.path"]);
    }

    #[test]
    fn test_values_are_left_alone() {
        let mut value = json!({ "url": "https://www.tiktok.com/@a.b/video/1?$x=1" });
        let original = value.clone();
        let mut rewritten = Vec::new();
        sanitize_json(&mut value, &mut rewritten);
        assert_eq!(value, original);
        assert!(rewritten.is_empty());
    }

    #[test]
    fn test_sanitize_query() {
        let mut rewritten = Vec::new();
        assert_eq!(sanitize_query("status=queued&limit=5", &mut rewritten), None);

        let safe = sanitize_query("status%5B%24ne%5D=x&a.b=1", &mut rewritten).unwrap();
        assert_eq!(safe, "status%5B_ne%5D=x&a_b=1");
        assert_eq!(rewritten, vec!["status[$ne]", "a.b"]);
    }
}
