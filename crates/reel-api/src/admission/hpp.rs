//! HTTP parameter pollution guard.

use std::collections::HashMap;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::middleware::Next;
use tracing::warn;

use super::{client_ip, with_query};

/// Collapse repeated query parameters to their last value.
///
/// Returns the rewritten query (first-occurrence order kept) and the
/// polluted key names, or `None` when no key repeats.
pub fn collapse_duplicates(query: &str) -> Option<(String, Vec<String>)> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut polluted: Vec<String> = Vec::new();

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match index.get(&*key) {
            Some(&i) => {
                pairs[i].1 = value.into_owned();
                if !polluted.iter().any(|k| k.as_str() == &*key) {
                    polluted.push(key.into_owned());
                }
            }
            None => {
                index.insert(key.to_string(), pairs.len());
                pairs.push((key.into_owned(), value.into_owned()));
            }
        }
    }

    if polluted.is_empty() {
        return None;
    }

    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish();
    Some((query, polluted))
}

/// Neutralize duplicate query parameters before handlers see them.
pub async fn hpp(mut request: Request<Body>, next: Next) -> Response<Body> {
    if let Some(query) = request.uri().query() {
        if let Some((query, polluted)) = collapse_duplicates(query) {
            warn!(
                ip = %client_ip(&request),
                keys = ?polluted,
                "Collapsed duplicate query parameters"
            );
            if let Some(uri) = with_query(request.uri(), &query) {
                *request.uri_mut() = uri;
            }
        }
    }

    next.run(request).await
}
