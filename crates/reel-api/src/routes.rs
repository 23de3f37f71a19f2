//! API routes.

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::admission::{
    fingerprint, hpp, rate_limit, require_api_key, require_beta_access, sanitize, size_limit,
    strict_rate_limit, user_rate_limit,
};
use crate::handlers::admin::{get_queue_stats, reevaluate_rate_limiter};
use crate::handlers::jobs::{enqueue_job, get_job};
use crate::handlers::{health, ready};
use crate::metrics::metrics_middleware;
use crate::middleware::{cors_layer, request_id, request_logging, security_headers};
use crate::state::AppState;

/// Create the API router.
///
/// Global admission runs in the order fingerprint, rate limit, size limit,
/// sanitize, hpp. Route guards run after it and only on matched routes, so
/// unknown paths still answer 404.
pub fn create_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let admission = state.admission.clone();

    let job_routes = Router::new()
        .route(
            "/jobs",
            post(enqueue_job)
                .layer(middleware::from_fn_with_state(admission.clone(), user_rate_limit))
                .layer(middleware::from_fn_with_state(admission.clone(), strict_rate_limit)),
        )
        .route("/jobs/:job_id", get(get_job))
        .route_layer(middleware::from_fn_with_state(
            admission.clone(),
            require_beta_access,
        ));

    let admin_routes = Router::new()
        .route("/admin/queue", get(get_queue_stats))
        .route("/admin/rate-limit/reevaluate", post(reevaluate_rate_limiter))
        .route_layer(middleware::from_fn_with_state(
            admission.clone(),
            require_api_key,
        ));

    let api_routes = Router::new().merge(job_routes).merge(admin_routes);

    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/ready", get(ready));

    // Metrics endpoint (if enabled)
    let metrics_routes = if let Some(handle) = metrics_handle {
        Router::new().route("/metrics", get(move || async move { handle.render() }))
    } else {
        Router::new()
    };

    Router::new()
        .nest("/api", api_routes)
        .merge(health_routes)
        .merge(metrics_routes)
        // Innermost first: the last layer added sees the request first
        .layer(middleware::from_fn(hpp))
        .layer(middleware::from_fn_with_state(admission.clone(), sanitize))
        .layer(middleware::from_fn_with_state(admission.clone(), size_limit))
        .layer(middleware::from_fn_with_state(admission, rate_limit))
        .layer(middleware::from_fn(fingerprint))
        .layer(middleware::from_fn(security_headers))
        .layer(cors_layer(&state.config.cors_origins))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_logging))
        .layer(middleware::from_fn(request_id))
        .with_state(state)
}
