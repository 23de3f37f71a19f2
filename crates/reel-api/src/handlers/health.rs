//! Health check handlers.

use std::future::Future;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::lifecycle::LifecycleState;
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: String,
}

/// Liveness check; answers as long as the process can serve HTTP.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now().to_rfc3339(),
    })
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub lifecycle: LifecycleState,
    pub checks: ReadinessChecks,
}

#[derive(Serialize)]
pub struct ReadinessChecks {
    /// Absent when no broker is configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker: Option<CheckStatus>,
    pub store: CheckStatus,
    pub queue: CheckStatus,
}

/// Outcome of one dependency check.
#[derive(Serialize)]
pub struct CheckStatus {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl CheckStatus {
    fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Time a dependency check and fold its result into a [`CheckStatus`].
async fn timed_check<T, E: std::fmt::Display>(check: impl Future<Output = Result<T, E>>) -> CheckStatus {
    let started = Instant::now();
    match check.await {
        Ok(_) => CheckStatus {
            status: "ok",
            error: None,
            latency_ms: Some(started.elapsed().as_millis() as u64),
        },
        Err(e) => CheckStatus {
            status: "error",
            error: Some(e.to_string()),
            latency_ms: None,
        },
    }
}

/// Readiness check.
///
/// 200 only while listening with every dependency reachable; 503 otherwise,
/// with the same body so operators can see which check failed.
pub async fn ready(
    State(state): State<AppState>,
) -> Result<Json<ReadinessResponse>, (StatusCode, Json<ReadinessResponse>)> {
    let lifecycle = state.lifecycle.state();

    let broker = match &state.broker {
        Some(broker) => Some(timed_check(broker.ping()).await),
        None => None,
    };
    let store = timed_check(state.store.health_check()).await;
    let queue = timed_check(state.queue.stats()).await;

    let healthy = store.is_ok() && queue.is_ok() && broker.as_ref().map_or(true, CheckStatus::is_ok);
    let status = match (lifecycle.is_ready(), healthy) {
        (true, true) => "ready",
        (true, false) => "degraded",
        _ if lifecycle >= LifecycleState::Draining => "draining",
        _ => "starting",
    };

    let response = Json(ReadinessResponse {
        status,
        lifecycle,
        checks: ReadinessChecks {
            broker,
            store,
            queue,
        },
    });

    if status == "ready" {
        Ok(response)
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, response))
    }
}
