//! Operator endpoints, gated by the admin API key.

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use tracing::info;

use reel_queue::QueueStats;

use crate::admission::LimiterMode;
use crate::error::ApiResult;
use crate::metrics;
use crate::state::AppState;

/// Current queue depth.
pub async fn get_queue_stats(State(state): State<AppState>) -> ApiResult<Json<QueueStats>> {
    let stats = state.queue.stats().await?;
    metrics::set_queue_depth(stats.queued, stats.delayed, stats.dead_lettered);
    Ok(Json(stats))
}

#[derive(Debug, Serialize)]
pub struct LimiterModes {
    pub general: LimiterMode,
    pub strict: LimiterMode,
}

/// Re-check the shared counter store and switch limiter mode if needed.
pub async fn reevaluate_rate_limiter(State(state): State<AppState>) -> Json<LimiterModes> {
    let (general, strict) = state.admission.reevaluate().await;
    info!(general = %general, strict = %strict, "Rate limiter modes re-evaluated by operator");
    Json(LimiterModes { general, strict })
}
