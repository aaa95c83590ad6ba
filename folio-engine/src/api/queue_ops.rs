//! Queue visibility and recovery endpoints

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::queue::JobCounts;
use crate::AppState;

/// GET /queue/stats response
#[derive(Debug, Serialize)]
pub struct QueueStatsResponse {
    pub backend: &'static str,
    pub counts: JobCounts,
}

/// GET /queue/stats
///
/// Per-state job totals for the configured backend.
pub async fn queue_stats(State(state): State<AppState>) -> ApiResult<Json<QueueStatsResponse>> {
    let queue = state
        .queue
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("no queue backend is configured".to_string()))?;
    let counts = queue.counts().await?;
    Ok(Json(QueueStatsResponse {
        backend: queue.backend_name(),
        counts,
    }))
}

/// POST /queue/recover
///
/// Operator escape hatch: drop every job record and force-unlock active
/// jobs. Executions keep their checkpoints and can be resumed afterwards.
pub async fn queue_recover(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let queue = state
        .queue
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("no queue backend is configured".to_string()))?;
    queue.obliterate().await?;
    tracing::warn!(
        backend = queue.backend_name(),
        "Queue obliterated by operator request"
    );
    Ok(Json(json!({
        "status": "recovered",
        "backend": queue.backend_name(),
    })))
}

/// Build queue operation routes
pub fn queue_routes() -> Router<AppState> {
    Router::new()
        .route("/queue/stats", get(queue_stats))
        .route("/queue/recover", post(queue_recover))
}
