//! Internal worker transport
//!
//! POST /internal/execute receives fire-and-forget dispatches from an
//! orchestrator peer running with `WORKER_URL` pointed here. The shared
//! secret header gates it; no user credential exists on this path.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::services::dispatcher::INTERNAL_TOKEN_HEADER;
use crate::AppState;

/// POST /internal/execute request
///
/// Mirrors the dispatcher's wire body. Only the execution id is acted on;
/// the workflow and inputs ride along for debugging the transport.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalExecuteRequest {
    pub execution_id: Uuid,
    #[serde(default)]
    pub workflow: Option<Value>,
    #[serde(default)]
    pub inputs: Option<String>,
    #[serde(default)]
    pub options: Option<Value>,
}

/// POST /internal/execute
///
/// Run the referenced execution on this process's worker. Replies as soon
/// as the task is spawned; the sender never waits for generation.
pub async fn internal_execute(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<InternalExecuteRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let expected = state
        .settings
        .internal_token
        .as_deref()
        .ok_or_else(|| ApiError::Forbidden("internal transport is not enabled".to_string()))?;
    let presented = headers
        .get(INTERNAL_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented != expected {
        return Err(ApiError::Unauthorized(
            "invalid internal token".to_string(),
        ));
    }

    tracing::info!(execution_id = %request.execution_id, "Internal dispatch received");

    let worker = state.worker.clone();
    let execution_id = request.execution_id;
    tokio::spawn(async move {
        // run() records the failure on the execution row itself
        if let Err(e) = worker.run(execution_id, None).await {
            tracing::error!(
                execution_id = %execution_id,
                error = %e,
                "Dispatched execution failed"
            );
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "executionId": request.execution_id })),
    ))
}

/// Build internal transport routes
pub fn internal_routes() -> Router<AppState> {
    Router::new().route("/internal/execute", post(internal_execute))
}
