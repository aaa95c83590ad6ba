//! Execution lifecycle API handlers
//!
//! POST /engines/:engine_id/execute, GET /executions/:execution_id,
//! POST /executions/:execution_id/stop, POST /engines/:engine_id/resume
//!
//! Every handler resolves the caller's api key first; no job or execution
//! row is created for a caller that fails entitlement checks.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    db::entitlements::Entitlement,
    error::{ApiError, ApiResult},
    models::{
        CompiledResult, Execution, ExecutionData, ExecutionOptions, ExecutionProgress,
        ExecutionStatus, GraphEdge, GraphNode,
    },
    AppState,
};

/// Caller credential header
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// POST /engines/:engine_id/execute request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub user_input: String,
    #[serde(default)]
    pub options: ExecutionOptions,
}

/// POST /engines/:engine_id/execute and resume response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub status_url: String,
}

/// GET /executions/:execution_id response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStatusResponse {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub execution_data: ExecutionData,
    /// Compiled manuscript, repeated at the top level for convenience
    pub result: Option<CompiledResult>,
    pub metadata: StatusMetadata,
}

/// Progress and usage summary on the status response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMetadata {
    pub progress: ExecutionProgress,
    pub error: Option<String>,
    pub tokens: u64,
    pub words: u64,
}

/// POST /executions/:execution_id/stop response
#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub status: ExecutionStatus,
}

/// POST /engines/:engine_id/resume request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRequest {
    pub execution_id: Uuid,
    /// Accepted for wire compatibility; the persisted graph always wins
    #[serde(default)]
    pub graph: Option<ResumeGraph>,
}

/// Caller's view of the graph on a resume request
#[derive(Debug, Deserialize)]
pub struct ResumeGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

fn api_key(headers: &HeaderMap) -> Option<&str> {
    headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok())
}

/// Resolve the caller for read and stop operations
///
/// Unlike [`crate::db::entitlements::authorize`], this does not check the
/// quota: a caller who exhausted it must still be able to watch and stop
/// runs already in flight.
async fn identify(state: &AppState, headers: &HeaderMap) -> ApiResult<Entitlement> {
    let key = match api_key(headers) {
        Some(key) if !key.trim().is_empty() => key,
        _ => return Err(ApiError::Unauthorized("missing api key".to_string())),
    };
    crate::db::entitlements::lookup_api_key(&state.db, key)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("unknown api key".to_string()))
}

/// Load an execution, enforcing that the caller owns it
async fn load_owned(
    state: &AppState,
    execution_id: Uuid,
    user_id: Uuid,
) -> ApiResult<Execution> {
    let execution = crate::db::executions::load_execution(&state.db, execution_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Execution not found: {}", execution_id)))?;
    if execution.user_id != user_id {
        return Err(ApiError::Forbidden(
            "execution belongs to another user".to_string(),
        ));
    }
    Ok(execution)
}

/// POST /engines/:engine_id/execute
///
/// Accept one run of the engine's graph. Returns 202 with the execution id;
/// generation happens on a worker after this response is sent.
pub async fn execute_engine(
    State(state): State<AppState>,
    Path(engine_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<ExecuteRequest>,
) -> ApiResult<(StatusCode, Json<ExecuteResponse>)> {
    let entitlement = crate::db::entitlements::authorize(&state.db, api_key(&headers)).await?;

    if request.user_input.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "userInput must not be empty".to_string(),
        ));
    }

    let engine = crate::db::engines::load_engine(&state.db, engine_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Engine not found: {}", engine_id)))?;

    let execution = Execution::new(
        engine_id,
        entitlement.user_id,
        engine.graph.nodes,
        engine.graph.edges,
        request.user_input,
        request.options,
    );
    crate::db::executions::save_execution(&state.db, &execution).await?;
    crate::db::entitlements::record_usage(&state.db, &entitlement.api_key).await?;

    tracing::info!(
        execution_id = %execution.execution_id,
        engine_id = %engine_id,
        user_id = %entitlement.user_id,
        "Execution accepted and persisted"
    );

    dispatch_or_fail(&state, execution).await.map(|execution| {
        (
            StatusCode::ACCEPTED,
            Json(ExecuteResponse {
                execution_id: execution.execution_id,
                status: execution.status,
                status_url: format!("/executions/{}", execution.execution_id),
            }),
        )
    })
}

/// GET /executions/:execution_id
///
/// Point-in-time snapshot of one execution. Owner-only.
pub async fn get_execution_status(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Json<ExecutionStatusResponse>> {
    let caller = identify(&state, &headers).await?;
    let execution = load_owned(&state, execution_id, caller.user_id).await?;

    tracing::debug!(
        execution_id = %execution_id,
        status = %execution.status,
        "Status query"
    );

    let response = ExecutionStatusResponse {
        execution_id: execution.execution_id,
        status: execution.status,
        metadata: StatusMetadata {
            progress: execution.data.progress.clone(),
            error: execution.data.error.clone(),
            tokens: execution.data.tokens_used,
            words: execution.data.words_used,
        },
        result: execution.data.result.clone(),
        execution_data: execution.data,
    };
    Ok(Json(response))
}

/// POST /executions/:execution_id/stop
///
/// Request cooperative cancellation. A worker observes the flag at the next
/// node or chapter boundary; a generation call already in flight finishes
/// first. Work accepted before the stop stays checkpointed.
pub async fn stop_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Json<StopResponse>> {
    let caller = identify(&state, &headers).await?;
    let mut execution = load_owned(&state, execution_id, caller.user_id).await?;

    if execution.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "Execution already {}",
            execution.status
        )));
    }

    crate::db::executions::request_cancel(&state.db, execution_id).await?;

    if let Some(queue) = &state.queue {
        // Best-effort: a waiting job is removed, an active one keeps running
        // until the worker observes the flag
        if let Err(e) = queue.cancel(&execution_id.to_string()).await {
            tracing::warn!(
                execution_id = %execution_id,
                error = %e,
                "Queue cancel failed"
            );
        }
    }

    execution.transition_to(ExecutionStatus::Cancelled);
    execution.data.progress.current_operation = String::from("Cancelled");
    crate::db::executions::save_execution(&state.db, &execution).await?;

    state
        .event_bus
        .emit_lossy(folio_common::ExecutionEvent::ExecutionCancelled {
            execution_id,
            timestamp: chrono::Utc::now(),
        });

    tracing::info!(execution_id = %execution_id, "Execution cancellation requested");

    Ok(Json(StopResponse {
        status: ExecutionStatus::Cancelled,
    }))
}

/// POST /engines/:engine_id/resume
///
/// Re-dispatch a cancelled or failed execution. The worker picks up from the
/// persisted checkpoint, so completed nodes and accepted chapters are not
/// regenerated.
pub async fn resume_engine(
    State(state): State<AppState>,
    Path(engine_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<ResumeRequest>,
) -> ApiResult<(StatusCode, Json<ExecuteResponse>)> {
    let entitlement = crate::db::entitlements::authorize(&state.db, api_key(&headers)).await?;
    let mut execution = load_owned(&state, request.execution_id, entitlement.user_id).await?;

    if execution.engine_id != engine_id {
        return Err(ApiError::BadRequest(format!(
            "Execution {} does not belong to engine {}",
            request.execution_id, engine_id
        )));
    }
    if !execution.is_resumable() {
        return Err(ApiError::Conflict(format!(
            "Execution is {}; only cancelled or failed executions can be resumed",
            execution.status
        )));
    }

    // The persisted graph wins on resume; a caller-supplied graph is only
    // checked so a stale client can be spotted in the logs
    if let Some(graph) = &request.graph {
        if graph.nodes != execution.data.nodes || graph.edges != execution.data.edges {
            tracing::warn!(
                execution_id = %execution.execution_id,
                "Resume request graph differs from the persisted graph; using the persisted one"
            );
        }
    }

    crate::db::executions::clear_cancel(&state.db, execution.execution_id).await?;
    execution.cancel_requested = false;
    execution.transition_to(ExecutionStatus::Queued);
    execution.data.progress.current_operation = String::from("Queued for resume");
    crate::db::executions::save_execution(&state.db, &execution).await?;

    tracing::info!(
        execution_id = %execution.execution_id,
        completed_nodes = execution.data.checkpoint.completed_nodes.len(),
        partial_chapters = execution.data.checkpoint.partial_chapters.len(),
        "Execution resume accepted"
    );

    dispatch_or_fail(&state, execution).await.map(|execution| {
        (
            StatusCode::ACCEPTED,
            Json(ExecuteResponse {
                execution_id: execution.execution_id,
                status: execution.status,
                status_url: format!("/executions/{}", execution.execution_id),
            }),
        )
    })
}

/// Dispatch, marking the execution failed when the handoff itself fails so
/// the row never sticks in a live status with no worker coming
async fn dispatch_or_fail(state: &AppState, mut execution: Execution) -> ApiResult<Execution> {
    match state.dispatcher.dispatch(execution.execution_id).await {
        Ok(()) => Ok(execution),
        Err(dispatch_error) => {
            tracing::error!(
                execution_id = %execution.execution_id,
                error = %dispatch_error,
                "Dispatch failed; marking execution failed"
            );
            execution.record_error(format!("dispatch failed: {}", dispatch_error));
            execution.transition_to(ExecutionStatus::Failed);
            crate::db::executions::save_execution(&state.db, &execution).await?;
            Err(dispatch_error.into())
        }
    }
}

/// Build execution lifecycle routes
pub fn execution_routes() -> Router<AppState> {
    Router::new()
        .route("/engines/:engine_id/execute", post(execute_engine))
        .route("/engines/:engine_id/resume", post(resume_engine))
        .route("/executions/:execution_id", get(get_execution_status))
        .route("/executions/:execution_id/stop", post(stop_execution))
}
