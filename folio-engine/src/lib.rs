//! folio-engine library interface
//!
//! Exposes the public modules for integration testing: the HTTP API, the
//! queue backends, the workflow worker and the compilation pipeline.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod queue;
pub mod services;
pub mod types;
pub mod validators;
pub mod workflow;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::config::Settings;
use crate::queue::QueueAdapter;
use crate::services::Dispatcher;
use crate::workflow::WorkflowWorker;
use folio_common::EventBus;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Resolved configuration
    pub settings: Arc<Settings>,
    /// Job queue backend; None when dispatch is queueless
    pub queue: Option<Arc<dyn QueueAdapter>>,
    /// Workflow worker for locally run executions
    pub worker: Arc<WorkflowWorker>,
    /// Execution dispatch (queue, remote worker, or local task)
    pub dispatcher: Arc<Dispatcher>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        settings: Arc<Settings>,
        queue: Option<Arc<dyn QueueAdapter>>,
        worker: Arc<WorkflowWorker>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            db,
            event_bus,
            settings,
            queue,
            worker,
            dispatcher,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;
    use tower_http::cors::CorsLayer;

    Router::new()
        .merge(api::execution_routes())
        .route(
            "/executions/:execution_id/events",
            get(api::execution_event_stream),
        )
        .merge(api::queue_routes())
        .merge(api::internal_routes())
        .merge(api::health_routes())
        .with_state(state)
        // Enable CORS for browser clients
        .layer(CorsLayer::permissive())
}
