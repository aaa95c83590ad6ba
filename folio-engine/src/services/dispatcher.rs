//! Execution dispatch
//!
//! One entry point decides how an accepted execution reaches a worker:
//! through the job queue when one is configured, over the internal worker
//! transport when a worker URL is set, or on a spawned task in this process
//! otherwise. Every path is fire-and-forget from the caller's point of view;
//! the HTTP response never waits for generation.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{error, info, warn};
use uuid::Uuid;

use folio_common::{Error, Result};

use crate::config::Settings;
use crate::db;
use crate::models::{ExecutionOptions, GraphEdge, GraphNode};
use crate::queue::{EnqueueOptions, QueueAdapter};
use crate::workflow::{WorkflowWorker, EXECUTION_JOB_TYPE};

/// Shared-secret header on the internal worker transport
pub const INTERNAL_TOKEN_HEADER: &str = "X-Internal-Token";

/// Internal worker transport request body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkerDispatch {
    execution_id: Uuid,
    workflow: DispatchWorkflow,
    inputs: String,
    options: ExecutionOptions,
}

#[derive(Debug, Serialize)]
struct DispatchWorkflow {
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
}

/// Routes accepted executions to whichever worker path is configured
pub struct Dispatcher {
    db: SqlitePool,
    queue: Option<Arc<dyn QueueAdapter>>,
    worker: Arc<WorkflowWorker>,
    http: reqwest::Client,
    worker_url: Option<String>,
    internal_token: Option<String>,
    attempts: u32,
    backoff_ms: u64,
}

impl Dispatcher {
    pub fn new(
        db: SqlitePool,
        queue: Option<Arc<dyn QueueAdapter>>,
        worker: Arc<WorkflowWorker>,
        settings: &Settings,
    ) -> Self {
        Self {
            db,
            queue,
            worker,
            http: reqwest::Client::new(),
            worker_url: settings.worker_url.clone(),
            internal_token: settings.internal_token.clone(),
            attempts: settings.queue.attempts,
            backoff_ms: settings.queue.backoff_ms,
        }
    }

    /// Hand an execution to a worker; returns once the handoff is recorded
    ///
    /// The job id equals the execution id, which makes re-dispatch of the
    /// same execution a no-op while a job for it is still live.
    pub async fn dispatch(&self, execution_id: Uuid) -> Result<()> {
        if let Some(queue) = &self.queue {
            let job_id = queue
                .enqueue(
                    EXECUTION_JOB_TYPE,
                    json!({ "execution_id": execution_id }),
                    EnqueueOptions {
                        job_id: Some(execution_id.to_string()),
                        attempts: Some(self.attempts),
                        backoff_ms: Some(self.backoff_ms),
                    },
                )
                .await?;
            info!(
                execution_id = %execution_id,
                job_id = %job_id,
                backend = queue.backend_name(),
                "Execution enqueued"
            );
            return Ok(());
        }

        if let Some(worker_url) = &self.worker_url {
            return self.dispatch_remote(execution_id, worker_url).await;
        }

        info!(execution_id = %execution_id, "Execution dispatched to local task");
        let worker = self.worker.clone();
        tokio::spawn(async move {
            // run() already records the failure on the execution row
            if let Err(run_error) = worker.run(execution_id, None).await {
                error!(
                    execution_id = %execution_id,
                    error = %run_error,
                    "Local execution task failed"
                );
            }
        });
        Ok(())
    }

    /// POST the execution to the remote worker, fire-and-forget
    async fn dispatch_remote(&self, execution_id: Uuid, worker_url: &str) -> Result<()> {
        let execution = db::executions::load_execution(&self.db, execution_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("execution {execution_id} not found")))?;

        let body = WorkerDispatch {
            execution_id,
            workflow: DispatchWorkflow {
                nodes: execution.data.nodes,
                edges: execution.data.edges,
            },
            inputs: execution.data.user_input,
            options: execution.data.options,
        };
        let request = self
            .http
            .post(format!("{}/execute", worker_url.trim_end_matches('/')))
            .header(
                INTERNAL_TOKEN_HEADER,
                self.internal_token.clone().unwrap_or_default(),
            )
            .json(&body);

        info!(
            execution_id = %execution_id,
            worker_url = %worker_url,
            "Execution dispatched to remote worker"
        );
        tokio::spawn(async move {
            // Transport failures are logged only; the execution row keeps its
            // running status and a later resume can re-dispatch it
            match request.send().await {
                Ok(response) if !response.status().is_success() => {
                    warn!(
                        execution_id = %execution_id,
                        status = %response.status(),
                        "Remote worker rejected dispatch"
                    );
                }
                Ok(_) => {}
                Err(send_error) => {
                    warn!(
                        execution_id = %execution_id,
                        error = %send_error,
                        "Remote worker dispatch failed"
                    );
                }
            }
        });
        Ok(())
    }
}
