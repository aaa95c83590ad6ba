//! Graph execution: the worker and its queue glue

pub mod worker;

pub use worker::WorkflowWorker;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use folio_common::{Error, Result};

use crate::queue::{JobContext, JobHandler};

/// Job type executions are enqueued under
pub const EXECUTION_JOB_TYPE: &str = "execution";

/// Callback fed the overall completion percentage after every work unit
pub type ProgressSink = Arc<dyn Fn(f64) + Send + Sync>;

/// Queue-side adapter: unwraps the job payload and drives the worker
///
/// Failures propagate to the queue so its backoff policy re-dispatches the
/// job; the worker then continues from the execution checkpoint.
pub struct ExecutionJobHandler {
    worker: Arc<WorkflowWorker>,
}

impl ExecutionJobHandler {
    pub fn new(worker: Arc<WorkflowWorker>) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl JobHandler for ExecutionJobHandler {
    async fn handle(&self, job: JobContext) -> Result<Value> {
        let execution_id = job
            .payload
            .get("execution_id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidInput("job payload missing execution_id".to_string()))?;
        let execution_id = Uuid::parse_str(execution_id)
            .map_err(|e| Error::InvalidInput(format!("malformed execution_id: {e}")))?;

        let sink: ProgressSink = Arc::new(move |percentage: f64| {
            job.update_progress(json!({ "percentage": percentage }));
        });

        self.worker.run(execution_id, Some(sink)).await?;
        Ok(json!({ "execution_id": execution_id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Execution, ExecutionOptions, ExecutionStatus, GraphNode, NodeKind};
    use crate::services::ScriptedGenerator;
    use crate::types::{CompileOptions, ValidationOptions};
    use folio_common::EventBus;
    use sqlx::SqlitePool;

    async fn handler_with_pool() -> (ExecutionJobHandler, SqlitePool) {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        crate::db::init_tables(&pool).await.unwrap();
        let worker = Arc::new(WorkflowWorker::new(
            pool.clone(),
            EventBus::new(16),
            Arc::new(ScriptedGenerator::new(Vec::new())),
            ValidationOptions::default(),
            CompileOptions::default(),
            1,
        ));
        (ExecutionJobHandler::new(worker), pool)
    }

    #[tokio::test]
    async fn test_handler_rejects_payload_without_execution_id() {
        let (handler, _pool) = handler_with_pool().await;
        let (job, _rx) = JobContext::new("job-1".to_string(), json!({}), 1);
        let error = handler.handle(job).await.unwrap_err();
        assert!(error.to_string().contains("execution_id"));
    }

    #[tokio::test]
    async fn test_handler_runs_execution_from_payload() {
        let (handler, pool) = handler_with_pool().await;
        let execution = Execution::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            vec![GraphNode {
                id: "input".to_string(),
                label: "input".to_string(),
                kind: NodeKind::Input,
                prompt: None,
                chapters: None,
            }],
            Vec::new(),
            "premise".to_string(),
            ExecutionOptions::default(),
        );
        crate::db::executions::save_execution(&pool, &execution)
            .await
            .unwrap();

        let (job, _rx) = JobContext::new(
            execution.execution_id.to_string(),
            json!({ "execution_id": execution.execution_id }),
            1,
        );
        handler.handle(job).await.unwrap();

        let finished = crate::db::executions::load_execution(&pool, execution.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(finished.status, ExecutionStatus::Completed);
    }
}
