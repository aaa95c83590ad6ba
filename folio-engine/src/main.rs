//! folio-engine - Book Generation Orchestrator
//!
//! Runs engine graphs of AI generation steps and compiles their outputs
//! into validated, deduplicated manuscripts. One process serves the HTTP
//! API, the queue consumer and the workflow worker; with the Redis backend
//! several processes share the broker and fan the work out.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use folio_common::EventBus;
use folio_engine::config::{QueueProvider, Settings};
use folio_engine::queue::{MemoryQueue, QueueAdapter, RedisQueue, RetryPolicy};
use folio_engine::services::{Dispatcher, Generator, HttpGenerator};
use folio_engine::workflow::{ExecutionJobHandler, WorkflowWorker, EXECUTION_JOB_TYPE};
use folio_engine::AppState;

/// Redis job lock lifetime; locks are renewed at half this interval
const REDIS_LOCK_TTL_MS: u64 = 30_000;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting folio-engine (Book Generation Orchestrator)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let settings = Arc::new(Settings::load()?);

    let db_path = settings.database_path();
    info!("Database: {}", db_path.display());
    let db_pool = folio_engine::db::init_database_pool(&db_path).await?;
    info!("Database connection established");

    // Event bus for SSE broadcasting
    let event_bus = EventBus::new(100);
    info!("Event bus initialized");

    let generator: Arc<dyn Generator> = Arc::new(HttpGenerator::new(&settings.generator)?);
    info!(generator = generator.name(), "Generation client ready");

    let worker = Arc::new(WorkflowWorker::new(
        db_pool.clone(),
        event_bus.clone(),
        generator,
        settings.validation.clone(),
        settings.compile.clone(),
        settings.generation_attempts,
    ));

    let queue = init_queue(&settings, &db_pool, worker.clone()).await?;

    let dispatcher = Arc::new(Dispatcher::new(
        db_pool.clone(),
        queue.clone(),
        worker.clone(),
        &settings,
    ));

    let state = AppState::new(
        db_pool,
        event_bus,
        settings.clone(),
        queue,
        worker,
        dispatcher,
    );
    let app = folio_engine::build_router(state);

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!("Listening on http://{}", settings.bind_addr);
    info!("Health check: http://{}/health", settings.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Construct the configured queue backend and start its consumer
///
/// A requested Redis backend that cannot be reached aborts startup; the
/// process never silently degrades to the in-process queue.
async fn init_queue(
    settings: &Settings,
    db_pool: &sqlx::SqlitePool,
    worker: Arc<WorkflowWorker>,
) -> Result<Option<Arc<dyn QueueAdapter>>> {
    if !settings.queue.enabled {
        info!("Queue disabled; executions dispatch directly");
        return Ok(None);
    }

    let policy = RetryPolicy::new(settings.queue.attempts, settings.queue.backoff_ms);
    let queue: Arc<dyn QueueAdapter> = match settings.queue.provider {
        QueueProvider::Redis => {
            let queue = RedisQueue::connect(
                &settings.queue.redis_url,
                &settings.queue.prefix,
                policy,
                REDIS_LOCK_TTL_MS,
            )
            .await
            .map_err(|e| anyhow::anyhow!("Redis queue backend unavailable: {}", e))?;
            info!(redis_url = %settings.queue.redis_url, "Redis queue backend connected");
            Arc::new(queue)
        }
        QueueProvider::InProcess => {
            // In-process jobs died with the previous process, so any
            // execution still marked live will never progress; fail it so
            // the owner can resume from its checkpoint. The durable backend
            // keeps its jobs across restarts and skips this sweep.
            let reconciled = folio_engine::db::executions::reconcile_interrupted(db_pool).await?;
            if reconciled > 0 {
                info!(count = reconciled, "Reconciled interrupted executions");
            }
            info!("In-process queue backend selected");
            Arc::new(MemoryQueue::new(policy))
        }
    };

    queue
        .process(
            EXECUTION_JOB_TYPE,
            Arc::new(ExecutionJobHandler::new(worker)),
            settings.queue.concurrency,
        )
        .await?;
    info!(
        backend = queue.backend_name(),
        concurrency = settings.queue.concurrency,
        "Queue consumer started"
    );

    Ok(Some(queue))
}
