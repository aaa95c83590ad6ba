//! Integration tests for the folio-engine HTTP API
//!
//! Each test drives the real router end to end: requests enter through
//! axum, dispatch lands on an in-memory queue, and a scripted generation
//! backend stands in for the provider. Nothing is mocked below the HTTP
//! boundary.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;
use uuid::Uuid;

use folio_common::EventBus;
use folio_engine::config::{GeneratorSettings, QueueProvider, QueueSettings, Settings};
use folio_engine::db::{self, engines::Engine, entitlements::Entitlement};
use folio_engine::models::{
    EngineGraph, Execution, ExecutionOptions, ExecutionStatus, GraphEdge, GraphNode, NodeKind,
};
use folio_engine::queue::{MemoryQueue, QueueAdapter, RetryPolicy};
use folio_engine::services::{Dispatcher, ScriptedGenerator};
use folio_engine::types::{CompileOptions, ValidationOptions};
use folio_engine::workflow::{ExecutionJobHandler, WorkflowWorker, EXECUTION_JOB_TYPE};
use folio_engine::{build_router, AppState};

const TEST_KEY: &str = "test-key";

/// Everything a test needs to drive the service and inspect its state
struct TestApp {
    app: axum::Router,
    pool: sqlx::SqlitePool,
    generator: Arc<ScriptedGenerator>,
    engine_id: Uuid,
    user_id: Uuid,
}

fn test_settings() -> Settings {
    Settings {
        bind_addr: "127.0.0.1:0".to_string(),
        data_dir: std::path::PathBuf::from("."),
        queue: QueueSettings {
            enabled: true,
            provider: QueueProvider::InProcess,
            redis_url: String::new(),
            prefix: "folio".to_string(),
            concurrency: 2,
            // One job attempt keeps failure tests deterministic; the
            // generation-level retry budget is exercised separately
            attempts: 1,
            backoff_ms: 10,
        },
        worker_url: None,
        internal_token: None,
        generator: GeneratorSettings {
            url: None,
            api_key: None,
            requests_per_second: 100,
        },
        generation_attempts: 1,
        validation: ValidationOptions::default(),
        compile: CompileOptions::default(),
    }
}

fn linear_graph(chapters: u32) -> EngineGraph {
    let node = |id: &str, kind: NodeKind| GraphNode {
        id: id.to_string(),
        label: id.to_string(),
        kind,
        prompt: None,
        chapters: None,
    };
    EngineGraph::new(
        vec![
            node("input", NodeKind::Input),
            GraphNode {
                chapters: Some(chapters),
                ..node("writer", NodeKind::MultiChapterGeneration)
            },
            node("output", NodeKind::Output),
        ],
        vec![
            GraphEdge {
                source: "input".to_string(),
                target: "writer".to_string(),
            },
            GraphEdge {
                source: "writer".to_string(),
                target: "output".to_string(),
            },
        ],
    )
    .expect("linear graph is valid")
}

/// Prose that clears every chapter-grade validation threshold; distinct
/// seeds stay clear of the near-duplicate cutoff while the same seed twice
/// is an exact duplicate
fn chapter_text(seed: &str) -> String {
    let mut text = String::new();
    for index in 0..5 {
        text.push_str(&format!(
            "{seed}gate {index} stood over the {seed}ford {index} in early light. \
             {seed}fire {index} burned beside the {seed}hall {index} all through evening. \
             {seed}path {index} curved past the {seed}stone {index} before full dark.\n\n"
        ));
    }
    text
}

fn chapter_response(seed: &str, tokens: u64) -> Value {
    json!({
        "content": chapter_text(seed),
        "usage": { "total_tokens": tokens }
    })
}

async fn seed_key(
    pool: &sqlx::SqlitePool,
    api_key: &str,
    user_id: Uuid,
    active: bool,
    used: i64,
    quota: Option<i64>,
) {
    db::entitlements::upsert_entitlement(
        pool,
        &Entitlement {
            api_key: api_key.to_string(),
            user_id,
            active,
            executions_used: used,
            execution_quota: quota,
            created_at: chrono::Utc::now(),
        },
    )
    .await
    .expect("Failed to seed entitlement");
}

/// In-memory pool pinned to one connection so the queue consumer and the
/// test see the same database
async fn test_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .expect("Failed to create in-memory database");
    db::init_tables(&pool)
        .await
        .expect("Failed to initialize database schema");
    pool
}

/// Test helper: full application over an in-memory database and queue,
/// one seeded engine, and the given generation script
async fn create_test_app(responses: Vec<Value>, chapters: u32) -> TestApp {
    let pool = test_pool().await;

    let settings = Arc::new(test_settings());
    let event_bus = EventBus::new(100);
    let generator = Arc::new(ScriptedGenerator::new(responses));
    let worker = Arc::new(WorkflowWorker::new(
        pool.clone(),
        event_bus.clone(),
        generator.clone(),
        ValidationOptions::default(),
        CompileOptions::default(),
        settings.generation_attempts,
    ));

    let policy = RetryPolicy::new(settings.queue.attempts, settings.queue.backoff_ms);
    let queue: Arc<dyn QueueAdapter> = Arc::new(MemoryQueue::new(policy));
    queue
        .process(
            EXECUTION_JOB_TYPE,
            Arc::new(ExecutionJobHandler::new(worker.clone())),
            settings.queue.concurrency,
        )
        .await
        .expect("Failed to start queue consumer");

    let dispatcher = Arc::new(Dispatcher::new(
        pool.clone(),
        Some(queue.clone()),
        worker.clone(),
        &settings,
    ));

    let engine_id = Uuid::new_v4();
    db::engines::save_engine(
        &pool,
        &Engine {
            engine_id,
            name: "Novel pipeline".to_string(),
            graph: linear_graph(chapters),
            created_at: chrono::Utc::now(),
        },
    )
    .await
    .expect("Failed to seed engine");

    let user_id = Uuid::new_v4();
    seed_key(&pool, TEST_KEY, user_id, true, 0, Some(100)).await;

    let state = AppState::new(
        pool.clone(),
        event_bus,
        settings,
        Some(queue),
        worker,
        dispatcher,
    );

    TestApp {
        app: build_router(state),
        pool,
        generator,
        engine_id,
        user_id,
    }
}

fn post_json(uri: &str, api_key: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = api_key {
        builder = builder.header("X-Api-Key", key);
    }
    builder
        .body(Body::from(serde_json::to_string(body).unwrap()))
        .unwrap()
}

fn post_empty(uri: &str, api_key: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("X-Api-Key", api_key)
        .body(Body::empty())
        .unwrap()
}

fn get_authed(uri: &str, api_key: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("X-Api-Key", api_key)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

/// Poll the status endpoint until the execution reaches a terminal state
async fn poll_until_terminal(app: &axum::Router, execution_id: &str) -> Value {
    for _ in 0..400 {
        let response = app
            .clone()
            .oneshot(get_authed(&format!("/executions/{execution_id}"), TEST_KEY))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let status = body_json(response).await;
        match status["status"].as_str() {
            Some("completed") | Some("failed") | Some("cancelled") => return status,
            _ => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
    panic!("execution {execution_id} never reached a terminal status");
}

/// Wait until the queue has bookkept the given number of failed jobs
async fn wait_for_failed_jobs(app: &axum::Router, failed: u64) {
    for _ in 0..400 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/queue/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let stats = body_json(response).await;
        if stats["counts"]["failed"].as_u64() == Some(failed) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queue never recorded {failed} failed jobs");
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = create_test_app(Vec::new(), 1).await;

    let response = app
        .app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let health = body_json(response).await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["module"], "folio-engine");
    assert_eq!(health["queue_backend"], "memory");
}

#[tokio::test]
async fn test_execute_compiles_a_deduplicated_manuscript() {
    // Chapter three repeats chapter one verbatim and must be dropped
    let app = create_test_app(
        vec![
            chapter_response("alpha", 100),
            chapter_response("beta", 100),
            chapter_response("alpha", 100),
            chapter_response("delta", 100),
        ],
        4,
    )
    .await;

    let response = app
        .app
        .clone()
        .oneshot(post_json(
            &format!("/engines/{}/execute", app.engine_id),
            Some(TEST_KEY),
            &json!({ "userInput": "A survey expedition maps a drowned river valley" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let accepted = body_json(response).await;
    let execution_id = accepted["executionId"].as_str().unwrap().to_string();
    assert_eq!(accepted["status"], "running");
    assert_eq!(accepted["statusUrl"], format!("/executions/{execution_id}"));

    let finished = poll_until_terminal(&app.app, &execution_id).await;
    assert_eq!(finished["status"], "completed");
    assert_eq!(finished["metadata"]["error"], Value::Null);
    assert_eq!(finished["metadata"]["tokens"], 400);
    assert_eq!(finished["metadata"]["progress"]["percentage"], 100.0);

    let manuscript = &finished["result"]["manuscript"];
    assert_eq!(manuscript["metadata"]["totalChapters"], 3);
    let numbers: Vec<u64> = manuscript["chapters"]
        .as_array()
        .unwrap()
        .iter()
        .map(|chapter| chapter["number"].as_u64().unwrap())
        .collect();
    assert_eq!(numbers, vec![1, 2, 3]);

    // The compiled result also rides along inside the execution data
    assert_eq!(
        finished["executionData"]["result"]["manuscript"]["metadata"]["totalChapters"],
        3
    );

    let entitlement = db::entitlements::lookup_api_key(&app.pool, TEST_KEY)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entitlement.executions_used, 1);
}

#[tokio::test]
async fn test_execute_requires_a_known_api_key() {
    let app = create_test_app(Vec::new(), 1).await;
    let uri = format!("/engines/{}/execute", app.engine_id);
    let body = json!({ "userInput": "premise" });

    let response = app
        .app
        .clone()
        .oneshot(post_json(&uri, None, &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .app
        .oneshot(post_json(&uri, Some("no-such-key"), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_execute_enforces_entitlement_state() {
    let app = create_test_app(Vec::new(), 1).await;
    let uri = format!("/engines/{}/execute", app.engine_id);
    let body = json!({ "userInput": "premise" });

    seed_key(&app.pool, "inactive-key", Uuid::new_v4(), false, 0, None).await;
    let response = app
        .app
        .clone()
        .oneshot(post_json(&uri, Some("inactive-key"), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    seed_key(&app.pool, "spent-key", Uuid::new_v4(), true, 5, Some(5)).await;
    let response = app
        .app
        .oneshot(post_json(&uri, Some("spent-key"), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_execute_rejects_bad_requests_before_any_side_effect() {
    let app = create_test_app(Vec::new(), 1).await;

    let response = app
        .app
        .clone()
        .oneshot(post_json(
            &format!("/engines/{}/execute", app.engine_id),
            Some(TEST_KEY),
            &json!({ "userInput": "   " }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .app
        .clone()
        .oneshot(post_json(
            &format!("/engines/{}/execute", Uuid::new_v4()),
            Some(TEST_KEY),
            &json!({ "userInput": "premise" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Neither rejection consumed quota
    let entitlement = db::entitlements::lookup_api_key(&app.pool, TEST_KEY)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entitlement.executions_used, 0);
}

#[tokio::test]
async fn test_status_is_visible_to_the_owner_only() {
    let app = create_test_app(vec![chapter_response("alpha", 10)], 1).await;

    let response = app
        .app
        .clone()
        .oneshot(post_json(
            &format!("/engines/{}/execute", app.engine_id),
            Some(TEST_KEY),
            &json!({ "userInput": "premise" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let accepted = body_json(response).await;
    let execution_id = accepted["executionId"].as_str().unwrap().to_string();

    seed_key(&app.pool, "other-key", Uuid::new_v4(), true, 0, None).await;
    let response = app
        .app
        .clone()
        .oneshot(get_authed(
            &format!("/executions/{execution_id}"),
            "other-key",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .app
        .oneshot(get_authed(
            &format!("/executions/{}", Uuid::new_v4()),
            TEST_KEY,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stop_cancels_and_terminal_stop_conflicts() {
    let app = create_test_app(Vec::new(), 1).await;

    // Seed a running execution directly; no job is holding it
    let graph = linear_graph(3);
    let execution = Execution::new(
        app.engine_id,
        app.user_id,
        graph.nodes,
        graph.edges,
        "premise".to_string(),
        ExecutionOptions::default(),
    );
    db::executions::save_execution(&app.pool, &execution)
        .await
        .unwrap();

    let uri = format!("/executions/{}/stop", execution.execution_id);
    let response = app
        .app
        .clone()
        .oneshot(post_empty(&uri, TEST_KEY))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stopped = body_json(response).await;
    assert_eq!(stopped["status"], "cancelled");

    let stored = db::executions::load_execution(&app.pool, execution.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, ExecutionStatus::Cancelled);

    let response = app
        .app
        .oneshot(post_empty(&uri, TEST_KEY))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_failed_execution_resumes_from_its_checkpoint() {
    // Five chapters requested, two scripted: chapter three exhausts the
    // script and fails the execution after its single generation attempt
    let app = create_test_app(
        vec![chapter_response("alpha", 10), chapter_response("beta", 10)],
        5,
    )
    .await;

    let response = app
        .app
        .clone()
        .oneshot(post_json(
            &format!("/engines/{}/execute", app.engine_id),
            Some(TEST_KEY),
            &json!({
                "userInput": "premise",
                "options": { "generationAttempts": 1 }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let accepted = body_json(response).await;
    let execution_id = accepted["executionId"].as_str().unwrap().to_string();

    let failed = poll_until_terminal(&app.app, &execution_id).await;
    assert_eq!(failed["status"], "failed");
    assert!(failed["metadata"]["error"]
        .as_str()
        .unwrap()
        .contains("scripted responses exhausted"));
    let checkpoint = &failed["executionData"]["checkpoint"];
    assert_eq!(checkpoint["partialChapters"].as_array().unwrap().len(), 2);
    assert!(checkpoint["completedNodes"]
        .as_array()
        .unwrap()
        .iter()
        .any(|node| node["nodeId"] == "input"));

    // The job record must settle before the same job id can be reused
    wait_for_failed_jobs(&app.app, 1).await;

    for seed in ["gamma", "delta", "epsilon"] {
        app.generator.push_response(chapter_response(seed, 10)).await;
    }

    let response = app
        .app
        .clone()
        .oneshot(post_json(
            &format!("/engines/{}/resume", app.engine_id),
            Some(TEST_KEY),
            &json!({ "executionId": execution_id }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let finished = poll_until_terminal(&app.app, &execution_id).await;
    assert_eq!(finished["status"], "completed");
    let manuscript = &finished["result"]["manuscript"];
    assert_eq!(manuscript["metadata"]["totalChapters"], 5);

    // Chapters one and two were not regenerated: two calls before the
    // failure, the failed third, and three after the resume
    assert_eq!(app.generator.prompts().await.len(), 6);
    assert_eq!(app.generator.remaining().await, 0);
}

#[tokio::test]
async fn test_resume_rejects_executions_that_are_not_resumable() {
    let app = create_test_app(Vec::new(), 1).await;

    let graph = linear_graph(1);
    let mut execution = Execution::new(
        app.engine_id,
        app.user_id,
        graph.nodes,
        graph.edges,
        "premise".to_string(),
        ExecutionOptions::default(),
    );
    execution.transition_to(ExecutionStatus::Completed);
    db::executions::save_execution(&app.pool, &execution)
        .await
        .unwrap();

    let response = app
        .app
        .clone()
        .oneshot(post_json(
            &format!("/engines/{}/resume", app.engine_id),
            Some(TEST_KEY),
            &json!({ "executionId": execution.execution_id }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .app
        .oneshot(post_json(
            &format!("/engines/{}/resume", app.engine_id),
            Some(TEST_KEY),
            &json!({ "executionId": Uuid::new_v4() }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_queue_stats_and_recover() {
    let app = create_test_app(Vec::new(), 1).await;

    let response = app
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/queue/stats")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stats = body_json(response).await;
    assert_eq!(stats["backend"], "memory");
    assert_eq!(stats["counts"]["waiting"], 0);
    assert_eq!(stats["counts"]["paused"], false);

    let response = app
        .app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/queue/recover")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let recovered = body_json(response).await;
    assert_eq!(recovered["status"], "recovered");
    assert_eq!(recovered["backend"], "memory");
}

#[tokio::test]
async fn test_event_stream_endpoint_connects() {
    let app = create_test_app(Vec::new(), 1).await;

    let response = app
        .app
        .oneshot(
            Request::builder()
                .uri(&format!("/executions/{}/events", Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
}

#[tokio::test]
async fn test_internal_execute_is_disabled_without_a_shared_token() {
    let app = create_test_app(Vec::new(), 1).await;

    let response = app
        .app
        .oneshot(post_json(
            "/internal/execute",
            None,
            &json!({ "executionId": Uuid::new_v4() }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
