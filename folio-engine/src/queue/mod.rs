//! Job queue abstraction
//!
//! Workflow executions run as queue jobs behind the `QueueAdapter` trait.
//! Two backends exist: an in-process FIFO for tests and broker-less
//! deployments, and a Redis backend with durable jobs, delayed retries and
//! multi-worker fan-out. Both preserve the same state machine
//! (`waiting -> active -> {completed, failed}`) so callers cannot tell the
//! backends apart by behavior, only by durability.
//!
//! Enqueue is idempotent on the caller-supplied job id: a second enqueue
//! against a live job is a no-op returning the existing id. A terminal job
//! under the same id is replaced, which is how resumes re-dispatch.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use folio_common::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub use self::memory::MemoryQueue;
pub use self::redis::RedisQueue;

/// Job lifecycle states
///
/// `Delayed` only appears on the broker backend; the in-process backend
/// keeps retry-pending jobs in `Waiting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "delayed" => Some(JobState::Delayed),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One queued unit of work
///
/// Failed jobs stay inspectable; nothing is silently dropped after retry
/// exhaustion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub payload: Value,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub progress: Option<Value>,
    pub result: Option<Value>,
}

impl Job {
    pub fn new(id: String, job_type: String, payload: Value, policy: &RetryPolicy) -> Self {
        Self {
            id,
            job_type,
            payload,
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts: policy.max_attempts,
            backoff_ms: policy.backoff_ms,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            progress: None,
            result: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Options accepted by `enqueue`
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Caller-chosen id; enqueue is idempotent on it while the job is live
    pub job_id: Option<String>,
    /// Attempt budget override
    pub attempts: Option<u32>,
    /// Base backoff override in milliseconds
    pub backoff_ms: Option<u64>,
}

/// Retry budget and exponential backoff base
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_ms,
        }
    }

    /// Delay before the retry that follows attempt `attempts_made`
    ///
    /// Doubles per failed attempt: base, 2x, 4x, and so on. The exponent is
    /// capped so pathological attempt counts cannot overflow.
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(1u64 << exponent))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 5000,
        }
    }
}

/// Per-state job totals plus the pause flag
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub paused: bool,
}

/// What a handler sees while processing one job
///
/// Progress updates flow through a channel back to the owning backend, so
/// the handler never needs a reference to the queue itself.
pub struct JobContext {
    pub id: String,
    pub payload: Value,
    pub attempts_made: u32,
    progress_tx: mpsc::UnboundedSender<Value>,
}

impl JobContext {
    pub fn new(
        id: String,
        payload: Value,
        attempts_made: u32,
    ) -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        (
            Self {
                id,
                payload,
                attempts_made,
                progress_tx,
            },
            progress_rx,
        )
    }

    /// Record progress on the job; lossy if the backend already moved on
    pub fn update_progress(&self, progress: Value) {
        let _ = self.progress_tx.send(progress);
    }
}

/// Handles one job to completion
///
/// The returned value becomes the job result. An error triggers the
/// backoff/retry policy until the attempt budget runs out.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: JobContext) -> Result<Value>;
}

/// Backend-agnostic queue contract
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    /// Backend name for logs and the stats endpoint
    fn backend_name(&self) -> &'static str;

    /// Add a job; idempotent on `opts.job_id` while that job is live
    async fn enqueue(&self, job_type: &str, payload: Value, opts: EnqueueOptions)
        -> Result<String>;

    /// Register a handler and start consuming jobs of `job_type`
    async fn process(
        &self,
        job_type: &str,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
    ) -> Result<()>;

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>>;

    async fn get_state(&self, job_id: &str) -> Result<Option<JobState>>;

    /// Requeue a failed job with a fresh attempt budget
    async fn retry(&self, job_id: &str) -> Result<()>;

    /// Cancel a job; best-effort for jobs already running
    async fn cancel(&self, job_id: &str) -> Result<()>;

    async fn counts(&self) -> Result<JobCounts>;

    /// Stop handing out jobs; queued work is kept
    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    /// Drop failed job records; returns how many were removed
    async fn clear_failed(&self) -> Result<u64>;

    /// Drop scheduled retries; returns how many were removed
    async fn clear_delayed(&self) -> Result<u64>;

    /// Hard reset: clear every queue structure, force-unlocking active jobs.
    /// Operational escape hatch, not part of normal flow.
    async fn obliterate(&self) -> Result<()>;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = RetryPolicy::new(5, 100);
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(4), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_exponent_is_capped() {
        let policy = RetryPolicy::new(5, u64::MAX / 2);
        // Must not overflow even with absurd attempt counts
        let delay = policy.delay_after(500);
        assert!(delay >= Duration::from_millis(u64::MAX / 2));
    }

    #[test]
    fn test_job_state_round_trip() {
        for state in [
            JobState::Waiting,
            JobState::Active,
            JobState::Delayed,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(JobState::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Waiting.is_terminal());
        assert!(!JobState::Active.is_terminal());
        assert!(!JobState::Delayed.is_terminal());
    }

    #[test]
    fn test_progress_flows_through_context() {
        let (ctx, mut rx) = JobContext::new("job-1".to_string(), Value::Null, 1);
        ctx.update_progress(serde_json::json!({ "percentage": 40 }));
        let received = rx.try_recv().expect("progress present");
        assert_eq!(received["percentage"], 40);
    }
}
