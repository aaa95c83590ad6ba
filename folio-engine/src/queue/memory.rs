//! In-process FIFO queue backend
//!
//! Single logical worker per job type, no durability. Jobs live in a shared
//! map and are handed out strictly in enqueue order. Retries go back to
//! `Waiting` after the backoff sleep; this backend does not distinguish a
//! delayed state. Suitable for tests and deployments without a broker.

use super::{
    EnqueueOptions, Job, JobContext, JobCounts, JobHandler, JobState, QueueAdapter, RetryPolicy,
};
use async_trait::async_trait;
use chrono::Utc;
use folio_common::{Error, Result};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fallback poll interval so the worker never wedges on a missed notify
const POLL_INTERVAL: Duration = Duration::from_millis(250);

struct Inner {
    jobs: RwLock<HashMap<String, Job>>,
    /// Waiting job ids per job type, FIFO
    waiting: RwLock<HashMap<String, VecDeque<String>>>,
    notify: Notify,
    paused: AtomicBool,
    policy: RetryPolicy,
    shutdown: CancellationToken,
}

impl Inner {
    /// Pop the next runnable id, skipping ids whose job was cancelled or
    /// replaced since it entered the deque
    async fn pop_waiting(&self, job_type: &str) -> Option<String> {
        if self.paused.load(Ordering::SeqCst) {
            return None;
        }
        let mut waiting = self.waiting.write().await;
        let deque = waiting.get_mut(job_type)?;
        let jobs = self.jobs.read().await;
        while let Some(id) = deque.pop_front() {
            if jobs.get(&id).map(|j| j.state) == Some(JobState::Waiting) {
                return Some(id);
            }
        }
        None
    }

    async fn push_waiting(&self, job_type: &str, job_id: String) {
        let mut waiting = self.waiting.write().await;
        waiting.entry(job_type.to_string()).or_default().push_back(job_id);
        drop(waiting);
        self.notify.notify_one();
    }
}

/// In-process queue; cheap to clone, all clones share state
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

impl MemoryQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: RwLock::new(HashMap::new()),
                waiting: RwLock::new(HashMap::new()),
                notify: Notify::new(),
                paused: AtomicBool::new(false),
                policy,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Stop the worker loops; queued jobs stay in the map
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    async fn run_job(inner: &Arc<Inner>, job_id: &str, handler: &Arc<dyn JobHandler>) {
        let (payload, attempts_made, max_attempts, backoff_ms, job_type) = {
            let mut jobs = inner.jobs.write().await;
            let Some(job) = jobs.get_mut(job_id) else {
                return;
            };
            if job.state != JobState::Waiting {
                return;
            }
            job.state = JobState::Active;
            job.started_at = Some(Utc::now());
            job.attempts_made += 1;
            (
                job.payload.clone(),
                job.attempts_made,
                job.max_attempts,
                job.backoff_ms,
                job.job_type.clone(),
            )
        };

        debug!(job_id, attempt = attempts_made, "job started");

        let (ctx, mut progress_rx) = JobContext::new(job_id.to_string(), payload, attempts_made);
        let drain_inner = Arc::clone(inner);
        let drain_id = job_id.to_string();
        let drain = tokio::spawn(async move {
            while let Some(progress) = progress_rx.recv().await {
                let mut jobs = drain_inner.jobs.write().await;
                if let Some(job) = jobs.get_mut(&drain_id) {
                    job.progress = Some(progress);
                }
            }
        });

        let outcome = handler.handle(ctx).await;
        let _ = drain.await;

        let mut jobs = inner.jobs.write().await;
        let Some(job) = jobs.get_mut(job_id) else {
            return;
        };
        if job.state == JobState::Cancelled {
            // Cancelled while running; keep the cancellation, drop the outcome
            job.finished_at = Some(Utc::now());
            return;
        }
        match outcome {
            Ok(result) => {
                job.state = JobState::Completed;
                job.result = Some(result);
                job.finished_at = Some(Utc::now());
                info!(job_id, attempts = attempts_made, "job completed");
            }
            Err(e) => {
                job.error = Some(e.to_string());
                if attempts_made < max_attempts {
                    job.state = JobState::Waiting;
                    let delay = RetryPolicy::new(max_attempts, backoff_ms).delay_after(attempts_made);
                    warn!(
                        job_id,
                        attempt = attempts_made,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "job failed, retry scheduled"
                    );
                    let requeue_inner = Arc::clone(inner);
                    let requeue_id = job_id.to_string();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if requeue_inner.shutdown.is_cancelled() {
                            return;
                        }
                        requeue_inner.push_waiting(&job_type, requeue_id).await;
                    });
                } else {
                    job.state = JobState::Failed;
                    job.finished_at = Some(Utc::now());
                    warn!(
                        job_id,
                        attempts = attempts_made,
                        error = %e,
                        "job failed, attempts exhausted"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl QueueAdapter for MemoryQueue {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn enqueue(
        &self,
        job_type: &str,
        payload: Value,
        opts: EnqueueOptions,
    ) -> Result<String> {
        let job_id = opts
            .job_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        {
            let mut jobs = self.inner.jobs.write().await;
            if let Some(existing) = jobs.get(&job_id) {
                if !existing.is_terminal() {
                    info!(job_id, state = %existing.state, "job already enqueued, skipping");
                    return Ok(job_id);
                }
                debug!(job_id, prior_state = %existing.state, "replacing finished job");
            }
            let mut policy = self.inner.policy;
            if let Some(attempts) = opts.attempts {
                policy.max_attempts = attempts.max(1);
            }
            if let Some(backoff_ms) = opts.backoff_ms {
                policy.backoff_ms = backoff_ms;
            }
            let job = Job::new(job_id.clone(), job_type.to_string(), payload, &policy);
            jobs.insert(job_id.clone(), job);
        }

        self.inner.push_waiting(job_type, job_id.clone()).await;
        debug!(job_id, job_type, "job enqueued");
        Ok(job_id)
    }

    async fn process(
        &self,
        job_type: &str,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
    ) -> Result<()> {
        if concurrency > 1 {
            debug!(
                requested = concurrency,
                "memory backend runs a single worker; extra concurrency ignored"
            );
        }
        let inner = Arc::clone(&self.inner);
        let job_type = job_type.to_string();
        tokio::spawn(async move {
            info!(job_type, "queue worker started");
            loop {
                while let Some(job_id) = inner.pop_waiting(&job_type).await {
                    Self::run_job(&inner, &job_id, &handler).await;
                }
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = inner.notify.notified() => {}
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
            }
            info!(job_type, "queue worker stopped");
        });
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.inner.jobs.read().await.get(job_id).cloned())
    }

    async fn get_state(&self, job_id: &str) -> Result<Option<JobState>> {
        Ok(self.inner.jobs.read().await.get(job_id).map(|j| j.state))
    }

    async fn retry(&self, job_id: &str) -> Result<()> {
        let job_type = {
            let mut jobs = self.inner.jobs.write().await;
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;
            if job.state != JobState::Failed {
                return Err(Error::InvalidInput(format!(
                    "job {job_id} is {}, only failed jobs can be retried",
                    job.state
                )));
            }
            job.state = JobState::Waiting;
            job.attempts_made = 0;
            job.error = None;
            job.started_at = None;
            job.finished_at = None;
            job.job_type.clone()
        };
        self.inner.push_waiting(&job_type, job_id.to_string()).await;
        info!(job_id, "failed job requeued");
        Ok(())
    }

    async fn cancel(&self, job_id: &str) -> Result<()> {
        let mut jobs = self.inner.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;
        if job.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "job {job_id} already finished as {}",
                job.state
            )));
        }
        // Waiting ids are skipped lazily at pop; active handlers finish but
        // their outcome is discarded
        job.state = JobState::Cancelled;
        job.finished_at = Some(Utc::now());
        info!(job_id, "job cancelled");
        Ok(())
    }

    async fn counts(&self) -> Result<JobCounts> {
        let jobs = self.inner.jobs.read().await;
        let mut counts = JobCounts {
            paused: self.inner.paused.load(Ordering::SeqCst),
            ..Default::default()
        };
        for job in jobs.values() {
            match job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Cancelled => counts.cancelled += 1,
            }
        }
        Ok(counts)
    }

    async fn pause(&self) -> Result<()> {
        self.inner.paused.store(true, Ordering::SeqCst);
        info!("queue paused");
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.notify.notify_one();
        info!("queue resumed");
        Ok(())
    }

    async fn clear_failed(&self) -> Result<u64> {
        let mut jobs = self.inner.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| job.state != JobState::Failed);
        let removed = (before - jobs.len()) as u64;
        info!(removed, "failed jobs cleared");
        Ok(removed)
    }

    async fn clear_delayed(&self) -> Result<u64> {
        // Retries wait outside the map as sleeping tasks; there is no
        // delayed state to clear on this backend
        Ok(0)
    }

    async fn obliterate(&self) -> Result<()> {
        // Same lock order as pop_waiting: waiting before jobs
        let mut waiting = self.inner.waiting.write().await;
        let mut jobs = self.inner.jobs.write().await;
        let dropped = jobs.len();
        jobs.clear();
        waiting.clear();
        warn!(dropped, "queue obliterated");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Mutex;

    /// Fails the first `fail_times` calls, then succeeds
    struct FlakyHandler {
        fail_times: u32,
        calls: AtomicU32,
    }

    impl FlakyHandler {
        fn new(fail_times: u32) -> Arc<Self> {
            Arc::new(Self {
                fail_times,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn handle(&self, job: JobContext) -> Result<Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_times {
                return Err(Error::Internal(format!("induced failure {call}")));
            }
            Ok(json!({ "echo": job.payload, "attempt": job.attempts_made }))
        }
    }

    /// Records the order jobs were executed in
    struct OrderHandler {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobHandler for OrderHandler {
        async fn handle(&self, job: JobContext) -> Result<Value> {
            self.seen.lock().await.push(job.id.clone());
            Ok(Value::Null)
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, 1)
    }

    async fn wait_for_state(queue: &MemoryQueue, job_id: &str, want: JobState) -> Job {
        for _ in 0..400 {
            if let Some(job) = queue.get_job(job_id).await.unwrap() {
                if job.state == want {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} never reached {want}");
    }

    #[tokio::test]
    async fn test_job_runs_to_completion() {
        let queue = MemoryQueue::new(fast_policy());
        let handler = FlakyHandler::new(0);
        queue.process("work", handler.clone(), 1).await.unwrap();

        let id = queue
            .enqueue("work", json!({ "n": 1 }), EnqueueOptions::default())
            .await
            .unwrap();
        let job = wait_for_state(&queue, &id, JobState::Completed).await;

        assert_eq!(job.attempts_made, 1);
        assert_eq!(job.result.as_ref().unwrap()["echo"]["n"], 1);
        assert!(job.finished_at.is_some());
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_same_id_is_noop_while_live() {
        let queue = MemoryQueue::new(fast_policy());
        queue.pause().await.unwrap();

        let opts = EnqueueOptions {
            job_id: Some("exec-1".to_string()),
            ..Default::default()
        };
        let first = queue
            .enqueue("work", json!({ "seq": "first" }), opts.clone())
            .await
            .unwrap();
        let second = queue
            .enqueue("work", json!({ "seq": "second" }), opts)
            .await
            .unwrap();

        assert_eq!(first, second);
        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.waiting, 1);
        // The original payload wins
        let job = queue.get_job("exec-1").await.unwrap().unwrap();
        assert_eq!(job.payload["seq"], "first");
    }

    #[tokio::test]
    async fn test_finished_job_is_replaced_on_reenqueue() {
        let queue = MemoryQueue::new(fast_policy());
        let handler = FlakyHandler::new(0);
        queue.process("work", handler.clone(), 1).await.unwrap();

        let opts = EnqueueOptions {
            job_id: Some("exec-2".to_string()),
            ..Default::default()
        };
        queue
            .enqueue("work", json!({}), opts.clone())
            .await
            .unwrap();
        wait_for_state(&queue, "exec-2", JobState::Completed).await;

        queue.enqueue("work", json!({}), opts).await.unwrap();
        wait_for_state(&queue, "exec-2", JobState::Completed).await;
        assert_eq!(handler.calls(), 2);
    }

    #[tokio::test]
    async fn test_failing_job_exhausts_attempts() {
        let queue = MemoryQueue::new(fast_policy());
        let handler = FlakyHandler::new(u32::MAX);
        queue.process("work", handler.clone(), 1).await.unwrap();

        let id = queue
            .enqueue("work", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let job = wait_for_state(&queue, &id, JobState::Failed).await;

        assert_eq!(job.attempts_made, 3);
        assert_eq!(handler.calls(), 3);
        assert!(job.error.as_ref().unwrap().contains("induced failure"));
        assert!(job.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_retry_resets_attempt_budget() {
        let queue = MemoryQueue::new(fast_policy());
        let handler = FlakyHandler::new(u32::MAX);
        queue.process("work", handler.clone(), 1).await.unwrap();

        let id = queue
            .enqueue("work", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        wait_for_state(&queue, &id, JobState::Failed).await;

        queue.retry(&id).await.unwrap();
        let job = wait_for_state(&queue, &id, JobState::Failed).await;
        assert_eq!(job.attempts_made, 3);
        assert_eq!(handler.calls(), 6);
    }

    #[tokio::test]
    async fn test_retry_rejects_non_failed_jobs() {
        let queue = MemoryQueue::new(fast_policy());
        queue.pause().await.unwrap();
        let id = queue
            .enqueue("work", json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let err = queue.retry(&id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(matches!(
            queue.retry("missing").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_cancel_waiting_job_never_runs() {
        let queue = MemoryQueue::new(fast_policy());
        let handler = FlakyHandler::new(0);
        queue.pause().await.unwrap();
        queue.process("work", handler.clone(), 1).await.unwrap();

        let id = queue
            .enqueue("work", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        queue.cancel(&id).await.unwrap();
        queue.resume().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.calls(), 0);
        assert_eq!(
            queue.get_state(&id).await.unwrap(),
            Some(JobState::Cancelled)
        );
        // Cancelling twice is an error, the job already finished
        assert!(matches!(
            queue.cancel(&id).await.unwrap_err(),
            Error::InvalidInput(_)
        ));
    }

    #[tokio::test]
    async fn test_pause_holds_jobs_until_resume() {
        let queue = MemoryQueue::new(fast_policy());
        let handler = FlakyHandler::new(0);
        queue.process("work", handler.clone(), 1).await.unwrap();
        queue.pause().await.unwrap();

        let id = queue
            .enqueue("work", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.get_state(&id).await.unwrap(), Some(JobState::Waiting));
        assert!(queue.counts().await.unwrap().paused);

        queue.resume().await.unwrap();
        wait_for_state(&queue, &id, JobState::Completed).await;
    }

    #[tokio::test]
    async fn test_jobs_run_in_fifo_order() {
        let queue = MemoryQueue::new(fast_policy());
        let handler = Arc::new(OrderHandler {
            seen: Mutex::new(Vec::new()),
        });
        queue.pause().await.unwrap();
        queue.process("work", handler.clone(), 1).await.unwrap();

        for id in ["a", "b", "c"] {
            queue
                .enqueue(
                    "work",
                    json!({}),
                    EnqueueOptions {
                        job_id: Some(id.to_string()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        queue.resume().await.unwrap();
        wait_for_state(&queue, "c", JobState::Completed).await;

        assert_eq!(*handler.seen.lock().await, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_progress_is_recorded() {
        struct ProgressHandler;

        #[async_trait]
        impl JobHandler for ProgressHandler {
            async fn handle(&self, job: JobContext) -> Result<Value> {
                job.update_progress(json!({ "percentage": 60 }));
                Ok(Value::Null)
            }
        }

        let queue = MemoryQueue::new(fast_policy());
        queue.process("work", Arc::new(ProgressHandler), 1).await.unwrap();

        let id = queue
            .enqueue("work", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let job = wait_for_state(&queue, &id, JobState::Completed).await;
        assert_eq!(job.progress.unwrap()["percentage"], 60);
    }

    #[tokio::test]
    async fn test_clear_failed_drops_records() {
        let queue = MemoryQueue::new(fast_policy());
        let handler = FlakyHandler::new(u32::MAX);
        queue.process("work", handler, 1).await.unwrap();

        let id = queue
            .enqueue("work", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        wait_for_state(&queue, &id, JobState::Failed).await;

        assert_eq!(queue.clear_failed().await.unwrap(), 1);
        assert!(queue.get_job(&id).await.unwrap().is_none());
        assert_eq!(queue.counts().await.unwrap().failed, 0);
    }

    #[tokio::test]
    async fn test_obliterate_clears_everything() {
        let queue = MemoryQueue::new(fast_policy());
        queue.pause().await.unwrap();
        for i in 0..3 {
            queue
                .enqueue("work", json!({ "i": i }), EnqueueOptions::default())
                .await
                .unwrap();
        }

        queue.obliterate().await.unwrap();
        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.waiting, 0);
        assert_eq!(counts.active, 0);
        assert_eq!(counts.failed, 0);
    }
}
