//! Redis queue backend
//!
//! Durable job records with true multi-worker consumption. Layout per job
//! type under a configurable prefix:
//!
//! - `{prefix}:{type}:wait`      list, LPUSH on enqueue, BLMOVE to active
//! - `{prefix}:{type}:active`    list of ids currently being worked
//! - `{prefix}:{type}:delayed`   zset scored by promote-at epoch millis
//! - `{prefix}:{type}:failed` / `:completed` / `:cancelled`   id sets
//! - `{prefix}:job:{id}`         hash with the full job record
//! - `{prefix}:lock:{id}`        worker lock, renewed at half TTL
//! - `{prefix}:paused`           global pause flag
//! - `{prefix}:types`            set of job types seen, for stats and resets
//!
//! Connection failures at construction are fatal by contract; the caller
//! must abort startup rather than degrade to another backend.

use super::{
    EnqueueOptions, Job, JobContext, JobCounts, JobHandler, JobState, QueueAdapter, RetryPolicy,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use folio_common::{Error, Result};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Direction, ExistenceCheck, SetExpiry, SetOptions};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a BLMOVE blocks before re-checking pause and shutdown
const CONSUME_BLOCK_SECS: f64 = 2.0;
/// Cadence of the delayed-to-waiting promotion sweep
const PROMOTE_INTERVAL: Duration = Duration::from_secs(1);
/// Backoff after a transport error in a consumer loop
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

const UNLOCK_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
  return redis.call("del", KEYS[1])
else
  return 0
end
"#;

fn qerr(e: redis::RedisError) -> Error {
    Error::Queue(e.to_string())
}

#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    prefix: String,
    policy: RetryPolicy,
    lock_ttl_ms: u64,
    shutdown: CancellationToken,
}

impl RedisQueue {
    /// Connect and verify the broker is reachable. Errors here must abort
    /// startup; a requested durable backend is never silently downgraded.
    pub async fn connect(
        url: &str,
        prefix: &str,
        policy: RetryPolicy,
        lock_ttl_ms: u64,
    ) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Queue(format!("invalid redis url: {e}")))?;
        let mut conn = client
            .get_connection_manager()
            .await
            .map_err(|e| Error::Queue(format!("redis connection failed: {e}")))?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Queue(format!("redis ping failed: {e}")))?;
        if pong != "PONG" {
            return Err(Error::Queue(format!("unexpected ping reply: {pong}")));
        }
        info!(prefix, "connected to redis queue backend");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            policy,
            lock_ttl_ms: lock_ttl_ms.max(1000),
            shutdown: CancellationToken::new(),
        })
    }

    /// Stop consumer and promotion loops; queued jobs stay in redis
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn wait_key(&self, job_type: &str) -> String {
        format!("{}:{}:wait", self.prefix, job_type)
    }

    fn active_key(&self, job_type: &str) -> String {
        format!("{}:{}:active", self.prefix, job_type)
    }

    fn delayed_key(&self, job_type: &str) -> String {
        format!("{}:{}:delayed", self.prefix, job_type)
    }

    fn state_set_key(&self, job_type: &str, state: JobState) -> String {
        format!("{}:{}:{}", self.prefix, job_type, state.as_str())
    }

    fn job_key(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    fn lock_key(&self, job_id: &str) -> String {
        format!("{}:lock:{}", self.prefix, job_id)
    }

    fn paused_key(&self) -> String {
        format!("{}:paused", self.prefix)
    }

    fn types_key(&self) -> String {
        format!("{}:types", self.prefix)
    }

    async fn is_paused(&self, conn: &mut ConnectionManager) -> Result<bool> {
        let flag: Option<String> = conn.get(self.paused_key()).await.map_err(qerr)?;
        Ok(flag.is_some())
    }

    async fn load_job(&self, conn: &mut ConnectionManager, job_id: &str) -> Result<Option<Job>> {
        let map: HashMap<String, String> =
            conn.hgetall(self.job_key(job_id)).await.map_err(qerr)?;
        if map.is_empty() {
            return Ok(None);
        }
        job_from_map(job_id, &map).map(Some)
    }

    async fn release_lock(
        &self,
        conn: &mut ConnectionManager,
        job_id: &str,
        token: &str,
    ) -> Result<()> {
        let _: i32 = redis::Script::new(UNLOCK_SCRIPT)
            .key(self.lock_key(job_id))
            .arg(token)
            .invoke_async(conn)
            .await
            .map_err(qerr)?;
        Ok(())
    }

    /// Work one job pulled off the wait list. The caller already moved the
    /// id into the active list.
    async fn run_one(&self, job_type: &str, job_id: &str, handler: &Arc<dyn JobHandler>) {
        if let Err(e) = self.try_run_one(job_type, job_id, handler).await {
            warn!(job_id, error = %e, "job execution bookkeeping failed");
        }
    }

    async fn try_run_one(
        &self,
        job_type: &str,
        job_id: &str,
        handler: &Arc<dyn JobHandler>,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let active = self.active_key(job_type);
        let job_key = self.job_key(job_id);

        let lock_token = Uuid::new_v4().to_string();
        let locked: bool = conn
            .set_options(
                self.lock_key(job_id),
                &lock_token,
                SetOptions::default()
                    .conditional_set(ExistenceCheck::NX)
                    .with_expiration(SetExpiry::PX(self.lock_ttl_ms as usize)),
            )
            .await
            .map_err(qerr)?;
        if !locked {
            // Another worker holds it; put nothing back, the lock owner will
            // finish the job
            warn!(job_id, "job already locked by another worker");
            let _: i64 = conn.lrem(&active, 1, job_id).await.map_err(qerr)?;
            return Ok(());
        }

        let Some(job) = self.load_job(&mut conn, job_id).await? else {
            debug!(job_id, "job record missing, dropping stale id");
            let _: i64 = conn.lrem(&active, 1, job_id).await.map_err(qerr)?;
            self.release_lock(&mut conn, job_id, &lock_token).await?;
            return Ok(());
        };
        if job.state == JobState::Cancelled {
            let _: i64 = conn.lrem(&active, 1, job_id).await.map_err(qerr)?;
            self.release_lock(&mut conn, job_id, &lock_token).await?;
            return Ok(());
        }

        let _: () = conn
            .hset_multiple(
                &job_key,
                &[
                    ("state", JobState::Active.as_str().to_string()),
                    ("started_at", Utc::now().to_rfc3339()),
                ],
            )
            .await
            .map_err(qerr)?;
        let attempts_made: i64 = conn.hincr(&job_key, "attempts_made", 1).await.map_err(qerr)?;
        let attempts_made = attempts_made.max(1) as u32;

        debug!(job_id, attempt = attempts_made, "job started");

        // Keep the lock alive while the handler runs
        let renew_stop = CancellationToken::new();
        let renew_task = {
            let stop = renew_stop.clone();
            let mut renew_conn = self.conn.clone();
            let lock_key = self.lock_key(job_id);
            let ttl_ms = self.lock_ttl_ms;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(ttl_ms / 2)) => {}
                    }
                    if stop.is_cancelled() {
                        break;
                    }
                    let renewed: std::result::Result<i64, _> =
                        renew_conn.pexpire(&lock_key, ttl_ms as i64).await;
                    if let Err(e) = renewed {
                        warn!(error = %e, "lock renewal failed");
                    }
                }
            })
        };

        let (ctx, mut progress_rx) =
            JobContext::new(job_id.to_string(), job.payload.clone(), attempts_made);
        let drain_task = {
            let mut drain_conn = self.conn.clone();
            let job_key = job_key.clone();
            tokio::spawn(async move {
                while let Some(progress) = progress_rx.recv().await {
                    let write: std::result::Result<(), _> = drain_conn
                        .hset(&job_key, "progress", progress.to_string())
                        .await;
                    if let Err(e) = write {
                        warn!(error = %e, "progress write failed");
                    }
                }
            })
        };

        let outcome = handler.handle(ctx).await;
        renew_stop.cancel();
        let _ = renew_task.await;
        let _ = drain_task.await;

        // An external cancel may have landed while the handler ran
        let current: Option<String> = conn.hget(&job_key, "state").await.map_err(qerr)?;
        if current.as_deref() == Some(JobState::Cancelled.as_str()) {
            let _: () = conn
                .hset(&job_key, "finished_at", Utc::now().to_rfc3339())
                .await
                .map_err(qerr)?;
            let _: i64 = conn.lrem(&active, 1, job_id).await.map_err(qerr)?;
            self.release_lock(&mut conn, job_id, &lock_token).await?;
            info!(job_id, "job cancelled mid-run, outcome discarded");
            return Ok(());
        }

        match outcome {
            Ok(result) => {
                let _: () = conn
                    .hset_multiple(
                        &job_key,
                        &[
                            ("state", JobState::Completed.as_str().to_string()),
                            ("result", result.to_string()),
                            ("finished_at", Utc::now().to_rfc3339()),
                        ],
                    )
                    .await
                    .map_err(qerr)?;
                let _: i64 = conn
                    .sadd(self.state_set_key(job_type, JobState::Completed), job_id)
                    .await
                    .map_err(qerr)?;
                info!(job_id, attempts = attempts_made, "job completed");
            }
            Err(e) => {
                if attempts_made < job.max_attempts {
                    let delay =
                        RetryPolicy::new(job.max_attempts, job.backoff_ms).delay_after(attempts_made);
                    let promote_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
                    let _: () = conn
                        .hset_multiple(
                            &job_key,
                            &[
                                ("state", JobState::Delayed.as_str().to_string()),
                                ("error", e.to_string()),
                            ],
                        )
                        .await
                        .map_err(qerr)?;
                    let _: i64 = conn
                        .zadd(self.delayed_key(job_type), job_id, promote_at)
                        .await
                        .map_err(qerr)?;
                    warn!(
                        job_id,
                        attempt = attempts_made,
                        max_attempts = job.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "job failed, retry scheduled"
                    );
                } else {
                    let _: () = conn
                        .hset_multiple(
                            &job_key,
                            &[
                                ("state", JobState::Failed.as_str().to_string()),
                                ("error", e.to_string()),
                                ("finished_at", Utc::now().to_rfc3339()),
                            ],
                        )
                        .await
                        .map_err(qerr)?;
                    let _: i64 = conn
                        .sadd(self.state_set_key(job_type, JobState::Failed), job_id)
                        .await
                        .map_err(qerr)?;
                    warn!(
                        job_id,
                        attempts = attempts_made,
                        error = %e,
                        "job failed, attempts exhausted"
                    );
                }
            }
        }

        let _: i64 = conn.lrem(&active, 1, job_id).await.map_err(qerr)?;
        self.release_lock(&mut conn, job_id, &lock_token).await?;
        Ok(())
    }

    /// Move due delayed jobs back onto the wait list
    async fn promote_due(&self, job_type: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let delayed = self.delayed_key(job_type);
        let now = Utc::now().timestamp_millis();
        let due: Vec<String> = conn
            .zrangebyscore(&delayed, "-inf", now)
            .await
            .map_err(qerr)?;
        let mut promoted = 0u64;
        for job_id in due {
            // Only the sweeper that removes the member may promote it
            let removed: i64 = conn.zrem(&delayed, &job_id).await.map_err(qerr)?;
            if removed == 0 {
                continue;
            }
            let _: () = conn
                .hset(
                    self.job_key(&job_id),
                    "state",
                    JobState::Waiting.as_str(),
                )
                .await
                .map_err(qerr)?;
            let _: i64 = conn
                .lpush(self.wait_key(job_type), &job_id)
                .await
                .map_err(qerr)?;
            debug!(job_id, "delayed job promoted");
            promoted += 1;
        }
        Ok(promoted)
    }

    async fn job_types(&self, conn: &mut ConnectionManager) -> Result<Vec<String>> {
        conn.smembers(self.types_key()).await.map_err(qerr)
    }

    /// Collect every job id referenced by this job type's structures
    async fn all_ids_for_type(
        &self,
        conn: &mut ConnectionManager,
        job_type: &str,
    ) -> Result<Vec<String>> {
        let mut ids: Vec<String> = conn
            .lrange(self.wait_key(job_type), 0, -1)
            .await
            .map_err(qerr)?;
        let active: Vec<String> = conn
            .lrange(self.active_key(job_type), 0, -1)
            .await
            .map_err(qerr)?;
        let delayed: Vec<String> = conn
            .zrange(self.delayed_key(job_type), 0, -1)
            .await
            .map_err(qerr)?;
        ids.extend(active);
        ids.extend(delayed);
        for state in [JobState::Completed, JobState::Failed, JobState::Cancelled] {
            let members: Vec<String> = conn
                .smembers(self.state_set_key(job_type, state))
                .await
                .map_err(qerr)?;
            ids.extend(members);
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

#[async_trait]
impl QueueAdapter for RedisQueue {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn enqueue(
        &self,
        job_type: &str,
        payload: Value,
        opts: EnqueueOptions,
    ) -> Result<String> {
        let mut conn = self.conn.clone();
        let job_id = opts
            .job_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let job_key = self.job_key(&job_id);

        let existing: Option<String> = conn.hget(&job_key, "state").await.map_err(qerr)?;
        if let Some(state) = existing.as_deref().and_then(JobState::parse) {
            if !state.is_terminal() {
                info!(job_id, state = %state, "job already enqueued, skipping");
                return Ok(job_id);
            }
            // Replacing a finished record; drop it from its terminal set
            let _: i64 = conn
                .srem(self.state_set_key(job_type, state), &job_id)
                .await
                .map_err(qerr)?;
            debug!(job_id, prior_state = %state, "replacing finished job");
        }

        let mut policy = self.policy;
        if let Some(attempts) = opts.attempts {
            policy.max_attempts = attempts.max(1);
        }
        if let Some(backoff_ms) = opts.backoff_ms {
            policy.backoff_ms = backoff_ms;
        }
        let job = Job::new(job_id.clone(), job_type.to_string(), payload, &policy);

        let _: () = conn
            .hset_multiple(&job_key, &job_to_fields(&job))
            .await
            .map_err(qerr)?;
        let _: i64 = conn.sadd(self.types_key(), job_type).await.map_err(qerr)?;
        let _: i64 = conn
            .lpush(self.wait_key(job_type), &job_id)
            .await
            .map_err(qerr)?;
        debug!(job_id, job_type, "job enqueued");
        Ok(job_id)
    }

    async fn process(
        &self,
        job_type: &str,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.sadd(self.types_key(), job_type).await.map_err(qerr)?;

        // One promotion sweeper per registered type
        {
            let queue = self.clone();
            let job_type = job_type.to_string();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = queue.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(PROMOTE_INTERVAL) => {}
                    }
                    if let Err(e) = queue.promote_due(&job_type).await {
                        warn!(error = %e, "delayed promotion sweep failed");
                    }
                }
            });
        }

        for worker in 0..concurrency.max(1) {
            let queue = self.clone();
            let handler = Arc::clone(&handler);
            let job_type = job_type.to_string();
            tokio::spawn(async move {
                info!(job_type, worker, "queue worker started");
                let mut conn = queue.conn.clone();
                let wait = queue.wait_key(&job_type);
                let active = queue.active_key(&job_type);
                loop {
                    if queue.shutdown.is_cancelled() {
                        break;
                    }
                    match queue.is_paused(&mut conn).await {
                        Ok(true) => {
                            tokio::time::sleep(Duration::from_millis(500)).await;
                            continue;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            warn!(error = %e, "pause check failed");
                            tokio::time::sleep(ERROR_BACKOFF).await;
                            continue;
                        }
                    }
                    let next: std::result::Result<Option<String>, _> = conn
                        .blmove(
                            &wait,
                            &active,
                            Direction::Right,
                            Direction::Left,
                            CONSUME_BLOCK_SECS,
                        )
                        .await;
                    match next {
                        Ok(Some(job_id)) => queue.run_one(&job_type, &job_id, &handler).await,
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, "queue consume failed");
                            tokio::time::sleep(ERROR_BACKOFF).await;
                        }
                    }
                }
                info!(job_type, worker, "queue worker stopped");
            });
        }
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        self.load_job(&mut conn, job_id).await
    }

    async fn get_state(&self, job_id: &str) -> Result<Option<JobState>> {
        let mut conn = self.conn.clone();
        let state: Option<String> = conn
            .hget(self.job_key(job_id), "state")
            .await
            .map_err(qerr)?;
        Ok(state.as_deref().and_then(JobState::parse))
    }

    async fn retry(&self, job_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let job = self
            .load_job(&mut conn, job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;
        if job.state != JobState::Failed {
            return Err(Error::InvalidInput(format!(
                "job {job_id} is {}, only failed jobs can be retried",
                job.state
            )));
        }
        let _: i64 = conn
            .srem(self.state_set_key(&job.job_type, JobState::Failed), job_id)
            .await
            .map_err(qerr)?;
        let _: () = conn
            .hset_multiple(
                self.job_key(job_id),
                &[
                    ("state", JobState::Waiting.as_str().to_string()),
                    ("attempts_made", "0".to_string()),
                    ("error", String::new()),
                    ("started_at", String::new()),
                    ("finished_at", String::new()),
                ],
            )
            .await
            .map_err(qerr)?;
        let _: i64 = conn
            .lpush(self.wait_key(&job.job_type), job_id)
            .await
            .map_err(qerr)?;
        info!(job_id, "failed job requeued");
        Ok(())
    }

    async fn cancel(&self, job_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let job = self
            .load_job(&mut conn, job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;
        if job.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "job {job_id} already finished as {}",
                job.state
            )));
        }
        match job.state {
            JobState::Waiting => {
                let _: i64 = conn
                    .lrem(self.wait_key(&job.job_type), 1, job_id)
                    .await
                    .map_err(qerr)?;
            }
            JobState::Delayed => {
                let _: i64 = conn
                    .zrem(self.delayed_key(&job.job_type), job_id)
                    .await
                    .map_err(qerr)?;
            }
            // Active jobs keep running; the worker notices the state flip
            // when the handler returns and discards the outcome
            JobState::Active => {}
            _ => {}
        }
        let _: () = conn
            .hset_multiple(
                self.job_key(job_id),
                &[
                    ("state", JobState::Cancelled.as_str().to_string()),
                    ("finished_at", Utc::now().to_rfc3339()),
                ],
            )
            .await
            .map_err(qerr)?;
        let _: i64 = conn
            .sadd(
                self.state_set_key(&job.job_type, JobState::Cancelled),
                job_id,
            )
            .await
            .map_err(qerr)?;
        info!(job_id, prior_state = %job.state, "job cancelled");
        Ok(())
    }

    async fn counts(&self) -> Result<JobCounts> {
        let mut conn = self.conn.clone();
        let mut counts = JobCounts {
            paused: self.is_paused(&mut conn).await?,
            ..Default::default()
        };
        for job_type in self.job_types(&mut conn).await? {
            let waiting: i64 = conn.llen(self.wait_key(&job_type)).await.map_err(qerr)?;
            let active: i64 = conn.llen(self.active_key(&job_type)).await.map_err(qerr)?;
            let delayed: i64 = conn.zcard(self.delayed_key(&job_type)).await.map_err(qerr)?;
            counts.waiting += waiting as u64;
            counts.active += active as u64;
            counts.delayed += delayed as u64;
            for (state, slot) in [
                (JobState::Completed, &mut counts.completed),
                (JobState::Failed, &mut counts.failed),
                (JobState::Cancelled, &mut counts.cancelled),
            ] {
                let n: i64 = conn
                    .scard(self.state_set_key(&job_type, state))
                    .await
                    .map_err(qerr)?;
                *slot += n as u64;
            }
        }
        Ok(counts)
    }

    async fn pause(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(self.paused_key(), "1").await.map_err(qerr)?;
        info!("queue paused");
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(self.paused_key()).await.map_err(qerr)?;
        info!("queue resumed");
        Ok(())
    }

    async fn clear_failed(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let mut removed = 0u64;
        for job_type in self.job_types(&mut conn).await? {
            let failed_key = self.state_set_key(&job_type, JobState::Failed);
            let ids: Vec<String> = conn.smembers(&failed_key).await.map_err(qerr)?;
            for job_id in &ids {
                let _: i64 = conn.del(self.job_key(job_id)).await.map_err(qerr)?;
            }
            let _: i64 = conn.del(&failed_key).await.map_err(qerr)?;
            removed += ids.len() as u64;
        }
        info!(removed, "failed jobs cleared");
        Ok(removed)
    }

    async fn clear_delayed(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let mut removed = 0u64;
        for job_type in self.job_types(&mut conn).await? {
            let delayed_key = self.delayed_key(&job_type);
            let ids: Vec<String> = conn.zrange(&delayed_key, 0, -1).await.map_err(qerr)?;
            for job_id in &ids {
                let _: i64 = conn.del(self.job_key(job_id)).await.map_err(qerr)?;
            }
            let _: i64 = conn.del(&delayed_key).await.map_err(qerr)?;
            removed += ids.len() as u64;
        }
        info!(removed, "delayed jobs cleared");
        Ok(removed)
    }

    async fn obliterate(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut dropped = 0u64;
        for job_type in self.job_types(&mut conn).await? {
            let ids = self.all_ids_for_type(&mut conn, &job_type).await?;
            for job_id in &ids {
                // Deleting the lock force-unlocks jobs a worker still holds
                let _: i64 = conn.del(self.lock_key(job_id)).await.map_err(qerr)?;
                let _: i64 = conn.del(self.job_key(job_id)).await.map_err(qerr)?;
            }
            dropped += ids.len() as u64;
            let keys = vec![
                self.wait_key(&job_type),
                self.active_key(&job_type),
                self.delayed_key(&job_type),
                self.state_set_key(&job_type, JobState::Completed),
                self.state_set_key(&job_type, JobState::Failed),
                self.state_set_key(&job_type, JobState::Cancelled),
            ];
            let _: i64 = conn.del(keys).await.map_err(qerr)?;
        }
        let _: i64 = conn
            .del(vec![self.paused_key(), self.types_key()])
            .await
            .map_err(qerr)?;
        warn!(dropped, "queue obliterated");
        Ok(())
    }
}

fn job_to_fields(job: &Job) -> Vec<(&'static str, String)> {
    vec![
        ("job_type", job.job_type.clone()),
        ("payload", job.payload.to_string()),
        ("state", job.state.as_str().to_string()),
        ("attempts_made", job.attempts_made.to_string()),
        ("max_attempts", job.max_attempts.to_string()),
        ("backoff_ms", job.backoff_ms.to_string()),
        ("created_at", job.created_at.to_rfc3339()),
        ("started_at", String::new()),
        ("finished_at", String::new()),
        ("error", String::new()),
        ("progress", String::new()),
        ("result", String::new()),
    ]
}

fn job_from_map(job_id: &str, map: &HashMap<String, String>) -> Result<Job> {
    let field = |key: &str| map.get(key).map(String::as_str).filter(|v| !v.is_empty());
    let parse_time = |key: &str| -> Result<Option<DateTime<Utc>>> {
        match field(key) {
            None => Ok(None),
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(|e| Error::Queue(format!("job {job_id} has malformed {key}: {e}"))),
        }
    };
    let parse_json = |key: &str| -> Option<Value> {
        field(key).and_then(|raw| serde_json::from_str(raw).ok())
    };

    let state = field("state")
        .and_then(JobState::parse)
        .ok_or_else(|| Error::Queue(format!("job {job_id} has malformed state")))?;
    let job_type = field("job_type")
        .ok_or_else(|| Error::Queue(format!("job {job_id} is missing its type")))?
        .to_string();
    let created_at = parse_time("created_at")?
        .ok_or_else(|| Error::Queue(format!("job {job_id} is missing created_at")))?;

    Ok(Job {
        id: job_id.to_string(),
        job_type,
        payload: parse_json("payload").unwrap_or(Value::Null),
        state,
        attempts_made: field("attempts_made").and_then(|v| v.parse().ok()).unwrap_or(0),
        max_attempts: field("max_attempts").and_then(|v| v.parse().ok()).unwrap_or(1),
        backoff_ms: field("backoff_ms").and_then(|v| v.parse().ok()).unwrap_or(0),
        created_at,
        started_at: parse_time("started_at")?,
        finished_at: parse_time("finished_at")?,
        error: field("error").map(str::to_string),
        progress: parse_json("progress"),
        result: parse_json("result"),
    })
}

// ============================================================================
// Tests
// ============================================================================
