//! [`RedisQueueAdapter`]: the production [`QueueAdapter`] implementation,
//! built on the `redis` crate's `tokio-comp` + `connection-manager` API.
//!
//! Layout per queue name `q` (prefix `p`):
//! - `relaywork:{p}:{q}:jobs` — hash, field = job id, value = JSON job data.
//! - `relaywork:{p}:{q}:wait` — list of job ids ready for dispatch.
//! - `relaywork:{p}:{q}:delayed` — sorted set, score = due-at unix ms.
//! - `relaywork:{p}:{q}:meta:{id}` — hash: state, priority, token,
//!   returnvalue, attempts_remaining.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use relaywork_core::queue::{
    HandlerFuture, JobExternalState, JobHandlerFn, JobId, QueueAdapter, QueueError, QueueJob,
    WorkerHandle, WorkerOptions, WorkerStatus,
};
use relaywork_core::{JobError, JobOrder, ResolvedJobOptions};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::RedisAdapterError;

const SWEEP_INTERVAL: Duration = Duration::from_millis(250);
const DISPATCH_TIMEOUT_SECS: usize = 1;

fn jobs_key(prefix: &str, queue: &str) -> String {
    format!("relaywork:{prefix}:{queue}:jobs")
}

fn wait_key(prefix: &str, queue: &str) -> String {
    format!("relaywork:{prefix}:{queue}:wait")
}

fn delayed_key(prefix: &str, queue: &str) -> String {
    format!("relaywork:{prefix}:{queue}:delayed")
}

fn meta_key(prefix: &str, queue: &str, id: &str) -> String {
    format!("relaywork:{prefix}:{queue}:meta:{id}")
}

fn state_to_str(state: JobExternalState) -> &'static str {
    match state {
        JobExternalState::Waiting => "waiting",
        JobExternalState::Active => "active",
        JobExternalState::Delayed => "delayed",
        JobExternalState::Completed => "completed",
        JobExternalState::Failed => "failed",
    }
}

fn state_from_str(s: &str) -> JobExternalState {
    match s {
        "active" => JobExternalState::Active,
        "delayed" => JobExternalState::Delayed,
        "completed" => JobExternalState::Completed,
        "failed" => JobExternalState::Failed,
        _ => JobExternalState::Waiting,
    }
}

/// Removes `id` from `wait`, writes its due timestamp into `delayed`, and
/// sets `meta.state = delayed`, atomically with respect to other workers.
const MOVE_TO_DELAYED_SCRIPT: &str = r#"
redis.call('LREM', KEYS[1], 0, ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
redis.call('HSET', KEYS[3], 'state', 'delayed')
return 1
"#;

/// Removes `id` from `delayed`, pushes it to the front of `wait` for
/// immediate dispatch, and sets `meta.state = waiting`. `wait` is consumed
/// tail-first (`BRPOP`), so "front" here means `RPUSH`.
const PROMOTE_SCRIPT: &str = r#"
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('RPUSH', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[3], 'state', 'waiting')
return 1
"#;

/// A Redis-backed [`QueueAdapter`]. Construct with [`RedisQueueAdapter::connect`].
///
/// Cheaply `Clone` (`ConnectionManager` is itself reference-counted
/// internally) so [`QueueAdapter`] can be implemented on the bare type —
/// required for `Arc<RedisQueueAdapter>` to coerce to `Arc<dyn QueueAdapter>`
/// — and so the worker loop can clone an owned, `'static` handle into its
/// spawned dispatch/sweep tasks.
#[derive(Clone)]
pub struct RedisQueueAdapter {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisQueueAdapter {
    #[instrument(skip(redis_url))]
    pub async fn connect(
        redis_url: &str,
        prefix: impl Into<String>,
    ) -> Result<Arc<Self>, RedisAdapterError> {
        let client = redis::Client::open(redis_url)
            .map_err(|_| RedisAdapterError::InvalidUrl(redis_url.to_string()))?;
        let manager = client.get_connection_manager().await?;
        Ok(Arc::new(Self {
            manager,
            prefix: prefix.into(),
        }))
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    async fn fetch_job(
        &self,
        queue: &str,
        id: &JobId,
    ) -> Result<Option<Arc<dyn QueueJob>>, QueueError> {
        let mut conn = self.conn();
        let raw: Option<String> = conn
            .hget(jobs_key(&self.prefix, queue), &id.0)
            .await
            .map_err(|e| RedisAdapterError::from(e))?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let data: serde_json::Value =
            serde_json::from_str(&raw).map_err(RedisAdapterError::from)?;

        let meta: HashMap<String, String> = conn
            .hgetall(meta_key(&self.prefix, queue, &id.0))
            .await
            .map_err(|e| RedisAdapterError::from(e))?;
        let state = meta
            .get("state")
            .map(|s| state_from_str(s))
            .unwrap_or(JobExternalState::Waiting);
        let token = meta.get("token").cloned().unwrap_or_default();
        let return_value = meta
            .get("returnvalue")
            .and_then(|s| serde_json::from_str(s).ok());

        Ok(Some(Arc::new(RedisJob {
            id: id.clone(),
            queue: queue.to_string(),
            prefix: self.prefix.clone(),
            manager: self.conn(),
            data: StdMutex::new(data),
            state: StdMutex::new(state),
            token,
            return_value: StdMutex::new(return_value),
        })))
    }

    async fn promote_due(&self, queue: &str) -> Result<(), QueueError> {
        let mut conn = self.conn();
        let now = Utc::now().timestamp_millis();
        let due: Vec<String> = conn
            .zrangebyscore(delayed_key(&self.prefix, queue), "-inf", now)
            .await
            .map_err(|e| RedisAdapterError::from(e))?;
        for id in due {
            let _: Result<i64, _> = redis::Script::new(PROMOTE_SCRIPT)
                .key(delayed_key(&self.prefix, queue))
                .key(wait_key(&self.prefix, queue))
                .key(meta_key(&self.prefix, queue, &id))
                .arg(&id)
                .invoke_async(&mut conn)
                .await;
        }
        Ok(())
    }
}

struct RedisJob {
    id: JobId,
    queue: String,
    prefix: String,
    manager: ConnectionManager,
    data: StdMutex<serde_json::Value>,
    state: StdMutex<JobExternalState>,
    token: String,
    return_value: StdMutex<Option<serde_json::Value>>,
}

#[async_trait]
impl QueueJob for RedisJob {
    fn id(&self) -> &JobId {
        &self.id
    }

    fn data(&self) -> serde_json::Value {
        self.data.lock().expect("job data mutex poisoned").clone()
    }

    async fn update_data(&self, data: serde_json::Value) -> Result<(), QueueError> {
        let encoded = serde_json::to_string(&data).map_err(RedisAdapterError::from)?;
        let mut conn = self.manager.clone();
        let _: () = conn
            .hset(jobs_key(&self.prefix, &self.queue), &self.id.0, encoded)
            .await
            .map_err(|e| RedisAdapterError::from(e))?;
        *self.data.lock().expect("job data mutex poisoned") = data;
        Ok(())
    }

    async fn move_to_delayed(&self, until_ms: i64, _token: &str) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::Script::new(MOVE_TO_DELAYED_SCRIPT)
            .key(wait_key(&self.prefix, &self.queue))
            .key(delayed_key(&self.prefix, &self.queue))
            .key(meta_key(&self.prefix, &self.queue, &self.id.0))
            .arg(&self.id.0)
            .arg(until_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RedisAdapterError::from(e))?;
        *self.state.lock().expect("state mutex poisoned") = JobExternalState::Delayed;
        Ok(())
    }

    async fn change_priority(&self, priority: i32) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .hset(
                meta_key(&self.prefix, &self.queue, &self.id.0),
                "priority",
                priority,
            )
            .await
            .map_err(|e| RedisAdapterError::from(e))?;
        Ok(())
    }

    async fn promote(&self) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::Script::new(PROMOTE_SCRIPT)
            .key(delayed_key(&self.prefix, &self.queue))
            .key(wait_key(&self.prefix, &self.queue))
            .key(meta_key(&self.prefix, &self.queue, &self.id.0))
            .arg(&self.id.0)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RedisAdapterError::from(e))?;
        *self.state.lock().expect("state mutex poisoned") = JobExternalState::Waiting;
        Ok(())
    }

    async fn get_state(&self) -> Result<JobExternalState, QueueError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn
            .hget(meta_key(&self.prefix, &self.queue, &self.id.0), "state")
            .await
            .map_err(|e| RedisAdapterError::from(e))?;
        let state = raw.map(|s| state_from_str(&s)).unwrap_or(JobExternalState::Waiting);
        *self.state.lock().expect("state mutex poisoned") = state;
        Ok(state)
    }

    fn return_value(&self) -> Option<serde_json::Value> {
        self.return_value.lock().expect("return value mutex poisoned").clone()
    }

    fn token(&self) -> &str {
        &self.token
    }
}

struct RedisWorkerHandle {
    status_tx: watch::Sender<WorkerStatus>,
}

#[async_trait]
impl WorkerHandle for RedisWorkerHandle {
    async fn pause(&self) {
        let _ = self.status_tx.send(WorkerStatus::Draining);
    }

    async fn resume(&self) {
        let _ = self.status_tx.send(WorkerStatus::Running);
    }

    async fn stop(&self) {
        let _ = self.status_tx.send(WorkerStatus::Stopped);
    }

    fn status(&self) -> WorkerStatus {
        *self.status_tx.borrow()
    }
}

#[async_trait]
impl QueueAdapter for RedisQueueAdapter {
    #[instrument(skip(self, data, options), fields(queue = %queue))]
    async fn enqueue(
        &self,
        queue: &str,
        data: serde_json::Value,
        options: ResolvedJobOptions,
    ) -> Result<JobId, QueueError> {
        let id = JobId(Uuid::now_v7().to_string());
        let token = Uuid::now_v7().to_string();
        let encoded = serde_json::to_string(&data).map_err(RedisAdapterError::from)?;
        let now = Utc::now().timestamp_millis();
        let mut conn = self.conn();

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset(jobs_key(&self.prefix, queue), &id.0, &encoded);
        let meta = meta_key(&self.prefix, queue, &id.0);
        pipe.hset(&meta, "token", &token);
        pipe.hset(&meta, "priority", options.priority);
        pipe.hset(&meta, "attempts_remaining", options.retries + 1);

        if options.delay_ms > 0 {
            pipe.hset(&meta, "state", state_to_str(JobExternalState::Delayed));
            pipe.zadd(
                delayed_key(&self.prefix, queue),
                &id.0,
                now + options.delay_ms as i64,
            );
        } else {
            pipe.hset(&meta, "state", state_to_str(JobExternalState::Waiting));
            match options.order {
                JobOrder::Fifo => {
                    pipe.lpush(wait_key(&self.prefix, queue), &id.0);
                }
                JobOrder::Lifo => {
                    pipe.rpush(wait_key(&self.prefix, queue), &id.0);
                }
            }
        }

        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisAdapterError::from(e))?;
        Ok(id)
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> Result<Option<Arc<dyn QueueJob>>, QueueError> {
        self.fetch_job(queue, id).await
    }

    async fn get_delayed(&self, queue: &str) -> Result<Vec<Arc<dyn QueueJob>>, QueueError> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn
            .zrange(delayed_key(&self.prefix, queue), 0, -1)
            .await
            .map_err(|e| RedisAdapterError::from(e))?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.fetch_job(queue, &JobId(id)).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn worker(
        &self,
        queue: &str,
        opts: WorkerOptions,
        handler: JobHandlerFn,
    ) -> Result<Box<dyn WorkerHandle>, QueueError> {
        let initial = if opts.autorun {
            WorkerStatus::Running
        } else {
            WorkerStatus::Draining
        };
        let (status_tx, status_rx) = watch::channel(initial);
        let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
        let adapter = self.clone();
        let queue_owned = queue.to_string();

        tokio::spawn(sweep_loop(adapter.clone(), queue_owned.clone(), status_rx.clone()));
        tokio::spawn(dispatch_loop(adapter, queue_owned, status_rx, semaphore, handler));

        Ok(Box::new(RedisWorkerHandle { status_tx }))
    }
}

async fn sweep_loop(
    adapter: RedisQueueAdapter,
    queue: String,
    mut status_rx: watch::Receiver<WorkerStatus>,
) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        if *status_rx.borrow_and_update() == WorkerStatus::Stopped {
            break;
        }
        if let Err(e) = adapter.promote_due(&queue).await {
            warn!(queue = %queue, error = %e, "failed to sweep delayed jobs");
        }
    }
}

async fn dispatch_loop(
    adapter: RedisQueueAdapter,
    queue: String,
    mut status_rx: watch::Receiver<WorkerStatus>,
    semaphore: Arc<Semaphore>,
    handler: JobHandlerFn,
) {
    loop {
        if *status_rx.borrow_and_update() == WorkerStatus::Stopped {
            break;
        }
        if *status_rx.borrow() != WorkerStatus::Running {
            tokio::time::sleep(Duration::from_millis(50)).await;
            continue;
        }

        let mut conn = adapter.conn();
        let popped: redis::RedisResult<Option<(String, String)>> = conn
            .brpop(wait_key(&adapter.prefix, &queue), DISPATCH_TIMEOUT_SECS as f64)
            .await;
        let id = match popped {
            Ok(Some((_, id))) => id,
            Ok(None) => continue,
            Err(e) => {
                warn!(queue = %queue, error = %e, "BRPOP failed, backing off");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let _: Result<(), _> = conn
            .hset(
                meta_key(&adapter.prefix, &queue, &id),
                "state",
                state_to_str(JobExternalState::Active),
            )
            .await;

        let job = match adapter.fetch_job(&queue, &JobId(id.clone())).await {
            Ok(Some(job)) => job,
            Ok(None) => continue,
            Err(e) => {
                warn!(queue = %queue, job_id = %id, error = %e, "failed to fetch dispatched job");
                continue;
            }
        };

        let permit = semaphore.clone().acquire_owned().await.expect("semaphore closed");
        let handler = handler.clone();
        let adapter = adapter.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            let _permit = permit;
            run_one(adapter, queue, job, handler).await;
        });
    }
}

async fn run_one(
    adapter: RedisQueueAdapter,
    queue: String,
    job: Arc<dyn QueueJob>,
    handler: JobHandlerFn,
) {
    let fut: HandlerFuture = handler(job.clone());
    let mut conn = adapter.conn();
    match fut.await {
        Ok(return_value) => {
            let meta = meta_key(&adapter.prefix, &queue, &job.id().0);
            let encoded = serde_json::to_string(&return_value).unwrap_or_default();
            let _: Result<(), _> = conn
                .hset_multiple(&meta, &[("state", state_to_str(JobExternalState::Completed)), ("returnvalue", encoded.as_str())])
                .await;
        }
        Err(JobError::Suspend) => {
            debug!(queue = %queue, job_id = %job.id(), "job suspended");
        }
        Err(JobError::Unrecoverable(message)) => {
            fail_job(&mut conn, &adapter.prefix, &queue, job.id(), &message, true).await;
        }
        Err(JobError::Step(failure)) => {
            let message = failure.to_string();
            let remaining: i64 = conn
                .hget(meta_key(&adapter.prefix, &queue, &job.id().0), "attempts_remaining")
                .await
                .unwrap_or(1);
            if remaining > 1 {
                let _: Result<(), _> = conn
                    .hset(
                        meta_key(&adapter.prefix, &queue, &job.id().0),
                        "attempts_remaining",
                        remaining - 1,
                    )
                    .await;
                let _: Result<(), _> = conn
                    .hset(
                        meta_key(&adapter.prefix, &queue, &job.id().0),
                        "state",
                        state_to_str(JobExternalState::Waiting),
                    )
                    .await;
                let _: Result<(), _> = conn.lpush(wait_key(&adapter.prefix, &queue), &job.id().0).await;
            } else {
                fail_job(&mut conn, &adapter.prefix, &queue, job.id(), &message, false).await;
            }
        }
    }
}

async fn fail_job(
    conn: &mut ConnectionManager,
    prefix: &str,
    queue: &str,
    id: &JobId,
    message: &str,
    unrecoverable: bool,
) {
    let meta = meta_key(prefix, queue, &id.0);
    let _: Result<(), _> = conn.hset(&meta, "state", state_to_str(JobExternalState::Failed)).await;
    if unrecoverable {
        debug!(job_id = %id, error = %message, "job marked unrecoverable, skipping retry");
    } else {
        debug!(job_id = %id, error = %message, "job exhausted retries");
    }
}
