//! The queue adapter contract: the sole external dependency of the core.
//! Everything in this module is interface-only; the
//! actual queue primitives (enqueue, worker loop, delayed-set promotion)
//! are implemented by an adapter such as [`crate::queue::memory::InMemoryQueueAdapter`]
//! or the `relaywork-redis` crate's `RedisQueueAdapter`.

pub mod memory;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::options::ResolvedJobOptions;

/// An adapter-assigned job identifier. Opaque to the core; a particular
/// adapter (e.g. Redis) may choose any string representation it likes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        JobId(value)
    }
}

/// The queue's view of a job's lifecycle position. `Completed`/`Failed`
/// are the two states [`crate::executor::StepExecutor::invoke`] polls for
/// on resumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobExternalState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("queue backend error: {0}")]
    Backend(String),
}

/// One job as seen through the queue adapter. Implementations wrap
/// whatever native job handle the backend exposes (a Redis hash entry, an
/// in-memory struct, ...).
#[async_trait]
pub trait QueueJob: Send + Sync {
    fn id(&self) -> &JobId;

    /// The job's current data blob (the persisted [`crate::job::JobState`]
    /// envelope, serialized to JSON).
    fn data(&self) -> serde_json::Value;

    async fn update_data(&self, data: serde_json::Value) -> Result<(), QueueError>;

    /// Move the job into the delayed set until `until_ms` (Unix epoch
    /// milliseconds). `token` is the dispatch token the worker currently
    /// holds, required by at-least-once queues to prevent a stale worker
    /// from re-delaying a job another worker has already picked back up.
    async fn move_to_delayed(&self, until_ms: i64, token: &str) -> Result<(), QueueError>;

    async fn change_priority(&self, priority: i32) -> Result<(), QueueError>;

    /// Remove the job from the delayed set and requeue it for immediate
    /// dispatch.
    async fn promote(&self) -> Result<(), QueueError>;

    async fn get_state(&self) -> Result<JobExternalState, QueueError>;

    /// The job's external return value, set once it reaches `Completed`.
    fn return_value(&self) -> Option<serde_json::Value>;

    fn token(&self) -> &str;
}

/// Concurrency and rate-limiting knobs for [`QueueAdapter::worker`].
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub concurrency: usize,
    pub limiter: Option<RateLimiter>,
    /// If `false`, the worker is constructed in a paused state and must be
    /// started explicitly (mirrors the `autorun: false` contract entry, so
    /// that `Client::start` controls when dispatch actually begins).
    pub autorun: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            limiter: None,
            autorun: false,
        }
    }
}

impl WorkerOptions {
    /// Set local concurrency: the number of jobs this worker processes in
    /// parallel.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Whether the worker starts dispatching immediately on construction
    /// or waits for an explicit `Client::start`.
    pub fn with_autorun(mut self, autorun: bool) -> Self {
        self.autorun = autorun;
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimiter {
    pub max: u32,
    pub duration_ms: u64,
}

/// A boxed future returning either the workflow's JSON-encoded return
/// value or a [`JobError`] (including the `Suspend`/`Unrecoverable`
/// sentinels, which the worker loop recognises and treats specially).
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value, JobError>> + Send>>;

/// The per-dispatch handler a workflow's worker loop invokes.
pub type JobHandlerFn = Arc<dyn Fn(Arc<dyn QueueJob>) -> HandlerFuture + Send + Sync>;

/// Runtime status of a started worker, mirrored from the worker pool's own
/// lifecycle, allowing in-flight jobs to drain before stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Running,
    Draining,
    Stopped,
}

/// A handle to a running worker loop, returned by [`QueueAdapter::worker`].
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    async fn pause(&self);
    async fn resume(&self);
    async fn stop(&self);
    fn status(&self) -> WorkerStatus;
}

/// The queue's contract as consumed by the core. This
/// is the sole external dependency of `relaywork-core`'s step/job
/// executors: they never talk to Redis, a database, or any other backend
/// directly, only through this trait.
#[async_trait]
pub trait QueueAdapter: Send + Sync + 'static {
    async fn enqueue(
        &self,
        queue: &str,
        data: serde_json::Value,
        options: ResolvedJobOptions,
    ) -> Result<JobId, QueueError>;

    async fn get_job(&self, queue: &str, id: &JobId) -> Result<Option<Arc<dyn QueueJob>>, QueueError>;

    async fn get_delayed(&self, queue: &str) -> Result<Vec<Arc<dyn QueueJob>>, QueueError>;

    /// Start a worker loop for `queue`. Returns a handle controlling its
    /// lifecycle; the worker itself drives `handler` once per dispatched
    /// job, honouring `opts.concurrency`/`opts.limiter`/`opts.autorun`.
    async fn worker(
        &self,
        queue: &str,
        opts: WorkerOptions,
        handler: JobHandlerFn,
    ) -> Result<Box<dyn WorkerHandle>, QueueError>;
}
