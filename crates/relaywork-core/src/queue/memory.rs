//! A process-local [`QueueAdapter`] implementation.
//!
//! Used by `relaywork-core`'s own test suite and by downstream users who
//! want to exercise a workflow function without a live Redis instance.
//! Plain `Mutex`-guarded maps stand in for the real backend, plus a
//! background sweep task promoting due delayed jobs — the same shape as
//! `relaywork_redis::RedisQueueAdapter`'s `ZRANGEBYSCORE` sweep, just
//! against an in-process virtual clock instead of Redis's own clock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Mutex, Semaphore};
use uuid::Uuid;

use super::{
    HandlerFuture, JobExternalState, JobHandlerFn, JobId, QueueAdapter, QueueError, QueueJob,
    WorkerHandle, WorkerOptions, WorkerStatus,
};
use crate::error::JobError;
use crate::options::ResolvedJobOptions;

#[derive(Debug, Clone)]
struct JobRecord {
    data: serde_json::Value,
    state: JobExternalState,
    priority: i32,
    token: String,
    return_value: Option<serde_json::Value>,
    attempts_remaining: u32,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, Arc<StdMutex<JobRecord>>>,
    wait_fifo: VecDeque<JobId>,
    delayed: Vec<(i64, JobId)>,
}

/// An in-memory, test-and-demo-oriented [`QueueAdapter`].
///
/// Cheaply `Clone` (its fields are themselves `Arc`-wrapped) so that
/// [`QueueAdapter`] can be implemented directly on `InMemoryQueueAdapter`
/// rather than on `Arc<InMemoryQueueAdapter>` — the bare type is what lets
/// `Arc<InMemoryQueueAdapter>` coerce to `Arc<dyn QueueAdapter>` at
/// construction sites, and what the worker loop clones to move an owned,
/// `'static` handle into its spawned background tasks.
#[derive(Clone)]
pub struct InMemoryQueueAdapter {
    queues: Arc<StdMutex<HashMap<String, QueueState>>>,
    /// Virtual clock, in Unix epoch milliseconds. Starts at wall-clock
    /// "now" and only otherwise advances via [`Self::advance_time`], so
    /// tests can deterministically fast-forward past a sleep/repeat delay
    /// without a real wait.
    clock_ms: Arc<AtomicI64>,
}

impl InMemoryQueueAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queues: Arc::new(StdMutex::new(HashMap::new())),
            clock_ms: Arc::new(AtomicI64::new(Utc::now().timestamp_millis())),
        })
    }

    pub fn now_ms(&self) -> i64 {
        self.clock_ms.load(Ordering::SeqCst)
    }

    /// Advance the virtual clock and immediately promote any delayed jobs
    /// that are now due, without waiting for the background sweep's next
    /// tick. Lets tests exercise delay/sleep/repeat logic deterministically
    /// instead of sleeping in wall-clock time.
    pub fn advance_time(&self, delta_ms: i64) {
        self.clock_ms.fetch_add(delta_ms, Ordering::SeqCst);
        self.sweep_delayed();
    }

    fn sweep_delayed(&self) {
        let now = self.now_ms();
        let mut queues = self.queues.lock().expect("queues mutex poisoned");
        for state in queues.values_mut() {
            let due: Vec<usize> = state
                .delayed
                .iter()
                .enumerate()
                .filter(|(_, (due_ms, _))| *due_ms <= now)
                .map(|(idx, _)| idx)
                .collect();
            for idx in due.into_iter().rev() {
                let (_, id) = state.delayed.remove(idx);
                if let Some(record) = state.jobs.get(&id) {
                    let mut record = record.lock().expect("job record mutex poisoned");
                    record.state = JobExternalState::Waiting;
                }
                state.wait_fifo.push_back(id);
            }
        }
    }
}

impl Default for InMemoryQueueAdapter {
    fn default() -> Self {
        Self {
            queues: Arc::new(StdMutex::new(HashMap::new())),
            clock_ms: Arc::new(AtomicI64::new(Utc::now().timestamp_millis())),
        }
    }
}

struct InMemoryJob {
    id: JobId,
    queue: String,
    record: Arc<StdMutex<JobRecord>>,
    adapter: InMemoryQueueAdapter,
    token: String,
}

#[async_trait]
impl QueueJob for InMemoryJob {
    fn id(&self) -> &JobId {
        &self.id
    }

    fn data(&self) -> serde_json::Value {
        self.record.lock().expect("job record mutex poisoned").data.clone()
    }

    async fn update_data(&self, data: serde_json::Value) -> Result<(), QueueError> {
        self.record.lock().expect("job record mutex poisoned").data = data;
        Ok(())
    }

    async fn move_to_delayed(&self, until_ms: i64, _token: &str) -> Result<(), QueueError> {
        {
            let mut record = self.record.lock().expect("job record mutex poisoned");
            record.state = JobExternalState::Delayed;
        }
        let mut queues = self.adapter.queues.lock().expect("queues mutex poisoned");
        let state = queues.entry(self.queue.clone()).or_default();
        state.wait_fifo.retain(|id| id != &self.id);
        state.delayed.push((until_ms, self.id.clone()));
        Ok(())
    }

    async fn change_priority(&self, priority: i32) -> Result<(), QueueError> {
        self.record.lock().expect("job record mutex poisoned").priority = priority;
        Ok(())
    }

    async fn promote(&self) -> Result<(), QueueError> {
        {
            let mut record = self.record.lock().expect("job record mutex poisoned");
            record.state = JobExternalState::Waiting;
        }
        let mut queues = self.adapter.queues.lock().expect("queues mutex poisoned");
        let state = queues.entry(self.queue.clone()).or_default();
        state.delayed.retain(|(_, id)| id != &self.id);
        if !state.wait_fifo.contains(&self.id) {
            state.wait_fifo.push_front(self.id.clone());
        }
        Ok(())
    }

    async fn get_state(&self) -> Result<JobExternalState, QueueError> {
        Ok(self.record.lock().expect("job record mutex poisoned").state)
    }

    fn return_value(&self) -> Option<serde_json::Value> {
        self.record
            .lock()
            .expect("job record mutex poisoned")
            .return_value
            .clone()
    }

    fn token(&self) -> &str {
        &self.token
    }
}

struct InMemoryWorkerHandle {
    shutdown_tx: watch::Sender<WorkerStatus>,
}

#[async_trait]
impl WorkerHandle for InMemoryWorkerHandle {
    async fn pause(&self) {
        let _ = self.shutdown_tx.send(WorkerStatus::Draining);
    }

    async fn resume(&self) {
        let _ = self.shutdown_tx.send(WorkerStatus::Running);
    }

    async fn stop(&self) {
        let _ = self.shutdown_tx.send(WorkerStatus::Stopped);
    }

    fn status(&self) -> WorkerStatus {
        *self.shutdown_tx.borrow()
    }
}

#[async_trait]
impl QueueAdapter for InMemoryQueueAdapter {
    async fn enqueue(
        &self,
        queue: &str,
        data: serde_json::Value,
        options: ResolvedJobOptions,
    ) -> Result<JobId, QueueError> {
        let id = JobId(Uuid::now_v7().to_string());
        let now = self.now_ms();
        let record = Arc::new(StdMutex::new(JobRecord {
            data,
            state: JobExternalState::Waiting,
            priority: options.priority,
            token: Uuid::now_v7().to_string(),
            return_value: None,
            attempts_remaining: options.retries + 1,
        }));

        let mut queues = self.queues.lock().expect("queues mutex poisoned");
        let state = queues.entry(queue.to_string()).or_default();
        state.jobs.insert(id.clone(), record.clone());
        if options.delay_ms > 0 {
            record.lock().expect("job record mutex poisoned").state = JobExternalState::Delayed;
            state.delayed.push((now + options.delay_ms as i64, id.clone()));
        } else {
            state.wait_fifo.push_back(id.clone());
        }
        Ok(id)
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> Result<Option<Arc<dyn QueueJob>>, QueueError> {
        let queues = self.queues.lock().expect("queues mutex poisoned");
        let Some(state) = queues.get(queue) else {
            return Ok(None);
        };
        let Some(record) = state.jobs.get(id) else {
            return Ok(None);
        };
        let token = record.lock().expect("job record mutex poisoned").token.clone();
        Ok(Some(Arc::new(InMemoryJob {
            id: id.clone(),
            queue: queue.to_string(),
            record: record.clone(),
            adapter: self.clone(),
            token,
        })))
    }

    async fn get_delayed(&self, queue: &str) -> Result<Vec<Arc<dyn QueueJob>>, QueueError> {
        let queues = self.queues.lock().expect("queues mutex poisoned");
        let Some(state) = queues.get(queue) else {
            return Ok(Vec::new());
        };
        Ok(state
            .delayed
            .iter()
            .filter_map(|(_, id)| {
                state.jobs.get(id).map(|record| {
                    let token = record.lock().expect("job record mutex poisoned").token.clone();
                    Arc::new(InMemoryJob {
                        id: id.clone(),
                        queue: queue.to_string(),
                        record: record.clone(),
                        adapter: self.clone(),
                        token,
                    }) as Arc<dyn QueueJob>
                })
            })
            .collect())
    }

    async fn worker(
        &self,
        queue: &str,
        opts: WorkerOptions,
        handler: JobHandlerFn,
    ) -> Result<Box<dyn WorkerHandle>, QueueError> {
        let initial_status = if opts.autorun {
            WorkerStatus::Running
        } else {
            WorkerStatus::Draining
        };
        let (shutdown_tx, mut shutdown_rx) = watch::channel(initial_status);
        let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
        let adapter = self.clone();
        let queue_name = queue.to_string();
        let poll_lock = Arc::new(Mutex::new(()));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(5));
            loop {
                interval.tick().await;
                if *shutdown_rx.borrow() == WorkerStatus::Stopped {
                    break;
                }
                if *shutdown_rx.borrow() != WorkerStatus::Running {
                    continue;
                }
                adapter.sweep_delayed();

                let next_id = {
                    let _guard = poll_lock.lock().await;
                    let mut queues = adapter.queues.lock().expect("queues mutex poisoned");
                    let state = queues.entry(queue_name.clone()).or_default();
                    state.wait_fifo.pop_front()
                };
                let Some(id) = next_id else {
                    continue;
                };
                let Ok(Some(job)) = QueueAdapter::get_job(&adapter, &queue_name, &id).await else {
                    continue;
                };
                {
                    let queues = adapter.queues.lock().expect("queues mutex poisoned");
                    if let Some(state) = queues.get(&queue_name) {
                        if let Some(record) = state.jobs.get(&id) {
                            record.lock().expect("job record mutex poisoned").state =
                                JobExternalState::Active;
                        }
                    }
                }

                let permit = semaphore.clone().acquire_owned().await.expect("semaphore closed");
                let handler = handler.clone();
                let adapter_for_task = adapter.clone();
                let queue_for_task = queue_name.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    run_one(adapter_for_task, queue_for_task, job, handler).await;
                });
            }
        });

        Ok(Box::new(InMemoryWorkerHandle { shutdown_tx }))
    }
}

async fn run_one(
    adapter: InMemoryQueueAdapter,
    queue: String,
    job: Arc<dyn QueueJob>,
    handler: JobHandlerFn,
) {
    let fut: HandlerFuture = handler(job.clone());
    match fut.await {
        Ok(return_value) => {
            let queues = adapter.queues.lock().expect("queues mutex poisoned");
            if let Some(state) = queues.get(&queue) {
                if let Some(record) = state.jobs.get(job.id()) {
                    let mut record = record.lock().expect("job record mutex poisoned");
                    record.state = JobExternalState::Completed;
                    record.return_value = Some(return_value);
                }
            }
        }
        Err(JobError::Suspend) => {
            // The step primitive already called `move_to_delayed`; the
            // dispatch is not a failure, nothing further to do.
        }
        Err(JobError::Unrecoverable(message)) => {
            mark_failed(&adapter, &queue, job.id(), message, true);
        }
        Err(JobError::Step(failure)) => {
            mark_failed(&adapter, &queue, job.id(), failure.to_string(), false);
        }
    }
}

fn mark_failed(
    adapter: &InMemoryQueueAdapter,
    queue: &str,
    id: &JobId,
    message: String,
    skip_retry: bool,
) {
    let mut queues = adapter.queues.lock().expect("queues mutex poisoned");
    let Some(state) = queues.get_mut(queue) else {
        return;
    };
    let Some(record) = state.jobs.get(id).cloned() else {
        return;
    };
    let mut record = record.lock().expect("job record mutex poisoned");
    if skip_retry {
        record.state = JobExternalState::Failed;
        return;
    }
    if record.attempts_remaining > 1 {
        record.attempts_remaining -= 1;
        record.state = JobExternalState::Waiting;
        drop(record);
        state.wait_fifo.push_back(id.clone());
    } else {
        record.state = JobExternalState::Failed;
        tracing::debug!(job_id = %id, error = %message, "job exhausted retries");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_then_get_job_round_trips_data() {
        let adapter = InMemoryQueueAdapter::new();
        let id = adapter
            .enqueue(
                "q",
                serde_json::json!({"prepared": true}),
                ResolvedJobOptions::default(),
            )
            .await
            .unwrap();
        let job = adapter.get_job("q", &id).await.unwrap().unwrap();
        assert_eq!(job.data()["prepared"], true);
        assert_eq!(job.get_state().await.unwrap(), JobExternalState::Waiting);
    }

    #[tokio::test]
    async fn move_to_delayed_then_sweep_promotes_job() {
        let adapter = InMemoryQueueAdapter::new();
        let id = adapter
            .enqueue("q", serde_json::json!({}), ResolvedJobOptions::default())
            .await
            .unwrap();
        let job = adapter.get_job("q", &id).await.unwrap().unwrap();
        job.move_to_delayed(adapter.now_ms() + 100, job.token()).await.unwrap();
        assert_eq!(job.get_state().await.unwrap(), JobExternalState::Delayed);

        adapter.advance_time(50);
        assert_eq!(job.get_state().await.unwrap(), JobExternalState::Delayed);

        adapter.advance_time(60);
        assert_eq!(job.get_state().await.unwrap(), JobExternalState::Waiting);
    }

    #[tokio::test]
    async fn promote_moves_job_out_of_delayed_immediately() {
        let adapter = InMemoryQueueAdapter::new();
        let id = adapter
            .enqueue("q", serde_json::json!({}), ResolvedJobOptions::default())
            .await
            .unwrap();
        let job = adapter.get_job("q", &id).await.unwrap().unwrap();
        job.move_to_delayed(adapter.now_ms() + 10_000, job.token()).await.unwrap();
        job.promote().await.unwrap();
        assert_eq!(job.get_state().await.unwrap(), JobExternalState::Waiting);
        let delayed = adapter.get_delayed("q").await.unwrap();
        assert!(delayed.is_empty());
    }
}
