//! [`StepExecutor`]: the five durable step primitives.
//!
//! Every primitive obeys the same first-call/resumption dichotomy driven by
//! [`StepStatus`]. `persist` is the single choke point that writes the
//! full job envelope back to the queue before any suspension, matching
//! the "every persistence point writes the full JobState back to the
//! queue before any suspension" rule.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{JobError, StepFailure};
use crate::job::{Invocation, JobState};
use crate::queue::{JobExternalState, JobId, QueueAdapter, QueueJob};
use crate::step::{StepState, StepStateHandle, StepStatus, StepType};
use crate::workflow::WorkflowRegistry;

/// Invocation-wait poll interval: a waiting caller falls back to polling
/// at this interval if it is never promoted directly. Promotion
/// short-circuits it in the common case.
pub const INVOKE_POLL_INTERVAL_MS: i64 = 1000;

/// Priority assigned to a job the moment it is moved to the delayed set,
/// so post-delay re-dispatch is ordered after freshly arrived work rather
/// than competing with it on the original priority.
pub const DELAYED_DEFAULT_PRIORITY: i32 = i32::MIN;

/// The uniform `{success, ran, result}` shape every step primitive
/// returns on a non-suspending path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome<R> {
    pub success: bool,
    pub ran: bool,
    pub result: R,
}

/// The outcome of a `repeat` step: whether it converged on a truthy result
/// before exhausting its attempt budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepeatOutcome<R> {
    pub completed: bool,
    pub result: Option<R>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RepeatRecord {
    attempt: u32,
    last_result: serde_json::Value,
    completed: bool,
    needs_delay: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InvokeRecord {
    job_id: String,
}

/// Implements the five step primitives against one job's shared state.
///
/// Holds the job's full [`JobState`] (generic over `serde_json::Value`,
/// since `StepExecutor` never needs the workflow's concrete input type)
/// behind one mutex, plus a per-run cache of [`StepStateHandle`]s so a
/// replayed dispatch reuses the same handle for a given step id instead of
/// allocating a fresh one — that cache is only reconciled back into
/// `JobState.steps` by [`StepExecutor::persist`] and [`StepExecutor::finish`].
pub struct StepExecutor {
    state: Arc<StdMutex<JobState<serde_json::Value>>>,
    handles: StdMutex<HashMap<String, StepStateHandle>>,
    job: Arc<dyn QueueJob>,
    adapter: Arc<dyn QueueAdapter>,
    registry: Arc<WorkflowRegistry>,
    own_workflow_id: &'static str,
}

impl StepExecutor {
    pub fn new(
        state: Arc<StdMutex<JobState<serde_json::Value>>>,
        job: Arc<dyn QueueJob>,
        adapter: Arc<dyn QueueAdapter>,
        registry: Arc<WorkflowRegistry>,
        own_workflow_id: &'static str,
    ) -> Self {
        Self {
            state,
            handles: StdMutex::new(HashMap::new()),
            job,
            adapter,
            registry,
            own_workflow_id,
        }
    }

    fn for_step(&self, step_id: &str, step_type: StepType) -> StepStateHandle {
        let mut handles = self.handles.lock().expect("handle cache mutex poisoned");
        if let Some(handle) = handles.get(step_id) {
            return handle.clone();
        }
        let existing = self
            .state
            .lock()
            .expect("job state mutex poisoned")
            .steps
            .get(step_id)
            .cloned();
        let initial = existing.unwrap_or_else(|| StepState::new(step_type));
        let handle = StepStateHandle::new(initial);
        handles.insert(step_id.to_string(), handle.clone());
        handle
    }

    /// Flush every cached handle into `JobState.steps` and write the full
    /// envelope back to the queue. Called before every suspension and
    /// after every non-suspending completion/failure.
    async fn persist(&self) -> Result<(), JobError> {
        let blob = {
            let handles = self.handles.lock().expect("handle cache mutex poisoned");
            let mut state = self.state.lock().expect("job state mutex poisoned");
            for (id, handle) in handles.iter() {
                state.steps.insert(id.clone(), handle.snapshot());
            }
            state
                .to_job_data()
                .map_err(|e| JobError::Unrecoverable(e.to_string()))?
        };
        self.job.update_data(blob).await?;
        Ok(())
    }

    /// Reconcile all cached handles into `JobState.steps` without a
    /// network round trip; used by [`crate::job_executor::JobExecutor`]'s
    /// final persistence pass, which serializes metrics/logs/errors in the
    /// same write.
    pub(crate) fn finish(&self) -> HashMap<String, StepState> {
        let handles = self.handles.lock().expect("handle cache mutex poisoned");
        let mut state = self.state.lock().expect("job state mutex poisoned");
        for (id, handle) in handles.iter() {
            state.steps.insert(id.clone(), handle.snapshot());
        }
        state.steps.clone()
    }

    /// Runs `f` exactly once per step id, caching its result for replay.
    pub async fn run<F, Fut, R>(&self, step_id: &str, f: F) -> Result<StepOutcome<R>, JobError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, anyhow::Error>>,
        R: Serialize + DeserializeOwned,
    {
        let handle = self.for_step(step_id, StepType::Run);
        if handle.status() == StepStatus::Completed {
            let result = decode_result(&handle, step_id)?;
            return Ok(StepOutcome {
                success: true,
                ran: false,
                result,
            });
        }

        handle.start();
        match f().await {
            Ok(value) => {
                let encoded = serde_json::to_value(&value)
                    .map_err(|e| JobError::step_failed(step_id, &anyhow::anyhow!(e)))?;
                handle.complete(encoded);
                self.persist().await?;
                Ok(StepOutcome {
                    success: true,
                    ran: true,
                    result: value,
                })
            }
            Err(e) => {
                handle.error(e.to_string());
                self.persist().await?;
                Err(JobError::step_failed(step_id, &e))
            }
        }
    }

    /// Suspends the job for `duration_ms`, resuming once it is due.
    pub async fn sleep(&self, step_id: &str, duration_ms: i64) -> Result<StepOutcome<bool>, JobError> {
        self.sleep_impl(step_id, StepType::Sleep, duration_ms).await
    }

    /// Suspends the job until `timestamp_ms`. Negative durations (the
    /// target time has already passed) degenerate to immediate completion
    /// on the next entry, since the job is simply due the instant it is
    /// delayed.
    pub async fn sleep_until(
        &self,
        step_id: &str,
        timestamp_ms: i64,
    ) -> Result<StepOutcome<bool>, JobError> {
        let duration_ms = timestamp_ms - Utc::now().timestamp_millis();
        self.sleep_impl(step_id, StepType::SleepUntil, duration_ms).await
    }

    async fn sleep_impl(
        &self,
        step_id: &str,
        step_type: StepType,
        duration_ms: i64,
    ) -> Result<StepOutcome<bool>, JobError> {
        let handle = self.for_step(step_id, step_type);
        if handle.status() == StepStatus::Completed {
            return Ok(StepOutcome {
                success: true,
                ran: false,
                result: true,
            });
        }
        if handle.status() == StepStatus::Delayed {
            handle.complete(serde_json::json!(true));
            self.persist().await?;
            return Ok(StepOutcome {
                success: true,
                ran: true,
                result: true,
            });
        }

        handle.start();
        handle.set_delayed();
        self.persist().await?;
        self.job.change_priority(DELAYED_DEFAULT_PRIORITY).await?;
        let until_ms = Utc::now().timestamp_millis() + duration_ms.max(0);
        self.job.move_to_delayed(until_ms, self.job.token()).await?;
        Err(JobError::Suspend)
    }

    /// Retries `f` up to `limit` times, optionally paced by `every_ms`. The
    /// unpaced (`every_ms: None`) branch loops in an explicit bounded loop
    /// rather than tail recursion, since there is no delay to wait out
    /// between attempts.
    pub async fn repeat<F, Fut, R>(
        &self,
        step_id: &str,
        limit: u32,
        every_ms: Option<u64>,
        mut f: F,
    ) -> Result<StepOutcome<RepeatOutcome<R>>, JobError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<R>, anyhow::Error>>,
        R: Serialize + DeserializeOwned,
    {
        let handle = self.for_step(step_id, StepType::Repeat);
        if handle.status() == StepStatus::Completed {
            let record = decode_repeat_record(&handle)?;
            let result = decode_repeat_result::<R>(&record)?;
            return Ok(StepOutcome {
                success: true,
                ran: false,
                result: RepeatOutcome {
                    completed: record.completed,
                    result,
                },
            });
        }

        let mut record = match handle.result() {
            Some(existing) => serde_json::from_value(existing).unwrap_or_default(),
            None => {
                let fresh = RepeatRecord::default();
                handle.start();
                handle.set_result(serde_json::to_value(&fresh).expect("RepeatRecord serializes"));
                self.persist().await?;
                fresh
            }
        };

        if handle.status() == StepStatus::Delayed && record.needs_delay {
            record.needs_delay = false;
            handle.set_result(serde_json::to_value(&record).expect("RepeatRecord serializes"));
            handle.start();
            self.persist().await?;
        } else if handle.status() == StepStatus::Failed {
            // The queue retried a job whose previous attempt at this step
            // raised an ordinary error; resume from the cached record.
            handle.start();
        }

        loop {
            if record.attempt >= limit {
                handle.set_result(serde_json::to_value(&record).expect("RepeatRecord serializes"));
                handle.mark_completed();
                self.persist().await?;
                return Ok(StepOutcome {
                    success: true,
                    ran: true,
                    result: RepeatOutcome {
                        completed: false,
                        result: None,
                    },
                });
            }

            match f().await {
                Ok(Some(value)) => {
                    record.attempt += 1;
                    record.completed = true;
                    record.last_result = serde_json::to_value(&value)
                        .map_err(|e| JobError::step_failed(step_id, &anyhow::anyhow!(e)))?;
                    handle.set_result(serde_json::to_value(&record).expect("RepeatRecord serializes"));
                    handle.mark_completed();
                    self.persist().await?;
                    return Ok(StepOutcome {
                        success: true,
                        ran: true,
                        result: RepeatOutcome {
                            completed: true,
                            result: Some(value),
                        },
                    });
                }
                Ok(None) => {
                    record.attempt += 1;
                    record.last_result = serde_json::Value::Null;

                    if let Some(every) = every_ms {
                        if every > 0 && record.attempt < limit {
                            record.needs_delay = true;
                            handle.set_result(
                                serde_json::to_value(&record).expect("RepeatRecord serializes"),
                            );
                            handle.set_delayed();
                            self.persist().await?;
                            let until_ms = Utc::now().timestamp_millis() + every as i64;
                            self.job.move_to_delayed(until_ms, self.job.token()).await?;
                            return Err(JobError::Suspend);
                        }
                    }

                    handle.set_result(serde_json::to_value(&record).expect("RepeatRecord serializes"));
                    self.persist().await?;
                    // No pacing requested (or limit effectively exhausted
                    // next loop): retry immediately within this dispatch.
                }
                Err(e) => {
                    handle.error(e.to_string());
                    self.persist().await?;
                    return Err(JobError::step_failed(step_id, &e));
                }
            }
        }
    }

    /// Durably invokes another registered workflow and awaits its result.
    pub async fn invoke(
        &self,
        step_id: &str,
        target_workflow_id: &str,
        payload: serde_json::Value,
    ) -> Result<StepOutcome<serde_json::Value>, JobError> {
        let handle = self.for_step(step_id, StepType::InvokeWaitForResult);

        if handle.status() == StepStatus::Completed {
            return Ok(StepOutcome {
                success: true,
                ran: false,
                result: handle.result().unwrap_or(serde_json::Value::Null),
            });
        }

        if handle.status() == StepStatus::Delayed {
            return self.invoke_resume(step_id, &handle, target_workflow_id).await;
        }

        if !self.registry.contains(target_workflow_id) {
            return Err(JobError::Step(StepFailure::unknown_workflow(target_workflow_id)));
        }
        let entry = self
            .registry
            .get(target_workflow_id)
            .expect("just checked containment");
        let options = entry.default_options().resolve();

        let (_, mut target_state) = JobState::<serde_json::Value>::prepare(&payload)
            .map_err(|e| JobError::Unrecoverable(e.to_string()))?;
        target_state.invocations.push(Invocation {
            caller_workflow_id: self.own_workflow_id.to_string(),
            caller_step_id: step_id.to_string(),
        });
        let job_data = target_state
            .to_job_data()
            .map_err(|e| JobError::Unrecoverable(e.to_string()))?;
        let job_id = self
            .adapter
            .enqueue(target_workflow_id, job_data, options)
            .await?;

        handle.start();
        handle.set_result(
            serde_json::to_value(&InvokeRecord { job_id: job_id.0.clone() })
                .expect("InvokeRecord serializes"),
        );
        handle.set_delayed();
        self.persist().await?;

        let until_ms = Utc::now().timestamp_millis() + INVOKE_POLL_INTERVAL_MS;
        self.job.move_to_delayed(until_ms, self.job.token()).await?;
        Err(JobError::Suspend)
    }

    async fn invoke_resume(
        &self,
        step_id: &str,
        handle: &StepStateHandle,
        target_workflow_id: &str,
    ) -> Result<StepOutcome<serde_json::Value>, JobError> {
        let record: InvokeRecord = serde_json::from_value(handle.result().unwrap_or_default())
            .map_err(|e| JobError::Unrecoverable(format!("corrupt invoke record: {e}")))?;
        let job_id = JobId(record.job_id.clone());

        let invoked = self
            .adapter
            .get_job(target_workflow_id, &job_id)
            .await?
            .ok_or_else(|| JobError::Unrecoverable(format!("invoked job {job_id} vanished")))?;

        match invoked.get_state().await? {
            JobExternalState::Completed => {
                let value = invoked.return_value().unwrap_or(serde_json::Value::Null);
                handle.complete(value.clone());
                self.persist().await?;
                Ok(StepOutcome {
                    success: true,
                    ran: true,
                    result: value,
                })
            }
            JobExternalState::Failed => {
                let message = format!("invoked job {job_id} failed");
                handle.error(message.clone());
                self.persist().await?;
                Err(JobError::Step(StepFailure::invoked_job_failed(job_id.0, message)))
            }
            _ => {
                let _ = step_id;
                let until_ms = Utc::now().timestamp_millis() + INVOKE_POLL_INTERVAL_MS;
                self.job.move_to_delayed(until_ms, self.job.token()).await?;
                Err(JobError::Suspend)
            }
        }
    }
}

fn decode_result<R: DeserializeOwned>(handle: &StepStateHandle, step_id: &str) -> Result<R, JobError> {
    let value = handle.result().unwrap_or(serde_json::Value::Null);
    serde_json::from_value(value)
        .map_err(|e| JobError::Unrecoverable(format!("corrupt cached result for step {step_id}: {e}")))
}

fn decode_repeat_record(handle: &StepStateHandle) -> Result<RepeatRecord, JobError> {
    serde_json::from_value(handle.result().unwrap_or_default())
        .map_err(|e| JobError::Unrecoverable(format!("corrupt repeat record: {e}")))
}

fn decode_repeat_result<R: DeserializeOwned>(record: &RepeatRecord) -> Result<Option<R>, JobError> {
    if record.completed {
        serde_json::from_value(record.last_result.clone())
            .map(Some)
            .map_err(|e| JobError::Unrecoverable(format!("corrupt repeat result: {e}")))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::client::{Client, ClientConfig};
    use crate::context::ExecutionContext;
    use crate::queue::memory::InMemoryQueueAdapter;
    use crate::workflow::{Workflow, WorkflowWrapper};

    /// Build a `StepExecutor` over a freshly enqueued job on `queue`, as a
    /// standalone dispatch would see it on first entry.
    async fn executor_for(
        adapter: &Arc<dyn QueueAdapter>,
        registry: &Arc<WorkflowRegistry>,
        queue: &str,
        own_workflow_id: &'static str,
    ) -> (Arc<dyn QueueJob>, StepExecutor) {
        let job_id = adapter
            .enqueue(queue, serde_json::json!({}), Default::default())
            .await
            .unwrap();
        let job = adapter.get_job(queue, &job_id).await.unwrap().unwrap();
        let executor = reload_executor(adapter, registry, &job, own_workflow_id);
        (job, executor)
    }

    /// Rebuild a `StepExecutor` from a job's current persisted data, as each
    /// re-entry dispatch does.
    fn reload_executor(
        adapter: &Arc<dyn QueueAdapter>,
        registry: &Arc<WorkflowRegistry>,
        job: &Arc<dyn QueueJob>,
        own_workflow_id: &'static str,
    ) -> StepExecutor {
        let (_, state) = JobState::<serde_json::Value>::prepare(&job.data()).unwrap();
        StepExecutor::new(
            Arc::new(StdMutex::new(state)),
            job.clone(),
            adapter.clone(),
            registry.clone(),
            own_workflow_id,
        )
    }

    struct Echo;

    #[async_trait]
    impl Workflow for Echo {
        const ID: &'static str = "echo";
        type Input = i64;
        type Output = i64;

        async fn run(
            _ctx: &ExecutionContext,
            _job: &Arc<dyn QueueJob>,
            input: i64,
        ) -> Result<i64, JobError> {
            Ok(input)
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Workflow for AlwaysFails {
        const ID: &'static str = "always-fails";
        type Input = ();
        type Output = ();

        async fn run(
            _ctx: &ExecutionContext,
            _job: &Arc<dyn QueueJob>,
            _input: (),
        ) -> Result<(), JobError> {
            Err(JobError::step_failed("inner", &anyhow::anyhow!("boom")))
        }
    }

    async fn wait_for_external_state(
        adapter: &Arc<dyn QueueAdapter>,
        queue: &str,
        id: &JobId,
        target: JobExternalState,
    ) {
        for _ in 0..200 {
            let job = adapter.get_job(queue, id).await.unwrap().unwrap();
            if job.get_state().await.unwrap() == target {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("job {id} never reached {target:?}");
    }

    #[tokio::test]
    async fn run_is_cached_and_never_reruns_on_replay() {
        let adapter: Arc<dyn QueueAdapter> = InMemoryQueueAdapter::new();
        let registry = Arc::new(WorkflowRegistry::new());
        let (job, executor) = executor_for(&adapter, &registry, "q", "q").await;

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let outcome = executor
            .run("a", move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(42)
                }
            })
            .await
            .unwrap();
        assert!(outcome.ran);
        assert_eq!(outcome.result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Re-entry: rebuild the executor from the persisted job data and call
        // `run` again. The cached result must come back without invoking the
        // closure a second time.
        let replay_executor = reload_executor(&adapter, &registry, &job, "q");
        let calls_clone = calls.clone();
        let replay_outcome = replay_executor
            .run("a", move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(42)
                }
            })
            .await
            .unwrap();
        assert!(!replay_outcome.ran);
        assert_eq!(replay_outcome.result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "closure must not re-run on replay");
    }

    #[tokio::test]
    async fn run_failure_is_recorded_and_rethrown() {
        let adapter: Arc<dyn QueueAdapter> = InMemoryQueueAdapter::new();
        let registry = Arc::new(WorkflowRegistry::new());
        let (job, executor) = executor_for(&adapter, &registry, "q", "q").await;

        let err = executor
            .run("a", || async { Err::<i64, _>(anyhow::anyhow!("boom")) })
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Step(_)));

        let persisted = job.data();
        assert_eq!(persisted["steps"]["a"]["status"], serde_json::json!("failed"));
    }

    #[tokio::test]
    async fn sleep_suspends_then_completes_on_resumption() {
        let adapter_arc = InMemoryQueueAdapter::new();
        let adapter: Arc<dyn QueueAdapter> = adapter_arc.clone();
        let registry = Arc::new(WorkflowRegistry::new());
        let (job, executor) = executor_for(&adapter, &registry, "q", "q").await;

        let err = executor.sleep("s", 50).await.unwrap_err();
        assert!(matches!(err, JobError::Suspend));
        assert_eq!(job.get_state().await.unwrap(), JobExternalState::Delayed);
        assert_eq!(job.data()["steps"]["s"]["status"], serde_json::json!("delayed"));

        adapter_arc.advance_time(2_000);
        assert_eq!(job.get_state().await.unwrap(), JobExternalState::Waiting);

        let resumed = reload_executor(&adapter, &registry, &job, "q");
        let outcome = resumed.sleep("s", 50).await.unwrap();
        assert!(outcome.ran);
        assert!(outcome.result);
        assert_eq!(job.data()["steps"]["s"]["status"], serde_json::json!("completed"));
    }

    #[tokio::test]
    async fn sleep_until_negative_duration_is_immediately_due() {
        let adapter_arc = InMemoryQueueAdapter::new();
        let adapter: Arc<dyn QueueAdapter> = adapter_arc.clone();
        let registry = Arc::new(WorkflowRegistry::new());
        let (job, executor) = executor_for(&adapter, &registry, "q", "q").await;

        let past_ms = Utc::now().timestamp_millis() - 10_000;
        let err = executor.sleep_until("s", past_ms).await.unwrap_err();
        assert!(matches!(err, JobError::Suspend));

        // A negative duration clamps to zero, so it is due as soon as the
        // virtual clock catches up to wall-clock time at the call above.
        adapter_arc.advance_time(2_000);
        assert_eq!(job.get_state().await.unwrap(), JobExternalState::Waiting);

        let resumed = reload_executor(&adapter, &registry, &job, "q");
        let outcome = resumed.sleep_until("s", past_ms).await.unwrap();
        assert!(outcome.ran);
        assert!(outcome.result);
    }

    #[tokio::test]
    async fn repeat_without_pacing_retries_in_process_until_success() {
        let adapter: Arc<dyn QueueAdapter> = InMemoryQueueAdapter::new();
        let registry = Arc::new(WorkflowRegistry::new());
        let (job, executor) = executor_for(&adapter, &registry, "q", "q").await;

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let outcome = executor
            .repeat("p", 5, None, move || {
                let calls = calls_clone.clone();
                async move {
                    let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok::<_, anyhow::Error>(if attempt >= 3 { Some("ok") } else { None })
                }
            })
            .await
            .unwrap();

        assert!(outcome.ran);
        assert_eq!(outcome.result.completed, true);
        assert_eq!(outcome.result.result, Some("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(job.get_state().await.unwrap(), JobExternalState::Waiting);
    }

    #[tokio::test]
    async fn repeat_exhaustion_returns_false_without_suspending() {
        let adapter: Arc<dyn QueueAdapter> = InMemoryQueueAdapter::new();
        let registry = Arc::new(WorkflowRegistry::new());
        let (_job, executor) = executor_for(&adapter, &registry, "q", "q").await;

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let outcome = executor
            .repeat("p", 3, None, move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<Option<&'static str>, anyhow::Error>(None)
                }
            })
            .await
            .unwrap();

        assert!(outcome.ran);
        assert_eq!(outcome.result.completed, false);
        assert_eq!(outcome.result.result, None);
        assert_eq!(calls.load(Ordering::SeqCst), 3, "at most `limit` attempts per dispatch");
    }

    #[tokio::test]
    async fn repeat_with_pacing_suspends_exactly_once_between_attempts() {
        let adapter_arc = InMemoryQueueAdapter::new();
        let adapter: Arc<dyn QueueAdapter> = adapter_arc.clone();
        let registry = Arc::new(WorkflowRegistry::new());
        let (job, executor) = executor_for(&adapter, &registry, "q", "q").await;

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let err = executor
            .repeat("p", 3, Some(50), move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<Option<&'static str>, anyhow::Error>(None)
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Suspend));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(job.data()["steps"]["p"]["status"], serde_json::json!("delayed"));

        adapter_arc.advance_time(2_000);
        let resumed = reload_executor(&adapter, &registry, &job, "q");
        let calls_clone = calls.clone();
        let err = resumed
            .repeat("p", 3, Some(50), move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<Option<&'static str>, anyhow::Error>(None)
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Suspend));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        adapter_arc.advance_time(2_000);
        let resumed = reload_executor(&adapter, &registry, &job, "q");
        let calls_clone = calls.clone();
        let outcome = resumed
            .repeat("p", 3, Some(50), move || {
                let calls = calls_clone.clone();
                async move {
                    let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok::<_, anyhow::Error>(if attempt == 3 { Some("ok") } else { None })
                }
            })
            .await
            .unwrap();
        assert!(outcome.ran);
        assert_eq!(outcome.result.result, Some("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn invoke_unknown_workflow_is_rejected() {
        let adapter: Arc<dyn QueueAdapter> = InMemoryQueueAdapter::new();
        let registry = Arc::new(WorkflowRegistry::new());
        let (_job, executor) = executor_for(&adapter, &registry, "caller", "caller").await;

        let err = executor
            .invoke("call", "nonexistent", serde_json::json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Step(StepFailure::UnknownWorkflow(_))));
    }

    #[tokio::test]
    async fn invoke_suspends_registers_subscription_then_resolves_on_completion() {
        let adapter_arc = InMemoryQueueAdapter::new();
        let adapter: Arc<dyn QueueAdapter> = adapter_arc.clone();
        let mut inner_registry = WorkflowRegistry::new();
        inner_registry.register::<Echo>();
        let registry = Arc::new(inner_registry);

        let client = Client::new(
            ClientConfig::new("redis://unused"),
            adapter.clone(),
            vec![Box::new(WorkflowWrapper::<Echo>::new())],
        )
        .unwrap();
        client.start().await.unwrap();

        let (job, executor) = executor_for(&adapter, &registry, "caller", "caller").await;
        let err = executor
            .invoke("call", Echo::ID, serde_json::json!(9))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Suspend));

        let persisted = job.data();
        let target_job_id = persisted["steps"]["call"]["result"]["job_id"]
            .as_str()
            .unwrap()
            .to_string();
        let target_id = JobId(target_job_id.clone());

        let invoked_job = adapter.get_job(Echo::ID, &target_id).await.unwrap().unwrap();
        let invoked_data = invoked_job.data();
        assert_eq!(invoked_data["invocations"][0]["caller_workflow_id"], "caller");
        assert_eq!(invoked_data["invocations"][0]["caller_step_id"], "call");

        wait_for_external_state(&adapter, Echo::ID, &target_id, JobExternalState::Completed).await;
        client.stop().await.unwrap();

        let resumed = reload_executor(&adapter, &registry, &job, "caller");
        let outcome = resumed
            .invoke("call", Echo::ID, serde_json::json!(9))
            .await
            .unwrap();
        assert!(outcome.ran);
        assert_eq!(outcome.result, serde_json::json!(9));
        assert_eq!(job.data()["steps"]["call"]["status"], serde_json::json!("completed"));
    }

    #[tokio::test]
    async fn invoke_still_pending_resuspends_without_consuming_a_retry() {
        let adapter_arc = InMemoryQueueAdapter::new();
        let adapter: Arc<dyn QueueAdapter> = adapter_arc.clone();
        let mut inner_registry = WorkflowRegistry::new();
        inner_registry.register::<Echo>();
        let registry = Arc::new(inner_registry);

        // Don't start a worker for the target: it stays `waiting` forever,
        // so the resumption branch must keep re-suspending rather than
        // erroring out.
        let (job, executor) = executor_for(&adapter, &registry, "caller", "caller").await;
        let err = executor
            .invoke("call", Echo::ID, serde_json::json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Suspend));

        let resumed = reload_executor(&adapter, &registry, &job, "caller");
        let err = resumed
            .invoke("call", Echo::ID, serde_json::json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Suspend));
        assert_eq!(job.data()["steps"]["call"]["status"], serde_json::json!("delayed"));
    }

    #[tokio::test]
    async fn invoke_reports_invoked_job_failure() {
        let adapter_arc = InMemoryQueueAdapter::new();
        let adapter: Arc<dyn QueueAdapter> = adapter_arc.clone();
        let mut inner_registry = WorkflowRegistry::new();
        inner_registry.register::<AlwaysFails>();
        let registry = Arc::new(inner_registry);

        let client = Client::new(
            ClientConfig::new("redis://unused"),
            adapter.clone(),
            vec![Box::new(WorkflowWrapper::<AlwaysFails>::new())],
        )
        .unwrap();
        client.start().await.unwrap();

        let (job, executor) = executor_for(&adapter, &registry, "caller", "caller").await;
        let err = executor
            .invoke("call", AlwaysFails::ID, serde_json::json!(null))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Suspend));

        let persisted = job.data();
        let target_job_id = persisted["steps"]["call"]["result"]["job_id"]
            .as_str()
            .unwrap()
            .to_string();
        let target_id = JobId(target_job_id);

        wait_for_external_state(&adapter, AlwaysFails::ID, &target_id, JobExternalState::Failed).await;
        client.stop().await.unwrap();

        let resumed = reload_executor(&adapter, &registry, &job, "caller");
        let err = resumed
            .invoke("call", AlwaysFails::ID, serde_json::json!(null))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Step(StepFailure::InvokedJobFailed { .. })));
        assert_eq!(job.data()["steps"]["call"]["status"], serde_json::json!("failed"));
    }

    #[tokio::test]
    async fn completed_repeat_replays_correctly_after_a_later_step_suspends() {
        let adapter_arc = InMemoryQueueAdapter::new();
        let adapter: Arc<dyn QueueAdapter> = adapter_arc.clone();
        let registry = Arc::new(WorkflowRegistry::new());
        let (job, executor) = executor_for(&adapter, &registry, "q", "q").await;

        let outcome = executor
            .repeat("p", 3, None, move || async {
                Ok::<_, anyhow::Error>(Some("ok"))
            })
            .await
            .unwrap();
        assert_eq!(outcome.result.result, Some("ok"));

        // A step after the repeat suspends the job (e.g. a sleep). On the
        // next dispatch the repeat step must still decode from its cached
        // `RepeatRecord`, not the bare completion result `complete` used to
        // overwrite it with.
        let err = executor.sleep("s", 50).await.unwrap_err();
        assert!(matches!(err, JobError::Suspend));

        adapter_arc.advance_time(2_000);
        let resumed = reload_executor(&adapter, &registry, &job, "q");
        let replay = resumed
            .repeat("p", 3, None, move || async {
                panic!("a completed repeat step must not re-run its closure")
            })
            .await
            .unwrap();
        assert!(!replay.ran);
        assert!(replay.result.completed);
        assert_eq!(replay.result.result, Some("ok".to_string()));
    }

    #[tokio::test]
    async fn run_step_can_retry_after_a_queue_driven_redispatch() {
        let adapter: Arc<dyn QueueAdapter> = InMemoryQueueAdapter::new();
        let registry = Arc::new(WorkflowRegistry::new());
        let (job, executor) = executor_for(&adapter, &registry, "q", "q").await;

        let err = executor
            .run("a", || async { Err::<i64, _>(anyhow::anyhow!("boom")) })
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Step(_)));
        assert_eq!(job.data()["steps"]["a"]["status"], serde_json::json!("failed"));

        // The queue's retry policy re-dispatches the job: a fresh
        // `StepExecutor` is built over the persisted (failed) step state.
        // `start()` must accept the `failed -> active` transition rather
        // than panicking or refusing to run.
        let retried = reload_executor(&adapter, &registry, &job, "q");
        let outcome = retried.run("a", || async { Ok::<_, anyhow::Error>(42) }).await.unwrap();
        assert!(outcome.ran);
        assert_eq!(outcome.result, 42);
        assert_eq!(job.data()["steps"]["a"]["status"], serde_json::json!("completed"));
        assert!(job.data()["steps"]["a"]["error"].is_null());
    }
}
