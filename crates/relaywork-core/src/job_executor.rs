//! [`JobExecutor`]: drives exactly one dispatch of a workflow function
//! (init/execute/finally).

use std::sync::{Arc, Mutex as StdMutex};

use tracing::warn;

use crate::context::ExecutionContext;
use crate::error::JobError;
use crate::job::JobState;
use crate::queue::{QueueAdapter, QueueJob};
use crate::step::StepStatus;
use crate::workflow::{Workflow, WorkflowRegistry};

/// Owns the adapter/registry pair every dispatch needs and drives one job
/// through init → execute → finally. A fresh `JobExecutor` is constructed
/// per dispatch by [`crate::workflow::WorkflowWrapper::run_erased`]; it
/// carries no state of its own across calls.
pub struct JobExecutor {
    adapter: Arc<dyn QueueAdapter>,
    registry: Arc<WorkflowRegistry>,
}

impl JobExecutor {
    pub fn new(adapter: Arc<dyn QueueAdapter>, registry: Arc<WorkflowRegistry>) -> Self {
        Self { adapter, registry }
    }

    /// Run `W`'s workflow function to completion or suspension.
    ///
    /// `init`: parse/prepare `job.data()` into `JobState<Value>`, bump
    /// `attempts`, deserialize `source` into `W::Input`.
    /// `execute`: bind an `ExecutionContext` to a fresh `StepExecutor` over
    /// the shared state and call `W::run`.
    /// `finally`: on every exit path (`Ok`, ordinary `Err`, or a rethrown
    /// sentinel) reconcile step handles, append drained logs, and persist
    /// the full envelope; on clean completion additionally promote waiting
    /// callers. `Suspend` has already persisted via the step primitive that
    /// raised it, so `finally`'s own persist here is a harmless repeat of
    /// the same data, not a second distinct write.
    pub async fn run_once<W: Workflow>(&self, job: Arc<dyn QueueJob>) -> Result<W::Output, JobError> {
        let raw = job.data();
        let (_was_prepared, mut generic_state) = JobState::<serde_json::Value>::prepare(&raw)
            .map_err(|e| JobError::Unrecoverable(e.to_string()))?;

        if generic_state.metrics.started_at.is_none() {
            generic_state.metrics.started_at = Some(chrono::Utc::now());
        }
        generic_state.metrics.attempts += 1;

        let input: W::Input = serde_json::from_value(generic_state.source.clone())
            .map_err(|e| JobError::Unrecoverable(format!("input failed schema validation: {e}")))?;

        let state = Arc::new(StdMutex::new(generic_state));
        let executor = Arc::new(crate::executor::StepExecutor::new(
            state.clone(),
            job.clone(),
            self.adapter.clone(),
            self.registry.clone(),
            W::ID,
        ));
        let ctx = ExecutionContext::new();
        ctx.bind(executor.clone());

        let outcome = W::run(&ctx, &job, input).await;

        let logs = ctx.drain_logs();
        let blob = {
            let mut guard = state.lock().expect("job state mutex poisoned");
            guard.steps = executor.finish();
            guard.logs.extend(logs);
            match &outcome {
                Ok(_) => {
                    guard.metrics.completed_at = Some(chrono::Utc::now());
                }
                Err(e) if !e.is_sentinel() => {
                    guard.metrics.failed_at = Some(chrono::Utc::now());
                    guard
                        .errors
                        .push(crate::error::ErrorEntry::new("<workflow>", e.to_string()));
                }
                Err(_) => {
                    // Suspend/Unrecoverable: no terminal timestamp recorded
                    // here, the step primitive that raised Suspend already
                    // persisted, and Unrecoverable is reported upstream.
                }
            }
            guard
                .to_job_data()
                .map_err(|e| JobError::Unrecoverable(e.to_string()))?
        };
        job.update_data(blob).await?;

        match outcome {
            Ok(output) => {
                self.promote_subscribers(&state, job.as_ref()).await;
                Ok(output)
            }
            Err(e) => Err(e),
        }
    }

    /// Completion hook: for every job waiting on this one, locate
    /// its delayed `invoke` step and promote it out of the delayed set.
    /// Failures here are logged and swallowed — the one place in the
    /// engine where an error is deliberately discarded.
    async fn promote_subscribers(
        &self,
        state: &Arc<StdMutex<JobState<serde_json::Value>>>,
        self_job: &dyn QueueJob,
    ) {
        let invocations = state.lock().expect("job state mutex poisoned").invocations.clone();
        let self_job_id = self_job.id().to_string();

        for invocation in invocations {
            let candidates = match self.adapter.get_delayed(&invocation.caller_workflow_id).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(
                        caller_workflow_id = %invocation.caller_workflow_id,
                        error = %e,
                        "failed to scan delayed jobs while promoting an invocation subscriber"
                    );
                    continue;
                }
            };

            for candidate in candidates {
                if let Err(e) = self
                    .try_promote_one(candidate.as_ref(), &invocation.caller_step_id, &self_job_id)
                    .await
                {
                    warn!(
                        job_id = %candidate.id(),
                        step_id = %invocation.caller_step_id,
                        error = %e,
                        "failed to promote an invocation subscriber"
                    );
                }
            }
        }
    }

    async fn try_promote_one(
        &self,
        candidate: &dyn QueueJob,
        caller_step_id: &str,
        self_job_id: &str,
    ) -> Result<(), crate::queue::QueueError> {
        let raw = candidate.data();
        let Some(step) = raw.get("steps").and_then(|s| s.get(caller_step_id)) else {
            return Ok(());
        };
        let status: Option<StepStatus> = step
            .get("status")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok());
        if status != Some(StepStatus::Delayed) {
            return Ok(());
        }
        let matches = step
            .get("result")
            .and_then(|r| r.get("job_id"))
            .and_then(|v| v.as_str())
            .map(|id| id == self_job_id)
            .unwrap_or(false);
        if matches {
            candidate.promote().await?;
        }
        Ok(())
    }
}
