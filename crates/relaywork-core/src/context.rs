//! [`ExecutionContext`]: the handle a [`crate::workflow::Workflow::run`]
//! implementation receives, wrapping [`crate::executor::StepExecutor`]'s
//! primitives plus buffered logging.
//!
//! The executor is bound once, by [`crate::job_executor::JobExecutor`],
//! immediately before the workflow function is invoked; every public
//! method here panics-as-`NotReady` rather than accepting an unbound
//! context, since a workflow can never legitimately observe one.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Mutex as StdMutex;

use crate::error::{JobError, StepFailure};
use crate::executor::{RepeatOutcome, StepExecutor, StepOutcome};
use crate::job::{LogEntry, LogLevel};
use crate::workflow::Workflow;

/// Passed by reference to every `Workflow::run` call. Exposes the five
/// durable step primitives and a per-dispatch log buffer.
#[derive(Default)]
pub struct ExecutionContext {
    executor: OnceLock<Arc<StepExecutor>>,
    logs: StdMutex<Vec<LogEntry>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the executor this context will delegate to. Called exactly
    /// once per dispatch, before the workflow function runs.
    pub(crate) fn bind(&self, executor: Arc<StepExecutor>) {
        self.executor
            .set(executor)
            .unwrap_or_else(|_| panic!("ExecutionContext bound twice"));
    }

    fn executor(&self) -> Result<&Arc<StepExecutor>, JobError> {
        self.executor
            .get()
            .ok_or_else(|| JobError::Step(StepFailure::NotReady))
    }

    /// Run a fallible, non-idempotent action exactly once per job, caching
    /// its result across re-entries.
    pub async fn run<F, Fut, R>(&self, step_id: &str, f: F) -> Result<StepOutcome<R>, JobError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, anyhow::Error>>,
        R: Serialize + DeserializeOwned,
    {
        self.executor()?.run(step_id, f).await
    }

    /// Durably sleep for `duration_ms` milliseconds, suspending the job via
    /// the queue's delayed set rather than blocking the worker thread.
    pub async fn sleep(&self, step_id: &str, duration_ms: i64) -> Result<StepOutcome<bool>, JobError> {
        self.executor()?.sleep(step_id, duration_ms).await
    }

    /// Durably sleep until the given Unix-epoch-millisecond timestamp.
    pub async fn sleep_until(
        &self,
        step_id: &str,
        timestamp_ms: i64,
    ) -> Result<StepOutcome<bool>, JobError> {
        self.executor()?.sleep_until(step_id, timestamp_ms).await
    }

    /// Retry `f` until it returns `Some`, up to `limit` attempts, optionally
    /// pacing attempts `every_ms` milliseconds apart via the delayed set.
    pub async fn repeat<F, Fut, R>(
        &self,
        step_id: &str,
        limit: u32,
        every_ms: Option<u64>,
        f: F,
    ) -> Result<StepOutcome<RepeatOutcome<R>>, JobError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<R>, anyhow::Error>>,
        R: Serialize + DeserializeOwned,
    {
        self.executor()?.repeat(step_id, limit, every_ms, f).await
    }

    /// Enqueue `target_workflow_id` with a raw JSON `payload` and durably
    /// wait for its result.
    pub async fn invoke(
        &self,
        step_id: &str,
        target_workflow_id: &str,
        payload: serde_json::Value,
    ) -> Result<StepOutcome<serde_json::Value>, JobError> {
        self.executor()?.invoke(step_id, target_workflow_id, payload).await
    }

    /// Typed convenience wrapper over [`Self::invoke`]: serializes `input`
    /// to JSON, dispatches to `W::ID`, and decodes the result as `W::Output`.
    pub async fn invoke_workflow<W: Workflow>(
        &self,
        step_id: &str,
        input: &W::Input,
    ) -> Result<StepOutcome<W::Output>, JobError> {
        let payload = serde_json::to_value(input)
            .map_err(|e| JobError::Unrecoverable(format!("failed to serialize invoke payload: {e}")))?;
        let outcome = self.invoke(step_id, W::ID, payload).await?;
        let result: W::Output = serde_json::from_value(outcome.result).map_err(|e| {
            JobError::Unrecoverable(format!("invoked workflow {} returned an unexpected shape: {e}", W::ID))
        })?;
        Ok(StepOutcome {
            success: outcome.success,
            ran: outcome.ran,
            result,
        })
    }

    /// Buffer a log entry for this dispatch and emit a `tracing` event at
    /// the matching level. Logs are not persisted individually;
    /// [`crate::job_executor::JobExecutor`] drains and appends the buffer
    /// to `JobState.logs` at the end of the run.
    pub fn log(&self, level: LogLevel, message: impl Into<String>, metadata: Option<serde_json::Value>) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!(metadata = ?metadata, "{}", message),
            LogLevel::Info => tracing::info!(metadata = ?metadata, "{}", message),
            LogLevel::Warn => tracing::warn!(metadata = ?metadata, "{}", message),
            LogLevel::Error => tracing::error!(metadata = ?metadata, "{}", message),
        }
        let entry = LogEntry {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            level,
            message,
            metadata,
        };
        self.logs.lock().expect("log buffer mutex poisoned").push(entry);
    }

    /// Take every buffered log entry, leaving the buffer empty.
    pub(crate) fn drain_logs(&self) -> Vec<LogEntry> {
        std::mem::take(&mut self.logs.lock().expect("log buffer mutex poisoned"))
    }
}
