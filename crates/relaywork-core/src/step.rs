//! [`StepState`] and its handle: the per-step state machine (active,
//! completed, failed, delayed) and a `Mutex`-guarded handle so
//! `StepExecutor` can mutate a step's record across await points without
//! re-acquiring the parent job lock each time.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Kind of a step. Set once, at first creation, and never changes
/// afterward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Run,
    Sleep,
    SleepUntil,
    Repeat,
    InvokeWaitForResult,
}

/// A step's position in the state machine:
/// transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Active,
    Completed,
    Failed,
    Delayed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepMetrics {
    pub started_at: Option<chrono::DateTime<Utc>>,
    pub completed_at: Option<chrono::DateTime<Utc>>,
    pub failed_at: Option<chrono::DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// The persisted record for one step. `result`/`error` are opaque JSON
/// since the engine only interprets two protocol shapes out of them
/// (repeat's and invoke's in-flight records), both stored here as
/// ordinary `serde_json::Value`s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub status: StepStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub metrics: StepMetrics,
}

impl StepState {
    pub fn new(step_type: StepType) -> Self {
        Self {
            step_type,
            status: StepStatus::Active,
            result: None,
            error: None,
            metrics: StepMetrics::default(),
        }
    }
}

/// A mutation handle over one [`StepState`], cached per dispatch by
/// [`crate::executor::StepExecutor::for_step`] so that repeated access
/// within a single job run always sees the same in-flight mutations.
#[derive(Debug, Clone)]
pub struct StepStateHandle {
    inner: Arc<Mutex<StepState>>,
}

impl StepStateHandle {
    pub fn new(state: StepState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub fn snapshot(&self) -> StepState {
        self.inner.lock().expect("step state mutex poisoned").clone()
    }

    pub fn status(&self) -> StepStatus {
        self.inner.lock().expect("step state mutex poisoned").status
    }

    pub fn step_type(&self) -> StepType {
        self.inner.lock().expect("step state mutex poisoned").step_type
    }

    /// `absent`/`active`/`delayed`/`failed` → `active`. Sets `started_at`
    /// the first time. Re-entering from `failed` is the queue's retry
    /// policy re-dispatching a job whose step errored on a previous
    /// attempt; the stale error is cleared so the step gets a clean slate.
    pub fn start(&self) {
        let mut state = self.inner.lock().expect("step state mutex poisoned");
        debug_assert!(
            matches!(state.status, StepStatus::Active | StepStatus::Delayed | StepStatus::Failed),
            "start() called on a completed step"
        );
        if state.metrics.started_at.is_none() {
            state.metrics.started_at = Some(Utc::now());
        }
        if state.status == StepStatus::Failed {
            state.error = None;
        }
        state.status = StepStatus::Active;
    }

    /// `active`/`delayed` → `completed`.
    pub fn complete(&self, result: serde_json::Value) {
        self.mark_completed();
        self.inner.lock().expect("step state mutex poisoned").result = Some(result);
    }

    /// `active`/`delayed` → `completed`, leaving `result` untouched. Used
    /// by steps that already wrote their own protocol record via
    /// [`Self::set_result`] and must not have it clobbered by a bare
    /// user-facing value.
    pub fn mark_completed(&self) {
        let mut state = self.inner.lock().expect("step state mutex poisoned");
        debug_assert!(
            matches!(state.status, StepStatus::Active | StepStatus::Delayed),
            "mark_completed() called on a step that cannot transition to completed"
        );
        let now = Utc::now();
        let started_at = state.metrics.started_at.unwrap_or(now);
        state.metrics.completed_at = Some(now);
        state.metrics.duration_ms = Some((now - started_at).num_milliseconds());
        state.status = StepStatus::Completed;
    }

    /// `active`/`delayed` → `failed`.
    pub fn error(&self, message: impl Into<String>) {
        let mut state = self.inner.lock().expect("step state mutex poisoned");
        debug_assert!(
            matches!(state.status, StepStatus::Active | StepStatus::Delayed),
            "error() called on a step that cannot transition to failed"
        );
        state.metrics.failed_at = Some(Utc::now());
        state.error = Some(serde_json::Value::String(message.into()));
        state.status = StepStatus::Failed;
    }

    /// `active`/`delayed` → `delayed`.
    pub fn set_delayed(&self) {
        let mut state = self.inner.lock().expect("step state mutex poisoned");
        debug_assert!(
            matches!(state.status, StepStatus::Active | StepStatus::Delayed),
            "set_delayed() called on a step that cannot be delayed"
        );
        state.status = StepStatus::Delayed;
    }

    /// Replace the protocol record carried in `result` (used by `repeat`
    /// and `invoke`, whose in-flight state is a multi-field struct rather
    /// than a plain user value).
    pub fn set_result(&self, result: serde_json::Value) {
        self.inner.lock().expect("step state mutex poisoned").result = Some(result);
    }

    pub fn result(&self) -> Option<serde_json::Value> {
        self.inner.lock().expect("step state mutex poisoned").result.clone()
    }
}

impl From<StepState> for StepStateHandle {
    fn from(state: StepState) -> Self {
        StepStateHandle::new(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_sets_started_at_once() {
        let handle = StepStateHandle::new(StepState::new(StepType::Run));
        handle.start();
        let first = handle.snapshot().metrics.started_at;
        handle.start();
        let second = handle.snapshot().metrics.started_at;
        assert_eq!(first, second);
    }

    #[test]
    fn complete_computes_duration_and_stores_result() {
        let handle = StepStateHandle::new(StepState::new(StepType::Run));
        handle.start();
        handle.complete(serde_json::json!(42));
        let snap = handle.snapshot();
        assert_eq!(snap.status, StepStatus::Completed);
        assert_eq!(snap.result, Some(serde_json::json!(42)));
        assert!(snap.metrics.duration_ms.is_some());
    }

    #[test]
    fn error_records_failed_state() {
        let handle = StepStateHandle::new(StepState::new(StepType::Run));
        handle.start();
        handle.error("boom");
        let snap = handle.snapshot();
        assert_eq!(snap.status, StepStatus::Failed);
        assert_eq!(snap.error, Some(serde_json::json!("boom")));
    }

    #[test]
    fn set_delayed_marks_status() {
        let handle = StepStateHandle::new(StepState::new(StepType::Sleep));
        handle.start();
        handle.set_delayed();
        assert_eq!(handle.status(), StepStatus::Delayed);
    }

    #[test]
    fn start_resets_a_failed_step_to_active() {
        let handle = StepStateHandle::new(StepState::new(StepType::Run));
        handle.start();
        handle.error("boom");
        assert_eq!(handle.status(), StepStatus::Failed);

        handle.start();
        let snap = handle.snapshot();
        assert_eq!(snap.status, StepStatus::Active);
        assert!(snap.error.is_none(), "retrying must clear the stale error");
    }

    #[test]
    fn mark_completed_leaves_result_untouched() {
        let handle = StepStateHandle::new(StepState::new(StepType::Repeat));
        handle.start();
        handle.set_result(serde_json::json!({"attempt": 2}));
        handle.mark_completed();
        let snap = handle.snapshot();
        assert_eq!(snap.status, StepStatus::Completed);
        assert_eq!(snap.result, Some(serde_json::json!({"attempt": 2})));
    }
}
