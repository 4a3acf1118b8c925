//! Error taxonomy for the durable step engine.
//!
//! [`JobError`] is the boundary type every step primitive and workflow
//! function returns. Its two sentinel variants, [`JobError::Suspend`] and
//! [`JobError::Unrecoverable`], are not errors in the user sense: they cross
//! the workflow function untouched and are interpreted by the worker loop
//! rather than by any retry policy.

/// The error type returned by step primitives and workflow functions.
///
/// `Suspend` and `Unrecoverable` are control sentinels: a step primitive
/// that needs to hand control back to the queue raises `Suspend` after it
/// has already moved the job into the delayed set, and a workflow that
/// wants to skip the queue's retry policy entirely raises `Unrecoverable`.
/// Both propagate through `?` like any other error; the difference is
/// purely in how [`crate::job_executor::JobExecutor`] and the worker loop
/// interpret the variant once it reaches them.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The job has been moved to the delayed set; the dispatch is not a
    /// failure and must not consume a retry attempt.
    #[error("job suspended")]
    Suspend,

    /// Terminal failure. Skips the queue's retry policy entirely.
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),

    /// An ordinary step failure, eligible for the queue's retry policy.
    #[error(transparent)]
    Step(#[from] StepFailure),
}

impl JobError {
    /// True for the two control sentinels that must never be treated as
    /// ordinary, retryable failures.
    pub fn is_sentinel(&self) -> bool {
        matches!(self, JobError::Suspend | JobError::Unrecoverable(_))
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        JobError::Unrecoverable(message.into())
    }

    /// Wrap an arbitrary user error (from a `run`/`repeat` closure) as a
    /// step failure attributed to `step_id`.
    pub fn step_failed(step_id: impl Into<String>, err: &anyhow::Error) -> Self {
        JobError::Step(StepFailure::Failed {
            step_id: step_id.into(),
            message: err.to_string(),
        })
    }
}

/// Ordinary (non-sentinel) step and context failures.
#[derive(Debug, thiserror::Error)]
pub enum StepFailure {
    #[error("step {step_id} failed: {message}")]
    Failed { step_id: String, message: String },

    #[error("workflow {0} is not registered with this client")]
    UnknownWorkflow(String),

    #[error("invoked job {job_id} failed: {message}")]
    InvokedJobFailed { job_id: String, message: String },

    #[error("execution context used before the executor was bound")]
    NotReady,
}

impl StepFailure {
    pub fn unknown_workflow(workflow_id: impl Into<String>) -> Self {
        StepFailure::UnknownWorkflow(workflow_id.into())
    }

    pub fn invoked_job_failed(job_id: impl Into<String>, message: impl Into<String>) -> Self {
        StepFailure::InvokedJobFailed {
            job_id: job_id.into(),
            message: message.into(),
        }
    }
}

/// Errors raised while preparing or persisting a [`crate::job::JobState`].
#[derive(Debug, thiserror::Error)]
pub enum JobStateError {
    #[error("job input failed schema validation: {0}")]
    SchemaMismatch(#[source] serde_json::Error),

    #[error("refusing to persist a source that is itself a prepared job record")]
    InvalidSource,
}

impl From<crate::queue::QueueError> for JobError {
    /// A queue-adapter failure reaching the engine mid-dispatch (a failed
    /// `move_to_delayed`, a dropped connection during `update_data`, ...)
    /// is not something retrying the same step would fix, so it is folded
    /// into the terminal sentinel rather than the ordinary retry path.
    fn from(err: crate::queue::QueueError) -> Self {
        JobError::Unrecoverable(err.to_string())
    }
}

/// Errors surfaced by [`crate::client::Client`] and [`crate::workflow::WorkflowHandle`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    JobState(#[from] JobStateError),

    #[error("workflow {0} is not registered with this client")]
    UnknownWorkflow(String),

    #[error("queue adapter error: {0}")]
    Queue(String),

    #[error("missing required configuration: {0}")]
    Configuration(String),
}

/// A single entry in [`crate::job::JobState::errors`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorEntry {
    pub step_id: String,
    pub error_message: String,
    pub detail: Option<serde_json::Value>,
}

impl ErrorEntry {
    pub fn new(step_id: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            error_message: error_message.into(),
            detail: None,
        }
    }
}
