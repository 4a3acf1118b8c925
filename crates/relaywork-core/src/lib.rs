//! Durable, replay-safe workflow execution over a pluggable job queue.
//!
//! A workflow is a named async function that consumes a typed input and
//! interacts with an [`ExecutionContext`] exposing five durable step
//! primitives: `run`, `sleep`, `sleep_until`, `repeat`, and `invoke`. Every
//! primitive is replay-safe: on re-entry (after a sleep, a delay, or a
//! worker restart) a completed step returns its recorded result without
//! re-running, and only the next undone step performs work.
//!
//! The core never talks to a concrete backend directly — every mutation
//! goes through the [`queue::QueueAdapter`] trait. `relaywork-core` ships
//! an in-memory adapter ([`queue::memory::InMemoryQueueAdapter`]) for
//! tests and examples; the `relaywork-redis` crate provides the
//! production Redis-backed adapter.
//!
//! ```text
//! Client ── WorkflowRegistry ── AnyWorkflow ── JobExecutor ── StepExecutor
//!                                                  │              │
//!                                            ExecutionContext     │
//!                                                  └──── JobState ┘
//! ```

pub mod client;
pub mod context;
pub mod error;
pub mod executor;
pub mod job;
pub mod job_executor;
pub mod options;
pub mod queue;
pub mod step;
pub mod workflow;

pub use client::{Client, ClientConfig};
pub use context::ExecutionContext;
pub use error::{ClientError, ErrorEntry, JobError, JobStateError, StepFailure};
pub use executor::{RepeatOutcome, StepExecutor, StepOutcome};
pub use job::{CompressionMode, Invocation, JobMetrics, JobState, LogEntry, LogLevel};
pub use job_executor::JobExecutor;
pub use options::{Deduplication, JobOptions, JobOrder, ResolvedJobOptions};
pub use queue::{JobExternalState, JobId, QueueAdapter, QueueError, QueueJob, WorkerOptions};
pub use step::{StepState, StepStatus, StepType};
pub use workflow::{AnyWorkflow, Workflow, WorkflowHandle, WorkflowRegistry, WorkflowWrapper};
