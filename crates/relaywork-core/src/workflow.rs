//! Workflow declaration and the type-erased registry used by `invoke` to
//! dispatch to a workflow by string id.
//!
//! `AnyWorkflow` + `WorkflowWrapper<W>` + string-keyed factories let the
//! worker loop dispatch to any registered workflow without knowing its
//! concrete input/output types.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::client::ClientInner;
use crate::context::ExecutionContext;
use crate::error::JobError;
use crate::job_executor::JobExecutor;
use crate::options::JobOptions;
use crate::queue::{QueueAdapter, QueueJob, WorkerOptions};

/// A named, durable workflow function.
///
/// `ID` is the queue name and must be unique per client. `Input`/`Output`
/// carry the workflow's payload and result types; both must be
/// JSON-serializable since they cross the queue-adapter boundary.
#[async_trait]
pub trait Workflow: Send + Sync + Sized + 'static {
    const ID: &'static str;

    type Input: Serialize + DeserializeOwned + Send + Sync + 'static;
    type Output: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Per-workflow default job options, merged under the client's own
    /// defaults and over by any per-job options.
    fn default_options() -> JobOptions {
        JobOptions::default()
    }

    /// Local concurrency and rate-limiting for this workflow's worker loop.
    /// Defaults to a single concurrent job, auto-started.
    fn worker_options() -> WorkerOptions {
        WorkerOptions::default().with_autorun(true)
    }

    async fn run(
        ctx: &ExecutionContext,
        job: &Arc<dyn QueueJob>,
        input: Self::Input,
    ) -> Result<Self::Output, JobError>;
}

/// A boxed future returning a workflow's JSON-encoded output or a
/// [`JobError`], used by the type-erased [`AnyWorkflow`] boundary.
pub type AnyWorkflowFuture =
    Pin<Box<dyn Future<Output = Result<serde_json::Value, JobError>> + Send>>;

/// Type-erased workflow entry point, built by [`WorkflowWrapper`] so that
/// `invoke`/the worker loop can dispatch to any registered workflow
/// without knowing its concrete `Workflow::Input`/`Output` types.
pub trait AnyWorkflow: Send + Sync {
    fn workflow_id(&self) -> &'static str;

    fn default_options(&self) -> JobOptions;

    fn worker_options(&self) -> WorkerOptions;

    /// Drive one dispatch of this workflow to completion: loads and
    /// prepares `job`'s [`crate::job::JobState`], runs the workflow
    /// function through a fresh [`JobExecutor`], and persists the result.
    fn run_erased(
        &self,
        adapter: Arc<dyn QueueAdapter>,
        registry: Arc<WorkflowRegistry>,
        job: Arc<dyn QueueJob>,
    ) -> AnyWorkflowFuture;
}

/// Adapts one concrete `W: Workflow` to the type-erased [`AnyWorkflow`]
/// boundary.
pub struct WorkflowWrapper<W> {
    _marker: std::marker::PhantomData<W>,
}

impl<W> WorkflowWrapper<W> {
    pub fn new() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }
}

impl<W> Default for WorkflowWrapper<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Workflow> AnyWorkflow for WorkflowWrapper<W> {
    fn workflow_id(&self) -> &'static str {
        W::ID
    }

    fn default_options(&self) -> JobOptions {
        W::default_options()
    }

    fn worker_options(&self) -> WorkerOptions {
        W::worker_options()
    }

    fn run_erased(
        &self,
        adapter: Arc<dyn QueueAdapter>,
        registry: Arc<WorkflowRegistry>,
        job: Arc<dyn QueueJob>,
    ) -> AnyWorkflowFuture {
        Box::pin(async move {
            let executor = JobExecutor::new(adapter, registry);
            let output = executor.run_once::<W>(job).await?;
            serde_json::to_value(output).map_err(|e| {
                crate::error::JobError::Step(crate::error::StepFailure::Failed {
                    step_id: "<output>".to_string(),
                    message: format!("output failed to serialize: {e}"),
                })
            })
        })
    }
}

/// Maps a workflow id (queue name) to its type-erased entry point.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<&'static str, Arc<dyn AnyWorkflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<W: Workflow>(&mut self) {
        self.workflows
            .insert(W::ID, Arc::new(WorkflowWrapper::<W>::new()));
    }

    /// Register an already type-erased workflow, as supplied to
    /// [`crate::client::Client::new`].
    pub fn insert_erased(&mut self, workflow: Box<dyn AnyWorkflow>) {
        self.workflows.insert(workflow.workflow_id(), Arc::from(workflow));
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn AnyWorkflow>> {
        self.workflows.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.workflows.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.workflows.keys().copied()
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflows", &self.ids().collect::<Vec<_>>())
            .finish()
    }
}

/// A statically typed reference to one registered workflow, obtained from
/// [`crate::client::Client::workflow`]. Holds only a weak back-pointer to
/// the client: the workflow owns no strong reference to the client that
/// registered it.
pub struct WorkflowHandle<W> {
    pub(crate) client: Weak<ClientInner>,
    pub(crate) _marker: std::marker::PhantomData<W>,
}

impl<W> Clone for WorkflowHandle<W> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            _marker: std::marker::PhantomData,
        }
    }
}
