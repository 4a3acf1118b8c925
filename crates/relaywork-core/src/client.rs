//! [`Client`]: the user-facing entry point.
//!
//! `Client` owns the [`WorkflowRegistry`] and the [`QueueAdapter`] and
//! drives one worker loop per registered workflow. `WorkflowHandle<W>`
//! (obtained via [`Client::workflow`]) holds only a `Weak` back-pointer
//! to [`ClientInner`], so the client and its workflows never form an `Arc`
//! ownership cycle.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument, warn};

use crate::error::ClientError;
use crate::job::{CompressionMode, JobState};
use crate::job_executor::JobExecutor;
use crate::options::JobOptions;
use crate::queue::{JobId, QueueAdapter, WorkerHandle};
use crate::workflow::{AnyWorkflow, Workflow, WorkflowHandle, WorkflowRegistry};

/// Client-level configuration. Constructible directly or via
/// [`ClientConfig::from_env`], which reads `REDIS_URL`, `RELAYWORK_PREFIX`,
/// and `RELAYWORK_COMPRESSION`.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub redis_url: String,
    pub prefix: String,
    pub default_job_options: JobOptions,
    pub compression: CompressionMode,
}

impl ClientConfig {
    pub fn new(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            prefix: default_prefix(),
            default_job_options: JobOptions::default(),
            compression: CompressionMode::default(),
        }
    }

    /// Read `REDIS_URL` (required), `RELAYWORK_PREFIX` (optional, default
    /// `"relaywork"`), and `RELAYWORK_COMPRESSION` (optional, `"none"` or
    /// `"gzip-hex"`, default `"none"`) from the environment, loading a
    /// `.env` file first if present.
    pub fn from_env() -> Result<Self, ClientError> {
        dotenvy::dotenv().ok();

        let redis_url = std::env::var("REDIS_URL")
            .map_err(|_| ClientError::Configuration("REDIS_URL is not set".to_string()))?;
        let prefix = std::env::var("RELAYWORK_PREFIX").unwrap_or_else(|_| default_prefix());
        let compression = match std::env::var("RELAYWORK_COMPRESSION").ok().as_deref() {
            None | Some("none") => CompressionMode::None,
            Some("gzip-hex") => CompressionMode::GzipHex,
            Some(other) => {
                return Err(ClientError::Configuration(format!(
                    "unrecognised RELAYWORK_COMPRESSION value: {other}"
                )))
            }
        };

        Ok(Self {
            redis_url,
            prefix,
            default_job_options: JobOptions::default(),
            compression,
        })
    }

    pub fn with_default_job_options(mut self, options: JobOptions) -> Self {
        self.default_job_options = options;
        self
    }

    pub fn with_compression(mut self, compression: CompressionMode) -> Self {
        self.compression = compression;
        self
    }
}

fn default_prefix() -> String {
    "relaywork".to_string()
}

/// Shared client state, held behind an `Arc` by [`Client`] and referenced
/// weakly by every [`WorkflowHandle`] it issues.
pub struct ClientInner {
    config: ClientConfig,
    adapter: Arc<dyn QueueAdapter>,
    registry: Arc<WorkflowRegistry>,
    workers: AsyncMutex<HashMap<&'static str, Box<dyn WorkerHandle>>>,
}

/// The durable-workflow client: holds a [`WorkflowRegistry`] and a
/// [`QueueAdapter`], and drives one worker loop per registered workflow.
///
/// The adapter is supplied by the caller rather than constructed from
/// `config.redis_url` directly, since `relaywork-core` has no Redis
/// dependency of its own — `relaywork_redis::RedisQueueAdapter::connect`
/// builds the adapter the production `Client` is wired against, while
/// tests and examples use [`crate::queue::memory::InMemoryQueueAdapter`].
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        adapter: Arc<dyn QueueAdapter>,
        workflows: Vec<Box<dyn AnyWorkflow>>,
    ) -> Result<Self, ClientError> {
        let mut registry = WorkflowRegistry::new();
        for workflow in workflows {
            registry.insert_erased(workflow);
        }
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                adapter,
                registry: Arc::new(registry),
                workers: AsyncMutex::new(HashMap::new()),
            }),
        })
    }

    /// Validate the client is ready to dispatch. There is no network
    /// handshake to perform here beyond what `adapter` already did at
    /// construction; `init` is kept separate from `start` to give future
    /// adapters a place to hook connection warm-up.
    #[instrument(skip(self))]
    pub async fn init(&self) -> Result<(), ClientError> {
        info!(workflows = self.inner.registry.ids().count(), "client initialised");
        Ok(())
    }

    /// Start a worker loop for every registered workflow.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), ClientError> {
        let mut workers = self.inner.workers.lock().await;
        for id in self.inner.registry.ids() {
            if workers.contains_key(id) {
                continue;
            }
            let entry = self
                .inner
                .registry
                .get(id)
                .expect("id came from registry.ids()");
            let adapter = self.inner.adapter.clone();
            let registry = self.inner.registry.clone();
            let handler_adapter = adapter.clone();
            let handler_registry = registry.clone();
            let handler_entry = entry.clone();
            let handler: crate::queue::JobHandlerFn = Arc::new(move |job| {
                let adapter = handler_adapter.clone();
                let registry = handler_registry.clone();
                let entry = handler_entry.clone();
                Box::pin(async move { entry.run_erased(adapter, registry, job).await })
            });

            let worker_opts = entry.worker_options();
            let handle = self
                .inner
                .adapter
                .worker(id, worker_opts, handler)
                .await
                .map_err(|e| ClientError::Queue(e.to_string()))?;
            workers.insert(id, handle);
            info!(workflow_id = id, "worker started");
        }
        Ok(())
    }

    /// Pause every running worker without tearing it down.
    #[instrument(skip(self))]
    pub async fn pause(&self) -> Result<(), ClientError> {
        let workers = self.inner.workers.lock().await;
        for (id, handle) in workers.iter() {
            handle.pause().await;
            info!(workflow_id = id, "worker paused");
        }
        Ok(())
    }

    /// Stop every worker and drop its handle.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), ClientError> {
        let mut workers = self.inner.workers.lock().await;
        for (id, handle) in workers.iter() {
            handle.stop().await;
            info!(workflow_id = id, "worker stopped");
        }
        workers.clear();
        Ok(())
    }

    /// A statically typed reference to `W`, used to create jobs with
    /// `W::Input` checked at compile time.
    pub fn workflow<W: Workflow>(&self) -> WorkflowHandle<W> {
        if !self.inner.registry.contains(W::ID) {
            warn!(workflow_id = W::ID, "workflow handle requested for an unregistered workflow");
        }
        WorkflowHandle {
            client: Arc::downgrade(&self.inner),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl<W: Workflow> WorkflowHandle<W> {
    /// Enqueue a new job for this workflow. Resolves job options as
    /// `client_defaults.merge(workflow_defaults).merge(per_job)`, validates
    /// `input` by round-tripping it through `JobState::prepare`, and hands
    /// the prepared envelope to the queue adapter.
    pub async fn create_job(
        &self,
        input: W::Input,
        options: Option<JobOptions>,
    ) -> Result<JobId, ClientError> {
        let inner = self
            .client
            .upgrade()
            .ok_or_else(|| ClientError::Configuration("client has been dropped".to_string()))?;

        let resolved = inner
            .config
            .default_job_options
            .clone()
            .merge(W::default_options())
            .merge(options.unwrap_or_default())
            .resolve();

        let raw = serde_json::to_value(&input)
            .map_err(|e| ClientError::Configuration(format!("failed to serialize job input: {e}")))?;
        let (_, state) = JobState::<W::Input>::prepare(&raw)?;
        let job_data = state.to_job_data()?;

        inner
            .adapter
            .enqueue(W::ID, job_data, resolved)
            .await
            .map_err(|e| ClientError::Queue(e.to_string()))
    }
}

/// A single dispatch's entry point, bridging [`JobExecutor`] to the
/// type-erased worker loop. Exposed so `demos/` binaries can run one
/// dispatch directly against the in-memory adapter without a full
/// `Client`.
pub async fn run_once<W: Workflow>(
    adapter: Arc<dyn QueueAdapter>,
    registry: Arc<WorkflowRegistry>,
    job: Arc<dyn crate::queue::QueueJob>,
) -> Result<W::Output, crate::error::JobError> {
    JobExecutor::new(adapter, registry).run_once::<W>(job).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::error::JobError;
    use crate::queue::memory::InMemoryQueueAdapter;
    use crate::workflow::WorkflowWrapper;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Workflow for Echo {
        const ID: &'static str = "echo";
        type Input = i64;
        type Output = i64;

        async fn run(
            _ctx: &ExecutionContext,
            _job: &Arc<dyn crate::queue::QueueJob>,
            input: i64,
        ) -> Result<i64, JobError> {
            Ok(input)
        }
    }

    #[tokio::test]
    async fn create_job_then_start_runs_workflow_to_completion() {
        let adapter: Arc<dyn QueueAdapter> = InMemoryQueueAdapter::new();
        let client = Client::new(
            ClientConfig::new("redis://unused"),
            adapter.clone(),
            vec![Box::new(WorkflowWrapper::<Echo>::new())],
        )
        .unwrap();

        client.init().await.unwrap();
        let handle = client.workflow::<Echo>();
        let job_id = handle.create_job(41, None).await.unwrap();
        client.start().await.unwrap();

        // Give the in-memory worker's poll loop a moment to dispatch.
        for _ in 0..50 {
            let job = adapter.get_job("echo", &job_id).await.unwrap().unwrap();
            if job.return_value().is_some() {
                assert_eq!(job.return_value().unwrap(), serde_json::json!(41));
                client.stop().await.unwrap();
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("job never completed");
    }

    #[test]
    fn config_from_env_requires_redis_url() {
        std::env::remove_var("REDIS_URL");
        let err = ClientConfig::from_env().unwrap_err();
        assert!(matches!(err, ClientError::Configuration(_)));
    }
}
