//! Two workflows where one durably invokes the other and waits for its
//! result, demonstrating the suspend/promote round trip end to end against
//! a real Redis instance.
//!
//! ```text
//! REDIS_URL=redis://127.0.0.1:6379 cargo run -p invoke-chain-demo
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use relaywork_core::{
    Client, ClientConfig, ExecutionContext, JobError, QueueAdapter, QueueJob, Workflow,
    WorkflowWrapper,
};
use relaywork_redis::RedisQueueAdapter;

struct Greeter;

#[async_trait]
impl Workflow for Greeter {
    const ID: &'static str = "demo.greeter";
    type Input = String;
    type Output = String;

    async fn run(
        ctx: &ExecutionContext,
        _job: &Arc<dyn QueueJob>,
        name: String,
    ) -> Result<String, JobError> {
        let greeting = ctx
            .run("build-greeting", || async move { Ok::<_, anyhow::Error>(format!("hello, {name}")) })
            .await?
            .result;
        Ok(greeting)
    }
}

struct Orchestrator;

#[async_trait]
impl Workflow for Orchestrator {
    const ID: &'static str = "demo.orchestrator";
    type Input = String;
    type Output = String;

    async fn run(
        ctx: &ExecutionContext,
        _job: &Arc<dyn QueueJob>,
        name: String,
    ) -> Result<String, JobError> {
        let greeting = ctx.invoke_workflow::<Greeter>("greet", &name).await?.result;
        Ok(format!("{greeting}!"))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = ClientConfig::from_env()
        .unwrap_or_else(|_| ClientConfig::new("redis://127.0.0.1:6379"))
        .with_compression(relaywork_core::CompressionMode::None);

    let adapter = RedisQueueAdapter::connect(&config.redis_url, config.prefix.clone()).await?;
    let queue_adapter: Arc<dyn QueueAdapter> = adapter.clone();

    let client = Client::new(
        config,
        queue_adapter,
        vec![
            Box::new(WorkflowWrapper::<Greeter>::new()),
            Box::new(WorkflowWrapper::<Orchestrator>::new()),
        ],
    )?;
    client.init().await?;
    client.start().await?;

    let job_id = client
        .workflow::<Orchestrator>()
        .create_job("world".to_string(), None)
        .await?;

    for _ in 0..100 {
        let job = adapter.get_job(Orchestrator::ID, &job_id).await?;
        if let Some(job) = job {
            if let Some(value) = job.return_value() {
                println!("orchestrator job {job_id} completed: {value}");
                client.stop().await?;
                return Ok(());
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    client.stop().await?;
    anyhow::bail!("orchestrator job {job_id} never completed")
}
