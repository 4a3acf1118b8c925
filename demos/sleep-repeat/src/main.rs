//! A workflow that durably sleeps, then polls an external condition with
//! `repeat` until it succeeds, demonstrating both delay-based primitives
//! against a real Redis instance.
//!
//! ```text
//! REDIS_URL=redis://127.0.0.1:6379 cargo run -p sleep-repeat-demo
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use relaywork_core::{
    Client, ClientConfig, ExecutionContext, JobError, QueueAdapter, QueueJob, Workflow,
    WorkflowWrapper,
};
use relaywork_redis::RedisQueueAdapter;

/// Stands in for a flaky external readiness check: not ready on its first
/// two polls, ready from the third onward.
static POLL_ATTEMPTS: AtomicU32 = AtomicU32::new(0);

struct PollAfterSleep;

#[async_trait]
impl Workflow for PollAfterSleep {
    const ID: &'static str = "demo.poll-after-sleep";
    type Input = ();
    type Output = String;

    async fn run(
        ctx: &ExecutionContext,
        _job: &Arc<dyn QueueJob>,
        _input: (),
    ) -> Result<String, JobError> {
        ctx.sleep("warm-up", 500).await?;

        let outcome = ctx
            .repeat("poll-readiness", 5, Some(300), || async move {
                let attempt = POLL_ATTEMPTS.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt >= 3 {
                    Ok::<_, anyhow::Error>(Some(attempt))
                } else {
                    Ok(None)
                }
            })
            .await?
            .result;

        match outcome.result {
            Some(attempt) => Ok(format!("ready after {attempt} polls")),
            None => Ok("gave up waiting for readiness".to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = ClientConfig::from_env()
        .unwrap_or_else(|_| ClientConfig::new("redis://127.0.0.1:6379"));

    let adapter = RedisQueueAdapter::connect(&config.redis_url, config.prefix.clone()).await?;
    let queue_adapter: Arc<dyn QueueAdapter> = adapter.clone();

    let client = Client::new(
        config,
        queue_adapter,
        vec![Box::new(WorkflowWrapper::<PollAfterSleep>::new())],
    )?;
    client.init().await?;
    client.start().await?;

    let job_id = client.workflow::<PollAfterSleep>().create_job((), None).await?;

    for _ in 0..100 {
        let job = adapter.get_job(PollAfterSleep::ID, &job_id).await?;
        if let Some(job) = job {
            if let Some(value) = job.return_value() {
                println!("poll-after-sleep job {job_id} completed: {value}");
                client.stop().await?;
                return Ok(());
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    client.stop().await?;
    anyhow::bail!("poll-after-sleep job {job_id} never completed")
}
