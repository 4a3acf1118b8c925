//! Adapter-local error type. Surfaces to callers of [`crate::RedisQueueAdapter::connect`];
//! folded into [`relaywork_core::QueueError::Backend`] everywhere else, since
//! `relaywork-core`'s `QueueAdapter` trait is not generic over an error type.

#[derive(Debug, thiserror::Error)]
pub enum RedisAdapterError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("failed to (de)serialize job data: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid redis url: {0}")]
    InvalidUrl(String),
}

impl From<RedisAdapterError> for relaywork_core::QueueError {
    fn from(err: RedisAdapterError) -> Self {
        relaywork_core::QueueError::Backend(err.to_string())
    }
}
