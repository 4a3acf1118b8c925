//! Redis-backed [`relaywork_core::QueueAdapter`].
//!
//! This is the only production queue adapter; `relaywork-core` itself ships
//! an in-memory adapter for tests and demos. See [`RedisQueueAdapter`] for
//! the key layout and dispatch loop.

mod adapter;
mod error;

pub use adapter::RedisQueueAdapter;
pub use error::RedisAdapterError;
