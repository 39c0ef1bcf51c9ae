//! Cross-process publish/subscribe transport used by fan-out Layer 1.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod redis;

pub use self::memory::{InMemoryBroker, InMemoryBus};
pub use self::redis::RedisBus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("message bus is not connected")]
    NotConnected,
    #[error("message bus connection closed")]
    Closed,
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("message bus unavailable: {0}")]
    Unavailable(String),
}

/// One process-wide connection to the bus.
///
/// Subscriptions are per connection: a message is returned by
/// [`MessageBus::next_message`] only for channels this connection subscribed.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Opens the upstream connection. Called once before any other method.
    async fn connect(&self) -> Result<(), BusError>;

    async fn subscribe(&self, channel: &str) -> Result<(), BusError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError>;

    /// Waits at most `timeout` for the next message. `Ok(None)` on timeout.
    async fn next_message(&self, timeout: Duration) -> Result<Option<BusMessage>, BusError>;

    async fn close(&self) -> Result<(), BusError>;

    fn backend_name(&self) -> &'static str;
}
