//! Two-layer live delivery of chat messages.
//!
//! Layer 1 ([`PubSubManager`]) keeps one bus subscription per chat that has
//! viewers in this process and relays bus messages to Layer 2
//! ([`LocalConnectionManager`]), which writes them to each local viewer.

use thiserror::Error;

use crate::bus::BusError;

pub mod local;
pub mod locks;
pub mod pubsub;

pub use local::{ConnectionClosed, ConnectionId, LocalConnection, LocalConnectionManager};
pub use locks::ChatLocks;
pub use pubsub::{PubSubManager, PubSubSettings};

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("failed to connect to the message bus after {attempts} attempts: {source}")]
    Connect {
        attempts: u32,
        #[source]
        source: BusError,
    },
    #[error("message bus listener failed: {0}")]
    Listener(#[source] BusError),
    #[error("message bus operation failed: {0}")]
    Bus(#[from] BusError),
    #[error("failed to encode fan-out payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl FanoutError {
    /// Failures after which this process can no longer deliver live messages.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FanoutError::Connect { .. } | FanoutError::Listener(_))
    }
}
