//! Durable event streaming over append-only channels with consumer groups.
//!
//! The broker itself is an external collaborator consumed through the
//! [`StreamBroker`] capability; [`MemoryBroker`] is the in-process
//! implementation with full consumer-group semantics. [`StreamClient`]
//! layers reconnection on top, [`Publisher`] and [`Subscriber`] speak the
//! WAVE message format over project-scoped channels.

mod broker;
mod channels;
mod client;
mod publisher;
mod subscriber;
mod types;

pub use broker::{FieldMap, MemoryBroker, RawEntry, StreamBroker};
pub use channels::{ChannelManager, ParsedChannel, WAVE_PREFIX};
pub use client::{StreamClient, BASE_RECONNECT_DELAY, MAX_RECONNECT_ATTEMPTS, MAX_RECONNECT_DELAY};
pub use publisher::{PublishOptions, Publisher, DEFAULT_MAX_STREAM_LEN};
pub use subscriber::{Subscriber, DEFAULT_BATCH_SIZE, DEFAULT_BLOCK, DLQ_MAX_LEN, PENDING_CLAIM_MIN_IDLE};
pub use types::{EventType, MessagePriority, StreamEntry, WaveMessage};

/// Error type for stream operations
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Broker connection error: {0}")]
    Connection(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Invalid channel name: {0}")]
    InvalidChannel(String),

    #[error("Unknown consumer group '{group}' on '{channel}'")]
    UnknownGroup { channel: String, group: String },

    #[error("Failed to parse stream entry {entry_id}: {message}")]
    Parse { entry_id: String, message: String },

    #[error("Emergency stop active: {0}")]
    EmergencyStop(String),
}

impl StreamError {
    /// Whether this error indicates a lost broker connection.
    ///
    /// Connection errors are retried once inside
    /// [`StreamClient::execute_with_retry`]; everything else propagates.
    pub fn is_connection(&self) -> bool {
        matches!(self, StreamError::Connection(_))
    }
}

/// Result type for stream operations
pub type StreamResult<T> = Result<T, StreamError>;
