//! Error types for replybus

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when using the reply bus
#[derive(Error, Debug)]
pub enum ReplyBusError {
    /// The first connection attempt failed, or connect was called in a state
    /// that does not allow it
    #[error("Connection error: {0}")]
    Connection(String),

    /// Not currently connected to the transport
    #[error("Not connected")]
    NotConnected,

    /// The transport rejected a publish
    #[error("Publish failed: {0}")]
    Publish(String),

    /// The transport rejected a subscribe
    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// One or more unsubscriptions failed
    #[error("Unsubscribe failed: {}", .0.join("; "))]
    Unsubscribe(Vec<String>),

    /// No correlated reply arrived in time
    #[error("Reply timeout expired: {}", .0.as_millis())]
    ReplyTimeout(Duration),

    /// The replying peer sent an error payload
    #[error("Remote error: {0}")]
    Remote(serde_json::Value),

    /// Failed to serialize/deserialize an envelope or payload
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Payload is not a JSON object
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The pending reply registry is full
    #[error("Too many pending replies (limit {0})")]
    TooManyPendingReplies(usize),

    /// The bus has been shut down
    #[error("Reply bus shut down")]
    Shutdown,
}

/// Result type for reply bus operations
pub type Result<T> = std::result::Result<T, ReplyBusError>;
