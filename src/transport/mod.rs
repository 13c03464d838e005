//! Transport contract
//!
//! The pub/sub transport is an external collaborator. These traits describe
//! what the adapter needs from it:
//!
//! - [`Connector`]: opens a connection for a cluster/client/server triple
//! - [`TransportConnection`]: publish, subscribe, options builder, close
//! - [`SubscriptionHandle`]: unsubscribe with asynchronous acknowledgment
//!
//! [`MemoryBroker`] is an in-process implementation used by tests and the
//! demo binary.

mod history;
mod memory;

pub use history::{StoredMessage, TopicHistory};
pub use memory::{MemoryBroker, SubscribeRecord, UnsubscribeAcks};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Errors reported by a transport
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connection closed")]
    Closed,

    #[error("publish rejected: {0}")]
    Publish(String),

    #[error("subscribe rejected: {0}")]
    Subscribe(String),

    #[error("unsubscribe failed: {0}")]
    Unsubscribe(String),
}

/// Connection-level events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection handshake completed
    Connected,
    /// The transport reported an error
    Error(TransportError),
}

/// Transport-supplied metadata for a delivered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryMeta {
    /// Per-topic sequence number assigned by the transport
    pub sequence: u64,
    /// When the transport accepted the message
    pub timestamp: SystemTime,
    /// Whether this delivery is a replay of history
    pub redelivered: bool,
}

/// A message delivered to a subscription
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
    pub meta: DeliveryMeta,
}

/// Where a new subscription starts reading
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StartPosition {
    /// Only messages published after subscribing
    #[default]
    NewOnly,
    /// The most recent message, then new ones
    LastReceived,
    /// Everything the transport still holds
    AllAvailable,
    /// From the given sequence number (inclusive)
    Sequence(u64),
    /// Messages no older than the given age
    TimeDelta(Duration),
}

/// Transport-specific subscription tuning
///
/// Opaque to the adapter apart from [`SubscriptionOptions::is_empty`], which
/// lets it pass "no options" instead of an explicitly empty value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub start: StartPosition,
    pub durable_name: Option<String>,
    pub max_in_flight: Option<usize>,
    pub ack_wait: Option<Duration>,
    pub manual_acks: bool,
}

impl SubscriptionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing differs from the transport defaults
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn deliver_all_available(mut self) -> Self {
        self.start = StartPosition::AllAvailable;
        self
    }

    pub fn start_with_last_received(mut self) -> Self {
        self.start = StartPosition::LastReceived;
        self
    }

    pub fn start_at_sequence(mut self, sequence: u64) -> Self {
        self.start = StartPosition::Sequence(sequence);
        self
    }

    pub fn start_at_time_delta(mut self, age: Duration) -> Self {
        self.start = StartPosition::TimeDelta(age);
        self
    }

    pub fn durable_name(mut self, name: impl Into<String>) -> Self {
        self.durable_name = Some(name.into());
        self
    }

    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = Some(max);
        self
    }

    pub fn ack_wait(mut self, wait: Duration) -> Self {
        self.ack_wait = Some(wait);
        self
    }

    pub fn manual_acks(mut self) -> Self {
        self.manual_acks = true;
        self
    }
}

/// A subscription as returned by the transport
pub struct TransportSubscription {
    pub handle: Arc<dyn SubscriptionHandle>,
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

/// Opens transport connections
#[async_trait]
pub trait Connector: Send + Sync {
    /// Start connecting. Handshake progress is reported through
    /// [`TransportConnection::take_events`].
    async fn connect(
        &self,
        cluster_id: &str,
        client_id: &str,
        server_url: &str,
    ) -> Result<Arc<dyn TransportConnection>, TransportError>;
}

/// One live connection to the transport
#[async_trait]
pub trait TransportConnection: Send + Sync {
    /// Take the connection event stream. Only the first call returns `Some`.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Subscribe to `topic`, optionally as a member of a delivery group
    async fn subscribe(
        &self,
        topic: &str,
        group: Option<&str>,
        options: Option<SubscriptionOptions>,
    ) -> Result<TransportSubscription, TransportError>;

    /// The transport's options builder
    fn subscription_options(&self) -> SubscriptionOptions;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Transport-level handle for one subscription
#[async_trait]
pub trait SubscriptionHandle: Send + Sync {
    fn id(&self) -> Uuid;

    /// Request unsubscription. Resolves once the transport acknowledges it;
    /// deliveries may continue until then.
    async fn unsubscribe(&self) -> Result<(), TransportError>;
}
