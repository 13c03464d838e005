//! replybus - request/reply over publish/subscribe
//!
//! Adds correlated replies, reply timeouts and trace-context propagation on
//! top of a fire-and-forget pub/sub transport, and keeps subscriptions and the
//! connection consistent through asynchronous unsubscribe acknowledgments.
//!
//! # Example
//!
//! ```no_run
//! use replybus::{MemoryBroker, PublishOptions, ReplyBus, ReplyBusConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = Arc::new(MemoryBroker::new());
//!
//!     let server = ReplyBus::new(ReplyBusConfig::new("default", "svc-b", "memory://"), broker.clone());
//!     server.connect().await?;
//!     server
//!         .subscribe("svc", None, |msg| {
//!             if let Some(reply) = msg.reply {
//!                 tokio::spawn(async move {
//!                     let _ = reply.reply(&serde_json::json!({"cmd": "pong"})).await;
//!                 });
//!             }
//!         })
//!         .await?;
//!
//!     let client = ReplyBus::new(ReplyBusConfig::new("default", "svc-a", "memory://"), broker);
//!     client.connect().await?;
//!
//!     let options = PublishOptions::new().reply_timeout(Duration::from_millis(500));
//!     let reply = client.request("svc", &serde_json::json!({"cmd": "ping"}), options).await?;
//!     println!("{}", reply.await?);
//!
//!     client.end().await?;
//!     server.end().await?;
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod config;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod trace;
pub mod transport;

pub use adapter::{Adapter, AdapterEvent, ConnectionState, MessageHandler, Subscription, TopicSpec};
pub use config::ReplyBusConfig;
pub use correlation::{IncomingMessage, PendingReply, PublishOptions, Replier, ReplyBus};
pub use envelope::{MessageEnvelope, ReplyEnvelope, TRACE_CONTEXT_KEY};
pub use error::{ReplyBusError, Result};
pub use trace::{NoopTracer, TraceParent, TraceSpan, Tracer, TracingTracer};
pub use transport::{
    Connector, MemoryBroker, SubscriptionOptions, TransportConnection, TransportError,
};
