//! Correlation service
//!
//! Turns one-way publish/subscribe into request/reply. Outgoing messages are
//! wrapped in a [`MessageEnvelope`] with a fresh guid; requests register a
//! pending entry under that guid. Replies come back on a topic named after
//! this instance's client id and are matched to pending entries by
//! `replyId`, in any arrival order.

mod pending;
mod reply;

pub use reply::{PendingReply, Replier};

use pending::{PendingReplies, ReplySink};

use crate::adapter::{Adapter, ConnectionState, MessageHandler, Subscription, TopicSpec};
use crate::config::ReplyBusConfig;
use crate::envelope::{inject_trace_context, MessageEnvelope, ReplyEnvelope};
use crate::error::{ReplyBusError, Result};
use crate::trace::{Tracer, TracingTracer};
use crate::transport::{Connector, Delivery, SubscriptionOptions};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Span name for messages without a `command` field
pub const DEFAULT_SPAN_NAME: &str = "replybus message";

/// Span kind recorded for inbound messages
pub const SPAN_KIND: &str = "pubsub";

/// Per-publish options
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Ask the receiver to reply
    pub reply_required: bool,
    /// How long to wait for the reply (config default when unset)
    pub reply_timeout: Option<Duration>,
    /// Trace context to continue (the tracer's current context when unset)
    pub trace_context: Option<String>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply_required(mut self, required: bool) -> Self {
        self.reply_required = required;
        self
    }

    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = Some(timeout);
        self
    }

    pub fn trace_context(mut self, context: impl Into<String>) -> Self {
        self.trace_context = Some(context.into());
        self
    }
}

/// A decoded inbound message as seen by a subscription handler
#[derive(Debug)]
pub struct IncomingMessage {
    pub topic: String,
    pub guid: String,
    pub sender: String,
    pub data: Value,
    /// Context of the span started for this message
    pub trace_context: Option<String>,
    /// Present when the sender asked for a reply
    pub reply: Option<Replier>,
}

struct BusInner {
    config: ReplyBusConfig,
    adapter: Adapter,
    pending: Arc<PendingReplies>,
    tracer: Arc<dyn Tracer>,
    self_subscription: Mutex<Option<Subscription>>,
}

/// Request/reply client over a pub/sub transport
///
/// This struct is cheaply cloneable as it uses an internal Arc.
#[derive(Clone)]
pub struct ReplyBus {
    inner: Arc<BusInner>,
}

impl ReplyBus {
    /// Create a bus that records spans with [`TracingTracer`]
    pub fn new(config: ReplyBusConfig, connector: Arc<dyn Connector>) -> Self {
        Self::with_tracer(config, connector, Arc::new(TracingTracer))
    }

    pub fn with_tracer(
        config: ReplyBusConfig,
        connector: Arc<dyn Connector>,
        tracer: Arc<dyn Tracer>,
    ) -> Self {
        let adapter = Adapter::new(
            config.cluster.clone(),
            &config.client_id,
            config.server_url.clone(),
            connector,
        );

        Self {
            inner: Arc::new(BusInner {
                pending: PendingReplies::new(config.max_pending_replies),
                config,
                adapter,
                tracer,
                self_subscription: Mutex::new(None),
            }),
        }
    }

    /// Base client id; replies for this instance are published to it
    pub fn client_id(&self) -> &str {
        &self.inner.config.client_id
    }

    pub fn config(&self) -> &ReplyBusConfig {
        &self.inner.config
    }

    /// The underlying transport adapter
    pub fn adapter(&self) -> &Adapter {
        &self.inner.adapter
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.adapter.state()
    }

    /// Number of requests awaiting a reply
    pub fn pending_replies(&self) -> usize {
        self.inner.pending.len()
    }

    /// Connect and open the reply subscription on this instance's client id
    ///
    /// If the transport connected but the reply subscription could not be
    /// opened, calling `connect` again retries only the subscription.
    pub async fn connect(&self) -> Result<()> {
        if self.has_reply_subscription() {
            return Err(ReplyBusError::Connection(
                "Cannot connect in state: Connected".into(),
            ));
        }

        if self.inner.adapter.state() == ConnectionState::Connected {
            debug!(topic = %self.client_id(), "Retrying reply subscription");
        } else {
            self.inner.adapter.connect().await?;
        }

        let weak = Arc::downgrade(&self.inner);
        let handler: MessageHandler = Arc::new(move |delivery: Delivery| {
            if let Some(bus) = weak.upgrade() {
                bus.handle_reply(&delivery);
            }
        });

        let subscription = self
            .inner
            .adapter
            .subscribe(TopicSpec::from(self.client_id()), None, handler)
            .await
            .map_err(|e| {
                warn!(topic = %self.client_id(), error = %e, "Failed to open reply subscription");
                e
            })?;
        debug!(topic = %subscription.topic(), "Listening for replies");
        *self.inner.self_subscription.lock() = Some(subscription);
        Ok(())
    }

    /// Whether replies for this instance are being received
    pub fn has_reply_subscription(&self) -> bool {
        self.inner.self_subscription.lock().is_some()
    }

    /// Publish without waiting for a reply
    ///
    /// With `reply_required` set the receiver is still asked to reply; that
    /// reply is consumed and dropped, and its pending entry lives at most
    /// `reply_timeout`.
    pub async fn publish<T: Serialize>(
        &self,
        topic: &str,
        data: &T,
        options: PublishOptions,
    ) -> Result<()> {
        let sink = options.reply_required.then_some(ReplySink::Discard);
        self.send(topic, data, &options, sink).await.map(|_| ())
    }

    /// Publish a request and return a future for its reply
    ///
    /// The returned `Result` reflects only the publish. The [`PendingReply`]
    /// resolves with the reply data, the replier's error
    /// ([`ReplyBusError::Remote`]), or [`ReplyBusError::ReplyTimeout`].
    pub async fn request<T: Serialize>(
        &self,
        topic: &str,
        data: &T,
        options: PublishOptions,
    ) -> Result<PendingReply> {
        let (tx, rx) = oneshot::channel();
        let guid = self
            .send(topic, data, &options, Some(ReplySink::Waiter(tx)))
            .await?;
        Ok(PendingReply::new(guid, rx))
    }

    /// Subscribe to a topic
    ///
    /// The handler gets every decoded message; those whose sender asked for a
    /// reply come with a [`Replier`].
    pub async fn subscribe<F>(
        &self,
        spec: impl Into<TopicSpec>,
        options: Option<SubscriptionOptions>,
        on_message: F,
    ) -> Result<Subscription>
    where
        F: Fn(IncomingMessage) + Send + Sync + 'static,
    {
        let weak: Weak<BusInner> = Arc::downgrade(&self.inner);
        let handler: MessageHandler = Arc::new(move |delivery: Delivery| {
            if let Some(bus) = weak.upgrade() {
                bus.dispatch(delivery, &on_message);
            }
        });

        self.inner
            .adapter
            .subscribe(spec.into(), options, handler)
            .await
    }

    /// The transport's subscription options builder
    pub fn subscription_options(&self) -> Result<SubscriptionOptions> {
        self.inner.adapter.subscription_options()
    }

    /// Unsubscribe and wait for the transport to acknowledge
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        self.inner.adapter.unsubscribe(subscription).await
    }

    /// Unsubscribe everything (the reply subscription included), then close
    ///
    /// Requests still waiting afterwards fail with [`ReplyBusError::Shutdown`].
    pub async fn end(&self) -> Result<()> {
        self.inner.adapter.end().await?;
        self.inner.self_subscription.lock().take();

        let failed = self.inner.pending.fail_all();
        if failed > 0 {
            debug!(count = failed, "Failed pending replies on shutdown");
        }
        Ok(())
    }

    /// Build, register and publish an envelope. Returns its guid.
    async fn send<T: Serialize>(
        &self,
        topic: &str,
        data: &T,
        options: &PublishOptions,
        sink: Option<ReplySink>,
    ) -> Result<String> {
        let mut data = match serde_json::to_value(data)? {
            Value::Object(map) => map,
            other => {
                return Err(ReplyBusError::InvalidPayload(format!(
                    "expected a JSON object, got {}",
                    json_kind(&other)
                )))
            }
        };

        let trace_context = options
            .trace_context
            .clone()
            .or_else(|| self.inner.tracer.current_context());
        if let Some(context) = &trace_context {
            inject_trace_context(&mut data, context);
        }

        let reply_required = options.reply_required || sink.is_some();
        let envelope = MessageEnvelope::new(data, self.client_id(), reply_required);
        let bytes = envelope.to_bytes()?;
        let guid = envelope.guid;

        // Register before publishing: the reply can beat the publish result
        if let Some(sink) = sink {
            if !self.has_reply_subscription() {
                return Err(ReplyBusError::NotConnected);
            }

            let timeout = options
                .reply_timeout
                .unwrap_or(self.inner.config.reply_timeout);
            self.inner.pending.register(guid.clone(), sink, timeout)?;
        }

        if let Err(e) = self.inner.adapter.publish(topic, bytes).await {
            self.inner.pending.cancel(&guid);
            return Err(e);
        }

        debug!(topic = %topic, guid = %guid, reply_required, "Published");
        Ok(guid)
    }
}

impl BusInner {
    /// Decode an application message and hand it to `handler`
    fn dispatch<F>(&self, delivery: Delivery, handler: &F)
    where
        F: Fn(IncomingMessage),
    {
        let envelope = match MessageEnvelope::from_slice(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(topic = %delivery.topic, error = %e, "Dropping undecodable message");
                return;
            }
        };

        let span = self.tracer.start_span(
            envelope.command().unwrap_or(DEFAULT_SPAN_NAME),
            SPAN_KIND,
            envelope.trace_context(),
        );
        let trace_context = span.context();

        let MessageEnvelope {
            data,
            guid,
            sender,
            reply_required,
        } = envelope;

        if reply_required {
            let reply = Replier::new(
                self.adapter.clone(),
                self.config.client_id.clone(),
                sender.clone(),
                guid.clone(),
                span,
            );
            handler(IncomingMessage {
                topic: delivery.topic,
                guid,
                sender,
                data,
                trace_context,
                reply: Some(reply),
            });
        } else {
            handler(IncomingMessage {
                topic: delivery.topic,
                guid,
                sender,
                data,
                trace_context,
                reply: None,
            });
            span.end();
        }
    }

    /// Match a reply from the self topic to its pending request
    fn handle_reply(&self, delivery: &Delivery) {
        let envelope = match ReplyEnvelope::from_slice(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(topic = %delivery.topic, error = %e, "Dropping undecodable reply");
                return;
            }
        };

        let reply_id = envelope.reply_id.clone();
        let sender = envelope.sender.clone();
        if self.pending.resolve(&reply_id, envelope.into_outcome()) {
            debug!(reply_id = %reply_id, sender = %sender, "Resolved reply");
        } else {
            debug!(reply_id = %reply_id, sender = %sender, "Dropping reply with no pending request");
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
