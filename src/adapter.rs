//! Transport adapter
//!
//! Owns one transport connection and the live subscription set. Translates
//! transport events into [`AdapterEvent`]s and keeps the live set consistent
//! with unsubscribe acknowledgments.

use crate::error::{ReplyBusError, Result};
use crate::transport::{
    ConnectionEvent, Connector, Delivery, DeliveryMeta, SubscriptionHandle, SubscriptionOptions,
    TransportConnection, TransportSubscription,
};

use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

/// Connection state of the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected (initial, and again after `end`)
    Disconnected,
    /// Waiting for the transport handshake
    Connecting,
    /// Connected and ready
    Connected,
    /// The first connection attempt failed
    Failed,
}

/// Events re-emitted from the transport
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    Connected,
    Error(String),
    Message {
        topic: String,
        payload: Vec<u8>,
        meta: DeliveryMeta,
    },
}

/// Handler for raw deliveries on a subscription
pub type MessageHandler = Arc<dyn Fn(Delivery) + Send + Sync>;

/// What to subscribe to: a plain topic, or a topic within a delivery group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicSpec {
    Topic(String),
    Group { topic: String, group: String },
}

impl TopicSpec {
    pub fn group(topic: impl Into<String>, group: impl Into<String>) -> Self {
        Self::Group {
            topic: topic.into(),
            group: group.into(),
        }
    }

    pub fn topic(&self) -> &str {
        match self {
            Self::Topic(topic) | Self::Group { topic, .. } => topic,
        }
    }

    pub fn group_name(&self) -> Option<&str> {
        match self {
            Self::Topic(_) => None,
            Self::Group { group, .. } => Some(group),
        }
    }
}

impl From<&str> for TopicSpec {
    fn from(topic: &str) -> Self {
        Self::Topic(topic.to_string())
    }
}

impl From<String> for TopicSpec {
    fn from(topic: String) -> Self {
        Self::Topic(topic)
    }
}

/// An active subscription that can be unsubscribed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: Uuid,
    topic: String,
    group: Option<String>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the subscribed topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Get the delivery group, if any
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }
}

/// A member of the live subscription set
struct LiveSubscription {
    subscription: Subscription,
    handle: Arc<dyn SubscriptionHandle>,
    dispatcher: AbortHandle,
}

/// Internal adapter state
struct AdapterInner {
    cluster: String,
    client_id: String,
    server_url: String,
    connector: Arc<dyn Connector>,

    state: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    closed: AtomicBool,

    connection: Mutex<Option<Arc<dyn TransportConnection>>>,
    event_pump: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<AdapterEvent>,

    // Ordered so teardown enumerates in subscribe order
    live: Mutex<Vec<LiveSubscription>>,
}

/// Adapter over one transport connection
///
/// This struct is cheaply cloneable as it uses an internal Arc.
#[derive(Clone)]
pub struct Adapter {
    inner: Arc<AdapterInner>,
}

impl Adapter {
    /// Create an adapter. The transport client id is `base_client_id`
    /// followed by a random suffix so instances never collide.
    pub fn new(
        cluster: impl Into<String>,
        base_client_id: &str,
        server_url: impl Into<String>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(AdapterInner {
                cluster: cluster.into(),
                client_id: format!("{}-{}", base_client_id, Uuid::new_v4()),
                server_url: server_url.into(),
                connector,
                state: state_tx,
                state_rx,
                closed: AtomicBool::new(false),
                connection: Mutex::new(None),
                event_pump: Mutex::new(None),
                events,
                live: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Unique transport client id
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn cluster(&self) -> &str {
        &self.inner.cluster
    }

    pub fn server_url(&self) -> &str {
        &self.inner.server_url
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Get a receiver for connection state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    /// Subscribe to re-emitted transport events
    pub fn events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.inner.events.subscribe()
    }

    /// Number of subscriptions awaiting no unsubscribe acknowledgment
    pub fn live_subscriptions(&self) -> usize {
        self.inner.live.lock().len()
    }

    /// Connect to the transport
    ///
    /// Resolves once, with the first of: the handshake completing, or an
    /// error reported before it completed. Later errors are re-emitted as
    /// [`AdapterEvent::Error`] and never retried.
    pub async fn connect(&self) -> Result<()> {
        let current_state = self.state();
        if current_state != ConnectionState::Disconnected
            || self.inner.closed.load(Ordering::SeqCst)
        {
            return Err(ReplyBusError::Connection(format!(
                "Cannot connect in state: {:?}",
                current_state
            )));
        }

        self.inner.set_state(ConnectionState::Connecting);
        debug!(
            cluster = %self.inner.cluster,
            client_id = %self.inner.client_id,
            server_url = %self.inner.server_url,
            "Connecting"
        );

        let connection = match self
            .inner
            .connector
            .connect(
                &self.inner.cluster,
                &self.inner.client_id,
                &self.inner.server_url,
            )
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                self.inner.set_state(ConnectionState::Failed);
                return Err(ReplyBusError::Connection(e.to_string()));
            }
        };

        let Some(mut events) = connection.take_events() else {
            self.inner.set_state(ConnectionState::Failed);
            return Err(ReplyBusError::Connection(
                "Connection events already taken".into(),
            ));
        };

        *self.inner.connection.lock() = Some(connection);

        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let inner = self.inner.clone();
        let pump = tokio::spawn(async move {
            let mut ready = Some(ready_tx);

            while let Some(event) = events.recv().await {
                match event {
                    ConnectionEvent::Connected => {
                        if let Some(tx) = ready.take() {
                            inner.set_state(ConnectionState::Connected);
                            info!(client_id = %inner.client_id, "Connected");
                            let _ = tx.send(Ok(()));
                        }
                        let _ = inner.events.send(AdapterEvent::Connected);
                    }
                    ConnectionEvent::Error(e) => {
                        let _ = inner.events.send(AdapterEvent::Error(e.to_string()));
                        match ready.take() {
                            Some(tx) => {
                                inner.set_state(ConnectionState::Failed);
                                let _ = tx.send(Err(ReplyBusError::Connection(e.to_string())));
                            }
                            None => warn!(error = %e, "Transport error"),
                        }
                    }
                }
            }

            if let Some(tx) = ready.take() {
                inner.set_state(ConnectionState::Failed);
                let _ = tx.send(Err(ReplyBusError::Connection(
                    "Connection closed during handshake".into(),
                )));
            }
        });
        *self.inner.event_pump.lock() = Some(pump);

        let result = ready_rx.await.unwrap_or(Err(ReplyBusError::Shutdown));
        if let Err(e) = &result {
            error!(error = %e, "Connection failed");
            self.inner.connection.lock().take();
        }
        result
    }

    /// Publish raw bytes. No buffering, no retry.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let connection = self.inner.connection()?;
        connection
            .publish(topic, payload)
            .await
            .map_err(|e| ReplyBusError::Publish(e.to_string()))
    }

    /// Subscribe to a topic
    ///
    /// `options` equal to the transport defaults are passed as `None`. The
    /// handler runs on a dedicated task, one delivery at a time.
    pub async fn subscribe(
        &self,
        spec: TopicSpec,
        options: Option<SubscriptionOptions>,
        handler: MessageHandler,
    ) -> Result<Subscription> {
        let connection = self.inner.connection()?;
        let options = options.filter(|o| !o.is_empty());

        let TransportSubscription {
            handle,
            mut deliveries,
        } = connection
            .subscribe(spec.topic(), spec.group_name(), options)
            .await
            .map_err(|e| ReplyBusError::Subscribe(e.to_string()))?;

        let subscription = Subscription {
            id: handle.id(),
            topic: spec.topic().to_string(),
            group: spec.group_name().map(str::to_string),
        };

        let events = self.inner.events.clone();
        let dispatcher = tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                if events.receiver_count() > 0 {
                    let _ = events.send(AdapterEvent::Message {
                        topic: delivery.topic.clone(),
                        payload: delivery.payload.clone(),
                        meta: delivery.meta.clone(),
                    });
                }
                handler(delivery);
            }
        });

        self.inner.live.lock().push(LiveSubscription {
            subscription: subscription.clone(),
            handle,
            dispatcher: dispatcher.abort_handle(),
        });

        debug!(
            subscription_id = %subscription.id,
            topic = %subscription.topic,
            group = ?subscription.group,
            "Subscribed"
        );
        Ok(subscription)
    }

    /// The transport's subscription options builder
    pub fn subscription_options(&self) -> Result<SubscriptionOptions> {
        Ok(self.inner.connection()?.subscription_options())
    }

    /// Unsubscribe and wait for the transport to acknowledge
    ///
    /// The subscription stays in the live set until then. Unsubscribing a
    /// subscription that is already gone succeeds without doing anything.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        let handle = self
            .inner
            .live
            .lock()
            .iter()
            .find(|live| live.subscription.id == subscription.id)
            .map(|live| live.handle.clone());

        let Some(handle) = handle else {
            debug!(topic = %subscription.topic, "Already unsubscribed");
            return Ok(());
        };

        handle.unsubscribe().await.map_err(|e| {
            ReplyBusError::Unsubscribe(vec![format!("{}: {}", subscription.topic, e)])
        })?;

        self.inner.remove_live(subscription.id);
        debug!(topic = %subscription.topic, "Unsubscribed");
        Ok(())
    }

    /// Tear down: unsubscribe everything, wait for every acknowledgment,
    /// then close the connection
    ///
    /// If any unsubscription fails the connection is left open and the
    /// failures are returned.
    pub async fn end(&self) -> Result<()> {
        let connection = self.inner.connection()?;

        let live: Vec<(Subscription, Arc<dyn SubscriptionHandle>)> = self
            .inner
            .live
            .lock()
            .iter()
            .map(|live| (live.subscription.clone(), live.handle.clone()))
            .collect();

        debug!(count = live.len(), "Unsubscribing all");

        let results = join_all(live.into_iter().map(|(subscription, handle)| async move {
            handle
                .unsubscribe()
                .await
                .map(|_| subscription.id)
                .map_err(|e| format!("{}: {}", subscription.topic, e))
        }))
        .await;

        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(id) => self.inner.remove_live(id),
                Err(e) => failures.push(e),
            }
        }

        if !failures.is_empty() {
            warn!(failures = ?failures, "Unsubscribe failed, leaving connection open");
            return Err(ReplyBusError::Unsubscribe(failures));
        }

        connection
            .close()
            .await
            .map_err(|e| ReplyBusError::Connection(e.to_string()))?;

        self.inner.connection.lock().take();
        if let Some(pump) = self.inner.event_pump.lock().take() {
            pump.abort();
        }
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.set_state(ConnectionState::Disconnected);
        info!(client_id = %self.inner.client_id, "Connection closed");
        Ok(())
    }
}

impl AdapterInner {
    fn set_state(&self, state: ConnectionState) {
        let _ = self.state.send(state);
    }

    fn connection(&self) -> Result<Arc<dyn TransportConnection>> {
        if *self.state_rx.borrow() != ConnectionState::Connected {
            return Err(ReplyBusError::NotConnected);
        }
        self.connection
            .lock()
            .clone()
            .ok_or(ReplyBusError::NotConnected)
    }

    fn remove_live(&self, id: Uuid) {
        let mut live = self.live.lock();
        if let Some(index) = live.iter().position(|l| l.subscription.id == id) {
            let removed = live.remove(index);
            removed.dispatcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryBroker, UnsubscribeAcks};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::timeout;

    fn adapter(broker: &MemoryBroker) -> Adapter {
        Adapter::new("test", "svc", "memory://", Arc::new(broker.clone()))
    }

    fn counting_handler() -> (MessageHandler, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let handler: MessageHandler = Arc::new(move |_delivery| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (handler, count)
    }

    #[test]
    fn test_client_id_has_unique_suffix() {
        let broker = MemoryBroker::new();
        let a = adapter(&broker);
        let b = adapter(&broker);

        assert!(a.client_id().starts_with("svc-"));
        assert_ne!(a.client_id(), b.client_id());
        assert_eq!(a.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_topic_spec_forms() {
        let plain = TopicSpec::from("orders");
        assert_eq!(plain.topic(), "orders");
        assert_eq!(plain.group_name(), None);

        let grouped = TopicSpec::group("orders", "workers");
        assert_eq!(grouped.topic(), "orders");
        assert_eq!(grouped.group_name(), Some("workers"));
    }

    #[tokio::test]
    async fn test_connect_success() {
        let broker = MemoryBroker::new();
        let adapter = adapter(&broker);

        adapter.connect().await.unwrap();

        assert_eq!(adapter.state(), ConnectionState::Connected);
        assert_eq!(broker.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_terminal() {
        let broker = MemoryBroker::new();
        broker.fail_next_connect("no route to host");
        let adapter = adapter(&broker);

        let result = adapter.connect().await;
        assert!(matches!(result, Err(ReplyBusError::Connection(msg)) if msg.contains("no route to host")));
        assert_eq!(adapter.state(), ConnectionState::Failed);

        assert!(matches!(
            adapter.connect().await,
            Err(ReplyBusError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_twice_rejected() {
        let broker = MemoryBroker::new();
        let adapter = adapter(&broker);

        adapter.connect().await.unwrap();
        assert!(matches!(
            adapter.connect().await,
            Err(ReplyBusError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_error_after_connect_is_reemitted() {
        let broker = MemoryBroker::new();
        let adapter = adapter(&broker);
        adapter.connect().await.unwrap();
        let mut events = adapter.events();

        assert_eq!(broker.inject_connection_error("stale heartbeat"), 1);

        let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
        assert!(matches!(event, AdapterEvent::Error(msg) if msg.contains("stale heartbeat")));
        assert_eq!(adapter.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let broker = MemoryBroker::new();
        let adapter = adapter(&broker);
        let (handler, _) = counting_handler();

        assert!(matches!(
            adapter.publish("svc", vec![]).await,
            Err(ReplyBusError::NotConnected)
        ));
        assert!(matches!(
            adapter.subscribe("svc".into(), None, handler).await,
            Err(ReplyBusError::NotConnected)
        ));
        assert!(matches!(adapter.end().await, Err(ReplyBusError::NotConnected)));
    }

    #[tokio::test]
    async fn test_subscribe_dispatches_and_reemits() {
        let broker = MemoryBroker::new();
        let adapter = adapter(&broker);
        adapter.connect().await.unwrap();
        let mut events = adapter.events();

        let (handler, count) = counting_handler();
        adapter.subscribe("svc".into(), None, handler).await.unwrap();
        adapter.publish("svc", b"payload".to_vec()).await.unwrap();

        let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
        match event {
            AdapterEvent::Message { topic, payload, meta } => {
                assert_eq!(topic, "svc");
                assert_eq!(payload, b"payload".to_vec());
                assert_eq!(meta.sequence, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.live_subscriptions(), 1);
    }

    #[tokio::test]
    async fn test_empty_options_normalized_to_none() {
        let broker = MemoryBroker::new();
        let adapter = adapter(&broker);
        adapter.connect().await.unwrap();

        let (handler, _) = counting_handler();
        adapter
            .subscribe("a".into(), Some(SubscriptionOptions::new()), handler.clone())
            .await
            .unwrap();
        adapter.subscribe("b".into(), None, handler.clone()).await.unwrap();
        let tuned = adapter.subscription_options().unwrap().deliver_all_available();
        adapter
            .subscribe(TopicSpec::group("c", "workers"), Some(tuned.clone()), handler)
            .await
            .unwrap();

        let log = broker.subscribe_log();
        assert_eq!(log[0].options, None);
        assert_eq!(log[0].options, log[1].options);
        assert_eq!(log[2].group.as_deref(), Some("workers"));
        assert_eq!(log[2].options, Some(tuned));
    }

    #[tokio::test]
    async fn test_subscribe_rejection() {
        let broker = MemoryBroker::new();
        let adapter = adapter(&broker);
        adapter.connect().await.unwrap();
        broker.reject_subscribes(Some("not authorized".into()));

        let (handler, _) = counting_handler();
        let result = adapter.subscribe("svc".into(), None, handler).await;

        assert!(matches!(result, Err(ReplyBusError::Subscribe(_))));
        assert_eq!(adapter.live_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let broker = MemoryBroker::new();
        let adapter = adapter(&broker);
        adapter.connect().await.unwrap();

        let (handler, _) = counting_handler();
        let keep = adapter.subscribe("keep".into(), None, handler.clone()).await.unwrap();
        let sub = adapter.subscribe("svc".into(), None, handler).await.unwrap();

        adapter.unsubscribe(&sub).await.unwrap();
        adapter.unsubscribe(&sub).await.unwrap();

        assert_eq!(adapter.live_subscriptions(), 1);
        assert_eq!(broker.subscribers("keep"), 1);
        assert_eq!(keep.topic(), "keep");
    }

    #[tokio::test]
    async fn test_unsubscribe_waits_for_ack() {
        let broker = MemoryBroker::new();
        broker.set_unsubscribe_acks(UnsubscribeAcks::Withhold);
        let adapter = adapter(&broker);
        adapter.connect().await.unwrap();

        let (handler, _) = counting_handler();
        let sub = adapter.subscribe("svc".into(), None, handler).await.unwrap();

        let pending = {
            let adapter = adapter.clone();
            let sub = sub.clone();
            tokio::spawn(async move { adapter.unsubscribe(&sub).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(adapter.live_subscriptions(), 1);

        assert_eq!(broker.release_unsubscribe_acks(), 1);
        pending.await.unwrap().unwrap();
        assert_eq!(adapter.live_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_end_unsubscribes_all_then_closes() {
        let broker = MemoryBroker::new();
        let adapter = adapter(&broker);
        adapter.connect().await.unwrap();

        let (handler, _) = counting_handler();
        for topic in ["a", "b", "c"] {
            adapter.subscribe(topic.into(), None, handler.clone()).await.unwrap();
        }

        adapter.end().await.unwrap();

        assert_eq!(adapter.live_subscriptions(), 0);
        assert_eq!(broker.active_subscriptions(), 0);
        assert_eq!(broker.open_connections(), 0);
        assert_eq!(adapter.state(), ConnectionState::Disconnected);
        assert!(matches!(adapter.connect().await, Err(ReplyBusError::Connection(_))));
    }

    #[tokio::test]
    async fn test_end_failure_keeps_connection_open() {
        let broker = MemoryBroker::new();
        let adapter = adapter(&broker);
        adapter.connect().await.unwrap();

        let (handler, _) = counting_handler();
        adapter.subscribe("a".into(), None, handler).await.unwrap();
        broker.set_unsubscribe_acks(UnsubscribeAcks::Fail("broker busy".into()));

        let result = adapter.end().await;

        assert!(matches!(result, Err(ReplyBusError::Unsubscribe(ref f)) if f.len() == 1));
        assert_eq!(adapter.state(), ConnectionState::Connected);
        assert_eq!(broker.open_connections(), 1);
        assert_eq!(adapter.live_subscriptions(), 1);
    }

    #[tokio::test]
    async fn test_end_blocks_without_ack() {
        let broker = MemoryBroker::new();
        let adapter = adapter(&broker);
        adapter.connect().await.unwrap();

        let (handler, _) = counting_handler();
        adapter.subscribe("a".into(), None, handler).await.unwrap();
        broker.set_unsubscribe_acks(UnsubscribeAcks::Withhold);

        let result = timeout(Duration::from_millis(50), adapter.end()).await;

        assert!(result.is_err(), "end must wait for every acknowledgment");
        assert_eq!(broker.open_connections(), 1);
        assert_eq!(adapter.state(), ConnectionState::Connected);
    }
}
