//! In-process broker implementing the transport contract
//!
//! Routes published messages to every plain subscriber of the topic and to one
//! member of each delivery group (round robin). Each topic keeps a bounded
//! history so subscriptions can start from an earlier position. Fault knobs
//! let tests exercise connect, publish, subscribe and unsubscribe failures.

use super::{
    ConnectionEvent, Connector, Delivery, DeliveryMeta, SubscriptionHandle, SubscriptionOptions,
    TopicHistory, TransportConnection, TransportError, TransportSubscription,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

const DEFAULT_HISTORY_CAPACITY: usize = 1024;

/// How the broker answers unsubscribe requests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum UnsubscribeAcks {
    /// Acknowledge right away
    #[default]
    Immediate,
    /// Hold acknowledgments until [`MemoryBroker::release_unsubscribe_acks`]
    Withhold,
    /// Refuse with the given reason
    Fail(String),
}

/// A subscribe call as the broker received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRecord {
    pub topic: String,
    pub group: Option<String>,
    pub options: Option<SubscriptionOptions>,
}

#[derive(Default)]
struct Faults {
    fail_next_connect: Option<String>,
    reject_publishes: Option<String>,
    reject_subscribes: Option<String>,
    unsubscribe_acks: UnsubscribeAcks,
}

struct BrokerSubscription {
    connection_id: Uuid,
    topic: String,
    group: Option<String>,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct BrokerInner {
    history_capacity: usize,
    histories: DashMap<String, TopicHistory>,
    subscriptions: DashMap<Uuid, BrokerSubscription>,
    /// Event senders of open connections
    connections: DashMap<Uuid, mpsc::UnboundedSender<ConnectionEvent>>,
    group_cursors: Mutex<HashMap<(String, String), usize>>,
    held_acks: Mutex<Vec<oneshot::Sender<()>>>,
    faults: Mutex<Faults>,
    subscribe_log: Mutex<Vec<SubscribeRecord>>,
    published: AtomicU64,
}

/// In-process pub/sub broker
///
/// Cheaply cloneable; clones share the same topics and subscriptions.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Create a broker retaining at most `capacity` messages per topic
    pub fn with_history_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                history_capacity: capacity,
                histories: DashMap::new(),
                subscriptions: DashMap::new(),
                connections: DashMap::new(),
                group_cursors: Mutex::new(HashMap::new()),
                held_acks: Mutex::new(Vec::new()),
                faults: Mutex::new(Faults::default()),
                subscribe_log: Mutex::new(Vec::new()),
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Make the next connect attempt report `reason` instead of connecting
    pub fn fail_next_connect(&self, reason: impl Into<String>) {
        self.inner.faults.lock().fail_next_connect = Some(reason.into());
    }

    /// Reject every publish with `reason` (`None` to accept again)
    pub fn reject_publishes(&self, reason: Option<String>) {
        self.inner.faults.lock().reject_publishes = reason;
    }

    /// Reject every subscribe with `reason` (`None` to accept again)
    pub fn reject_subscribes(&self, reason: Option<String>) {
        self.inner.faults.lock().reject_subscribes = reason;
    }

    pub fn set_unsubscribe_acks(&self, acks: UnsubscribeAcks) {
        self.inner.faults.lock().unsubscribe_acks = acks;
    }

    /// Deliver every withheld unsubscribe acknowledgment. Returns how many
    /// were released.
    pub fn release_unsubscribe_acks(&self) -> usize {
        let held: Vec<_> = self.inner.held_acks.lock().drain(..).collect();
        let count = held.len();
        for ack in held {
            let _ = ack.send(());
        }
        count
    }

    /// Report an error on every open connection. Returns how many were notified.
    pub fn inject_connection_error(&self, reason: impl Into<String>) -> usize {
        let reason = reason.into();
        self.inner
            .connections
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .send(ConnectionEvent::Error(TransportError::Connect(reason.clone())))
                    .is_ok()
            })
            .count()
    }

    /// Every subscribe call received so far, in order
    pub fn subscribe_log(&self) -> Vec<SubscribeRecord> {
        self.inner.subscribe_log.lock().clone()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// Number of active subscriptions on `topic`
    pub fn subscribers(&self, topic: &str) -> usize {
        self.inner
            .subscriptions
            .iter()
            .filter(|entry| entry.value().topic == topic)
            .count()
    }

    pub fn open_connections(&self) -> usize {
        self.inner.connections.len()
    }

    /// Total messages accepted for publishing
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::SeqCst)
    }

    /// Number of messages retained for `topic`
    pub fn history_len(&self, topic: &str) -> usize {
        self.inner
            .histories
            .get(topic)
            .map(|history| history.len())
            .unwrap_or(0)
    }
}

impl BrokerInner {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if let Some(reason) = self.faults.lock().reject_publishes.clone() {
            return Err(TransportError::Publish(reason));
        }

        // Holding the history entry keeps replay and live delivery ordered
        // against a concurrent subscribe on the same topic.
        let mut history = self
            .histories
            .entry(topic.to_string())
            .or_insert_with(|| TopicHistory::new(self.history_capacity));
        let stored = history.push(payload);
        self.published.fetch_add(1, Ordering::SeqCst);

        let delivery = Delivery {
            topic: topic.to_string(),
            payload: stored.payload,
            meta: DeliveryMeta {
                sequence: stored.seq,
                timestamp: stored.timestamp,
                redelivered: false,
            },
        };
        let count = self.route(&delivery);
        drop(history);

        debug!(topic = %topic, subscriber_count = count, "Routed message");
        Ok(())
    }

    /// Fan a delivery out to subscribers of its topic
    fn route(&self, delivery: &Delivery) -> usize {
        let mut groups: HashMap<String, Vec<Uuid>> = HashMap::new();
        let mut delivered = 0;

        for entry in self.subscriptions.iter() {
            let sub = entry.value();
            if sub.topic != delivery.topic {
                continue;
            }
            match &sub.group {
                Some(group) => groups.entry(group.clone()).or_default().push(*entry.key()),
                None => {
                    if sub.tx.send(delivery.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        debug!(subscription_id = %entry.key(), "Subscriber gone");
                    }
                }
            }
        }

        for (group, mut members) in groups {
            members.sort();
            let index = {
                let mut cursors = self.group_cursors.lock();
                let cursor = cursors
                    .entry((delivery.topic.clone(), group))
                    .or_insert(0);
                let index = *cursor % members.len();
                *cursor = cursor.wrapping_add(1);
                index
            };
            if let Some(sub) = self.subscriptions.get(&members[index]) {
                if sub.tx.send(delivery.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }

        delivered
    }

    fn subscribe(
        self: &Arc<Self>,
        connection_id: Uuid,
        topic: &str,
        group: Option<&str>,
        options: Option<SubscriptionOptions>,
    ) -> Result<TransportSubscription, TransportError> {
        if let Some(reason) = self.faults.lock().reject_subscribes.clone() {
            return Err(TransportError::Subscribe(reason));
        }

        self.subscribe_log.lock().push(SubscribeRecord {
            topic: topic.to_string(),
            group: group.map(str::to_string),
            options: options.clone(),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        let history = self
            .histories
            .entry(topic.to_string())
            .or_insert_with(|| TopicHistory::new(self.history_capacity));
        if let Some(options) = &options {
            for stored in history.replay(&options.start) {
                let _ = tx.send(Delivery {
                    topic: topic.to_string(),
                    payload: stored.payload,
                    meta: DeliveryMeta {
                        sequence: stored.seq,
                        timestamp: stored.timestamp,
                        redelivered: true,
                    },
                });
            }
        }
        self.subscriptions.insert(
            id,
            BrokerSubscription {
                connection_id,
                topic: topic.to_string(),
                group: group.map(str::to_string),
                tx,
            },
        );
        drop(history);

        debug!(subscription_id = %id, topic = %topic, group = ?group, "Subscribed");

        Ok(TransportSubscription {
            handle: Arc::new(MemorySubscriptionHandle {
                id,
                broker: self.clone(),
            }),
            deliveries: rx,
        })
    }

    async fn unsubscribe(&self, id: Uuid) -> Result<(), TransportError> {
        if !self.subscriptions.contains_key(&id) {
            return Ok(());
        }

        let acks = self.faults.lock().unsubscribe_acks.clone();
        match acks {
            UnsubscribeAcks::Immediate => {}
            UnsubscribeAcks::Fail(reason) => return Err(TransportError::Unsubscribe(reason)),
            UnsubscribeAcks::Withhold => {
                let (tx, rx) = oneshot::channel();
                self.held_acks.lock().push(tx);
                rx.await.map_err(|_| TransportError::Closed)?;
            }
        }

        self.subscriptions.remove(&id);
        debug!(subscription_id = %id, "Unsubscribed");
        Ok(())
    }

    fn close_connection(&self, connection_id: Uuid) {
        self.connections.remove(&connection_id);
        self.subscriptions
            .retain(|_, sub| sub.connection_id != connection_id);
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(
        &self,
        cluster_id: &str,
        client_id: &str,
        server_url: &str,
    ) -> Result<Arc<dyn TransportConnection>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        let failure = self.inner.faults.lock().fail_next_connect.take();
        match failure {
            Some(reason) => {
                let _ = tx.send(ConnectionEvent::Error(TransportError::Connect(reason)));
            }
            None => {
                self.inner.connections.insert(id, tx.clone());
                let _ = tx.send(ConnectionEvent::Connected);
            }
        }

        debug!(
            connection_id = %id,
            cluster_id = %cluster_id,
            client_id = %client_id,
            server_url = %server_url,
            "Opened memory connection"
        );

        Ok(Arc::new(MemoryConnection {
            id,
            broker: self.inner.clone(),
            events: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryConnection {
    id: Uuid,
    broker: Arc<BrokerInner>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events.lock().take()
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.broker.publish(topic, payload)
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: Option<&str>,
        options: Option<SubscriptionOptions>,
    ) -> Result<TransportSubscription, TransportError> {
        self.ensure_open()?;
        self.broker.subscribe(self.id, topic, group, options)
    }

    fn subscription_options(&self) -> SubscriptionOptions {
        SubscriptionOptions::new()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.close_connection(self.id);
            debug!(connection_id = %self.id, "Closed memory connection");
        }
        Ok(())
    }
}

struct MemorySubscriptionHandle {
    id: Uuid,
    broker: Arc<BrokerInner>,
}

#[async_trait]
impl SubscriptionHandle for MemorySubscriptionHandle {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        self.broker.unsubscribe(self.id).await
    }
}
