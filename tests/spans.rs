//! Trace span lifecycle for inbound messages
//!
//! A recording tracer writes span starts and ends into one ordered log that
//! handlers share, so tests can check when each span ends relative to the
//! handler and to the reply reaching the broker.

use parking_lot::Mutex;
use replybus::correlation::{DEFAULT_SPAN_NAME, SPAN_KIND};
use replybus::{
    IncomingMessage, MemoryBroker, PublishOptions, ReplyBus, ReplyBusConfig, TraceSpan, Tracer,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const PARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

type EventLog = Arc<Mutex<Vec<String>>>;

/// Tracer that logs every span, and on span end how many replies the
/// broker has accepted for `reply_topic`
struct RecordingTracer {
    events: EventLog,
    started: Mutex<Vec<(String, String, Option<String>)>>,
    broker: MemoryBroker,
    reply_topic: String,
}

impl RecordingTracer {
    fn new(broker: &MemoryBroker, reply_topic: &str) -> Arc<Self> {
        Arc::new(Self {
            events: Arc::new(Mutex::new(Vec::new())),
            started: Mutex::new(Vec::new()),
            broker: broker.clone(),
            reply_topic: reply_topic.to_string(),
        })
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl Tracer for RecordingTracer {
    fn current_context(&self) -> Option<String> {
        None
    }

    fn start_span(&self, name: &str, kind: &str, parent: Option<&str>) -> Box<dyn TraceSpan> {
        self.started
            .lock()
            .push((name.to_string(), kind.to_string(), parent.map(str::to_string)));
        self.events.lock().push(format!("start {}", name));

        Box::new(RecordingSpan {
            name: name.to_string(),
            events: self.events.clone(),
            broker: self.broker.clone(),
            reply_topic: self.reply_topic.clone(),
        })
    }
}

struct RecordingSpan {
    name: String,
    events: EventLog,
    broker: MemoryBroker,
    reply_topic: String,
}

impl TraceSpan for RecordingSpan {
    fn context(&self) -> Option<String> {
        Some(format!("span:{}", self.name))
    }

    fn end(self: Box<Self>) {
        let replies = self.broker.history_len(&self.reply_topic);
        self.events
            .lock()
            .push(format!("end {} replies={}", self.name, replies));
    }
}

/// A traced bus subscribed to `svc` that logs each handled message and
/// forwards it to a channel
async fn traced_receiver(
    broker: &MemoryBroker,
    tracer: &Arc<RecordingTracer>,
) -> (ReplyBus, mpsc::UnboundedReceiver<IncomingMessage>) {
    let receiver = ReplyBus::with_tracer(
        ReplyBusConfig::new("test", "svc-b", "memory://"),
        Arc::new(broker.clone()),
        tracer.clone(),
    );
    receiver.connect().await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    let events = tracer.events.clone();
    receiver
        .subscribe("svc", None, move |msg: IncomingMessage| {
            let command = msg.data["command"].as_str().unwrap_or("-").to_string();
            events.lock().push(format!("handled {}", command));
            let _ = tx.send(msg);
        })
        .await
        .unwrap();
    (receiver, rx)
}

async fn requester(broker: &MemoryBroker) -> ReplyBus {
    let bus = ReplyBus::new(
        ReplyBusConfig::new("test", "svc-a", "memory://"),
        Arc::new(broker.clone()),
    );
    bus.connect().await.unwrap();
    bus
}

#[tokio::test]
async fn test_span_named_from_command_and_ended_after_handler() {
    let broker = MemoryBroker::new();
    let tracer = RecordingTracer::new(&broker, "svc-a");
    let (_receiver, mut messages) = traced_receiver(&broker, &tracer).await;
    let sender = requester(&broker).await;

    for data in [json!({"command": "get-user", "id": 7}), json!({"id": 8})] {
        sender
            .publish("svc", &data, PublishOptions::new().trace_context(PARENT))
            .await
            .unwrap();
    }

    let first = timeout(Duration::from_secs(1), messages.recv()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(1), messages.recv()).await.unwrap().unwrap();
    assert_eq!(first.trace_context.as_deref(), Some("span:get-user"));
    assert_eq!(
        second.trace_context,
        Some(format!("span:{}", DEFAULT_SPAN_NAME))
    );

    assert_eq!(
        *tracer.started.lock(),
        vec![
            ("get-user".to_string(), SPAN_KIND.to_string(), Some(PARENT.to_string())),
            (DEFAULT_SPAN_NAME.to_string(), SPAN_KIND.to_string(), Some(PARENT.to_string())),
        ]
    );
    assert_eq!(
        tracer.events(),
        vec![
            "start get-user".to_string(),
            "handled get-user".to_string(),
            "end get-user replies=0".to_string(),
            format!("start {}", DEFAULT_SPAN_NAME),
            "handled -".to_string(),
            format!("end {} replies=0", DEFAULT_SPAN_NAME),
        ]
    );
}

#[tokio::test]
async fn test_reply_span_ends_after_reply_is_published() {
    let broker = MemoryBroker::new();
    let tracer = RecordingTracer::new(&broker, "svc-a");
    let (_receiver, mut messages) = traced_receiver(&broker, &tracer).await;
    let requester = requester(&broker).await;

    let pending = requester
        .request("svc", &json!({"command": "ping"}), PublishOptions::new())
        .await
        .unwrap();

    let msg = timeout(Duration::from_secs(1), messages.recv()).await.unwrap().unwrap();
    assert_eq!(tracer.events(), vec!["start ping", "handled ping"]);

    msg.reply.unwrap().reply(&json!({"cmd": "pong"})).await.unwrap();

    assert_eq!(
        tracer.events(),
        vec!["start ping", "handled ping", "end ping replies=1"]
    );
    let reply = timeout(Duration::from_secs(1), pending).await.unwrap().unwrap();
    assert_eq!(reply, json!({"cmd": "pong"}));
}

#[tokio::test]
async fn test_reply_span_ends_when_reply_publish_fails() {
    let broker = MemoryBroker::new();
    let tracer = RecordingTracer::new(&broker, "svc-a");
    let (_receiver, mut messages) = traced_receiver(&broker, &tracer).await;
    let requester = requester(&broker).await;

    let _pending = requester
        .request("svc", &json!({"command": "ping"}), PublishOptions::new())
        .await
        .unwrap();
    let msg = timeout(Duration::from_secs(1), messages.recv()).await.unwrap().unwrap();

    broker.reject_publishes(Some("quota exceeded".into()));
    assert!(msg.reply.unwrap().reply(&json!({})).await.is_err());

    assert_eq!(
        tracer.events(),
        vec!["start ping", "handled ping", "end ping replies=0"]
    );
}

#[tokio::test]
async fn test_dropped_replier_ends_span() {
    let broker = MemoryBroker::new();
    let tracer = RecordingTracer::new(&broker, "svc-a");
    let (_receiver, mut messages) = traced_receiver(&broker, &tracer).await;
    let requester = requester(&broker).await;

    let _pending = requester
        .request("svc", &json!({"command": "ping"}), PublishOptions::new())
        .await
        .unwrap();
    let msg = timeout(Duration::from_secs(1), messages.recv()).await.unwrap().unwrap();
    assert!(msg.reply.is_some());
    assert_eq!(tracer.events(), vec!["start ping", "handled ping"]);

    drop(msg);

    assert_eq!(
        tracer.events(),
        vec!["start ping", "handled ping", "end ping replies=0"]
    );
}
