//! Wire envelopes exchanged between reply bus peers
//!
//! Requests carry `{data, guid, sender, replyRequired}`; replies carry
//! `{data, guid, sender, replyId, err}`. Keys are camelCase so peers written
//! against the same wire format interoperate.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Reserved key inside `data` holding the serialized trace context
pub const TRACE_CONTEXT_KEY: &str = "elastic-apm-traceparent";

/// Key inside `data` naming the command, used for span names
pub const COMMAND_KEY: &str = "command";

/// Generate a fresh correlation id
pub fn new_guid() -> String {
    Uuid::new_v4().to_string()
}

/// Envelope around an application message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    #[serde(default)]
    pub data: Value,
    pub guid: String,
    pub sender: String,
    #[serde(default)]
    pub reply_required: bool,
}

impl MessageEnvelope {
    /// Wrap `data` with a fresh guid
    pub fn new(data: Map<String, Value>, sender: impl Into<String>, reply_required: bool) -> Self {
        Self {
            data: Value::Object(data),
            guid: new_guid(),
            sender: sender.into(),
            reply_required,
        }
    }

    /// Trace context injected by the sender, if any
    pub fn trace_context(&self) -> Option<&str> {
        self.data.get(TRACE_CONTEXT_KEY).and_then(Value::as_str)
    }

    /// Application command name, if the payload has one
    pub fn command(&self) -> Option<&str> {
        self.data.get(COMMAND_KEY).and_then(Value::as_str)
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Envelope around a reply to an earlier message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplyEnvelope {
    #[serde(default)]
    pub data: Value,
    pub guid: String,
    pub sender: String,
    /// Guid of the message being answered
    pub reply_id: String,
    #[serde(default)]
    pub err: Option<Value>,
}

impl ReplyEnvelope {
    /// Build a reply to `reply_id` with a fresh guid
    pub fn new(
        reply_id: impl Into<String>,
        sender: impl Into<String>,
        data: Value,
        err: Option<Value>,
    ) -> Self {
        Self {
            data,
            guid: new_guid(),
            sender: sender.into(),
            reply_id: reply_id.into(),
            err,
        }
    }

    /// Split into the outcome seen by the requester
    pub fn into_outcome(self) -> Result<Value, Value> {
        match self.err {
            Some(err) if !err.is_null() => Err(err),
            _ => Ok(self.data),
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Insert a trace context under the reserved key
pub fn inject_trace_context(data: &mut Map<String, Value>, context: &str) {
    data.insert(
        TRACE_CONTEXT_KEY.to_string(),
        Value::String(context.to_string()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_message_envelope_wire_keys() {
        let envelope = MessageEnvelope::new(object(json!({"cmd": "ping"})), "svc-a", true);
        let value: Value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["data"], json!({"cmd": "ping"}));
        assert_eq!(value["sender"], "svc-a");
        assert_eq!(value["replyRequired"], true);
        assert_eq!(value["guid"], envelope.guid.as_str());
    }

    #[test]
    fn test_message_envelope_fresh_guids() {
        let a = MessageEnvelope::new(Map::new(), "svc", false);
        let b = MessageEnvelope::new(Map::new(), "svc", false);
        assert_ne!(a.guid, b.guid);
    }

    #[test]
    fn test_message_envelope_missing_reply_required() {
        let raw = br#"{"data":{"x":1},"guid":"g-1","sender":"peer"}"#;
        let envelope = MessageEnvelope::from_slice(raw).unwrap();
        assert!(!envelope.reply_required);
        assert_eq!(envelope.data, json!({"x": 1}));
    }

    #[test]
    fn test_trace_context_and_command() {
        let mut data = object(json!({"command": "order.create"}));
        inject_trace_context(&mut data, "00-abc-def-01");
        let envelope = MessageEnvelope::new(data, "svc", false);

        assert_eq!(envelope.trace_context(), Some("00-abc-def-01"));
        assert_eq!(envelope.command(), Some("order.create"));
    }

    #[test]
    fn test_trace_context_absent() {
        let envelope = MessageEnvelope::new(object(json!({"command": 7})), "svc", false);
        assert_eq!(envelope.trace_context(), None);
        assert_eq!(envelope.command(), None);
    }

    #[test]
    fn test_reply_envelope_wire_keys() {
        let reply = ReplyEnvelope::new("g-1", "svc-b", json!({"cmd": "pong"}), None);
        let value: Value = serde_json::to_value(&reply).unwrap();

        assert_eq!(value["replyId"], "g-1");
        assert_eq!(value["err"], Value::Null);
        assert!(value.get("replyRequired").is_none());
        assert_ne!(reply.guid, "g-1");
    }

    #[test]
    fn test_reply_envelope_without_err_field() {
        let raw = br#"{"data":{"ok":true},"guid":"g-2","sender":"peer","replyId":"g-1"}"#;
        let reply = ReplyEnvelope::from_slice(raw).unwrap();
        assert_eq!(reply.into_outcome(), Ok(json!({"ok": true})));
    }

    #[test]
    fn test_reply_envelope_error_outcome() {
        let raw = br#"{"data":null,"guid":"g-2","sender":"peer","replyId":"g-1","err":{"message":"nope"}}"#;
        let reply = ReplyEnvelope::from_slice(raw).unwrap();
        assert_eq!(reply.into_outcome(), Err(json!({"message": "nope"})));
    }
}
