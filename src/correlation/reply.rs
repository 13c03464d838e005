//! Reply-side types: the future a requester awaits, and the capability a
//! handler uses to answer

use crate::adapter::Adapter;
use crate::envelope::ReplyEnvelope;
use crate::error::{ReplyBusError, Result};
use crate::trace::TraceSpan;

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::debug;

/// Outcome of a request, resolved by a correlated reply or by timeout
///
/// Dropping it does not cancel the request; the pending entry is still
/// retired by the reply or the timeout.
pub struct PendingReply {
    guid: String,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingReply {
    pub(crate) fn new(guid: String, rx: oneshot::Receiver<Result<Value>>) -> Self {
        Self { guid, rx }
    }

    /// Correlation id of the request
    pub fn guid(&self) -> &str {
        &self.guid
    }
}

impl Future for PendingReply {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ReplyBusError::Shutdown)))
    }
}

impl fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReply")
            .field("guid", &self.guid)
            .finish()
    }
}

/// Bound reply capability handed to a handler when the sender wants a reply
///
/// Consumed by replying. The message's trace span ends once the reply has
/// been published, or when the replier is dropped unused.
pub struct Replier {
    adapter: Adapter,
    local_id: String,
    to: String,
    reply_id: String,
    span: Option<Box<dyn TraceSpan>>,
}

impl Replier {
    pub(crate) fn new(
        adapter: Adapter,
        local_id: String,
        to: String,
        reply_id: String,
        span: Box<dyn TraceSpan>,
    ) -> Self {
        Self {
            adapter,
            local_id,
            to,
            reply_id,
            span: Some(span),
        }
    }

    /// Client id the reply goes to
    pub fn to(&self) -> &str {
        &self.to
    }

    /// Guid of the message being answered
    pub fn reply_id(&self) -> &str {
        &self.reply_id
    }

    /// Reply with a successful result
    pub async fn reply<T: Serialize>(self, data: &T) -> Result<()> {
        let data = serde_json::to_value(data)?;
        self.send(None, data).await
    }

    /// Reply with an error payload
    pub async fn reply_error<E: Serialize>(self, err: &E) -> Result<()> {
        let err = serde_json::to_value(err)?;
        self.send(Some(err), Value::Null).await
    }

    async fn send(mut self, err: Option<Value>, data: Value) -> Result<()> {
        let envelope = ReplyEnvelope::new(self.reply_id.clone(), self.local_id.clone(), data, err);
        let bytes = envelope.to_bytes()?;

        let result = self.adapter.publish(&self.to, bytes).await;
        debug!(
            to = %self.to,
            reply_id = %self.reply_id,
            ok = result.is_ok(),
            "Sent reply"
        );

        if let Some(span) = self.span.take() {
            span.end();
        }
        result
    }
}

impl Drop for Replier {
    fn drop(&mut self) {
        if let Some(span) = self.span.take() {
            debug!(reply_id = %self.reply_id, "Replier dropped without replying");
            span.end();
        }
    }
}

impl fmt::Debug for Replier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replier")
            .field("to", &self.to)
            .field("reply_id", &self.reply_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_pending_reply_resolves() {
        let (tx, rx) = oneshot::channel();
        let pending = PendingReply::new("g-1".into(), rx);
        assert_eq!(pending.guid(), "g-1");

        tx.send(Ok(json!({"ok": true}))).unwrap();
        assert_eq!(pending.await.unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_pending_reply_sender_dropped() {
        let (tx, rx) = oneshot::channel::<Result<Value>>();
        let pending = PendingReply::new("g-1".into(), rx);
        drop(tx);

        assert!(matches!(pending.await, Err(ReplyBusError::Shutdown)));
    }
}
