//! Registry of requests awaiting a correlated reply
//!
//! Each entry is retired exactly once: by [`PendingReplies::resolve`] when the
//! reply arrives, or by its timeout task. Both paths remove the entry under
//! the same lock, so whichever gets there first wins and the other finds
//! nothing.

use crate::error::{ReplyBusError, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

// About 30 years
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Where the outcome of a pending request goes
pub(crate) enum ReplySink {
    /// A caller awaiting a [`super::PendingReply`]
    Waiter(oneshot::Sender<Result<Value>>),
    /// Nobody is waiting; the reply is consumed and dropped
    Discard,
}

impl ReplySink {
    fn complete(self, guid: &str, outcome: Result<Value>) {
        match self {
            Self::Waiter(tx) => {
                if tx.send(outcome).is_err() {
                    debug!(guid = %guid, "Reply waiter dropped");
                }
            }
            Self::Discard => debug!(guid = %guid, "Discarding reply outcome"),
        }
    }
}

struct PendingEntry {
    sink: ReplySink,
    timer: AbortHandle,
}

pub(crate) struct PendingReplies {
    entries: Mutex<HashMap<String, PendingEntry>>,
    limit: usize,
}

impl PendingReplies {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            limit,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[cfg(test)]
    pub fn contains(&self, guid: &str) -> bool {
        self.entries.lock().contains_key(guid)
    }

    /// Track `guid` until a reply arrives or `timeout` elapses
    pub fn register(
        self: &Arc<Self>,
        guid: String,
        sink: ReplySink,
        timeout: Duration,
    ) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.limit {
            return Err(ReplyBusError::TooManyPendingReplies(self.limit));
        }

        let registry: Weak<Self> = Arc::downgrade(self);
        let timer_guid = guid.clone();
        let deadline = deadline_after(timeout);
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(registry) = registry.upgrade() {
                registry.expire(&timer_guid, timeout);
            }
        });

        if let Some(previous) = entries.insert(
            guid.clone(),
            PendingEntry {
                sink,
                timer: timer.abort_handle(),
            },
        ) {
            // guids are fresh uuids; a collision means a caller bug
            warn!(guid = %guid, "Replaced pending reply with duplicate guid");
            previous.timer.abort();
        }
        Ok(())
    }

    /// Complete the entry for `guid` with a reply. Returns false when there
    /// is no such entry (timed out, or never ours).
    pub fn resolve(&self, guid: &str, outcome: std::result::Result<Value, Value>) -> bool {
        let entry = self.entries.lock().remove(guid);
        match entry {
            Some(entry) => {
                entry.timer.abort();
                entry
                    .sink
                    .complete(guid, outcome.map_err(ReplyBusError::Remote));
                true
            }
            None => false,
        }
    }

    /// Drop the entry for `guid` without completing it
    pub fn cancel(&self, guid: &str) {
        if let Some(entry) = self.entries.lock().remove(guid) {
            entry.timer.abort();
        }
    }

    /// Fail every outstanding entry with [`ReplyBusError::Shutdown`]
    pub fn fail_all(&self) -> usize {
        let drained: Vec<(String, PendingEntry)> = self.entries.lock().drain().collect();
        let count = drained.len();
        for (guid, entry) in drained {
            entry.timer.abort();
            entry.sink.complete(&guid, Err(ReplyBusError::Shutdown));
        }
        count
    }

    fn expire(&self, guid: &str, timeout: Duration) {
        let entry = self.entries.lock().remove(guid);
        if let Some(entry) = entry {
            debug!(guid = %guid, timeout_ms = timeout.as_millis() as u64, "Reply timed out");
            entry
                .sink
                .complete(guid, Err(ReplyBusError::ReplyTimeout(timeout)));
        }
    }
}

/// Deadline `timeout` from now; timeouts past the clock's range never fire
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}
