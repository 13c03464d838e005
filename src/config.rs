//! Configuration for the reply bus

use std::time::Duration;

/// Default transport cluster id
pub const DEFAULT_CLUSTER: &str = "default";

/// Default base client id
pub const DEFAULT_CLIENT_ID: &str = "default";

/// Default transport server URL
pub const DEFAULT_SERVER_URL: &str = "nats://localhost:4222";

/// Default time to wait for a correlated reply
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(15);

/// Default cap on outstanding requests
pub const DEFAULT_MAX_PENDING_REPLIES: usize = 10_000;

/// Configuration for a reply bus instance
#[derive(Debug, Clone)]
pub struct ReplyBusConfig {
    /// Transport cluster id
    pub cluster: String,

    /// Base client id. Replies for this instance arrive on a topic with this name.
    pub client_id: String,

    /// Transport server URL (e.g., "nats://localhost:4222")
    pub server_url: String,

    /// Reply timeout used when a publish does not set one
    pub reply_timeout: Duration,

    /// Maximum number of requests awaiting replies at once
    pub max_pending_replies: usize,
}

impl Default for ReplyBusConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CLUSTER, DEFAULT_CLIENT_ID, DEFAULT_SERVER_URL)
    }
}

impl ReplyBusConfig {
    /// Create a new configuration
    pub fn new(
        cluster: impl Into<String>,
        client_id: impl Into<String>,
        server_url: impl Into<String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            client_id: client_id.into(),
            server_url: server_url.into(),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            max_pending_replies: DEFAULT_MAX_PENDING_REPLIES,
        }
    }

    /// Build a configuration from `REPLYBUS_*` environment variables,
    /// falling back to defaults for anything unset or unparsable
    pub fn from_env() -> Self {
        let mut config = Self::new(
            std::env::var("REPLYBUS_CLUSTER").unwrap_or_else(|_| DEFAULT_CLUSTER.to_string()),
            std::env::var("REPLYBUS_CLIENT_ID").unwrap_or_else(|_| DEFAULT_CLIENT_ID.to_string()),
            std::env::var("REPLYBUS_SERVER_URL").unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string()),
        );

        if let Some(ms) = std::env::var("REPLYBUS_REPLY_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.reply_timeout = Duration::from_millis(ms);
        }

        if let Some(max) = std::env::var("REPLYBUS_MAX_PENDING_REPLIES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            config.max_pending_replies = max;
        }

        config
    }

    /// Set the default reply timeout
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Set the pending reply limit
    pub fn max_pending_replies(mut self, max: usize) -> Self {
        self.max_pending_replies = max;
        self
    }
}
