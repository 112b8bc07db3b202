use std::time::Duration;

use crate::framing::DEFAULT_MAX_MESSAGE_SIZE;
use crate::loadbalance::LoadBalance;
use crate::url::UrlOptions;

/// How many messages a per-call queue buffers before the producer blocks.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Client-side knobs.
///
/// URL options (`?timeout_ms=...`) override the struct defaults, so a
/// reference URL is enough to configure a client end to end.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Default per-call timeout; `None` means calls wait indefinitely.
    pub timeout: Option<Duration>,
    /// TCP connect + HTTP/2 handshake budget.
    pub connect_timeout: Duration,
    /// Cap on one serialized message in either direction.
    pub max_message_size: usize,
    /// Per-call bounded queue depth (the backpressure point).
    pub queue_capacity: usize,
    /// HTTP/2 keep-alive PING interval; `None` disables pings.
    pub keepalive_interval: Option<Duration>,
    /// Connections idle longer than this are closed; `None` keeps them.
    pub idle_timeout: Option<Duration>,
    pub user_agent: String,
    pub loadbalance: LoadBalance,
    /// How long the last non-empty address list may serve after the
    /// registry reports empty. Zero disables stale serving.
    pub grace_window: Duration,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            timeout: None,
            connect_timeout: Duration::from_secs(10),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            keepalive_interval: Some(Duration::from_secs(60)),
            idle_timeout: Some(Duration::from_secs(300)),
            user_agent: default_user_agent(),
            loadbalance: LoadBalance::Random,
            grace_window: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    /// Fold recognized URL options into this configuration.
    pub fn apply_url_options(&mut self, options: &UrlOptions) {
        if let Some(loadbalance) = options.loadbalance {
            self.loadbalance = loadbalance;
        }
        if let Some(timeout) = options.timeout {
            self.timeout = Some(timeout);
        }
        if let Some(size) = options.max_message_size {
            self.max_message_size = size;
        }
    }
}

/// Server-side knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Size of the handler pool. Handlers run here so a slow handler
    /// never blocks the event loop.
    pub handler_threads: usize,
    pub max_message_size: usize,
    pub queue_capacity: usize,
    /// HTTP/2 concurrent stream cap advertised in SETTINGS.
    pub max_concurrent_streams: Option<u32>,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            handler_threads: num_cpus::get(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_concurrent_streams: None,
        }
    }
}

pub(crate) fn default_user_agent() -> String {
    format!("triple-core/{}", env!("CARGO_PKG_VERSION"))
}
