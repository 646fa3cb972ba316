//! View server configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::hub::{SlowConsumerPolicy, DEFAULT_SUBSCRIBER_BUFFER};

/// Default HTTP/WebSocket port.
pub const DEFAULT_PORT: u16 = 8081;

/// Default directory of pre-built dashboard assets.
pub const DEFAULT_ASSET_PATH: &str = "static/";

/// Configuration for the view server.
#[derive(Debug, Clone)]
pub struct ViewConfig {
    /// Address to bind the HTTP server to.
    pub bind_addr: SocketAddr,
    /// Directory served at the root path.
    pub asset_path: PathBuf,
    /// Maximum WebSocket connections allowed.
    pub max_ws_connections: usize,
    /// Messages buffered per connected client.
    pub subscriber_buffer: usize,
    /// Handling of clients that fall behind.
    pub slow_consumer_policy: SlowConsumerPolicy,
    /// CORS allowed origins (empty means all).
    pub cors_origins: Vec<String>,
    /// Time between failing health checks and stopping on shutdown.
    pub shutdown_delay: Duration,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            asset_path: PathBuf::from(DEFAULT_ASSET_PATH),
            max_ws_connections: 1000,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            slow_consumer_policy: SlowConsumerPolicy::default(),
            cors_origins: Vec::new(),
            shutdown_delay: Duration::ZERO,
        }
    }
}

impl ViewConfig {
    /// Create a new configuration with the specified bind address.
    #[must_use]
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Self::default()
        }
    }

    /// Set the static asset directory.
    #[must_use]
    pub fn with_asset_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.asset_path = path.into();
        self
    }

    /// Set the maximum WebSocket connections.
    #[must_use]
    pub const fn with_max_ws_connections(mut self, max: usize) -> Self {
        self.max_ws_connections = max;
        self
    }

    /// Set the per-client message buffer.
    #[must_use]
    pub const fn with_subscriber_buffer(mut self, capacity: usize) -> Self {
        self.subscriber_buffer = capacity;
        self
    }

    /// Set the slow consumer policy.
    #[must_use]
    pub const fn with_slow_consumer_policy(mut self, policy: SlowConsumerPolicy) -> Self {
        self.slow_consumer_policy = policy;
        self
    }

    /// Add a CORS allowed origin.
    #[must_use]
    pub fn with_cors_origin(mut self, origin: impl Into<String>) -> Self {
        self.cors_origins.push(origin.into());
        self
    }

    /// Set the shutdown delay.
    #[must_use]
    pub const fn with_shutdown_delay(mut self, delay: Duration) -> Self {
        self.shutdown_delay = delay;
        self
    }
}
