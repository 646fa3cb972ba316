//! Shared state for the view server.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ViewConfig;
use crate::hub::BroadcastHub;
use crate::registry::ClusterRegistry;

/// Shared state for the view server.
#[derive(Debug)]
pub struct ViewState {
    /// Server configuration.
    config: Arc<ViewConfig>,
    /// Clusters served by this process.
    registry: Arc<ClusterRegistry>,
    /// Delta fan-out shared with the watch ingestors.
    hub: Arc<BroadcastHub>,
    /// Number of active WebSocket connections.
    ws_connections: AtomicUsize,
    /// Server start time.
    start_time: Instant,
    /// Parent of every ingestor and connection token.
    shutdown: CancellationToken,
    /// Set once shutdown begins; health checks fail from then on.
    shutting_down: AtomicBool,
}

impl ViewState {
    /// Create state for the given clusters. The hub is sized from `config`.
    pub fn new(config: ViewConfig, registry: ClusterRegistry) -> Self {
        let hub = BroadcastHub::new(config.subscriber_buffer, config.slow_consumer_policy);
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            hub: Arc::new(hub),
            ws_connections: AtomicUsize::new(0),
            start_time: Instant::now(),
            shutdown: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &ViewConfig {
        &self.config
    }

    /// Get the cluster registry.
    #[must_use]
    pub fn registry(&self) -> Arc<ClusterRegistry> {
        self.registry.clone()
    }

    /// Get the broadcast hub.
    #[must_use]
    pub fn hub(&self) -> Arc<BroadcastHub> {
        self.hub.clone()
    }

    /// Token cancelled when the server stops.
    #[must_use]
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Get the number of active WebSocket connections.
    #[must_use]
    pub fn ws_connection_count(&self) -> usize {
        self.ws_connections.load(Ordering::Relaxed)
    }

    /// Increment the WebSocket connection count.
    ///
    /// Returns `true` if the connection was allowed, `false` if limit reached.
    pub fn add_ws_connection(&self) -> bool {
        let current = self.ws_connections.fetch_add(1, Ordering::Relaxed);
        if current >= self.config.max_ws_connections {
            self.ws_connections.fetch_sub(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Decrement the WebSocket connection count.
    pub fn remove_ws_connection(&self) {
        self.ws_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get server uptime in seconds.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Start draining: health checks fail and new connections are refused.
    /// Running sessions continue until [`Self::stop`].
    pub fn begin_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            info!("shutdown requested, failing health checks");
        }
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Cancel every ingestor and session.
    pub fn stop(&self) {
        self.begin_shutdown();
        self.shutdown.cancel();
    }
}
