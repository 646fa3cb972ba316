//! View server implementation.

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::ViewConfig;
use crate::error::{ViewError, ViewResult};
use crate::registry::ClusterRegistry;
use crate::routes::create_router;
use crate::state::ViewState;
use crate::watch::spawn_ingestors;

/// The composition root: owns the registry, the hub and the HTTP listener.
#[derive(Debug, Clone)]
pub struct ViewServer {
    state: Arc<ViewState>,
}

impl ViewServer {
    /// Create a server for the given clusters.
    #[must_use]
    pub fn new(config: ViewConfig, registry: ClusterRegistry) -> Self {
        Self {
            state: Arc::new(ViewState::new(config, registry)),
        }
    }

    /// Get the server state for external access.
    #[must_use]
    pub fn state(&self) -> Arc<ViewState> {
        self.state.clone()
    }

    /// Start one watch ingestor per cluster. They stop when the server does.
    pub fn start_ingestors(&self) -> Vec<JoinHandle<()>> {
        let registry = self.state.registry();
        spawn_ingestors(
            registry.clusters(),
            &self.state.hub(),
            self.state.shutdown_token(),
        )
    }

    /// Serve until `shutdown` completes, then cancel every session and
    /// ingestor.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn serve_with_shutdown<F>(&self, shutdown: F) -> ViewResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.state.config().bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ViewError::BindFailed(addr, e))?;

        info!(addr = %addr, clusters = self.state.registry().len(), "view server listening");

        // Open WebSocket sessions keep graceful shutdown waiting until their
        // tokens fire.
        let state = self.state.clone();
        let signal = async move {
            shutdown.await;
            state.stop();
        };

        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| ViewError::Internal(e.to_string()));

        self.state.stop();
        info!("view server shut down");
        result
    }

    /// Create the router without starting the server.
    pub fn router(&self) -> axum::Router {
        create_router(self.state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn make_test_server() -> ViewServer {
        let registry = ClusterRegistry::mock(2, Duration::from_secs(60)).unwrap();
        ViewServer::new(ViewConfig::default(), registry)
    }

    #[tokio::test]
    async fn test_ingestors_stop_with_server() {
        let server = make_test_server();

        let handles = server.start_ingestors();
        assert_eq!(handles.len(), 2);

        server.state().stop();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_serve_stops_on_signal() {
        let config = ViewConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)));
        let registry = ClusterRegistry::mock(1, Duration::from_secs(60)).unwrap();
        let server = ViewServer::new(config, registry);

        server.serve_with_shutdown(async {}).await.unwrap();

        assert!(server.state().shutdown_token().is_cancelled());
        assert!(server.state().is_shutting_down());
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = ClusterRegistry::mock(1, Duration::from_secs(60)).unwrap();
        let server = ViewServer::new(ViewConfig::new(addr), registry);

        let result = server.serve_with_shutdown(async {}).await;

        assert!(matches!(result, Err(ViewError::BindFailed(a, _)) if a == addr));
    }
}
