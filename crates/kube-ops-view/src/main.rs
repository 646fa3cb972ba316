//! kube-ops-view - live node and pod placement across Kubernetes clusters.
//!
//! Discovers clusters, starts one watch per cluster and serves the dashboard
//! and its `/ws` stream until SIGTERM or Ctrl-C.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use kube_ops_view::config::{DEFAULT_ASSET_PATH, DEFAULT_PORT};
use kube_ops_view::discovery::{discover, DiscoveryConfig};
use kube_ops_view::{ClusterRegistry, ViewConfig, ViewServer};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Interval between mock watch events.
const MOCK_TICK: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "kube-ops-view")]
#[command(about = "Live node and pod placement view across Kubernetes clusters")]
#[command(version)]
struct Cli {
    /// HTTP port to listen on
    #[arg(short, long, env = "SERVER_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Directory of dashboard assets served at /
    #[arg(long, env = "ASSET_PATH", default_value = DEFAULT_ASSET_PATH)]
    asset_path: PathBuf,

    /// Comma-separated Kubernetes API server URLs (replaces kubeconfig discovery)
    #[arg(long, env = "CLUSTERS", value_delimiter = ',')]
    clusters: Vec<String>,

    /// Colon-separated kubeconfig files or directories
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<String>,

    /// Comma-separated kubeconfig contexts to load (default: current context)
    #[arg(long, env = "KUBECONFIG_CONTEXTS", value_delimiter = ',')]
    kubeconfig_contexts: Vec<String>,

    /// Serve generated clusters instead of real ones
    #[arg(short, long, env = "MOCK")]
    mock: bool,

    /// Number of generated clusters
    #[arg(long, env = "MOCK_CLUSTERS", default_value_t = 3)]
    mock_clusters: u64,

    /// Enable debug logging
    #[arg(short, long, env = "DEBUG")]
    debug: bool,

    /// Messages buffered per dashboard client before it is disconnected
    #[arg(long, env = "SUBSCRIBER_BUFFER", default_value_t = kube_ops_view::hub::DEFAULT_SUBSCRIBER_BUFFER)]
    subscriber_buffer: usize,

    /// Seconds to fail health checks before stopping on shutdown
    #[arg(long, env = "SHUTDOWN_DELAY", default_value_t = 0)]
    shutdown_delay: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug { "kube_ops_view=debug" } else { "kube_ops_view=info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(level.parse()?))
        .init();

    let registry = match build_registry(&cli).await {
        Ok(registry) => registry,
        Err(e) => {
            error!(error = %e, "no usable clusters, exiting");
            std::process::exit(1);
        }
    };
    info!(clusters = registry.len(), "cluster registry ready");

    let config = ViewConfig::new(SocketAddr::from(([0, 0, 0, 0], cli.port)))
        .with_asset_path(cli.asset_path)
        .with_subscriber_buffer(cli.subscriber_buffer)
        .with_shutdown_delay(Duration::from_secs(cli.shutdown_delay));

    let server = ViewServer::new(config, registry);
    let ingestors = server.start_ingestors();

    let state = server.state();
    let shutdown = async move {
        wait_for_signal().await;
        state.begin_shutdown();
        let delay = state.config().shutdown_delay;
        if !delay.is_zero() {
            info!(delay_secs = delay.as_secs(), "waiting before shutdown");
            tokio::time::sleep(delay).await;
        }
    };

    server
        .serve_with_shutdown(shutdown)
        .await
        .context("view server failed")?;

    for handle in ingestors {
        if let Err(e) = handle.await {
            error!(error = %e, "watch ingestor panicked");
        }
    }
    Ok(())
}

async fn build_registry(cli: &Cli) -> kube_ops_view::ViewResult<ClusterRegistry> {
    if cli.mock {
        info!(count = cli.mock_clusters, "serving mock clusters");
        return ClusterRegistry::mock(cli.mock_clusters, MOCK_TICK);
    }

    let discovery = DiscoveryConfig::new(cli.kubeconfig.clone())
        .with_clusters(cli.clusters.clone())
        .with_contexts(cli.kubeconfig_contexts.clone());
    ClusterRegistry::connect(discover(&discovery).await)
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "unable to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received SIGTERM"),
    }
}
