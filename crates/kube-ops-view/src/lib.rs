//! # kube-ops-view
//!
//! Live node and pod placement across one or more Kubernetes clusters,
//! streamed to dashboard clients over a WebSocket.
//!
//! Each connected client first receives one `clusterupdate` message per
//! cluster carrying a full [`ClusterSnapshot`], then a stream of
//! `clusterdelta` messages, each inserting, replacing or removing exactly
//! one pod.
//!
//! ## Components
//!
//! - [`ClusterRegistry`]: the fixed set of clusters, built at startup from
//!   [`discovery`] or generated [`mock`] clusters
//! - [`build_snapshot`]: lists a cluster's nodes and pods into a snapshot
//! - [`WatchIngestor`]: one per cluster, turns pod watch events into deltas
//! - [`BroadcastHub`]: fans deltas out to every connected client
//! - [`ConnectionHandler`]: one per client, delivers snapshots then deltas
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use kube_ops_view::{ClusterRegistry, ViewConfig, ViewServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = ClusterRegistry::mock(2, Duration::from_secs(5))?;
//!     let server = ViewServer::new(ViewConfig::default(), registry);
//!     server.start_ingestors();
//!     server.serve_with_shutdown(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     }).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Endpoints
//!
//! | Endpoint | Method | Description |
//! |----------|--------|-------------|
//! | `/ws` | GET | WebSocket stream of snapshots and deltas, optionally narrowed by `?cluster_ids=` |
//! | `/health` | GET | Liveness, 503 while shutting down |
//! | `/clusters` | GET | Served cluster IDs |
//! | `/*` | GET | Dashboard assets |

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod discovery;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod mock;
pub mod registry;
pub mod routes;
pub mod server;
pub mod session;
pub mod snapshot;
pub mod source;
pub mod state;
pub mod types;
pub mod watch;
pub mod websocket;

pub use config::ViewConfig;
pub use error::{SourceError, ViewError, ViewResult};
pub use hub::{BroadcastHub, SlowConsumerPolicy, Subscription};
pub use registry::{ClusterHandle, ClusterRegistry};
pub use server::ViewServer;
pub use session::{ConnectionHandler, SessionEnd};
pub use snapshot::build_snapshot;
pub use source::{ClusterSource, KubeSource, PodListing, PodSelector, WatchItem, WatchStream};
pub use state::ViewState;
pub use types::{ClientMessage, ClusterId, ClusterSnapshot, DeltaPath, DeltaRecord, NodeEntry, PodKey};
pub use watch::{IngestorState, WatchIngestor};
