//! Long-running per-cluster pod watch feeding the broadcast hub.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hub::BroadcastHub;
use crate::source::{ClusterSource, PodSelector, WatchItem, WatchStream};
use crate::types::{ClientMessage, ClusterId, DeltaRecord};

/// Resource version meaning "start from the most recent state".
const ANY_VERSION: &str = "0";

/// HTTP status of an expired resource version.
const GONE: u16 = 410;

/// Upper bound on the exponential part of the retry delay.
const MAX_BACKOFF_SECS: u64 = 120;

/// Random jitter added on top of the retry delay.
const BACKOFF_JITTER_SECS: f64 = 4.0;

/// Lifecycle of a [`WatchIngestor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestorState {
    /// Created, not yet running.
    Idle,
    /// Obtaining a baseline resource version.
    Listing,
    /// Consuming the pod event stream.
    Watching,
    /// Cancelled; terminal.
    Stopped,
}

/// Translate one raw watch event into a delta, if it carries a pod change.
///
/// Error events and bookmarks yield `None` and are never broadcast.
#[must_use]
pub fn normalize(cluster_id: &ClusterId, item: WatchItem) -> Option<DeltaRecord> {
    match item {
        WatchItem::Added(pod) | WatchItem::Modified(pod) => {
            Some(DeltaRecord::upsert(cluster_id.clone(), pod))
        }
        WatchItem::Deleted(pod) => Some(DeltaRecord::remove(cluster_id.clone(), &pod)),
        WatchItem::Bookmark { .. } | WatchItem::Error { .. } => None,
    }
}

/// Delay before retry number `attempt` (1-based): `2^attempt` seconds capped
/// at two minutes, plus up to four seconds of jitter.
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = 2u64.saturating_pow(attempt).min(MAX_BACKOFF_SECS);
    let jitter = rand::thread_rng().gen_range(0.0..BACKOFF_JITTER_SECS);
    Duration::from_secs(base) + Duration::from_secs_f64(jitter)
}

enum WatchEnd {
    Cancelled,
    Reopen,
    Relist,
}

/// Watches the pods of one cluster and publishes every change to the hub.
#[derive(Debug)]
pub struct WatchIngestor {
    cluster_id: ClusterId,
    source: Arc<dyn ClusterSource>,
    hub: Arc<BroadcastHub>,
    state: IngestorState,
    resource_version: String,
    failures: u32,
}

impl WatchIngestor {
    /// Create an idle ingestor for one cluster.
    pub fn new(cluster_id: ClusterId, source: Arc<dyn ClusterSource>, hub: Arc<BroadcastHub>) -> Self {
        Self {
            cluster_id,
            source,
            hub,
            state: IngestorState::Idle,
            resource_version: ANY_VERSION.to_string(),
            failures: 0,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> IngestorState {
        self.state
    }

    /// Cluster this ingestor watches.
    #[must_use]
    pub fn cluster_id(&self) -> &ClusterId {
        &self.cluster_id
    }

    /// Run until `cancel` fires. Cluster errors are logged and retried.
    pub async fn run(&mut self, cancel: CancellationToken) {
        info!(cluster = %self.cluster_id, "starting pod watch");
        self.state = IngestorState::Listing;

        loop {
            match self.state {
                IngestorState::Idle | IngestorState::Listing => {
                    if !self.list(&cancel).await {
                        break;
                    }
                }
                IngestorState::Watching => match self.watch(&cancel).await {
                    WatchEnd::Cancelled => break,
                    WatchEnd::Reopen => {}
                    WatchEnd::Relist => self.state = IngestorState::Listing,
                },
                IngestorState::Stopped => break,
            }
        }

        self.state = IngestorState::Stopped;
        info!(cluster = %self.cluster_id, "pod watch stopped");
    }

    /// Obtain a baseline resource version. Returns `false` when cancelled.
    async fn list(&mut self, cancel: &CancellationToken) -> bool {
        let listing = tokio::select! {
            () = cancel.cancelled() => return false,
            listing = self.source.list_pods(PodSelector::All) => listing,
        };

        match listing {
            Ok(listing) => {
                self.resource_version = listing
                    .resource_version
                    .unwrap_or_else(|| ANY_VERSION.to_string());
                self.failures = 0;
                debug!(
                    cluster = %self.cluster_id,
                    pods = listing.pods.len(),
                    resource_version = %self.resource_version,
                    "listed pods"
                );
                self.state = IngestorState::Watching;
                true
            }
            Err(e) => {
                warn!(cluster = %self.cluster_id, error = %e, "error listing pods");
                self.pause(cancel).await
            }
        }
    }

    /// Consume one watch stream until it ends or fails.
    async fn watch(&mut self, cancel: &CancellationToken) -> WatchEnd {
        let opened = tokio::select! {
            () = cancel.cancelled() => return WatchEnd::Cancelled,
            opened = self.source.watch_pods(self.resource_version.clone()) => opened,
        };

        let mut stream: WatchStream = match opened {
            Ok(stream) => stream,
            Err(e) if e.is_gone() => {
                info!(cluster = %self.cluster_id, error = %e, "resource version expired, relisting");
                return WatchEnd::Relist;
            }
            Err(e) => {
                warn!(cluster = %self.cluster_id, error = %e, "unable to start watch");
                return if self.pause(cancel).await {
                    WatchEnd::Reopen
                } else {
                    WatchEnd::Cancelled
                };
            }
        };
        self.failures = 0;

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => {
                    debug!(cluster = %self.cluster_id, "cancelled, stopping watch stream");
                    return WatchEnd::Cancelled;
                }
                next = stream.next() => next,
            };

            match next {
                None => {
                    debug!(cluster = %self.cluster_id, "watch stream ended, reopening");
                    return WatchEnd::Reopen;
                }
                Some(Ok(item)) => {
                    if let WatchItem::Error { code, message } = &item {
                        warn!(cluster = %self.cluster_id, code, message = %message, "error from watch");
                        if *code == GONE {
                            return WatchEnd::Relist;
                        }
                        continue;
                    }
                    self.ingest(item);
                }
                Some(Err(e)) if e.is_gone() => {
                    info!(cluster = %self.cluster_id, error = %e, "resource version expired, relisting");
                    return WatchEnd::Relist;
                }
                Some(Err(e)) => {
                    warn!(cluster = %self.cluster_id, error = %e, "error from watch stream");
                }
            }
        }
    }

    fn ingest(&mut self, item: WatchItem) {
        if let Some(version) = item.resource_version() {
            self.resource_version = version.to_string();
        }

        match normalize(&self.cluster_id, item) {
            Some(record) => {
                debug!(
                    cluster = %self.cluster_id,
                    path = ?record.path.segments(),
                    removal = record.is_removal(),
                    "publishing pod delta"
                );
                self.hub.publish(Arc::new(ClientMessage::ClusterDelta(record)));
            }
            None => debug!(cluster = %self.cluster_id, "dropping event without pod change"),
        }
    }

    /// Sleep before retrying. Returns `false` when cancelled.
    async fn pause(&mut self, cancel: &CancellationToken) -> bool {
        self.failures = self.failures.saturating_add(1);
        let delay = backoff_delay(self.failures);
        debug!(
            cluster = %self.cluster_id,
            attempt = self.failures,
            delay_secs = delay.as_secs(),
            "backing off"
        );
        tokio::select! {
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }
}

/// Spawn one ingestor per cluster, each stopped by a child of `cancel`.
pub fn spawn_ingestors<'a>(
    clusters: impl IntoIterator<Item = (&'a ClusterId, &'a Arc<dyn ClusterSource>)>,
    hub: &Arc<BroadcastHub>,
    cancel: &CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    clusters
        .into_iter()
        .map(|(id, source)| {
            let mut ingestor = WatchIngestor::new(id.clone(), source.clone(), hub.clone());
            let token = cancel.child_token();
            tokio::spawn(async move { ingestor.run(token).await })
        })
        .collect()
}
