//! Per-client delivery of snapshots and deltas.
//!
//! A [`ConnectionHandler`] registers its subscription before any snapshot is
//! read, so no delta published after the snapshot listing can be missed.
//! Deltas for a cluster whose snapshot has not been delivered yet are held
//! and flushed right after that cluster's `clusterupdate`; deltas for a
//! cluster whose snapshot failed are dropped, since the client has no
//! baseline to apply them to.
//!
//! A client may narrow its stream to a subset of clusters; both snapshots
//! and deltas of every other cluster are then skipped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::ViewError;
use crate::hub::BroadcastHub;
use crate::registry::{ClusterHandle, ClusterRegistry};
use crate::snapshot::build_snapshot;
use crate::types::{ClientMessage, ClusterId, ClusterSnapshot};

/// Why a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The connection's cancellation token fired.
    Cancelled,
    /// The hub dropped the subscription, e.g. because the client fell behind.
    Evicted,
}

/// Delivery state of one cluster's snapshot for this client.
#[derive(Debug)]
enum Baseline {
    Pending(Vec<Arc<ClientMessage>>),
    Delivered,
    Failed,
}

/// Drives one dashboard client from connect to disconnect.
#[derive(Debug)]
pub struct ConnectionHandler {
    registry: Arc<ClusterRegistry>,
    hub: Arc<BroadcastHub>,
    cancel: CancellationToken,
    selected: Option<HashSet<ClusterId>>,
}

impl ConnectionHandler {
    /// Create a handler whose lifetime is bound to `cancel`.
    #[must_use]
    pub fn new(
        registry: Arc<ClusterRegistry>,
        hub: Arc<BroadcastHub>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            hub,
            cancel,
            selected: None,
        }
    }

    /// Only stream the given clusters. An empty set streams every cluster.
    #[must_use]
    pub fn with_cluster_filter(mut self, clusters: impl IntoIterator<Item = ClusterId>) -> Self {
        let selected: HashSet<ClusterId> = clusters.into_iter().collect();
        self.selected = (!selected.is_empty()).then_some(selected);
        self
    }

    fn is_selected(&self, id: &ClusterId) -> bool {
        self.selected.as_ref().is_none_or(|selected| selected.contains(id))
    }

    /// Run the session against `sink` until cancellation, eviction or a
    /// delivery failure. The subscription is removed and the sink closed on
    /// every exit path.
    ///
    /// # Errors
    ///
    /// Returns the sink's error if delivering a message fails.
    pub async fn run<S>(self, mut sink: S) -> Result<SessionEnd, ViewError>
    where
        S: Sink<Arc<ClientMessage>, Error = ViewError> + Unpin,
    {
        let (subscription, mut deltas) = self.hub.subscribe();
        info!(
            subscription = %subscription.id(),
            clusters = self.registry.len(),
            filtered = self.selected.is_some(),
            "session started"
        );

        let result = self.relay(&mut sink, &mut deltas).await;

        self.hub.unregister(&subscription);
        if let Err(e) = sink.close().await {
            debug!(subscription = %subscription.id(), error = %e, "error closing connection");
        }

        match &result {
            Ok(end) => info!(subscription = %subscription.id(), reason = ?end, "session ended"),
            Err(e) => warn!(subscription = %subscription.id(), error = %e, "session failed"),
        }
        result
    }

    async fn relay<S>(
        &self,
        sink: &mut S,
        deltas: &mut mpsc::Receiver<Arc<ClientMessage>>,
    ) -> Result<SessionEnd, ViewError>
    where
        S: Sink<Arc<ClientMessage>, Error = ViewError> + Unpin,
    {
        let mut baselines: HashMap<ClusterId, Baseline> = self
            .registry
            .ids()
            .filter(|id| self.is_selected(id))
            .map(|id| (id.clone(), Baseline::Pending(Vec::new())))
            .collect();

        let mut snapshots: FuturesUnordered<_> = self
            .registry
            .clusters()
            .iter()
            .filter(|(id, _)| self.is_selected(id))
            .map(|(id, handle)| cluster_snapshot(id.clone(), Arc::clone(handle)))
            .collect();

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => return Ok(SessionEnd::Cancelled),

                Some((id, result)) = snapshots.next(), if !snapshots.is_empty() => match result {
                    Ok(snapshot) => {
                        debug!(cluster = %id, pods = snapshot.pod_count(), "delivering snapshot");
                        sink.send(Arc::new(ClientMessage::ClusterUpdate(snapshot))).await?;
                        if let Some(Baseline::Pending(held)) =
                            baselines.insert(id, Baseline::Delivered)
                        {
                            for message in held {
                                sink.send(message).await?;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "error building snapshot, omitting cluster");
                        baselines.insert(id, Baseline::Failed);
                    }
                },

                message = deltas.recv() => {
                    let Some(message) = message else {
                        return Ok(SessionEnd::Evicted);
                    };
                    if !self.is_selected(message.cluster_id()) {
                        continue;
                    }
                    match baselines.get_mut(message.cluster_id()) {
                        Some(Baseline::Pending(held)) => held.push(message),
                        Some(Baseline::Failed) => {
                            trace!(cluster = %message.cluster_id(), "dropping delta without baseline");
                        }
                        Some(Baseline::Delivered) | None => sink.send(message).await?,
                    }
                }
            }
        }
    }
}

/// Build one cluster's snapshot, tagging a failure with the cluster.
async fn cluster_snapshot(
    id: ClusterId,
    handle: ClusterHandle,
) -> (ClusterId, Result<ClusterSnapshot, ViewError>) {
    let result = build_snapshot(&id, handle.as_ref())
        .await
        .map(|(snapshot, _)| snapshot)
        .map_err(|source| ViewError::Cluster {
            cluster: id.to_string(),
            source,
        });
    (id, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::SlowConsumerPolicy;
    use crate::registry::ClusterHandle;
    use crate::source::fake::FakeSource;
    use crate::source::{ClusterSource, PodListing, PodSelector, WatchStream};
    use crate::error::SourceError;
    use crate::types::fixtures::{node, pod};
    use crate::types::DeltaRecord;
    use futures::channel::mpsc as client;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use k8s_openapi::api::core::v1::Node;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Source whose node listing waits until the gate opens.
    #[derive(Debug)]
    struct GatedSource {
        inner: FakeSource,
        gate: Notify,
    }

    impl ClusterSource for GatedSource {
        fn list_nodes(&self) -> BoxFuture<'_, Result<Vec<Node>, SourceError>> {
            async move {
                self.gate.notified().await;
                self.inner.list_nodes().await
            }
            .boxed()
        }

        fn list_pods(&self, selector: PodSelector) -> BoxFuture<'_, Result<PodListing, SourceError>> {
            self.inner.list_pods(selector)
        }

        fn watch_pods(&self, resource_version: String) -> BoxFuture<'_, Result<WatchStream, SourceError>> {
            self.inner.watch_pods(resource_version)
        }
    }

    type ClientRx = client::UnboundedReceiver<Arc<ClientMessage>>;

    fn client_sink() -> (
        impl Sink<Arc<ClientMessage>, Error = ViewError> + Unpin,
        ClientRx,
    ) {
        let (tx, rx) = client::unbounded();
        (tx.sink_map_err(|e| ViewError::WebSocket(e.to_string())), rx)
    }

    fn healthy(node_name: &str) -> ClusterHandle {
        Arc::new(FakeSource::new(
            vec![node(node_name)],
            vec![pod("default", "web", Some(node_name))],
        ))
    }

    fn broken() -> ClusterHandle {
        Arc::new(FakeSource::broken())
    }

    async fn wait_for_subscriber(hub: &BroadcastHub) {
        while hub.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_failed_cluster_does_not_block_others() {
        let registry = Arc::new(
            ClusterRegistry::from_handles(vec![
                (ClusterId::new("https://ok"), healthy("n1")),
                (ClusterId::new("https://broken"), broken()),
            ])
            .unwrap(),
        );
        let hub = Arc::new(BroadcastHub::default());
        let cancel = CancellationToken::new();
        let (sink, mut rx) = client_sink();

        let handler = ConnectionHandler::new(registry, hub.clone(), cancel.clone());
        let session = tokio::spawn(handler.run(sink));

        let first = rx.next().await.unwrap();
        assert_eq!(first.message_type(), "clusterupdate");
        assert_eq!(first.cluster_id().as_str(), "https://ok");

        cancel.cancel();
        assert_eq!(session.await.unwrap().unwrap(), SessionEnd::Cancelled);
        assert!(rx.next().await.is_none());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_deltas_held_until_snapshot_delivered() {
        let id = ClusterId::new("https://slow");
        let gated = Arc::new(GatedSource {
            inner: FakeSource::new(vec![node("n1")], Vec::new()),
            gate: Notify::new(),
        });
        let handle: ClusterHandle = gated.clone();
        let registry = Arc::new(ClusterRegistry::from_handles(vec![(id.clone(), handle)]).unwrap());
        let hub = Arc::new(BroadcastHub::default());
        let cancel = CancellationToken::new();
        let (sink, mut rx) = client_sink();

        let session = tokio::spawn(
            ConnectionHandler::new(registry, hub.clone(), cancel.clone()).run(sink),
        );
        wait_for_subscriber(&hub).await;

        let delta = DeltaRecord::upsert(id.clone(), pod("default", "late", Some("n1")));
        assert_eq!(hub.publish(Arc::new(ClientMessage::ClusterDelta(delta))), 1);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.next())
                .await
                .is_err()
        );

        gated.gate.notify_one();

        let update = rx.next().await.unwrap();
        assert_eq!(update.message_type(), "clusterupdate");
        let held = rx.next().await.unwrap();
        assert_eq!(held.message_type(), "clusterdelta");

        cancel.cancel();
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_deltas_for_failed_cluster_are_dropped() {
        let ok = ClusterId::new("https://ok");
        let bad = ClusterId::new("https://broken");
        let registry = Arc::new(
            ClusterRegistry::from_handles(vec![(ok.clone(), healthy("n1")), (bad.clone(), broken())])
                .unwrap(),
        );
        let hub = Arc::new(BroadcastHub::default());
        let cancel = CancellationToken::new();
        let (sink, mut rx) = client_sink();

        let session = tokio::spawn(
            ConnectionHandler::new(registry, hub.clone(), cancel.clone()).run(sink),
        );
        assert_eq!(rx.next().await.unwrap().message_type(), "clusterupdate");

        hub.publish(Arc::new(ClientMessage::ClusterDelta(DeltaRecord::upsert(
            bad,
            pod("default", "ghost", None),
        ))));
        hub.publish(Arc::new(ClientMessage::ClusterDelta(DeltaRecord::upsert(
            ok.clone(),
            pod("default", "web-2", Some("n1")),
        ))));

        let next = rx.next().await.unwrap();
        assert_eq!(next.cluster_id(), &ok);
        assert_eq!(next.message_type(), "clusterdelta");

        cancel.cancel();
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_failure_names_cluster() {
        let (id, result) = cluster_snapshot(ClusterId::new("https://broken"), broken()).await;

        assert_eq!(id.as_str(), "https://broken");
        match result {
            Err(ViewError::Cluster { cluster, source }) => {
                assert_eq!(cluster, "https://broken");
                assert!(matches!(source, SourceError::Unavailable(_)));
            }
            other => panic!("expected cluster error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cluster_filter_limits_snapshots_and_deltas() {
        let a = ClusterId::new("https://a");
        let b = ClusterId::new("https://b");
        let registry = Arc::new(
            ClusterRegistry::from_handles(vec![(a.clone(), healthy("n1")), (b.clone(), healthy("n2"))])
                .unwrap(),
        );
        let hub = Arc::new(BroadcastHub::default());
        let cancel = CancellationToken::new();
        let (sink, mut rx) = client_sink();

        let session = tokio::spawn(
            ConnectionHandler::new(registry, hub.clone(), cancel.clone())
                .with_cluster_filter([b.clone()])
                .run(sink),
        );

        let update = rx.next().await.unwrap();
        assert_eq!(update.message_type(), "clusterupdate");
        assert_eq!(update.cluster_id(), &b);

        hub.publish(Arc::new(ClientMessage::ClusterDelta(DeltaRecord::upsert(
            a,
            pod("default", "hidden", Some("n1")),
        ))));
        hub.publish(Arc::new(ClientMessage::ClusterDelta(DeltaRecord::upsert(
            b.clone(),
            pod("default", "shown", Some("n2")),
        ))));

        let delta = rx.next().await.unwrap();
        assert_eq!(delta.message_type(), "clusterdelta");
        assert_eq!(delta.cluster_id(), &b);

        cancel.cancel();
        session.await.unwrap().unwrap();
        assert!(rx.next().await.is_none());
    }

    #[tokio::test]
    async fn test_empty_cluster_filter_streams_every_cluster() {
        let registry = Arc::new(
            ClusterRegistry::from_handles(vec![
                (ClusterId::new("https://a"), healthy("n1")),
                (ClusterId::new("https://b"), healthy("n2")),
            ])
            .unwrap(),
        );
        let hub = Arc::new(BroadcastHub::default());
        let cancel = CancellationToken::new();
        let (sink, mut rx) = client_sink();

        let session = tokio::spawn(
            ConnectionHandler::new(registry, hub, cancel.clone())
                .with_cluster_filter(Vec::new())
                .run(sink),
        );

        let mut ids = vec![
            rx.next().await.unwrap().cluster_id().to_string(),
            rx.next().await.unwrap().cluster_id().to_string(),
        ];
        ids.sort();
        assert_eq!(ids, vec!["https://a", "https://b"]);

        cancel.cancel();
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_delivery_failure_is_fatal() {
        let registry = Arc::new(
            ClusterRegistry::from_handles(vec![(ClusterId::new("https://ok"), healthy("n1"))])
                .unwrap(),
        );
        let hub = Arc::new(BroadcastHub::default());
        let (sink, rx) = client_sink();
        drop(rx);

        let result = ConnectionHandler::new(registry, hub.clone(), CancellationToken::new())
            .run(sink)
            .await;

        assert!(matches!(result, Err(ViewError::WebSocket(_))));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_eviction_ends_session() {
        let registry = Arc::new(
            ClusterRegistry::from_handles(vec![(ClusterId::new("https://ok"), healthy("n1"))])
                .unwrap(),
        );
        let hub = Arc::new(BroadcastHub::new(1, SlowConsumerPolicy::Disconnect));
        let (sink, mut rx) = client_sink();

        let session = tokio::spawn(
            ConnectionHandler::new(registry, hub.clone(), CancellationToken::new()).run(sink),
        );
        assert_eq!(rx.next().await.unwrap().message_type(), "clusterupdate");

        // Fill the one-slot buffer faster than the session drains it.
        let message = Arc::new(ClientMessage::ClusterDelta(DeltaRecord::upsert(
            ClusterId::new("https://ok"),
            pod("default", "web", Some("n1")),
        )));
        while hub.subscriber_count() > 0 {
            hub.publish(message.clone());
        }

        let end = tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .expect("evicted session kept running");
        assert_eq!(end.unwrap().unwrap(), SessionEnd::Evicted);
    }
}
