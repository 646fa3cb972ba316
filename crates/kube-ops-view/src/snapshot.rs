//! Point-in-time placement snapshots.

use std::collections::BTreeMap;

use futures::future::join_all;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::source::{ClusterSource, PodSelector};
use crate::types::{ClusterId, ClusterSnapshot, NodeEntry, PodKey};

/// Build a full snapshot of one cluster.
///
/// Returns the snapshot and the resource version observed while listing.
/// Failing to list nodes fails the snapshot; failing to list the pods of a
/// single node only leaves that node empty, and failing to list unassigned
/// pods leaves that list empty.
pub async fn build_snapshot(
    id: &ClusterId,
    source: &dyn ClusterSource,
) -> Result<(ClusterSnapshot, Option<String>), SourceError> {
    debug!(cluster = %id, "building cluster snapshot");

    let nodes = source.list_nodes().await?;

    let listings = join_all(nodes.iter().map(|node| {
        let selector = PodSelector::OnNode(node.name_any());
        source.list_pods(selector)
    }))
    .await;

    let mut entries = BTreeMap::new();
    for (node, listing) in nodes.into_iter().zip(listings) {
        let name = node.name_any();
        let mut entry = NodeEntry::new(node);
        match listing {
            Ok(listing) => {
                entry.pods = listing
                    .pods
                    .into_iter()
                    .map(|pod| (PodKey::of(&pod), pod))
                    .collect();
            }
            Err(e) => {
                warn!(cluster = %id, node = %name, error = %e, "error listing pods for node");
            }
        }
        entries.insert(name, entry);
    }

    let (unassigned_pods, resource_version) = match source.list_pods(PodSelector::Unassigned).await
    {
        Ok(listing) => (listing.pods, listing.resource_version),
        Err(e) => {
            warn!(cluster = %id, error = %e, "error listing unassigned pods");
            (Vec::new(), None)
        }
    };

    let snapshot = ClusterSnapshot {
        id: id.clone(),
        nodes: entries,
        unassigned_pods,
    };
    debug!(
        cluster = %id,
        nodes = snapshot.nodes.len(),
        pods = snapshot.pod_count(),
        "cluster snapshot built"
    );

    Ok((snapshot, resource_version))
}
