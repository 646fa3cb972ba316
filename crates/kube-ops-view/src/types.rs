//! Cluster placement data model and the client wire protocol.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use serde::ser::{SerializeSeq, SerializeStruct};
use serde::{Serialize, Serializer};

/// Identifies a cluster by its API endpoint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ClusterId(String);

impl ClusterId {
    /// Create a cluster ID from an endpoint string.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self(endpoint.into())
    }

    /// Borrow the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClusterId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// `namespace/name` key of a pod, unique within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct PodKey(String);

impl PodKey {
    /// Build a key from namespace and name.
    #[must_use]
    pub fn new(namespace: &str, name: &str) -> Self {
        Self(format!("{namespace}/{name}"))
    }

    /// Build the key for a pod object.
    #[must_use]
    pub fn of(pod: &Pod) -> Self {
        Self::new(&pod.namespace().unwrap_or_default(), &pod.name_any())
    }

    /// Borrow the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of the node a pod is scheduled to, if any.
#[must_use]
pub fn assigned_node(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.node_name.as_deref())
        .filter(|name| !name.is_empty())
}

/// A node together with the pods currently scheduled to it.
#[derive(Debug, Clone, Serialize)]
pub struct NodeEntry {
    /// Node object; its fields are inlined on the wire.
    #[serde(flatten)]
    pub node: Node,
    /// Pods on this node keyed by `namespace/name`.
    pub pods: BTreeMap<PodKey, Pod>,
}

impl NodeEntry {
    /// Create an entry with no pods.
    #[must_use]
    pub fn new(node: Node) -> Self {
        Self {
            node,
            pods: BTreeMap::new(),
        }
    }
}

/// Full placement state of one cluster at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSnapshot {
    /// Cluster this snapshot describes.
    pub id: ClusterId,
    /// Nodes keyed by node name.
    pub nodes: BTreeMap<String, NodeEntry>,
    /// Pods without a node assignment.
    pub unassigned_pods: Vec<Pod>,
}

impl ClusterSnapshot {
    /// Total number of pods in the snapshot, assigned or not.
    #[must_use]
    pub fn pod_count(&self) -> usize {
        self.nodes.values().map(|entry| entry.pods.len()).sum::<usize>()
            + self.unassigned_pods.len()
    }
}

/// Location of exactly one pod inside a snapshot-shaped structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaPath {
    /// `["unassigned_pods", key]`
    Unassigned(PodKey),
    /// `["nodes", node, "pods", key]`
    Node {
        /// Node name.
        node: String,
        /// Pod key.
        pod: PodKey,
    },
}

impl DeltaPath {
    /// Address a pod by where it is currently placed.
    #[must_use]
    pub fn for_pod(pod: &Pod) -> Self {
        let key = PodKey::of(pod);
        match assigned_node(pod) {
            Some(node) => Self::Node {
                node: node.to_string(),
                pod: key,
            },
            None => Self::Unassigned(key),
        }
    }

    /// The path as string segments.
    #[must_use]
    pub fn segments(&self) -> Vec<&str> {
        match self {
            Self::Unassigned(pod) => vec!["unassigned_pods", pod.as_str()],
            Self::Node { node, pod } => vec!["nodes", node.as_str(), "pods", pod.as_str()],
        }
    }
}

impl Serialize for DeltaPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let segments = self.segments();
        let mut seq = serializer.serialize_seq(Some(segments.len()))?;
        for segment in segments {
            seq.serialize_element(segment)?;
        }
        seq.end()
    }
}

/// An incremental change to one pod slot of a cluster snapshot.
///
/// A present payload inserts or replaces the pod at `path`; an absent payload
/// removes it.
#[derive(Debug, Clone)]
pub struct DeltaRecord {
    /// Cluster the change belongs to.
    pub cluster_id: ClusterId,
    /// Addressed slot.
    pub path: DeltaPath,
    /// Current pod state, `None` for removal.
    pub payload: Option<Pod>,
}

impl DeltaRecord {
    /// Insert-or-replace record for a pod.
    #[must_use]
    pub fn upsert(cluster_id: ClusterId, pod: Pod) -> Self {
        Self {
            cluster_id,
            path: DeltaPath::for_pod(&pod),
            payload: Some(pod),
        }
    }

    /// Removal record for a pod.
    #[must_use]
    pub fn remove(cluster_id: ClusterId, pod: &Pod) -> Self {
        Self {
            cluster_id,
            path: DeltaPath::for_pod(pod),
            payload: None,
        }
    }

    /// Whether this record removes its slot.
    #[must_use]
    pub fn is_removal(&self) -> bool {
        self.payload.is_none()
    }
}

/// `[path, payload?]`
struct DeltaEntry<'a>(&'a DeltaRecord);

impl Serialize for DeltaEntry<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.0.payload.is_some() { 2 } else { 1 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.0.path)?;
        if let Some(pod) = &self.0.payload {
            seq.serialize_element(pod)?;
        }
        seq.end()
    }
}

impl Serialize for DeltaRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("DeltaRecord", 2)?;
        state.serialize_field("cluster_id", &self.cluster_id)?;
        state.serialize_field("delta", &[DeltaEntry(self)])?;
        state.end()
    }
}

/// Envelope for everything sent to a dashboard client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Full snapshot of one cluster.
    ClusterUpdate(ClusterSnapshot),
    /// Single-pod change within one cluster.
    ClusterDelta(DeltaRecord),
}

impl ClientMessage {
    /// Cluster the message refers to.
    #[must_use]
    pub fn cluster_id(&self) -> &ClusterId {
        match self {
            Self::ClusterUpdate(snapshot) => &snapshot.id,
            Self::ClusterDelta(delta) => &delta.cluster_id,
        }
    }

    /// Wire name of the message type.
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::ClusterUpdate(_) => "clusterupdate",
            Self::ClusterDelta(_) => "clusterdelta",
        }
    }
}
