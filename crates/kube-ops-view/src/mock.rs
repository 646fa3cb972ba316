//! Deterministic generated clusters for demos and local development.
//!
//! Every cluster has ten nodes with a hash-derived number of pods and one
//! unassigned pod. Its watch stream flaps every 17th pod on each node:
//! deleted on one tick, re-added on the next.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{stream, FutureExt, StreamExt};
use k8s_openapi::api::core::v1::{
    Container, Node, NodeStatus, Pod, PodSpec, PodStatus, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio_stream::wrappers::IntervalStream;

use crate::error::SourceError;
use crate::source::{ClusterSource, PodListing, PodSelector, WatchItem, WatchStream};
use crate::types::assigned_node;

const NODE_COUNT: u64 = 10;
const MAX_PODS_PER_NODE: u64 = 32;
const FLAP_EVERY: u64 = 17;

const POD_NAMES: [&str; 8] = [
    "agent-cooper",
    "black-lodge",
    "bob",
    "bobby-briggs",
    "laura-palmer",
    "leland-palmer",
    "log-lady",
    "sheriff-truman",
];

const PHASES: [&str; 3] = ["Pending", "Running", "Running"];

/// Integer mixing used to derive stable pseudo-random values.
#[must_use]
pub fn hash_int(x: u64) -> u64 {
    let x = ((x >> 16) ^ x).wrapping_mul(0x045d_9f3b) & 0xffff_ffff;
    let x = ((x >> 16) ^ x).wrapping_mul(0x045d_9f3b) & 0xffff_ffff;
    (x >> 16) ^ x
}

/// Generated cluster number `index`.
#[derive(Debug, Clone)]
pub struct MockSource {
    index: u64,
    tick: Duration,
}

impl MockSource {
    /// Create mock cluster `index` whose watch ticks every `tick`.
    #[must_use]
    pub fn new(index: u64, tick: Duration) -> Self {
        Self { index, tick }
    }

    /// Cluster ID of mock cluster `index`.
    #[must_use]
    pub fn cluster_id(index: u64) -> String {
        format!("mock-cluster-{index}")
    }

    fn node(&self, i: u64) -> Node {
        let mut labels = BTreeMap::new();
        if i < 2 {
            let (key, value) = match self.index {
                0 => ("kubernetes.io/role", "master"),
                1 => ("node-role.kubernetes.io/master", ""),
                _ => ("master", "true"),
            };
            labels.insert(key.to_string(), value.to_string());
        }
        let quantities = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), Quantity((*v).to_string())))
                .collect::<BTreeMap<_, _>>()
        };
        Node {
            metadata: ObjectMeta {
                name: Some(format!("node-{i}")),
                labels: Some(labels),
                ..Default::default()
            },
            status: Some(NodeStatus {
                capacity: Some(quantities(&[("cpu", "4"), ("memory", "32Gi"), ("pods", "110")])),
                allocatable: Some(quantities(&[("cpu", "3800m"), ("memory", "31Gi")])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod(&self, i: u64, j: u64, node: Option<&str>) -> Pod {
        let seed = (self.index + 1) * (i + 1) * (j + 1);

        let mut labels = BTreeMap::new();
        for (li, (key, values)) in [("env", ["prod", "dev"]), ("owner", ["x-wing", "iris"])]
            .iter()
            .enumerate()
        {
            let choice = hash_int(seed * (li as u64 + 1)) % (values.len() as u64 + 1);
            if choice != 0 {
                labels.insert((*key).to_string(), values[choice as usize - 1].to_string());
            }
        }

        let phase = PHASES[(hash_int(seed) % PHASES.len() as u64) as usize];
        let name = POD_NAMES[(hash_int((i + 1) * (j + 1)) % POD_NAMES.len() as u64) as usize];
        let containers = (0..=j % 2)
            .map(|k| Container {
                name: format!("myapp-{k}"),
                image: Some(format!("foo/bar/{j}")),
                resources: Some(ResourceRequirements {
                    requests: Some(BTreeMap::from([
                        ("cpu".to_string(), Quantity("100m".to_string())),
                        ("memory".to_string(), Quantity("100Mi".to_string())),
                    ])),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect();

        Pod {
            metadata: ObjectMeta {
                name: Some(format!("{name}-{i}-{j}")),
                namespace: Some(if j < 3 { "kube-system" } else { "default" }.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: node.map(str::to_string),
                containers,
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    fn pods_on(&self, i: u64) -> Vec<Pod> {
        let node = format!("node-{i}");
        (0..hash_int((self.index + 1) * (i + 1)) % MAX_PODS_PER_NODE)
            .map(|j| self.pod(i, j, Some(node.as_str())))
            .collect()
    }

    fn unassigned(&self) -> Pod {
        self.pod(11, self.index, None)
    }

    fn all_pods(&self) -> Vec<Pod> {
        let mut pods: Vec<Pod> = (0..NODE_COUNT).flat_map(|i| self.pods_on(i)).collect();
        pods.push(self.unassigned());
        pods
    }

    /// Pods that flap in the watch stream.
    fn flapping(&self) -> Vec<Pod> {
        (0..NODE_COUNT)
            .flat_map(|i| {
                self.pods_on(i)
                    .into_iter()
                    .enumerate()
                    .filter(|(j, _)| *j as u64 % FLAP_EVERY == 0)
                    .map(|(_, pod)| pod)
            })
            .collect()
    }
}

impl ClusterSource for MockSource {
    fn list_nodes(&self) -> BoxFuture<'_, Result<Vec<Node>, SourceError>> {
        let nodes = (0..NODE_COUNT).map(|i| self.node(i)).collect();
        async move { Ok(nodes) }.boxed()
    }

    fn list_pods(&self, selector: PodSelector) -> BoxFuture<'_, Result<PodListing, SourceError>> {
        let pods = match &selector {
            PodSelector::All => self.all_pods(),
            PodSelector::Unassigned => vec![self.unassigned()],
            PodSelector::OnNode(node) => self
                .all_pods()
                .into_iter()
                .filter(|pod| assigned_node(pod) == Some(node.as_str()))
                .collect(),
        };
        async move {
            Ok(PodListing {
                pods,
                resource_version: Some("1".to_string()),
            })
        }
        .boxed()
    }

    fn watch_pods(
        &self,
        _resource_version: String,
    ) -> BoxFuture<'_, Result<WatchStream, SourceError>> {
        let flapping = self.flapping();
        let tick = self.tick;

        async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first interval tick completes immediately.
            let stream = IntervalStream::new(interval)
                .skip(1)
                .enumerate()
                .flat_map(move |(tick, _)| {
                    let items: Vec<Result<WatchItem, SourceError>> = flapping
                        .iter()
                        .cloned()
                        .map(|pod| {
                            Ok(if tick % 2 == 0 {
                                WatchItem::Deleted(pod)
                            } else {
                                WatchItem::Added(pod)
                            })
                        })
                        .collect();
                    stream::iter(items)
                })
                .boxed();
            Ok(stream)
        }
        .boxed()
    }
}
