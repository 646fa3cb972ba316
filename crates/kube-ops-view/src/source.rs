//! Access to a cluster's node and pod objects.
//!
//! [`ClusterSource`] is the seam between the event pipeline and the API
//! server. [`KubeSource`] talks to a real cluster through `kube`; the mock
//! clusters in [`crate::mock`] implement the same trait.

use std::fmt;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::Client;

use crate::error::SourceError;

/// Server-side watch timeout; the ingestor reopens the stream afterwards.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Which pods a listing should return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodSelector {
    /// Every pod in every namespace.
    All,
    /// Pods scheduled to the named node.
    OnNode(String),
    /// Pods without a node assignment.
    Unassigned,
}

impl PodSelector {
    /// Field selector expressing this selection, if any.
    #[must_use]
    pub fn field_selector(&self) -> Option<String> {
        match self {
            Self::All => None,
            Self::OnNode(node) => Some(format!("spec.nodeName={node}")),
            Self::Unassigned => Some("spec.nodeName=".to_string()),
        }
    }
}

/// Result of a pod listing.
#[derive(Debug, Clone, Default)]
pub struct PodListing {
    /// Listed pods.
    pub pods: Vec<Pod>,
    /// Collection resource version at listing time.
    pub resource_version: Option<String>,
}

/// One raw event from a pod watch.
#[derive(Debug, Clone)]
pub enum WatchItem {
    /// Pod created.
    Added(Pod),
    /// Pod changed.
    Modified(Pod),
    /// Pod removed.
    Deleted(Pod),
    /// Progress marker carrying no object.
    Bookmark {
        /// Resource version reached by the watch.
        resource_version: String,
    },
    /// Error reported in-band by the API server.
    Error {
        /// HTTP-style status code.
        code: u16,
        /// Server message.
        message: String,
    },
}

impl WatchItem {
    /// Resource version this event advances the watch to.
    #[must_use]
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            Self::Added(pod) | Self::Modified(pod) | Self::Deleted(pod) => {
                pod.metadata.resource_version.as_deref()
            }
            Self::Bookmark { resource_version } => Some(resource_version),
            Self::Error { .. } => None,
        }
    }
}

impl From<WatchEvent<Pod>> for WatchItem {
    fn from(event: WatchEvent<Pod>) -> Self {
        match event {
            WatchEvent::Added(pod) => Self::Added(pod),
            WatchEvent::Modified(pod) => Self::Modified(pod),
            WatchEvent::Deleted(pod) => Self::Deleted(pod),
            WatchEvent::Bookmark(bookmark) => Self::Bookmark {
                resource_version: bookmark.metadata.resource_version,
            },
            WatchEvent::Error(response) => Self::Error {
                code: response.code,
                message: response.message,
            },
        }
    }
}

/// Stream of pod watch events.
pub type WatchStream = BoxStream<'static, Result<WatchItem, SourceError>>;

/// Lists and watches the workload objects of one cluster.
pub trait ClusterSource: Send + Sync + fmt::Debug {
    /// List every node.
    fn list_nodes(&self) -> BoxFuture<'_, Result<Vec<Node>, SourceError>>;

    /// List pods matching `selector`.
    fn list_pods(&self, selector: PodSelector) -> BoxFuture<'_, Result<PodListing, SourceError>>;

    /// Open a pod watch starting after `resource_version`.
    fn watch_pods(&self, resource_version: String)
        -> BoxFuture<'_, Result<WatchStream, SourceError>>;
}

/// [`ClusterSource`] backed by a live API server.
#[derive(Clone)]
pub struct KubeSource {
    client: Client,
}

impl KubeSource {
    /// Wrap a connected client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl fmt::Debug for KubeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeSource")
            .field("default_namespace", &self.client.default_namespace())
            .finish_non_exhaustive()
    }
}

impl ClusterSource for KubeSource {
    fn list_nodes(&self) -> BoxFuture<'_, Result<Vec<Node>, SourceError>> {
        async move {
            let api: Api<Node> = Api::all(self.client.clone());
            let list = api.list(&ListParams::default()).await?;
            Ok(list.items)
        }
        .boxed()
    }

    fn list_pods(&self, selector: PodSelector) -> BoxFuture<'_, Result<PodListing, SourceError>> {
        async move {
            let api: Api<Pod> = Api::all(self.client.clone());
            let mut params = ListParams::default();
            if let Some(fields) = selector.field_selector() {
                params = params.fields(&fields);
            }
            let list = api.list(&params).await?;
            Ok(PodListing {
                pods: list.items,
                resource_version: list.metadata.resource_version,
            })
        }
        .boxed()
    }

    fn watch_pods(
        &self,
        resource_version: String,
    ) -> BoxFuture<'_, Result<WatchStream, SourceError>> {
        async move {
            let api: Api<Pod> = Api::all(self.client.clone());
            let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
            let stream = api.watch(&params, &resource_version).await?;
            Ok(stream
                .map(|event| event.map(WatchItem::from).map_err(SourceError::from))
                .boxed())
        }
        .boxed()
    }
}
