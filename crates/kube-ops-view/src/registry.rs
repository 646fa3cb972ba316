//! The fixed set of clusters this process serves.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tracing::{info, warn};

use crate::error::{ViewError, ViewResult};
use crate::mock::MockSource;
use crate::source::{ClusterSource, KubeSource};
use crate::types::ClusterId;

/// Shared handle to a cluster's objects.
pub type ClusterHandle = Arc<dyn ClusterSource>;

/// Reachable clusters keyed by API endpoint. Built once at startup.
#[derive(Debug, Clone, Default)]
pub struct ClusterRegistry {
    clusters: BTreeMap<ClusterId, ClusterHandle>,
}

impl ClusterRegistry {
    /// Build a registry from already-constructed handles.
    ///
    /// # Errors
    ///
    /// Returns [`ViewError::NoClusters`] if `handles` is empty.
    pub fn from_handles(
        handles: impl IntoIterator<Item = (ClusterId, ClusterHandle)>,
    ) -> ViewResult<Self> {
        let mut clusters = BTreeMap::new();
        for (id, handle) in handles {
            if clusters.contains_key(&id) {
                warn!(cluster = %id, "duplicate cluster endpoint, keeping first");
                continue;
            }
            clusters.insert(id, handle);
        }
        if clusters.is_empty() {
            return Err(ViewError::NoClusters);
        }
        Ok(Self { clusters })
    }

    /// Connect a client for every config; configs that fail are logged and
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ViewError::NoClusters`] if no config produced a client.
    pub fn connect(configs: Vec<kube::Config>) -> ViewResult<Self> {
        let mut handles: Vec<(ClusterId, ClusterHandle)> = Vec::with_capacity(configs.len());
        for config in configs {
            let endpoint = config.cluster_url.to_string();
            match Client::try_from(config) {
                Ok(client) => {
                    info!(cluster = %endpoint, "created client");
                    handles.push((ClusterId::new(endpoint), Arc::new(KubeSource::new(client))));
                }
                Err(e) => {
                    warn!(cluster = %endpoint, error = %e, "unable to create client");
                }
            }
        }
        Self::from_handles(handles)
    }

    /// Generated mock clusters `mock-cluster-0 .. count-1`.
    ///
    /// # Errors
    ///
    /// Returns [`ViewError::NoClusters`] if `count` is zero.
    pub fn mock(count: u64, tick: Duration) -> ViewResult<Self> {
        Self::from_handles((0..count).map(|index| {
            let handle: ClusterHandle = Arc::new(MockSource::new(index, tick));
            (ClusterId::new(MockSource::cluster_id(index)), handle)
        }))
    }

    /// All clusters.
    #[must_use]
    pub fn clusters(&self) -> &BTreeMap<ClusterId, ClusterHandle> {
        &self.clusters
    }

    /// Look up one cluster.
    #[must_use]
    pub fn get(&self, id: &ClusterId) -> Option<&ClusterHandle> {
        self.clusters.get(id)
    }

    /// Iterate over cluster IDs.
    pub fn ids(&self) -> impl Iterator<Item = &ClusterId> {
        self.clusters.keys()
    }

    /// Number of clusters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    /// Whether the registry is empty. Never true for a constructed registry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::fake::FakeSource;

    fn fake() -> ClusterHandle {
        Arc::new(FakeSource::default())
    }

    #[test]
    fn test_empty_registry_is_an_error() {
        let result = ClusterRegistry::from_handles(Vec::new());

        assert!(matches!(result, Err(ViewError::NoClusters)));
    }

    #[test]
    fn test_duplicate_endpoints_keep_first() {
        let first = fake();
        let registry = ClusterRegistry::from_handles(vec![
            (ClusterId::new("https://a"), first.clone()),
            (ClusterId::new("https://a"), fake()),
            (ClusterId::new("https://b"), fake()),
        ])
        .unwrap();

        assert_eq!(registry.len(), 2);
        let kept = registry.get(&ClusterId::new("https://a")).unwrap();
        assert!(Arc::ptr_eq(kept, &first));
    }

    #[test]
    fn test_mock_registry() {
        let registry = ClusterRegistry::mock(3, Duration::from_secs(1)).unwrap();

        let ids: Vec<_> = registry.ids().map(ClusterId::as_str).collect();
        assert_eq!(ids, vec!["mock-cluster-0", "mock-cluster-1", "mock-cluster-2"]);
        assert!(ClusterRegistry::mock(0, Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_connect_keeps_valid_configs() {
        let config = kube::Config::new("http://localhost:8001".parse().unwrap());

        let registry = ClusterRegistry::connect(vec![config]).unwrap();

        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_connect_nothing_is_fatal() {
        assert!(matches!(
            ClusterRegistry::connect(Vec::new()),
            Err(ViewError::NoClusters)
        ));
    }
}
