//! Sharing of clusters between sessions.

use std::sync::{Arc, OnceLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::client::session_builder::{ClusterConfig, ClusterKey};
use crate::cluster::Cluster;
use crate::errors::OpenError;

/// Clusters keyed by their normalized configuration.
///
/// Sessions opened through one registry with configurations of equal
/// [`ClusterKey`] share a [`Cluster`], and with it the connections, the
/// prepared statement cache and the throttle. Clusters are created on first
/// use and live until [`ClusterRegistry::shutdown`] or
/// [`ClusterRegistry::shutdown_all`].
#[derive(Debug, Default)]
pub struct ClusterRegistry {
    clusters: DashMap<ClusterKey, Arc<Cluster>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, used by [`Session::connect`](crate::client::session::Session::connect).
    pub fn global() -> &'static ClusterRegistry {
        static GLOBAL: OnceLock<ClusterRegistry> = OnceLock::new();
        GLOBAL.get_or_init(ClusterRegistry::new)
    }

    /// Returns the cluster for `config`, creating it if there is none or if
    /// the registered one was shut down. The cluster is not opened here.
    pub fn get_or_create(&self, config: ClusterConfig) -> Result<Arc<Cluster>, OpenError> {
        match self.clusters.entry(config.key()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_closed() {
                    return Ok(entry.get().clone());
                }
                debug!("Registered cluster was shut down, replacing it");
                let cluster = Arc::new(Cluster::new(config)?);
                entry.insert(cluster.clone());
                Ok(cluster)
            }
            Entry::Vacant(entry) => {
                debug!(nodes = ?config.known_nodes(), "Registering new cluster");
                let cluster = Arc::new(Cluster::new(config)?);
                entry.insert(cluster.clone());
                Ok(cluster)
            }
        }
    }

    pub fn get(&self, key: &ClusterKey) -> Option<Arc<Cluster>> {
        self.clusters.get(key).map(|entry| entry.value().clone())
    }

    /// Removes the cluster of `key` and shuts it down. Returns whether there
    /// was one.
    pub async fn shutdown(&self, key: &ClusterKey) -> bool {
        // The map guard is dropped before awaiting.
        let removed = self.clusters.remove(key);
        match removed {
            Some((_, cluster)) => {
                cluster.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Shuts down every registered cluster.
    pub async fn shutdown_all(&self) {
        let keys: Vec<ClusterKey> = self
            .clusters
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            self.shutdown(&key).await;
        }
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::client::session_builder::{ClusterBuilder, StrategyKind};

    #[tokio::test]
    async fn equal_configurations_share_a_cluster() {
        let registry = ClusterRegistry::new();
        let a = registry
            .get_or_create(
                ClusterBuilder::new()
                    .known_nodes(["10.0.0.1:9042", "10.0.0.2:9042"])
                    .build(),
            )
            .unwrap();
        let b = registry
            .get_or_create(
                ClusterBuilder::new()
                    .known_nodes(["10.0.0.2:9042", "10.0.0.1:9042"])
                    .build(),
            )
            .unwrap();
        let c = registry
            .get_or_create(
                ClusterBuilder::new()
                    .known_node("10.0.0.1:9042")
                    .strategy(StrategyKind::Exclusive)
                    .build(),
            )
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
        assert!(!a.is_open());
    }

    #[tokio::test]
    async fn shutdown_removes_the_cluster() {
        let registry = ClusterRegistry::new();
        let config = ClusterBuilder::new().known_node("10.0.0.1:9042").build();
        let key = config.key();
        let cluster = registry.get_or_create(config.clone()).unwrap();

        assert!(registry.shutdown(&key).await);
        assert!(cluster.is_closed());
        assert!(registry.is_empty());
        assert!(!registry.shutdown(&key).await);

        let recreated = registry.get_or_create(config).unwrap();
        assert!(!Arc::ptr_eq(&cluster, &recreated));
        assert!(!recreated.is_closed());

        registry.shutdown_all().await;
        assert!(recreated.is_closed());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn closed_cluster_is_replaced() {
        let registry = ClusterRegistry::new();
        let config = ClusterBuilder::new().known_node("10.0.0.1:9042").build();
        let cluster = registry.get_or_create(config.clone()).unwrap();
        cluster.shutdown().await;

        let replacement = registry.get_or_create(config).unwrap();
        assert!(!Arc::ptr_eq(&cluster, &replacement));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn invalid_keyspace_is_rejected_up_front() {
        let registry = ClusterRegistry::new();
        let config = ClusterBuilder::new()
            .known_node("10.0.0.1:9042")
            .use_keyspace("no spaces allowed")
            .build();
        assert_matches!(
            registry.get_or_create(config),
            Err(OpenError::BadKeyspaceName(_))
        );
        assert!(registry.is_empty());
    }
}
