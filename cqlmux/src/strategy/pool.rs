use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tracing::{debug, trace};

use super::{least_loaded, ConnectionFactory};
use crate::cluster::node::Node;
use crate::cluster::ClusterState;
use crate::errors::TransportError;
use crate::network::Connection;

#[derive(Debug, Clone, Copy)]
pub(crate) struct PoolConfig {
    pub(crate) max_connections_per_node: usize,
    /// Load at which a connection counts as busy and a new one is opened,
    /// if the pool has room.
    pub(crate) new_connection_threshold: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_connections_per_node: 2,
            new_connection_threshold: 10,
        }
    }
}

#[derive(Debug, Default)]
struct NodePool {
    connections: Mutex<Vec<Arc<Connection>>>,
    // Serializes opening so that racing callers can not overshoot the bound.
    open_lock: tokio::sync::Mutex<()>,
}

impl NodePool {
    fn live_connections(&self) -> Vec<Arc<Connection>> {
        let mut connections = self.connections.lock().unwrap();
        connections.retain(|c| c.is_connected());
        connections.clone()
    }

    fn len(&self) -> usize {
        self.live_connections().len()
    }
}

/// Bounded connection pools of all nodes, shared by the pooled strategies.
#[derive(Debug)]
pub(crate) struct NodePools {
    factory: ConnectionFactory,
    config: PoolConfig,
    pools: DashMap<SocketAddr, Arc<NodePool>>,
    closed: AtomicBool,
}

impl NodePools {
    pub(crate) fn new(factory: ConnectionFactory, config: PoolConfig) -> Self {
        NodePools {
            factory,
            config,
            pools: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn pool(&self, node: &Node) -> Arc<NodePool> {
        // Clone out of the map; the shard lock must not be held across .await.
        self.pools.entry(node.address).or_default().clone()
    }

    pub(crate) fn connection_count(&self, node: &Node) -> usize {
        self.pools.get(&node.address).map_or(0, |pool| pool.len())
    }

    pub(crate) fn has_room(&self, node: &Node) -> bool {
        self.connection_count(node) < self.config.max_connections_per_node
    }

    pub(crate) fn is_busy(&self, connection: &Connection) -> bool {
        connection.load() >= self.config.new_connection_threshold
    }

    /// The least loaded live connection to any of `nodes`.
    pub(crate) fn least_loaded<'a>(
        &self,
        nodes: impl IntoIterator<Item = &'a Arc<Node>>,
    ) -> Option<Arc<Connection>> {
        let connections: Vec<Arc<Connection>> = nodes
            .into_iter()
            .filter_map(|node| self.pools.get(&node.address).map(|pool| pool.clone()))
            .flat_map(|pool| pool.live_connections())
            .collect();
        least_loaded(&connections)
    }

    /// Opens one more connection to `node`, unless its pool is full.
    pub(crate) async fn open(
        &self,
        node: &Arc<Node>,
    ) -> Result<Option<Arc<Connection>>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        let pool = self.pool(node);
        let _guard = pool.open_lock.lock().await;
        if pool.len() >= self.config.max_connections_per_node {
            trace!(node = %node.address, "Pool is full, not opening a connection");
            return Ok(None);
        }

        let connection = self.factory.open(node).await?;
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        let mut connections = pool.connections.lock().unwrap();
        connections.push(connection.clone());
        debug!(
            node = %node.address,
            pool_size = connections.len(),
            "Opened pooled connection"
        );
        Ok(Some(connection))
    }

    /// Drops the pools of nodes that left the cluster.
    pub(crate) fn retain_nodes(&self, state: &ClusterState) {
        if self.pools.len() > state.nodes().len() {
            self.pools
                .retain(|address, _| state.get_node(*address).is_some());
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.pools.clear();
    }
}
