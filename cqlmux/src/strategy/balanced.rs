use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tracing::{debug, trace};

use super::pool::{NodePools, PoolConfig};
use super::{ConnectionFactory, ConnectionScope, ConnectionStrategy};
use crate::cluster::node::Node;
use crate::cluster::ClusterState;
use crate::errors::TransportError;
use crate::network::Connection;
use crate::routing::PartitionKey;

/// Spreads commands over per-node pools, least loaded connection first.
///
/// A new connection is opened once the best one has reached the configured
/// load threshold, on the node with the fewest connections.
pub struct BalancedStrategy {
    state: Arc<ArcSwap<ClusterState>>,
    pools: NodePools,
    // Breaks ties between equally small pools.
    round_robin: AtomicUsize,
}

impl Debug for BalancedStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BalancedStrategy")
            .field("pools", &self.pools)
            .finish_non_exhaustive()
    }
}

impl BalancedStrategy {
    pub(crate) fn new(
        state: Arc<ArcSwap<ClusterState>>,
        factory: ConnectionFactory,
        config: PoolConfig,
    ) -> Self {
        BalancedStrategy {
            state,
            pools: NodePools::new(factory, config),
            round_robin: AtomicUsize::new(0),
        }
    }

    pub(crate) fn state(&self) -> &Arc<ArcSwap<ClusterState>> {
        &self.state
    }

    pub(crate) fn pools(&self) -> &NodePools {
        &self.pools
    }

    // Usable nodes that can take another connection, fewest connections
    // first, rotated among equals.
    fn growth_candidates<'a>(&self, usable: &[&'a Arc<Node>]) -> Vec<&'a Arc<Node>> {
        let mut candidates: Vec<(usize, &Arc<Node>)> = usable
            .iter()
            .map(|node| (self.pools.connection_count(node), *node))
            .filter(|(count, _)| *count < self.pools.config().max_connections_per_node)
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }
        candidates.sort_by_key(|(count, _)| *count);
        let fewest = candidates[0].0;
        let ties = candidates.iter().take_while(|(c, _)| *c == fewest).count();
        let shift = self.round_robin.fetch_add(1, Ordering::Relaxed) % ties;
        candidates[..ties].rotate_left(shift);
        candidates.into_iter().map(|(_, node)| node).collect()
    }

    pub(crate) async fn pick(&self) -> Result<Option<Arc<Connection>>, TransportError> {
        let state = self.state.load_full();
        self.pools.retain_nodes(&state);
        let usable: Vec<&Arc<Node>> = state.usable_nodes().collect();

        let best = self.pools.least_loaded(usable.iter().copied());
        if let Some(best) = &best {
            if !self.pools.is_busy(best) {
                return Ok(Some(best.clone()));
            }
            trace!(
                node = %best.address(),
                load = best.load(),
                "Least loaded connection is busy, trying to grow a pool"
            );
        }

        let mut last_error = None;
        for node in self.growth_candidates(&usable) {
            match self.pools.open(node).await {
                Ok(Some(connection)) => return Ok(Some(connection)),
                Ok(None) => continue,
                Err(err) => {
                    debug!(node = %node.address, error = %err, "Could not open pooled connection");
                    if best.is_some() {
                        break;
                    }
                    last_error = Some(err);
                }
            }
        }

        match (best, last_error) {
            (Some(best), _) => Ok(Some(best)),
            (None, Some(err)) => Err(err),
            (None, None) => Ok(self.pools.least_loaded(usable.iter().copied())),
        }
    }
}

#[async_trait]
impl ConnectionStrategy for BalancedStrategy {
    async fn get_or_create_connection(
        &self,
        scope: ConnectionScope,
        _partition_key: Option<&PartitionKey>,
    ) -> Result<Option<Arc<Connection>>, TransportError> {
        if scope == ConnectionScope::Connection {
            return Ok(None);
        }
        let connection = self.pick().await?;
        if let Some(connection) = &connection {
            connection.mark_taken();
        }
        Ok(connection)
    }

    fn return_connection(&self, connection: Arc<Connection>, _scope: ConnectionScope) {
        connection.mark_returned();
    }

    fn provides_exclusive_connections(&self) -> bool {
        false
    }

    async fn close(&self) {
        self.pools.close();
    }
}
