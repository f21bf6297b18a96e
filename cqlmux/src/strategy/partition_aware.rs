use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::balanced::BalancedStrategy;
use super::{ConnectionScope, ConnectionStrategy};
use crate::cluster::node::Node;
use crate::errors::TransportError;
use crate::network::Connection;
use crate::routing::PartitionKey;

/// Sends each command to the node owning its partition.
///
/// The partition key is hashed with Murmur3 and looked up on the token ring.
/// Commands without a key, keys that can't be hashed, an empty ring or an
/// unusable owner all fall back to [`BalancedStrategy`] behaviour.
pub struct PartitionAwareStrategy {
    balanced: BalancedStrategy,
}

impl Debug for PartitionAwareStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionAwareStrategy")
            .field("balanced", &self.balanced)
            .finish()
    }
}

impl PartitionAwareStrategy {
    pub(crate) fn new(balanced: BalancedStrategy) -> Self {
        PartitionAwareStrategy { balanced }
    }

    fn owner(&self, partition_key: &PartitionKey) -> Option<Arc<Node>> {
        let token = match partition_key.token() {
            Ok(token) => token,
            Err(err) => {
                debug!(error = %err, "Partition key can't be hashed, routing without it");
                return None;
            }
        };
        let state = self.balanced.state().load();
        let owner = state.owner_of(token)?;
        if !owner.is_usable() {
            debug!(
                node = %owner.address,
                token = token.value(),
                "Partition owner is not usable, routing without it"
            );
            return None;
        }
        Some(owner.clone())
    }

    async fn connection_to(&self, node: &Arc<Node>) -> Option<Arc<Connection>> {
        let pools = self.balanced.pools();
        let best = pools.least_loaded([node]);
        if let Some(best) = &best {
            if !pools.is_busy(best) {
                return Some(best.clone());
            }
        }
        match pools.open(node).await {
            Ok(Some(connection)) => Some(connection),
            Ok(None) => best,
            Err(err) => {
                debug!(node = %node.address, error = %err, "Could not open connection to partition owner");
                best
            }
        }
    }
}

#[async_trait]
impl ConnectionStrategy for PartitionAwareStrategy {
    async fn get_or_create_connection(
        &self,
        scope: ConnectionScope,
        partition_key: Option<&PartitionKey>,
    ) -> Result<Option<Arc<Connection>>, TransportError> {
        if scope == ConnectionScope::Connection {
            return Ok(None);
        }

        if let Some(owner) = partition_key.and_then(|key| self.owner(key)) {
            if let Some(connection) = self.connection_to(&owner).await {
                trace!(node = %owner.address, "Routing to partition owner");
                connection.mark_taken();
                return Ok(Some(connection));
            }
        }

        self.balanced
            .get_or_create_connection(scope, partition_key)
            .await
    }

    fn return_connection(&self, connection: Arc<Connection>, scope: ConnectionScope) {
        self.balanced.return_connection(connection, scope);
    }

    fn provides_exclusive_connections(&self) -> bool {
        false
    }

    async fn close(&self) {
        self.balanced.close().await;
    }
}
