//! Connection strategies decide which [`Connection`] serves a request.
//!
//! Three strategies are provided, selected with
//! [`StrategyKind`](crate::client::session_builder::StrategyKind):
//! * [`BalancedStrategy`] keeps a small pool per node and hands out the
//!   least loaded connection of the whole cluster,
//! * [`PartitionAwareStrategy`] prefers a connection to the node owning the
//!   request's partition,
//! * [`ExclusiveStrategy`] never shares a connection between two holders,
//!   so per-socket session state (the current keyspace) stays private.
//!
//! Every call names its [`ConnectionScope`]. A connection taken at
//! `Command` scope is returned after one logical operation; one taken at
//! `Connection` scope is held by a session until it is closed.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use crate::cluster::node::Node;
use crate::errors::TransportError;
use crate::network::{open_connection, Connection, ConnectionConfig, ErrorReceiver};
use crate::routing::PartitionKey;

mod balanced;
mod exclusive;
mod partition_aware;
mod pool;

pub use balanced::BalancedStrategy;
pub use exclusive::ExclusiveStrategy;
pub use partition_aware::PartitionAwareStrategy;
pub(crate) use pool::PoolConfig;

/// How long a connection handed out by a strategy is going to be held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionScope {
    /// Held by a session for its whole lifetime.
    Connection,
    /// Held for a single logical operation, retries included.
    Command,
}

/// Source of connections for command execution.
#[async_trait]
pub trait ConnectionStrategy: Send + Sync + Debug {
    /// Returns a connection for the given scope, opening one if needed.
    ///
    /// `Ok(None)` means the strategy does not hand out connections for this
    /// scope (pooled strategies at `Connection` scope) or has none to give.
    async fn get_or_create_connection(
        &self,
        scope: ConnectionScope,
        partition_key: Option<&PartitionKey>,
    ) -> Result<Option<Arc<Connection>>, TransportError>;

    /// Gives back a connection obtained from
    /// [`get_or_create_connection`](ConnectionStrategy::get_or_create_connection)
    /// with the same scope.
    fn return_connection(&self, connection: Arc<Connection>, scope: ConnectionScope);

    /// Whether every handed out connection is private to its holder. When
    /// true, a transport failure is never retried on another connection.
    fn provides_exclusive_connections(&self) -> bool;

    /// Drops every connection the strategy owns. Connections still held by
    /// callers close when they are dropped.
    async fn close(&self);
}

/// Opens connections with the cluster's connection settings and watches
/// them for failures.
#[derive(Clone)]
pub(crate) struct ConnectionFactory {
    config: ConnectionConfig,
}

impl Debug for ConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("version", &self.config.version)
            .field("compression", &self.config.compression)
            .field("keyspace", &self.config.keyspace)
            .finish_non_exhaustive()
    }
}

impl ConnectionFactory {
    pub(crate) fn new(config: ConnectionConfig) -> Self {
        ConnectionFactory { config }
    }

    pub(crate) async fn open(&self, node: &Arc<Node>) -> Result<Arc<Connection>, TransportError> {
        let (connection, error_receiver) = open_connection(node, &self.config).await?;
        watch_connection(node.clone(), error_receiver);
        Ok(Arc::new(connection))
    }
}

// A broken connection means the node is unreachable until proven otherwise.
fn watch_connection(node: Arc<Node>, error_receiver: ErrorReceiver) {
    tokio::spawn(async move {
        // Err means the connection was closed on purpose.
        if let Ok(error) = error_receiver.await {
            warn!(node = %node.address, error = %error, "Connection broken, marking node down");
            node.mark_down();
        }
    });
}

/// Picks the connection with the lowest load, random among equals.
pub(crate) fn least_loaded(connections: &[Arc<Connection>]) -> Option<Arc<Connection>> {
    let min_load = connections.iter().map(|c| (c.load(), c.in_use())).min()?;
    let candidates: Vec<&Arc<Connection>> = connections
        .iter()
        .filter(|c| (c.load(), c.in_use()) == min_load)
        .collect();
    let idx = rand::rng().random_range(0..candidates.len());
    Some(candidates[idx].clone())
}
