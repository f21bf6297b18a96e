use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tracing::{debug, trace};

use super::{ConnectionFactory, ConnectionScope, ConnectionStrategy};
use crate::cluster::node::Node;
use crate::cluster::ClusterState;
use crate::errors::TransportError;
use crate::network::Connection;
use crate::routing::PartitionKey;

/// Hands every caller a connection nobody else uses at the same time.
///
/// Returned connections go to an idle list and are reused by the next
/// caller. Because a connection is never shared, anything a holder changes
/// on it (such as the current keyspace) is private to that holder.
pub struct ExclusiveStrategy {
    state: Arc<ArcSwap<ClusterState>>,
    factory: ConnectionFactory,
    idle: Mutex<Vec<Arc<Connection>>>,
    round_robin: AtomicUsize,
    closed: AtomicBool,
}

impl Debug for ExclusiveStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveStrategy")
            .field("idle", &self.idle_count())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ExclusiveStrategy {
    pub(crate) fn new(state: Arc<ArcSwap<ClusterState>>, factory: ConnectionFactory) -> Self {
        ExclusiveStrategy {
            state,
            factory,
            idle: Mutex::new(Vec::new()),
            round_robin: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.idle.lock().unwrap().len()
    }

    fn take_idle(&self) -> Option<Arc<Connection>> {
        let mut idle = self.idle.lock().unwrap();
        while let Some(connection) = idle.pop() {
            if connection.is_connected() && connection.node().is_usable() {
                return Some(connection);
            }
            trace!(node = %connection.address(), "Discarding stale idle connection");
        }
        None
    }

    async fn open_private(&self) -> Result<Option<Arc<Connection>>, TransportError> {
        let state = self.state.load_full();
        let usable: Vec<&Arc<Node>> = state.usable_nodes().collect();
        if usable.is_empty() {
            return Ok(None);
        }

        let start = self.round_robin.fetch_add(1, Ordering::Relaxed);
        let mut last_error = None;
        for i in 0..usable.len() {
            let node = usable[(start + i) % usable.len()];
            match self.factory.open(node).await {
                Ok(connection) => {
                    debug!(node = %node.address, "Opened exclusive connection");
                    return Ok(Some(connection));
                }
                Err(err) => {
                    debug!(node = %node.address, error = %err, "Could not open exclusive connection");
                    last_error = Some(err);
                }
            }
        }
        match last_error {
            Some(err) => Err(err),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ConnectionStrategy for ExclusiveStrategy {
    async fn get_or_create_connection(
        &self,
        _scope: ConnectionScope,
        _partition_key: Option<&PartitionKey>,
    ) -> Result<Option<Arc<Connection>>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        let connection = match self.take_idle() {
            Some(connection) => Some(connection),
            None => self.open_private().await?,
        };
        if let Some(connection) = &connection {
            connection.mark_taken();
        }
        Ok(connection)
    }

    fn return_connection(&self, connection: Arc<Connection>, _scope: ConnectionScope) {
        connection.mark_returned();
        if self.closed.load(Ordering::Acquire) || !connection.is_connected() {
            return;
        }
        self.idle.lock().unwrap().push(connection);
    }

    fn provides_exclusive_connections(&self) -> bool {
        true
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let idle = std::mem::take(&mut *self.idle.lock().unwrap());
        debug!(idle = idle.len(), "Closing exclusive strategy");
    }
}
