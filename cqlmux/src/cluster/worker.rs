use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use cqlmux_cql::frame::response::event::{Event, StatusChangeEvent};
use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::sync::{mpsc, OnceCell};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::control_connection::ControlConnection;
use super::node::resolve_known_nodes;
use super::state::ClusterState;
use crate::authentication::{AuthenticatorProvider, PlainTextAuthenticator};
use crate::client::session_builder::{ClusterConfig, ClusterKey, StrategyKind};
use crate::errors::{ExecutionError, OpenError, RequestAttemptError};
use crate::execution::{Executor, PreparedStatementCache, Throttle};
use crate::network::{ConnectionConfig, ErrorReceiver, VerifiedKeyspaceName};
use crate::strategy::{
    BalancedStrategy, ConnectionFactory, ConnectionStrategy, ExclusiveStrategy,
    PartitionAwareStrategy, PoolConfig,
};

const SERVER_EVENTS_CHANNEL_SIZE: usize = 32;

/// A database cluster: its topology, the connections to its nodes and
/// everything sessions share.
///
/// Opened lazily by the first session. All sessions created from equal
/// configurations through one
/// [`ClusterRegistry`](crate::client::registry::ClusterRegistry) share a
/// single `Cluster`.
pub struct Cluster {
    config: ClusterConfig,
    key: ClusterKey,
    // `ArcSwap<ClusterState>` is wrapped in `Arc` to support sharing cluster state
    // between `Cluster`, `ClusterWorker` and the strategies
    state: Arc<ArcSwap<ClusterState>>,
    connection_config: ConnectionConfig,
    executor: Executor,

    opened: OnceCell<()>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    worker_handle: Mutex<Option<RemoteHandle<()>>>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("key", &self.key)
            .field("state", &self.state.load())
            .field("strategy", self.executor.strategy())
            .field("prepared_statements", &self.executor.cache().len())
            .field("throttle_capacity", &self.executor.throttle().capacity())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Cluster {
    /// Creates an unopened cluster. Nothing is connected until
    /// [`Cluster::open`].
    pub fn new(config: ClusterConfig) -> Result<Cluster, OpenError> {
        let keyspace = config
            .keyspace
            .as_deref()
            .map(VerifiedKeyspaceName::new)
            .transpose()?;
        let authenticator = config.credentials.as_ref().map(|credentials| {
            Arc::new(PlainTextAuthenticator::new(
                credentials.username.clone(),
                credentials.password.clone(),
            )) as Arc<dyn AuthenticatorProvider>
        });
        let connection_config = ConnectionConfig {
            version: config.protocol_version,
            compression: config.compression,
            tcp_nodelay: config.tcp_nodelay,
            tcp_keepalive_interval: config.tcp_keepalive_interval,
            connect_timeout: config.connect_timeout,
            authenticator,
            keyspace,
            event_sender: None,
        };

        let state = Arc::new(ArcSwap::from_pointee(ClusterState::default()));
        let factory = ConnectionFactory::new(connection_config.clone());
        let pool_config = PoolConfig {
            max_connections_per_node: config.max_connections_per_node,
            new_connection_threshold: config.new_connection_threshold,
        };
        let strategy: Arc<dyn ConnectionStrategy> = match config.strategy {
            StrategyKind::Balanced => {
                Arc::new(BalancedStrategy::new(state.clone(), factory, pool_config))
            }
            StrategyKind::PartitionAware => Arc::new(PartitionAwareStrategy::new(
                BalancedStrategy::new(state.clone(), factory, pool_config),
            )),
            StrategyKind::Exclusive => Arc::new(ExclusiveStrategy::new(state.clone(), factory)),
        };
        let executor = Executor::new(
            strategy,
            Arc::new(PreparedStatementCache::new()),
            Arc::new(Throttle::new(config.max_concurrent_queries)),
            config.max_query_attempts,
        );

        Ok(Cluster {
            key: config.key(),
            config,
            state,
            connection_config,
            executor,
            opened: OnceCell::new(),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            worker_handle: Mutex::new(None),
        })
    }

    /// Connects the control connection, reads the topology and starts
    /// following server events.
    ///
    /// Idempotent: racing callers share one attempt, later callers return
    /// at once. A failed or cancelled open leaves the cluster unopened, so
    /// the next call tries again.
    pub async fn open(&self, cancel: &CancellationToken) -> Result<(), OpenError> {
        if self.is_closed() {
            return Err(OpenError::ClusterClosed);
        }
        self.opened
            .get_or_try_init(|| async {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(OpenError::Cancelled),
                    _ = self.shutdown.cancelled() => Err(OpenError::ClusterClosed),
                    opened = self.open_inner() => opened,
                }
            })
            .await
            .map(|_| ())
    }

    async fn open_inner(&self) -> Result<(), OpenError> {
        if self.config.known_nodes.is_empty() {
            return Err(OpenError::EmptyKnownNodesList);
        }
        let retry_delay = self.config.node_retry_delay;
        let addresses = resolve_known_nodes(&self.config.known_nodes)
            .await
            .map_err(|(hostname, error)| OpenError::HostnameResolution { hostname, error })?;
        if addresses.is_empty() {
            return Err(OpenError::EmptyKnownNodesList);
        }
        let contact_points = ClusterState::from_addresses(addresses, retry_delay);

        let (events_sender, events) = mpsc::channel(SERVER_EVENTS_CHANNEL_SIZE);
        let control_config = ConnectionConfig {
            // The control connection only reads system tables.
            keyspace: None,
            event_sender: Some(events_sender),
            ..self.connection_config.clone()
        };
        let (control, control_errors) =
            ControlConnection::open(contact_points.nodes(), &control_config)
                .await
                .map_err(|err| match err {
                    Some(err) => OpenError::AllNodesUnreachable(err),
                    None => OpenError::EmptyKnownNodesList,
                })?;

        self.state.store(Arc::new(contact_points));
        refresh_topology(&self.state, &control, retry_delay)
            .await
            .map_err(OpenError::MetadataFetch)?;

        let worker = ClusterWorker {
            state: self.state.clone(),
            control,
            control_errors,
            events,
            config: control_config,
            retry_delay,
            refresh_interval: self.config.topology_refresh_interval,
            shutdown: self.shutdown.child_token(),
        };
        let (fut, worker_handle) = worker.work().remote_handle();
        tokio::spawn(fut);
        *self.worker_handle.lock().unwrap() = Some(worker_handle);

        info!(
            nodes = self.state.load().nodes().len(),
            strategy = ?self.config.strategy,
            "Cluster opened"
        );
        Ok(())
    }

    /// Closes every connection and stops following the cluster. Operations
    /// started afterwards fail with [`ExecutionError::ClusterClosed`].
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        drop(self.worker_handle.lock().unwrap().take());
        self.executor.throttle().close();
        self.executor.strategy().close().await;
        info!(key = ?self.key, "Cluster shut down");
    }

    pub fn is_open(&self) -> bool {
        self.opened.initialized() && !self.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn key(&self) -> &ClusterKey {
        &self.key
    }

    /// The current topology snapshot.
    pub fn state(&self) -> Arc<ClusterState> {
        self.state.load_full()
    }

    pub(crate) fn executor(&self) -> &Executor {
        &self.executor
    }

    pub(crate) fn ensure_not_closed(&self) -> Result<(), ExecutionError> {
        if self.is_closed() {
            return Err(ExecutionError::ClusterClosed);
        }
        Ok(())
    }
}

// Attempt control connection repair every second.
const CONTROL_CONNECTION_REPAIR_INTERVAL: Duration = Duration::from_secs(1);

/// Re-reads the topology through `control` and swaps in the new state.
pub(crate) async fn refresh_topology(
    state: &ArcSwap<ClusterState>,
    control: &ControlConnection,
    retry_delay: Duration,
) -> Result<(), RequestAttemptError> {
    let nodes = control.fetch_topology(retry_delay).await?;
    let previous = state.load_full();
    let refreshed = ClusterState::new(nodes, Some(&previous));
    if refreshed.nodes().len() != previous.nodes().len() {
        info!(
            before = previous.nodes().len(),
            after = refreshed.nodes().len(),
            "Cluster topology changed"
        );
    }
    state.store(Arc::new(refreshed));
    Ok(())
}

// Works in the background to keep the cluster state up to date.
pub(crate) struct ClusterWorker {
    pub(crate) state: Arc<ArcSwap<ClusterState>>,
    pub(crate) control: ControlConnection,
    pub(crate) control_errors: ErrorReceiver,
    // Channel used to receive server events
    pub(crate) events: mpsc::Receiver<Event>,
    // Used to reopen the control connection. Carries the sender of `events`.
    pub(crate) config: ConnectionConfig,
    pub(crate) retry_delay: Duration,
    pub(crate) refresh_interval: Duration,
    pub(crate) shutdown: CancellationToken,
}

impl ClusterWorker {
    pub(crate) async fn work(self) {
        let ClusterWorker {
            state,
            control,
            control_errors,
            mut events,
            config,
            retry_delay,
            refresh_interval,
            shutdown,
        } = self;
        let mut control = Some(control);
        let mut control_errors = Some(control_errors);
        let mut last_refresh_time = Instant::now();

        loop {
            let sleep_until = last_refresh_time
                + if control.is_some() {
                    refresh_interval
                } else {
                    CONTROL_CONNECTION_REPAIR_INTERVAL
                };

            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Cluster worker stopped");
                    return;
                }

                _ = tokio::time::sleep_until(sleep_until) => {
                    // Time to do periodic refresh.
                }

                maybe_event = events.recv() => {
                    let Some(event) = maybe_event else {
                        return;
                    };
                    debug!(event = ?event, "Received server event");
                    match event {
                        Event::TopologyChange(_) => (), // Refresh immediately
                        Event::StatusChange(change) => {
                            apply_status_change(&state.load(), &change);
                            continue;
                        }
                        Event::SchemaChange(_) => continue,
                    }
                }

                broken = async {
                    match control_errors.as_mut() {
                        Some(receiver) => receiver.await.ok(),
                        None => std::future::pending().await,
                    }
                } => {
                    match broken {
                        Some(error) => warn!(error = %error, "Control connection broken"),
                        None => warn!("Control connection closed"),
                    }
                    control = None;
                    control_errors = None;
                }
            }

            last_refresh_time = Instant::now();

            if control.as_ref().is_some_and(|c| !c.is_connected()) {
                control = None;
                control_errors = None;
            }
            if control.is_none() {
                let current = state.load_full();
                let mut candidates: Vec<_> = current.usable_nodes().cloned().collect();
                candidates.extend(
                    current
                        .nodes()
                        .iter()
                        .filter(|node| !node.is_usable())
                        .cloned(),
                );
                match ControlConnection::open(&candidates, &config).await {
                    Ok((reopened, errors)) => {
                        info!(node = %reopened.address(), "Control connection repaired");
                        control = Some(reopened);
                        control_errors = Some(errors);
                    }
                    Err(_) => {
                        trace!("Control connection repair failed, retrying later");
                        continue;
                    }
                }
            }

            if let Some(control) = &control {
                if let Err(err) = refresh_topology(&state, control, retry_delay).await {
                    warn!(error = %err, "Topology refresh failed");
                }
            }
        }
    }
}

fn apply_status_change(state: &ClusterState, change: &StatusChangeEvent) {
    let (address, up) = match change {
        StatusChangeEvent::Up(address) => (*address, true),
        StatusChangeEvent::Down(address) => (*address, false),
    };
    match state.find_node(address) {
        Some(node) if up => node.mark_up(),
        Some(node) => node.mark_down(),
        None => trace!(node = %address, "Status change of an unknown node"),
    }
}
