//! Configuration of a cluster, and the key clusters are shared by.

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::time::Duration;

use cqlmux_cql::{Compression, Consistency, ProtocolVersion};

use crate::cluster::node::KnownNode;

/// Which [`ConnectionStrategy`](crate::strategy::ConnectionStrategy) a
/// cluster uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StrategyKind {
    /// [`BalancedStrategy`](crate::strategy::BalancedStrategy).
    #[default]
    Balanced,
    /// [`PartitionAwareStrategy`](crate::strategy::PartitionAwareStrategy).
    PartitionAware,
    /// [`ExclusiveStrategy`](crate::strategy::ExclusiveStrategy).
    Exclusive,
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Credentials {
    pub(crate) username: String,
    pub(crate) password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<hidden>")
            .finish()
    }
}

const DEFAULT_TRACING_INFO_FETCH_ATTEMPTS: NonZeroU32 = match NonZeroU32::new(10) {
    Some(attempts) => attempts,
    None => unreachable!(),
};

/// Everything a cluster is opened with. Built by [`ClusterBuilder`].
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub(crate) known_nodes: Vec<KnownNode>,
    pub(crate) protocol_version: ProtocolVersion,
    pub(crate) compression: Option<Compression>,
    pub(crate) credentials: Option<Credentials>,
    pub(crate) keyspace: Option<String>,
    pub(crate) strategy: StrategyKind,
    pub(crate) max_connections_per_node: usize,
    pub(crate) new_connection_threshold: usize,
    pub(crate) max_concurrent_queries: usize,
    pub(crate) max_query_attempts: usize,
    pub(crate) connect_timeout: Duration,
    pub(crate) tcp_nodelay: bool,
    pub(crate) tcp_keepalive_interval: Option<Duration>,
    pub(crate) buffer_rows: bool,
    pub(crate) node_retry_delay: Duration,
    pub(crate) topology_refresh_interval: Duration,
    pub(crate) tracing_info_fetch_attempts: NonZeroU32,
    pub(crate) tracing_info_fetch_interval: Duration,
    pub(crate) tracing_info_fetch_consistency: Consistency,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            known_nodes: Vec::new(),
            protocol_version: ProtocolVersion::V4,
            compression: None,
            credentials: None,
            keyspace: None,
            strategy: StrategyKind::default(),
            max_connections_per_node: 2,
            new_connection_threshold: 10,
            max_concurrent_queries: 2048,
            max_query_attempts: 3,
            connect_timeout: Duration::from_secs(5),
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            buffer_rows: false,
            node_retry_delay: Duration::from_secs(5),
            topology_refresh_interval: Duration::from_secs(60),
            tracing_info_fetch_attempts: DEFAULT_TRACING_INFO_FETCH_ATTEMPTS,
            tracing_info_fetch_interval: Duration::from_millis(3),
            tracing_info_fetch_consistency: Consistency::One,
        }
    }
}

impl ClusterConfig {
    /// Identity of the cluster this configuration opens. Two configurations
    /// with equal keys share one cluster in a
    /// [`ClusterRegistry`](crate::client::registry::ClusterRegistry).
    pub fn key(&self) -> ClusterKey {
        let mut known_nodes = self.known_nodes.clone();
        known_nodes.sort();
        known_nodes.dedup();
        ClusterKey {
            known_nodes,
            protocol_version: self.protocol_version.as_u8(),
            compression: self.compression.map(|c| c.as_str()),
            credentials: self.credentials.clone(),
            keyspace: self.keyspace.clone(),
            strategy: self.strategy,
            max_connections_per_node: self.max_connections_per_node,
            new_connection_threshold: self.new_connection_threshold,
            max_concurrent_queries: self.max_concurrent_queries,
            max_query_attempts: self.max_query_attempts,
            connect_timeout: self.connect_timeout,
            tcp_nodelay: self.tcp_nodelay,
            tcp_keepalive_interval: self.tcp_keepalive_interval,
            buffer_rows: self.buffer_rows,
            node_retry_delay: self.node_retry_delay,
            topology_refresh_interval: self.topology_refresh_interval,
            tracing_info_fetch_attempts: self.tracing_info_fetch_attempts,
            tracing_info_fetch_interval: self.tracing_info_fetch_interval,
            tracing_info_fetch_consistency: self.tracing_info_fetch_consistency,
        }
    }

    pub fn known_nodes(&self) -> &[KnownNode] {
        &self.known_nodes
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy
    }
}

/// Normalized [`ClusterConfig`]: the known nodes sorted and de-duplicated,
/// plus every option that changes how the cluster behaves.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterKey {
    known_nodes: Vec<KnownNode>,
    protocol_version: u8,
    compression: Option<&'static str>,
    credentials: Option<Credentials>,
    keyspace: Option<String>,
    strategy: StrategyKind,
    max_connections_per_node: usize,
    new_connection_threshold: usize,
    max_concurrent_queries: usize,
    max_query_attempts: usize,
    connect_timeout: Duration,
    tcp_nodelay: bool,
    tcp_keepalive_interval: Option<Duration>,
    buffer_rows: bool,
    node_retry_delay: Duration,
    topology_refresh_interval: Duration,
    tracing_info_fetch_attempts: NonZeroU32,
    tracing_info_fetch_interval: Duration,
    tracing_info_fetch_consistency: Consistency,
}

/// Builds a [`ClusterConfig`].
///
/// # Example
///
/// ```
/// # use cqlmux::client::session_builder::{ClusterBuilder, StrategyKind};
/// let config = ClusterBuilder::new()
///     .known_node("127.0.0.1:9042")
///     .strategy(StrategyKind::PartitionAware)
///     .max_query_attempts(5)
///     .build();
/// assert_eq!(config.strategy(), StrategyKind::PartitionAware);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ClusterBuilder {
    config: ClusterConfig,
}

impl ClusterBuilder {
    /// Creates new ClusterBuilder with default configuration.
    pub fn new() -> Self {
        ClusterBuilder::default()
    }

    /// Add a known node with a hostname. Without a port, 9042 is used.
    pub fn known_node(mut self, hostname: impl AsRef<str>) -> Self {
        self.config
            .known_nodes
            .push(KnownNode::Hostname(hostname.as_ref().to_owned()));
        self
    }

    /// Add a known node with an IP address.
    pub fn known_node_addr(mut self, node_addr: SocketAddr) -> Self {
        self.config.known_nodes.push(KnownNode::Address(node_addr));
        self
    }

    /// Add a list of known nodes with hostnames.
    pub fn known_nodes(self, hostnames: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        hostnames
            .into_iter()
            .fold(self, |builder, hostname| builder.known_node(hostname))
    }

    /// Add a list of known nodes with IP addresses.
    pub fn known_nodes_addr(self, node_addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        node_addrs
            .into_iter()
            .fold(self, |builder, addr| builder.known_node_addr(addr))
    }

    /// Protocol version every connection negotiates. Defaults to v4.
    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.config.protocol_version = version;
        self
    }

    /// Set preferred Compression algorithm.
    /// The default is no compression.
    /// If it is not supported by database server Session will fall back to no compression.
    pub fn compression(mut self, compression: Option<Compression>) -> Self {
        self.config.compression = compression;
        self
    }

    /// Set username and password for plain text authentication.
    pub fn user(mut self, username: impl Into<String>, passwd: impl Into<String>) -> Self {
        self.config.credentials = Some(Credentials {
            username: username.into(),
            password: passwd.into(),
        });
        self
    }

    /// Keyspace every connection switches to right after the handshake.
    pub fn use_keyspace(mut self, keyspace_name: impl Into<String>) -> Self {
        self.config.keyspace = Some(keyspace_name.into());
        self
    }

    pub fn strategy(mut self, strategy: StrategyKind) -> Self {
        self.config.strategy = strategy;
        self
    }

    /// Upper bound of the pool of each node, for the pooled strategies.
    pub fn max_connections_per_node(mut self, max: usize) -> Self {
        self.config.max_connections_per_node = max.max(1);
        self
    }

    /// Load at which a pooled connection counts as busy, so that a new one
    /// is opened if the pool has room.
    pub fn new_connection_threshold(mut self, threshold: usize) -> Self {
        self.config.new_connection_threshold = threshold.max(1);
        self
    }

    /// Capacity of the throttle: the total load of operations running at
    /// once.
    pub fn max_concurrent_queries(mut self, max: usize) -> Self {
        self.config.max_concurrent_queries = max.max(1);
        self
    }

    /// How many times an operation is tried before giving up, the first
    /// attempt included.
    pub fn max_query_attempts(mut self, attempts: usize) -> Self {
        self.config.max_query_attempts = attempts.max(1);
        self
    }

    /// Changes connection timeout
    /// The default is 5 seconds.
    /// If it's higher than underlying os's default connection timeout it won't effect.
    pub fn connection_timeout(mut self, duration: Duration) -> Self {
        self.config.connect_timeout = duration;
        self
    }

    /// Set the nodelay TCP flag.
    /// The default is true.
    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.config.tcp_nodelay = nodelay;
        self
    }

    /// Set the TCP keepalive interval. Disabled by default.
    pub fn tcp_keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.tcp_keepalive_interval = Some(interval);
        self
    }

    /// Whether rows are decoded before results are returned, unless a
    /// statement says otherwise. Off by default.
    pub fn buffer_rows(mut self, buffer_rows: bool) -> Self {
        self.config.buffer_rows = buffer_rows;
        self
    }

    /// How long a node that went down is avoided before being tried again.
    pub fn node_retry_delay(mut self, delay: Duration) -> Self {
        self.config.node_retry_delay = delay;
        self
    }

    /// How often the topology is re-read when no event asks for it.
    pub fn topology_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.topology_refresh_interval = interval;
        self
    }

    /// How many times [`Session::get_tracing_info`] reads the trace tables
    /// before giving up, 10 by default. Traces are written asynchronously,
    /// so the first reads may come back empty.
    ///
    /// [`Session::get_tracing_info`]: crate::client::session::Session::get_tracing_info
    pub fn tracing_info_fetch_attempts(mut self, attempts: NonZeroU32) -> Self {
        self.config.tracing_info_fetch_attempts = attempts;
        self
    }

    /// Pause between two reads of the trace tables. The default is 3ms.
    pub fn tracing_info_fetch_interval(mut self, interval: Duration) -> Self {
        self.config.tracing_info_fetch_interval = interval;
        self
    }

    /// Consistency of the trace table reads. The default is `One`.
    pub fn tracing_info_fetch_consistency(mut self, consistency: Consistency) -> Self {
        self.config.tracing_info_fetch_consistency = consistency;
        self
    }

    pub fn build(self) -> ClusterConfig {
        self.config
    }
}
