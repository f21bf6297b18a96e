use std::fmt::Display;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use itertools::Itertools;
use tokio::net::lookup_host;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::routing::Token;

/// Health of a node, as last observed by this driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Up,
    Down,
    Bootstrapping,
}

impl Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            NodeState::Up => "up",
            NodeState::Down => "down",
            NodeState::Bootstrapping => "bootstrapping",
        })
    }
}

#[derive(Debug)]
struct StateCell {
    state: NodeState,
    since: Instant,
}

/// Node represents a cluster node along with the metadata read from the
/// system tables.
///
/// Metadata is fixed for the lifetime of the struct. A topology refresh
/// creates a new `Node` sharing the state cell of the old one, so failures
/// seen through connections opened before the refresh still count.
#[derive(Debug)]
pub struct Node {
    pub address: SocketAddr,
    pub host_id: Option<Uuid>,
    pub datacenter: Option<String>,
    pub rack: Option<String>,
    pub tokens: Vec<Token>,

    state: Arc<Mutex<StateCell>>,
    // A node that is not `Up` may be tried again after this long.
    retry_delay: Duration,
}

/// A way that Nodes are often passed and accessed in the driver's code.
pub type NodeRef<'a> = &'a Arc<Node>;

impl Node {
    pub(crate) fn new(address: SocketAddr, retry_delay: Duration) -> Self {
        Node {
            address,
            host_id: None,
            datacenter: None,
            rack: None,
            tokens: Vec::new(),
            state: Arc::new(Mutex::new(StateCell {
                state: NodeState::Up,
                since: Instant::now(),
            })),
            retry_delay,
        }
    }

    pub(crate) fn with_metadata(
        address: SocketAddr,
        host_id: Option<Uuid>,
        datacenter: Option<String>,
        rack: Option<String>,
        tokens: Vec<Token>,
        retry_delay: Duration,
    ) -> Self {
        Node {
            host_id,
            datacenter,
            rack,
            tokens,
            ..Node::new(address, retry_delay)
        }
    }

    /// Makes this node share the state of the node it replaces.
    pub(crate) fn share_state(&mut self, previous: &Node) {
        self.state = previous.state.clone();
    }

    pub fn state(&self) -> NodeState {
        self.state.lock().unwrap().state
    }

    /// Whether a connection to this node should be attempted now: the node is
    /// up, or it has been in another state for longer than the retry delay.
    pub fn is_usable(&self) -> bool {
        let cell = self.state.lock().unwrap();
        cell.state == NodeState::Up || cell.since.elapsed() >= self.retry_delay
    }

    fn transition(&self, new_state: NodeState) {
        let mut cell = self.state.lock().unwrap();
        let old_state = cell.state;
        cell.since = Instant::now();
        cell.state = new_state;
        drop(cell);

        if old_state != new_state {
            match new_state {
                NodeState::Up => info!(node = %self.address, from = %old_state, "Node is up"),
                _ => debug!(node = %self.address, from = %old_state, to = %new_state, "Node state changed"),
            }
        }
    }

    pub(crate) fn mark_up(&self) {
        self.transition(NodeState::Up);
    }

    pub(crate) fn mark_down(&self) {
        self.transition(NodeState::Down);
    }

    pub(crate) fn mark_bootstrapping(&self) {
        self.transition(NodeState::Bootstrapping);
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

/// Describes a database server known on cluster startup.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[non_exhaustive]
pub enum KnownNode {
    /// A node identified by its hostname, with or without a port.
    Hostname(String),
    /// A node identified by its IP address + a port.
    Address(SocketAddr),
}

/// Port of the native protocol, used when a hostname carries none.
pub(crate) const DEFAULT_PORT: u16 = 9042;

// Resolve the given hostname using a DNS lookup if necessary.
// IPv4 addresses are preferred over IPv6 ones.
pub(crate) async fn resolve_hostname(hostname: &str) -> Result<SocketAddr, Arc<std::io::Error>> {
    // `lookup_host` wants "hostname:port"; without a port retry with the
    // default one, but report the original error if that fails too.
    let addrs = match lookup_host(hostname).await {
        Ok(addrs) => itertools::Either::Left(addrs),
        Err(e) => {
            let addrs = lookup_host((hostname, DEFAULT_PORT))
                .await
                .map_err(|_| Arc::new(e))?;
            itertools::Either::Right(addrs)
        }
    };

    addrs
        .find_or_last(|addr| matches!(addr, SocketAddr::V4(_)))
        .ok_or_else(|| {
            Arc::new(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses found for {}", hostname),
            ))
        })
}

/// Turns the known nodes into addresses, resolving hostnames. Hostnames
/// that do not resolve are skipped; the error is returned only when nothing
/// resolved at all.
pub(crate) async fn resolve_known_nodes(
    known_nodes: &[KnownNode],
) -> Result<Vec<SocketAddr>, (String, Arc<std::io::Error>)> {
    let mut addresses = Vec::with_capacity(known_nodes.len());
    let mut last_error = None;
    for known_node in known_nodes {
        match known_node {
            KnownNode::Address(address) => addresses.push(*address),
            KnownNode::Hostname(hostname) => match resolve_hostname(hostname).await {
                Ok(address) => addresses.push(address),
                Err(error) => {
                    warn!(hostname = hostname.as_str(), error = %error, "Hostname resolution failed");
                    last_error = Some((hostname.clone(), error));
                }
            },
        }
    }
    match (addresses.is_empty(), last_error) {
        (true, Some(error)) => Err(error),
        _ => Ok(addresses),
    }
}
