use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::node::{Node, NodeRef};
use crate::routing::{PartitionKey, Token, TokenRing};

/// A snapshot of the cluster topology.
///
/// Snapshots are immutable; a refresh builds a new one and swaps it in. Node
/// health lives inside the shared [`Node`]s and survives refreshes.
#[derive(Debug, Default)]
pub struct ClusterState {
    known_peers: HashMap<SocketAddr, Arc<Node>>,
    // Sorted by address, for a stable iteration order.
    all_nodes: Vec<Arc<Node>>,
    ring: TokenRing<Arc<Node>>,
}

impl ClusterState {
    /// Builds a snapshot from freshly read node metadata. Nodes that were
    /// already known keep their state.
    pub(crate) fn new(nodes: Vec<Node>, previous: Option<&ClusterState>) -> Self {
        let mut all_nodes: Vec<Arc<Node>> = nodes
            .into_iter()
            .map(|mut node| {
                if let Some(old) = previous.and_then(|p| p.known_peers.get(&node.address)) {
                    node.share_state(old);
                }
                Arc::new(node)
            })
            .collect();
        all_nodes.sort_by_key(|node| node.address);
        all_nodes.dedup_by_key(|node| node.address);

        let known_peers = all_nodes
            .iter()
            .map(|node| (node.address, node.clone()))
            .collect();

        let ring = TokenRing::new(all_nodes.iter().flat_map(|node| {
            node.tokens.iter().map(move |token| (*token, node.clone()))
        }));

        ClusterState {
            known_peers,
            all_nodes,
            ring,
        }
    }

    /// A snapshot with just the contact points and no token information.
    pub(crate) fn from_addresses(
        addresses: impl IntoIterator<Item = SocketAddr>,
        retry_delay: Duration,
    ) -> Self {
        let nodes = addresses
            .into_iter()
            .map(|address| Node::new(address, retry_delay))
            .collect();
        Self::new(nodes, None)
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.all_nodes
    }

    pub fn get_node(&self, address: SocketAddr) -> Option<NodeRef<'_>> {
        self.known_peers.get(&address)
    }

    /// Looks a node up by address, falling back to a match on the IP alone.
    /// Server events carry the RPC address, whose port may differ from the
    /// one the driver connects to.
    pub(crate) fn find_node(&self, address: SocketAddr) -> Option<NodeRef<'_>> {
        self.get_node(address).or_else(|| {
            let mut same_ip = self
                .all_nodes
                .iter()
                .filter(|node| node.address.ip() == address.ip());
            match (same_ip.next(), same_ip.next()) {
                (Some(node), None) => Some(node),
                _ => None,
            }
        })
    }

    pub fn ring(&self) -> &TokenRing<Arc<Node>> {
        &self.ring
    }

    /// The node owning the partition, if the ring knows any tokens.
    pub fn owner_of(&self, token: Token) -> Option<NodeRef<'_>> {
        self.ring.owner(token)
    }

    pub fn owner_of_key(&self, partition_key: &PartitionKey) -> Option<NodeRef<'_>> {
        let token = partition_key.token().ok()?;
        self.owner_of(token)
    }

    pub(crate) fn usable_nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.all_nodes.iter().filter(|node| node.is_usable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::NodeState;

    fn node(port: u16, tokens: &[i64]) -> Node {
        Node::with_metadata(
            SocketAddr::from(([127, 0, 0, 1], port)),
            None,
            Some("dc1".to_owned()),
            None,
            tokens.iter().copied().map(Token::new).collect(),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn ring_is_built_from_every_node_token() {
        let state = ClusterState::new(
            vec![node(9043, &[-100, 500]), node(9042, &[0]), node(9044, &[])],
            None,
        );
        assert_eq!(state.nodes().len(), 3);
        assert_eq!(state.nodes()[0].address.port(), 9042);
        assert_eq!(state.ring().len(), 3);

        assert_eq!(state.owner_of(Token::new(-200)).unwrap().address.port(), 9043);
        assert_eq!(state.owner_of(Token::new(-5)).unwrap().address.port(), 9042);
        assert_eq!(state.owner_of(Token::new(1)).unwrap().address.port(), 9043);
        assert_eq!(state.owner_of(Token::new(600)).unwrap().address.port(), 9043);
    }

    #[test]
    fn refresh_keeps_node_state() {
        let first = ClusterState::new(vec![node(9042, &[0]), node(9043, &[10])], None);
        first
            .get_node(SocketAddr::from(([127, 0, 0, 1], 9043)))
            .unwrap()
            .mark_down();

        let second = ClusterState::new(vec![node(9042, &[0]), node(9043, &[10])], Some(&first));
        let refreshed = second
            .get_node(SocketAddr::from(([127, 0, 0, 1], 9043)))
            .unwrap();
        assert_eq!(refreshed.state(), NodeState::Down);
        assert_eq!(second.usable_nodes().count(), 1);
    }

    #[test]
    fn failures_on_nodes_held_before_a_refresh_reach_the_new_snapshot() {
        let address = SocketAddr::from(([127, 0, 0, 1], 9042));
        let first = ClusterState::new(vec![node(9042, &[0]), node(9043, &[10])], None);
        // What a pooled connection keeps after being opened.
        let held = first.get_node(address).unwrap().clone();

        let second = ClusterState::new(vec![node(9042, &[0]), node(9043, &[10])], Some(&first));
        let third = ClusterState::new(vec![node(9042, &[0]), node(9043, &[10])], Some(&second));

        held.mark_down();
        let current = third.get_node(address).unwrap();
        assert_eq!(current.state(), NodeState::Down);
        assert!(!current.is_usable());
        assert_eq!(third.usable_nodes().count(), 1);

        held.mark_bootstrapping();
        assert_eq!(current.state(), NodeState::Bootstrapping);
        held.mark_up();
        assert_eq!(current.state(), NodeState::Up);
    }

    #[test]
    fn events_match_nodes_by_ip_when_port_differs() {
        let state = ClusterState::from_addresses(
            [
                SocketAddr::from(([10, 0, 0, 1], 19042)),
                SocketAddr::from(([10, 0, 0, 2], 19042)),
            ],
            Duration::from_secs(1),
        );
        let found = state
            .find_node(SocketAddr::from(([10, 0, 0, 2], 9042)))
            .unwrap();
        assert_eq!(found.address, SocketAddr::from(([10, 0, 0, 2], 19042)));
        assert!(state
            .find_node(SocketAddr::from(([10, 0, 0, 3], 9042)))
            .is_none());
        assert!(state.ring().is_empty());
    }
}
