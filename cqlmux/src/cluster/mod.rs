//! This module holds entities that represent the cluster as a whole,
//! the nodes in the cluster and the topology snapshot shared between them.
//!
//! The topology is kept up to date by a background worker, which follows
//! server events on a dedicated control connection and re-reads the system
//! tables periodically.

mod control_connection;
pub mod node;
mod state;
mod worker;

pub use node::{KnownNode, Node, NodeRef, NodeState};
pub use state::ClusterState;
pub use worker::Cluster;
