//! Async driver core for Cassandra-compatible CQL clusters.
//!
//! Requests from many callers are multiplexed over a few sockets per node,
//! routed to the node owning their partition when asked to, admitted through
//! a per cluster throttle and retried when the failure allows it.
//!
//! # Driver overview
//! ### Connecting
//! All driver activity revolves around the [Session]\
//! A `Session` is opened on a cluster described by a [ClusterConfig]. Sessions
//! opened with equal configurations share one cluster, with its connections
//! and its prepared statement cache:
//!
//! ```rust,no_run
//! use cqlmux::{ClusterBuilder, Session, Statement, StrategyKind};
//! use std::error::Error;
//!
//! async fn example() -> Result<(), Box<dyn Error>> {
//!     let config = ClusterBuilder::new()
//!         .known_node("127.0.0.1:9042")
//!         .known_node("10.0.0.7")
//!         .strategy(StrategyKind::PartitionAware)
//!         .build();
//!     let session = Session::connect(config).await?;
//!
//!     let rows = session
//!         .execute_query(&Statement::new("SELECT cluster_name FROM system.local"))
//!         .await?
//!         .result;
//!     println!("{} row(s)", rows.rows_count());
//!     Ok(())
//! }
//! ```
//!
//! ### Making queries
//! * [`Session::execute_query`] runs a statement returning rows,
//! * [`Session::execute_non_query`] runs a statement for its effect,
//! * [`Session::execute_batch`] sends several statements as one [`Batch`],
//! * [`Session::prepare`] prepares a statement up front; statements marked
//!   [`Statement::prepared`] are prepared on demand on each node.
//!
//! Every operation returns an [`ExecutionReport`] telling how many attempts
//! it took and which node coordinated it. When tracing was requested, the
//! trace can be read back with [`Session::get_tracing_info`].

pub mod authentication;
pub mod client;
pub mod cluster;
pub mod errors;
pub mod execution;
pub mod network;
pub mod observability;
pub mod response;
pub mod routing;
pub mod strategy;

pub(crate) mod utils;

pub use cqlmux_cql as cql;

pub use client::batch::{Batch, BatchType};
pub use client::registry::ClusterRegistry;
pub use client::session::Session;
pub use client::session_builder::{ClusterBuilder, ClusterConfig, ClusterKey, StrategyKind};
pub use client::statement::Statement;
pub use cluster::Cluster;
pub use cqlmux_cql::{Compression, Consistency, ProtocolVersion, SerialConsistency};
pub use response::{ExecutionReport, QueryResult, RowsResult};
