//! This module holds entities that allow users to interact with the driver.
//! This includes the [`Session`](session::Session) and the
//! [`ClusterRegistry`](registry::ClusterRegistry) sessions share clusters
//! through, along with [`Statement`](statement::Statement), [`Batch`](batch::Batch)
//! and the configuration builder.

pub mod batch;
pub mod registry;
pub mod session;
pub mod session_builder;
pub mod statement;
