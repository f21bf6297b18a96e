//! This module holds entities that allow observing the cluster's behaviour.
//! For now this is cluster-side tracing of single statements.

pub mod tracing;
