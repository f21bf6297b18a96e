//! CQL binary protocol building blocks for the `cqlmux` driver.
//!
//! This crate knows how bytes look on the wire: frame headers, primitive
//! notations, request and response bodies and the value codec capability.
//! It has no notion of connections, nodes or retries.

pub mod frame;
pub mod value;

pub use crate::frame::types::{Consistency, SerialConsistency};
pub use crate::frame::{Compression, ProtocolVersion};
