mod connection;

pub use connection::Connection;
pub(crate) use connection::{open_connection, ConnectionConfig, ErrorReceiver, VerifiedKeyspaceName};

#[cfg(test)]
mod connection_test;
