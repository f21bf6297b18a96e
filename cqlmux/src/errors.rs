//! This module contains various errors which can be returned by `cqlmux`.
//!
//! Lower layers only classify and propagate. The decision whether an error is
//! worth another attempt is taken in [`crate::execution`].

use std::net::SocketAddr;
use std::sync::Arc;

pub use cqlmux_cql::frame::response::error::{DbError, WriteType};

use cqlmux_cql::frame::frame_errors::{CqlRequestSerializationError, FrameError, ParseError};
use cqlmux_cql::frame::response::Error as CqlError;
use thiserror::Error;
use uuid::Uuid;

/// The router of a connection stopped; every request in flight on it fails
/// with a copy of this error.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum BrokenConnectionError {
    #[error("Failed to read a response frame: {0}")]
    FrameError(#[from] FrameError),

    #[error("Failed to write a request frame: {0}")]
    WriteError(Arc<std::io::Error>),

    #[error("Received a response with unexpected stream id {0}")]
    UnexpectedStreamId(i16),

    #[error("Failed to handle a server event: {0}")]
    EventHandling(String),

    #[error("The connection is closed")]
    ChannelError,
}

impl From<std::io::Error> for BrokenConnectionError {
    fn from(io_error: std::io::Error) -> Self {
        BrokenConnectionError::WriteError(Arc::new(io_error))
    }
}

/// A handshake request (OPTIONS, STARTUP, AUTH_RESPONSE, REGISTER, USE) did
/// not go through.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionSetupError {
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    #[error("Received unexpected response to {request}: {response}")]
    UnexpectedResponse {
        request: &'static str,
        response: &'static str,
    },

    #[error("Server requested authentication ({0}) but no credentials were configured")]
    MissingAuthentication(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error(transparent)]
    Request(Box<RequestAttemptError>),
}

impl From<RequestAttemptError> for ConnectionSetupError {
    fn from(err: RequestAttemptError) -> Self {
        match err {
            RequestAttemptError::DbError(e, msg) => ConnectionSetupError::DbError(e, msg),
            other => ConnectionSetupError::Request(Box::new(other)),
        }
    }
}

/// Failure to reach a node or to keep talking to it.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TransportError {
    #[error("Failed to connect to {0}: {1}")]
    ConnectFailed(SocketAddr, Arc<std::io::Error>),

    #[error("Timed out while connecting to {0}")]
    ConnectTimeout(SocketAddr),

    #[error("Handshake with {0} failed: {1}")]
    SetupFailed(SocketAddr, ConnectionSetupError),

    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),
}

/// Error of a single attempt of a request on a single connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestAttemptError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    #[error("Received unexpected response from the server: {0}")]
    UnexpectedResponse(&'static str),

    #[error("Failed to deserialize the response: {0}")]
    ResultParse(#[from] ParseError),

    #[error("Failed to strip response frame extensions: {0}")]
    BodyExtensions(FrameError),

    #[error("Failed to serialize the request: {0}")]
    Serialization(#[from] CqlRequestSerializationError),

    #[error("Keyspace name mismatch; expected: {expected}, received: {received}")]
    KeyspaceNameMismatch { expected: String, received: String },

    #[error("Unable to allocate stream id")]
    UnableToAllocStreamId,

    /// The strategy had no connection to hand out.
    #[error("No connection available")]
    NoConnectionAvailable,
}

impl From<BrokenConnectionError> for RequestAttemptError {
    fn from(err: BrokenConnectionError) -> Self {
        RequestAttemptError::Transport(TransportError::BrokenConnection(err))
    }
}

impl From<CqlError> for RequestAttemptError {
    fn from(error: CqlError) -> Self {
        RequestAttemptError::DbError(error.error, error.reason)
    }
}

/// The caller asked for something this driver will not do.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum UsageError {
    #[error("Expected a rows result, but the statement returned {0}")]
    NotARowsResult(&'static str),

    #[error("Statement expects {expected} bound values, got {received}")]
    ValueCountMismatch { expected: usize, received: usize },

    #[error("Changing the keyspace requires the exclusive connection strategy")]
    KeyspaceChangeRequiresExclusive,

    #[error("Passed invalid keyspace name to use: {0}")]
    BadKeyspaceName(#[from] BadKeyspaceName),

    #[error("Statement text is empty")]
    EmptyStatement,
}

/// Invalid keyspace name given to `Session::use_keyspace()`
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BadKeyspaceName {
    /// Keyspace name is empty
    #[error("Keyspace name is empty")]
    Empty,

    /// Keyspace name too long, must be up to 48 characters
    #[error("Keyspace name too long, must be up to 48 characters, found {1} characters. Bad keyspace name: '{0}'")]
    TooLong(String, usize),

    /// Illegal character - only alphanumeric and underscores allowed.
    #[error("Illegal character found: '{1}', only alphanumeric and underscores allowed. Bad keyspace name: '{0}'")]
    IllegalCharacter(String, char),
}

/// Error that occurred while opening a cluster.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum OpenError {
    #[error("Empty known nodes list")]
    EmptyKnownNodesList,

    #[error("Failed to resolve hostname {hostname}: {error}")]
    HostnameResolution {
        hostname: String,
        error: Arc<std::io::Error>,
    },

    #[error("Invalid keyspace name: {0}")]
    BadKeyspaceName(#[from] BadKeyspaceName),

    #[error("Could not connect to any known node, last error: {0}")]
    AllNodesUnreachable(TransportError),

    #[error("Failed to fetch cluster metadata: {0}")]
    MetadataFetch(RequestAttemptError),

    #[error("Opening the cluster was cancelled")]
    Cancelled,

    #[error("The cluster was shut down")]
    ClusterClosed,
}

/// Final outcome of a failed logical operation.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ExecutionError {
    #[error(transparent)]
    Transport(TransportError),

    #[error("Database returned an error: {0}, Error message: {1}")]
    Db(DbError, String),

    #[error(transparent)]
    Usage(#[from] UsageError),

    /// Every attempt failed with a retryable error.
    #[error("Giving up after {attempts} attempts, last error: {last_error}")]
    RetriesExhausted {
        attempts: usize,
        last_error: Box<RequestAttemptError>,
    },

    /// A request failed in a way that neither the transport nor the
    /// database is to blame for, e.g. a malformed response.
    #[error(transparent)]
    Request(RequestAttemptError),

    #[error(transparent)]
    Open(#[from] OpenError),

    #[error("The operation was cancelled")]
    Cancelled,

    #[error("The cluster was shut down")]
    ClusterClosed,

    #[error("No connection available")]
    NoConnection,

    /// The trace tables stayed empty for every read, the trace may not have
    /// propagated yet.
    #[error("Tracing info of session {tracing_id} is still incomplete after {attempts} reads")]
    TracingInfoUnavailable { tracing_id: Uuid, attempts: u32 },
}

impl From<RequestAttemptError> for ExecutionError {
    fn from(err: RequestAttemptError) -> Self {
        match err {
            RequestAttemptError::Transport(e) => ExecutionError::Transport(e),
            RequestAttemptError::DbError(e, msg) => ExecutionError::Db(e, msg),
            RequestAttemptError::NoConnectionAvailable => ExecutionError::NoConnection,
            other => ExecutionError::Request(other),
        }
    }
}

impl From<BadKeyspaceName> for ExecutionError {
    fn from(err: BadKeyspaceName) -> Self {
        ExecutionError::Usage(UsageError::BadKeyspaceName(err))
    }
}

impl ExecutionError {
    /// The database error behind this failure, if any. Looks through
    /// `RetriesExhausted`.
    pub fn db_error(&self) -> Option<&DbError> {
        match self {
            ExecutionError::Db(e, _) => Some(e),
            ExecutionError::RetriesExhausted { last_error, .. } => match last_error.as_ref() {
                RequestAttemptError::DbError(e, _) => Some(e),
                _ => None,
            },
            _ => None,
        }
    }
}
