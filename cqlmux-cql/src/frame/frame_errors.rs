//! Errors produced while building, reading and parsing frames.

use std::sync::Arc;

use thiserror::Error;

use super::TryFromPrimitiveError;

/// Failure while reading a frame off the wire or unwrapping its extensions.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FrameError {
    #[error("Frame is compressed, but no compression was negotiated for the connection")]
    NoCompressionNegotiated,
    #[error("Received frame marked as coming from a client")]
    FrameFromClient,
    #[error("Received a frame of protocol version {received}, connection uses version {expected}")]
    VersionMismatch { expected: u8, received: u8 },
    #[error("Frame body of {0} bytes exceeds the allowed maximum")]
    FrameTooLarge(usize),
    #[error("Connection was closed before body was read: missing {0} out of {1}")]
    ConnectionClosed(usize, usize),
    #[error("Frame decompression failed")]
    FrameDecompression,
    #[error(transparent)]
    StdIoError(Arc<std::io::Error>),
    #[error("Unrecognized response opcode: {0}")]
    UnknownOpcode(#[from] TryFromPrimitiveError<u8>),
    #[error("Malformed frame extensions: {0}")]
    Extensions(#[from] LowLevelDeserializationError),
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        FrameError::StdIoError(Arc::new(err))
    }
}

/// Failure while decoding the body of a response.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ParseError {
    #[error(transparent)]
    LowLevel(#[from] LowLevelDeserializationError),
    #[error("Unknown RESULT kind: {0}")]
    UnknownResultKind(i32),
    #[error("Column type with id {0:#06x} is not supported")]
    TypeNotImplemented(u16),
    #[error("Unknown {what}: {value}")]
    UnknownEnumValue { what: &'static str, value: String },
    #[error("Bad incoming data: {0}")]
    BadIncomingData(String),
}

/// Failure while reading one of the primitive protocol notations.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum LowLevelDeserializationError {
    #[error(transparent)]
    IoError(Arc<std::io::Error>),
    #[error("Too few bytes received: expected {expected}, received {received}")]
    TooFewBytesReceived { expected: usize, received: usize },
    #[error("Invalid value length: {0}")]
    InvalidValueLength(i32),
    #[error("Unknown consistency: {0}")]
    UnknownConsistency(#[from] TryFromPrimitiveError<u16>),
    #[error("Invalid inet bytes length: {0}, only 4 or 16 are allowed")]
    InvalidInetLength(u8),
    #[error("UTF-8 deserialization failed: {0}")]
    Utf8DeserializationError(#[from] std::str::Utf8Error),
    #[error(transparent)]
    TryFromIntError(#[from] std::num::TryFromIntError),
}

impl From<std::io::Error> for LowLevelDeserializationError {
    fn from(err: std::io::Error) -> Self {
        LowLevelDeserializationError::IoError(Arc::new(err))
    }
}

/// Failure while serializing a request body.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlRequestSerializationError {
    #[error("A field does not fit into its length prefix: {0}")]
    LengthOverflow(#[from] std::num::TryFromIntError),
    #[error("Too many bound values: {0}, at most {max} are allowed", max = u16::MAX)]
    TooManyValues(usize),
    #[error("Snappy compression failed: {0}")]
    SnapCompressError(Arc<snap::Error>),
}

impl From<snap::Error> for CqlRequestSerializationError {
    fn from(err: snap::Error) -> Self {
        CqlRequestSerializationError::SnapCompressError(Arc::new(err))
    }
}
