//! CQL requests sent by the client.

pub mod auth_response;
pub mod batch;
pub mod execute;
pub mod options;
pub mod prepare;
pub mod query;
pub mod register;
pub mod startup;

use bytes::Bytes;
use thiserror::Error;

pub use auth_response::AuthResponse;
pub use batch::Batch;
pub use execute::Execute;
pub use options::Options;
pub use prepare::Prepare;
pub use query::Query;
pub use register::Register;
pub use startup::Startup;

use super::frame_errors::{CqlRequestSerializationError, LowLevelDeserializationError};
use super::TryFromPrimitiveError;
use crate::Consistency;

/// Opcode of a request, used to identify the request type in a CQL frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum RequestOpcode {
    Startup = 0x01,
    Options = 0x05,
    Query = 0x07,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Batch = 0x0D,
    AuthResponse = 0x0F,
}

impl TryFrom<u8> for RequestOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Startup),
            0x05 => Ok(Self::Options),
            0x07 => Ok(Self::Query),
            0x09 => Ok(Self::Prepare),
            0x0A => Ok(Self::Execute),
            0x0B => Ok(Self::Register),
            0x0D => Ok(Self::Batch),
            0x0F => Ok(Self::AuthResponse),
            _ => Err(TryFromPrimitiveError {
                enum_name: "RequestOpcode",
                primitive: value,
            }),
        }
    }
}

impl std::fmt::Display for RequestOpcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RequestOpcode::Startup => "STARTUP",
            RequestOpcode::Options => "OPTIONS",
            RequestOpcode::Query => "QUERY",
            RequestOpcode::Prepare => "PREPARE",
            RequestOpcode::Execute => "EXECUTE",
            RequestOpcode::Register => "REGISTER",
            RequestOpcode::Batch => "BATCH",
            RequestOpcode::AuthResponse => "AUTH_RESPONSE",
        })
    }
}

/// Requests that can be serialized into a CQL frame.
pub trait SerializableRequest {
    const OPCODE: RequestOpcode;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError>;

    fn to_bytes(&self) -> Result<Bytes, CqlRequestSerializationError> {
        let mut v = Vec::new();
        self.serialize(&mut v)?;
        Ok(v.into())
    }
}

/// Requests that can be deserialized from a CQL frame.
///
/// The driver never reads requests; this exists for in-process test servers
/// that need to look at what the client sent.
pub trait DeserializableRequest: SerializableRequest + Sized {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError>;
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RequestDeserializationError {
    #[error("Low level deser error: {0}")]
    LowLevelDeserialization(#[from] LowLevelDeserializationError),
    #[error("Specified flags are not recognised: {flags:02x}")]
    UnknownFlags { flags: u8 },
    #[error("Named values in frame are currently unsupported")]
    NamedValuesUnsupported,
    #[error("Expected SerialConsistency, got regular Consistency: {0}")]
    ExpectedSerialConsistency(Consistency),
    #[error("Bad batch type: {0}")]
    BadBatchType(u8),
    #[error("Unexpected batch statement kind: {0}")]
    UnexpectedBatchStatementKind(u8),
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
    #[error(transparent)]
    UnknownOpcode(#[from] TryFromPrimitiveError<u8>),
}

/// Every request a client may send, as one closed sum.
#[derive(Debug, PartialEq, Eq)]
pub enum Request<'r> {
    Startup(Startup<'r>),
    Options(Options),
    Query(Query<'r>),
    Prepare(Prepare<'r>),
    Execute(Execute<'r>),
    Register(Register),
    Batch(Batch<'r>),
    AuthResponse(AuthResponse),
}

impl Request<'_> {
    pub fn deserialize(
        buf: &mut &[u8],
        opcode: RequestOpcode,
    ) -> Result<Self, RequestDeserializationError> {
        match opcode {
            RequestOpcode::Startup => Startup::deserialize(buf).map(Self::Startup),
            RequestOpcode::Options => Options::deserialize(buf).map(Self::Options),
            RequestOpcode::Query => Query::deserialize(buf).map(Self::Query),
            RequestOpcode::Prepare => Prepare::deserialize(buf).map(Self::Prepare),
            RequestOpcode::Execute => Execute::deserialize(buf).map(Self::Execute),
            RequestOpcode::Register => Register::deserialize(buf).map(Self::Register),
            RequestOpcode::Batch => Batch::deserialize(buf).map(Self::Batch),
            RequestOpcode::AuthResponse => AuthResponse::deserialize(buf).map(Self::AuthResponse),
        }
    }

    pub fn opcode(&self) -> RequestOpcode {
        match self {
            Request::Startup(_) => RequestOpcode::Startup,
            Request::Options(_) => RequestOpcode::Options,
            Request::Query(_) => RequestOpcode::Query,
            Request::Prepare(_) => RequestOpcode::Prepare,
            Request::Execute(_) => RequestOpcode::Execute,
            Request::Register(_) => RequestOpcode::Register,
            Request::Batch(_) => RequestOpcode::Batch,
            Request::AuthResponse(_) => RequestOpcode::AuthResponse,
        }
    }

    /// Retrieves consistency from request frame, if present.
    pub fn get_consistency(&self) -> Option<Consistency> {
        match self {
            Request::Query(q) => Some(q.parameters.consistency),
            Request::Execute(e) => Some(e.parameters.consistency),
            Request::Batch(b) => Some(b.consistency),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;
    use std::collections::HashMap;

    use assert_matches::assert_matches;
    use bytes::Bytes;

    use super::batch::{BatchStatement, BatchType};
    use super::query::QueryParameters;
    use super::*;
    use crate::frame::server_event_type::EventType;
    use crate::frame::types::{self, SerialConsistency};
    use crate::value::SerializedValues;

    fn decode<R: SerializableRequest>(req: &R) -> Request<'static> {
        let buf = req.to_bytes().unwrap();
        Request::deserialize(&mut &buf[..], R::OPCODE).unwrap()
    }

    fn two_values() -> SerializedValues {
        let mut values = SerializedValues::new();
        values.add_raw(Some(Bytes::from_static(&[0, 0, 8, 0x59])));
        values.add_raw(None);
        values
    }

    #[test]
    fn request_ser_de_identity() {
        let query = Query {
            contents: Cow::Borrowed("SELECT host_id FROM system.peers"),
            parameters: QueryParameters {
                consistency: Consistency::All,
                serial_consistency: Some(SerialConsistency::Serial),
                page_size: Some(323),
                paging_state: Some(Bytes::from_static(&[2, 1, 3, 7])),
                skip_metadata: true,
                values: Cow::Owned(two_values()),
            },
        };
        assert_eq!(decode(&query), Request::Query(query));

        let execute = Execute {
            id: Bytes::from_static(&[2, 4, 5, 2, 6, 7, 3, 1]),
            parameters: QueryParameters {
                consistency: Consistency::Any,
                values: Cow::Owned(two_values()),
                ..Default::default()
            },
        };
        assert_eq!(decode(&execute), Request::Execute(execute));

        let batch = Batch {
            statements: vec![
                BatchStatement::Query {
                    text: "INSERT INTO ks.t (a) VALUES (?)".into(),
                },
                BatchStatement::Prepared {
                    id: Bytes::from_static(&[9, 9]),
                },
            ],
            batch_type: BatchType::Unlogged,
            consistency: Consistency::EachQuorum,
            serial_consistency: Some(SerialConsistency::LocalSerial),
            values: vec![two_values(), SerializedValues::new()],
        };
        assert_eq!(decode(&batch), Request::Batch(batch));

        let mut options = HashMap::new();
        options.insert(Cow::Borrowed("CQL_VERSION"), Cow::Borrowed("3.0.0"));
        let startup = Startup { options };
        assert_eq!(decode(&startup), Request::Startup(startup));

        let register = Register {
            event_types_to_register_for: vec![EventType::TopologyChange, EventType::StatusChange],
        };
        assert_eq!(decode(&register), Request::Register(register));

        let prepare = Prepare {
            query: Cow::Borrowed("SELECT * FROM ks.t WHERE a = ?"),
        };
        assert_eq!(decode(&prepare), Request::Prepare(prepare));

        let auth = AuthResponse {
            response: Some(b"\0cassandra\0cassandra".to_vec()),
        };
        assert_eq!(decode(&auth), Request::AuthResponse(auth));
        assert_eq!(decode(&Options), Request::Options(Options));
    }

    #[test]
    fn deser_rejects_unknown_flags() {
        let query = Query {
            contents: Cow::Borrowed("SELECT 1"),
            parameters: QueryParameters::default(),
        };
        let mut buf = query.to_bytes().unwrap().to_vec();

        let mut rest = &buf[..];
        types::read_long_string(&mut rest).unwrap();
        types::read_consistency(&mut rest).unwrap();
        let flags_idx = buf.len() - rest.len();
        buf[flags_idx] |= 0x80;

        assert_matches!(
            Query::deserialize(&mut &buf[..]),
            Err(RequestDeserializationError::UnknownFlags { flags: 0x80 })
        );
    }

    #[test]
    fn opcode_dispatch_is_total() {
        for raw in [0x01u8, 0x05, 0x07, 0x09, 0x0A, 0x0B, 0x0D, 0x0F] {
            let opcode = RequestOpcode::try_from(raw).unwrap();
            assert_eq!(opcode as u8, raw);
        }
        assert!(RequestOpcode::try_from(0x02).is_err());
    }
}
