//! CQL protocol-level representation of a `BATCH` request (protocol v3+ layout).

use std::borrow::Cow;

use bytes::{BufMut, Bytes};

use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types::{self, SerialConsistency};
use crate::value::SerializedValues;

use super::{DeserializableRequest, RequestDeserializationError};

// Batch flags
const FLAG_WITH_SERIAL_CONSISTENCY: u8 = 0x10;
const FLAG_WITH_DEFAULT_TIMESTAMP: u8 = 0x20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<'b> {
    pub statements: Vec<BatchStatement<'b>>,
    pub batch_type: BatchType,
    pub consistency: types::Consistency,
    pub serial_consistency: Option<SerialConsistency>,
    /// One value list per statement, in statement order.
    pub values: Vec<SerializedValues>,
}

/// The type of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BatchType {
    Logged = 0,
    Unlogged = 1,
    Counter = 2,
}

impl TryFrom<u8> for BatchType {
    type Error = RequestDeserializationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Logged),
            1 => Ok(Self::Unlogged),
            2 => Ok(Self::Counter),
            _ => Err(RequestDeserializationError::BadBatchType(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchStatement<'a> {
    Query { text: Cow<'a, str> },
    Prepared { id: Bytes },
}

impl BatchStatement<'_> {
    fn serialize(&self, buf: &mut impl BufMut) -> Result<(), CqlRequestSerializationError> {
        match self {
            Self::Query { text } => {
                buf.put_u8(0);
                types::write_long_string(text, buf)?;
            }
            Self::Prepared { id } => {
                buf.put_u8(1);
                types::write_short_bytes(id, buf)?;
            }
        }
        Ok(())
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        match types::read_byte(buf)? {
            0 => Ok(Self::Query {
                text: Cow::Owned(types::read_long_string(buf)?.to_owned()),
            }),
            1 => Ok(Self::Prepared {
                id: Bytes::copy_from_slice(types::read_short_bytes(buf)?),
            }),
            kind => Err(RequestDeserializationError::UnexpectedBatchStatementKind(kind)),
        }
    }
}

impl SerializableRequest for Batch<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Batch;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        buf.put_u8(self.batch_type as u8);

        let count: u16 = self.statements.len().try_into()?;
        types::write_short(count, buf);

        let empty = SerializedValues::new();
        for (idx, statement) in self.statements.iter().enumerate() {
            statement.serialize(buf)?;
            self.values.get(idx).unwrap_or(&empty).write_to_request(buf)?;
        }

        types::write_consistency(self.consistency, buf);

        let mut flags = 0;
        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }
        buf.put_u8(flags);

        if let Some(serial_consistency) = self.serial_consistency {
            types::write_serial_consistency(serial_consistency, buf);
        }

        Ok(())
    }
}

impl DeserializableRequest for Batch<'_> {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        let batch_type = BatchType::try_from(types::read_byte(buf)?)?;

        let count = types::read_short(buf)? as usize;
        let mut statements = Vec::with_capacity(count);
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            statements.push(BatchStatement::deserialize(buf)?);
            values.push(SerializedValues::new_from_frame(buf)?);
        }

        let consistency = types::read_consistency(buf)?;
        let flags = types::read_byte(buf)?;
        let serial_consistency = if flags & FLAG_WITH_SERIAL_CONSISTENCY != 0 {
            let consistency = types::read_consistency(buf)?;
            Some(
                SerialConsistency::try_from(consistency).map_err(|_| {
                    RequestDeserializationError::ExpectedSerialConsistency(consistency)
                })?,
            )
        } else {
            None
        };
        if flags & FLAG_WITH_DEFAULT_TIMESTAMP != 0 {
            types::read_long(buf)?;
        }

        Ok(Self {
            statements,
            batch_type,
            consistency,
            serial_consistency,
            values,
        })
    }
}
