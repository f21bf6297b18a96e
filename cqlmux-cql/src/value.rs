//! Bound values and the per-type value codec capability.
//!
//! The frame layer treats values as opaque `[bytes]`. Turning a Rust value
//! into those bytes (and back) is the job of a [`Codec`]; the driver ships
//! [`NativeCodec`], which only covers what it needs to read the system tables
//! and to build partition keys.

use std::collections::HashMap;
use std::net::IpAddr;

use bytes::{BufMut, Bytes};
use thiserror::Error;
use uuid::Uuid;

use crate::frame::frame_errors::{CqlRequestSerializationError, LowLevelDeserializationError};
use crate::frame::response::result::ColumnType;
use crate::frame::types;
use crate::ProtocolVersion;

/// Values bound to a QUERY or EXECUTE, already serialized. `None` is a null.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerializedValues {
    values: Vec<Option<Bytes>>,
}

impl SerializedValues {
    pub const fn new() -> Self {
        SerializedValues { values: Vec::new() }
    }

    /// A const `SerializedValues` with no values.
    pub const EMPTY: &'static SerializedValues = &SerializedValues::new();

    pub fn add_raw(&mut self, value: Option<Bytes>) {
        self.values.push(value);
    }

    /// Serializes `value` as `typ` with the given codec and appends it.
    pub fn add_value<T, C: Codec<T> + ?Sized>(
        &mut self,
        codec: &C,
        value: &T,
        typ: &ColumnType,
        version: ProtocolVersion,
    ) -> Result<(), CodecError> {
        let serialized = codec.serialize(value, typ, version)?;
        self.values.push(serialized);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<&[u8]>> {
        self.values.iter().map(|v| v.as_deref())
    }

    pub fn get(&self, idx: usize) -> Option<Option<&[u8]>> {
        self.values.get(idx).map(|v| v.as_deref())
    }

    /// Writes `<n><value_1>...<value_n>` as found in QUERY, EXECUTE and BATCH.
    pub fn write_to_request(&self, buf: &mut impl BufMut) -> Result<(), CqlRequestSerializationError> {
        let count: u16 = self
            .values
            .len()
            .try_into()
            .map_err(|_| CqlRequestSerializationError::TooManyValues(self.values.len()))?;
        types::write_short(count, buf);
        for value in &self.values {
            types::write_bytes_opt(value.as_ref(), buf)?;
        }
        Ok(())
    }

    pub fn new_from_frame(buf: &mut &[u8]) -> Result<Self, LowLevelDeserializationError> {
        let count = types::read_short(buf)?;
        let values = (0..count)
            .map(|_| Ok(types::read_bytes_opt(buf)?.map(Bytes::copy_from_slice)))
            .collect::<Result<Vec<_>, LowLevelDeserializationError>>()?;
        Ok(SerializedValues { values })
    }
}

#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum CodecError {
    #[error("Rust type {rust_type} can't be mapped to CQL type {cql_type:?}")]
    TypeMismatch {
        rust_type: &'static str,
        cql_type: ColumnType,
    },
    #[error("Unexpected null value for non-nullable type {0}")]
    UnexpectedNull(&'static str),
    #[error("Expected {expected} bytes, got {received}")]
    BadLength { expected: usize, received: usize },
    #[error("Value is too large to be serialized")]
    ValueTooLarge,
    #[error("Malformed value: {0}")]
    Malformed(#[from] LowLevelDeserializationError),
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

/// Converts between Rust values and their CQL encoding.
pub trait Codec<T> {
    fn serialize(
        &self,
        value: &T,
        typ: &ColumnType,
        version: ProtocolVersion,
    ) -> Result<Option<Bytes>, CodecError>;

    fn deserialize(
        &self,
        bytes: Option<&[u8]>,
        typ: &ColumnType,
        version: ProtocolVersion,
    ) -> Result<T, CodecError>;
}

/// Codec for the native types the driver needs internally.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeCodec;

fn mismatch<T>(typ: &ColumnType) -> CodecError {
    CodecError::TypeMismatch {
        rust_type: std::any::type_name::<T>(),
        cql_type: typ.clone(),
    }
}

fn non_null<'a, T>(bytes: Option<&'a [u8]>) -> Result<&'a [u8], CodecError> {
    bytes.ok_or_else(|| CodecError::UnexpectedNull(std::any::type_name::<T>()))
}

fn exact_len(bytes: &[u8], expected: usize) -> Result<(), CodecError> {
    if bytes.len() != expected {
        return Err(CodecError::BadLength {
            expected,
            received: bytes.len(),
        });
    }
    Ok(())
}

impl Codec<String> for NativeCodec {
    fn serialize(
        &self,
        value: &String,
        typ: &ColumnType,
        _version: ProtocolVersion,
    ) -> Result<Option<Bytes>, CodecError> {
        match typ {
            ColumnType::Text | ColumnType::Ascii => {}
            _ => return Err(mismatch::<String>(typ)),
        }
        if typ == &ColumnType::Ascii && !value.is_ascii() {
            return Err(mismatch::<String>(typ));
        }
        Ok(Some(Bytes::copy_from_slice(value.as_bytes())))
    }

    fn deserialize(
        &self,
        bytes: Option<&[u8]>,
        typ: &ColumnType,
        _version: ProtocolVersion,
    ) -> Result<String, CodecError> {
        match typ {
            ColumnType::Text | ColumnType::Ascii => {}
            _ => return Err(mismatch::<String>(typ)),
        }
        let bytes = non_null::<String>(bytes)?;
        Ok(std::str::from_utf8(bytes)?.to_owned())
    }
}

impl Codec<i32> for NativeCodec {
    fn serialize(
        &self,
        value: &i32,
        typ: &ColumnType,
        _version: ProtocolVersion,
    ) -> Result<Option<Bytes>, CodecError> {
        if typ != &ColumnType::Int {
            return Err(mismatch::<i32>(typ));
        }
        Ok(Some(Bytes::copy_from_slice(&value.to_be_bytes())))
    }

    fn deserialize(
        &self,
        bytes: Option<&[u8]>,
        typ: &ColumnType,
        _version: ProtocolVersion,
    ) -> Result<i32, CodecError> {
        if typ != &ColumnType::Int {
            return Err(mismatch::<i32>(typ));
        }
        let mut bytes = non_null::<i32>(bytes)?;
        exact_len(bytes, 4)?;
        Ok(types::read_int(&mut bytes)?)
    }
}

/// `bigint`, `counter` and `timestamp`; the latter counts milliseconds since
/// the unix epoch.
impl Codec<i64> for NativeCodec {
    fn serialize(
        &self,
        value: &i64,
        typ: &ColumnType,
        _version: ProtocolVersion,
    ) -> Result<Option<Bytes>, CodecError> {
        match typ {
            ColumnType::BigInt | ColumnType::Counter | ColumnType::Timestamp => {}
            _ => return Err(mismatch::<i64>(typ)),
        }
        Ok(Some(Bytes::copy_from_slice(&value.to_be_bytes())))
    }

    fn deserialize(
        &self,
        bytes: Option<&[u8]>,
        typ: &ColumnType,
        _version: ProtocolVersion,
    ) -> Result<i64, CodecError> {
        match typ {
            ColumnType::BigInt | ColumnType::Counter | ColumnType::Timestamp => {}
            _ => return Err(mismatch::<i64>(typ)),
        }
        let mut bytes = non_null::<i64>(bytes)?;
        exact_len(bytes, 8)?;
        Ok(types::read_long(&mut bytes)?)
    }
}

impl Codec<Uuid> for NativeCodec {
    fn serialize(
        &self,
        value: &Uuid,
        typ: &ColumnType,
        _version: ProtocolVersion,
    ) -> Result<Option<Bytes>, CodecError> {
        match typ {
            ColumnType::Uuid | ColumnType::Timeuuid => {}
            _ => return Err(mismatch::<Uuid>(typ)),
        }
        let mut buf = Vec::with_capacity(16);
        types::write_uuid(value, &mut buf);
        Ok(Some(Bytes::from(buf)))
    }

    fn deserialize(
        &self,
        bytes: Option<&[u8]>,
        typ: &ColumnType,
        _version: ProtocolVersion,
    ) -> Result<Uuid, CodecError> {
        match typ {
            ColumnType::Uuid | ColumnType::Timeuuid => {}
            _ => return Err(mismatch::<Uuid>(typ)),
        }
        let mut bytes = non_null::<Uuid>(bytes)?;
        exact_len(bytes, 16)?;
        Ok(types::read_uuid(&mut bytes)?)
    }
}

impl Codec<IpAddr> for NativeCodec {
    fn serialize(
        &self,
        value: &IpAddr,
        typ: &ColumnType,
        _version: ProtocolVersion,
    ) -> Result<Option<Bytes>, CodecError> {
        if typ != &ColumnType::Inet {
            return Err(mismatch::<IpAddr>(typ));
        }
        let bytes = match value {
            IpAddr::V4(v4) => Bytes::copy_from_slice(&v4.octets()),
            IpAddr::V6(v6) => Bytes::copy_from_slice(&v6.octets()),
        };
        Ok(Some(bytes))
    }

    fn deserialize(
        &self,
        bytes: Option<&[u8]>,
        typ: &ColumnType,
        _version: ProtocolVersion,
    ) -> Result<IpAddr, CodecError> {
        if typ != &ColumnType::Inet {
            return Err(mismatch::<IpAddr>(typ));
        }
        let bytes = non_null::<IpAddr>(bytes)?;
        if let Ok(v4) = <[u8; 4]>::try_from(bytes) {
            return Ok(IpAddr::from(v4));
        }
        if let Ok(v6) = <[u8; 16]>::try_from(bytes) {
            return Ok(IpAddr::from(v6));
        }
        Err(CodecError::BadLength {
            expected: 16,
            received: bytes.len(),
        })
    }
}

impl Codec<Bytes> for NativeCodec {
    fn serialize(
        &self,
        value: &Bytes,
        typ: &ColumnType,
        _version: ProtocolVersion,
    ) -> Result<Option<Bytes>, CodecError> {
        if typ != &ColumnType::Blob {
            return Err(mismatch::<Bytes>(typ));
        }
        Ok(Some(value.clone()))
    }

    fn deserialize(
        &self,
        bytes: Option<&[u8]>,
        typ: &ColumnType,
        _version: ProtocolVersion,
    ) -> Result<Bytes, CodecError> {
        if typ != &ColumnType::Blob {
            return Err(mismatch::<Bytes>(typ));
        }
        Ok(Bytes::copy_from_slice(non_null::<Bytes>(bytes)?))
    }
}

// Collection sizes and element lengths are [short] before v3 and [int] after.
fn write_collection_len(
    len: usize,
    version: ProtocolVersion,
    buf: &mut Vec<u8>,
) -> Result<(), CodecError> {
    match version {
        ProtocolVersion::V2 => {
            let len: u16 = len.try_into().map_err(|_| CodecError::ValueTooLarge)?;
            types::write_short(len, buf);
        }
        _ => {
            let len: i32 = len.try_into().map_err(|_| CodecError::ValueTooLarge)?;
            types::write_int(len, buf);
        }
    }
    Ok(())
}

fn read_collection_len(buf: &mut &[u8], version: ProtocolVersion) -> Result<usize, CodecError> {
    Ok(match version {
        ProtocolVersion::V2 => types::read_short(buf)? as usize,
        _ => types::read_int_length(buf)?,
    })
}

fn read_element<'a>(buf: &mut &'a [u8], version: ProtocolVersion) -> Result<&'a [u8], CodecError> {
    let len = read_collection_len(buf, version)?;
    if buf.len() < len {
        return Err(CodecError::BadLength {
            expected: len,
            received: buf.len(),
        });
    }
    let (element, rest) = buf.split_at(len);
    *buf = rest;
    Ok(element)
}

impl Codec<HashMap<String, String>> for NativeCodec {
    fn serialize(
        &self,
        value: &HashMap<String, String>,
        typ: &ColumnType,
        version: ProtocolVersion,
    ) -> Result<Option<Bytes>, CodecError> {
        let ColumnType::Map(key_type, value_type) = typ else {
            return Err(mismatch::<HashMap<String, String>>(typ));
        };
        let mut buf = Vec::new();
        write_collection_len(value.len(), version, &mut buf)?;
        for (key, val) in value {
            for (item, item_type) in [(key, key_type), (val, value_type)] {
                let serialized =
                    <Self as Codec<String>>::serialize(self, item, item_type, version)?
                        .unwrap_or_default();
                write_collection_len(serialized.len(), version, &mut buf)?;
                buf.extend_from_slice(&serialized);
            }
        }
        Ok(Some(Bytes::from(buf)))
    }

    fn deserialize(
        &self,
        bytes: Option<&[u8]>,
        typ: &ColumnType,
        version: ProtocolVersion,
    ) -> Result<HashMap<String, String>, CodecError> {
        let ColumnType::Map(key_type, value_type) = typ else {
            return Err(mismatch::<HashMap<String, String>>(typ));
        };
        let Some(mut buf) = bytes else {
            return Ok(HashMap::new());
        };
        let count = read_collection_len(&mut buf, version)?;
        let mut out = HashMap::with_capacity(count.min(buf.len()));
        for _ in 0..count {
            let key = read_element(&mut buf, version)?;
            let val = read_element(&mut buf, version)?;
            out.insert(
                <Self as Codec<String>>::deserialize(self, Some(key), key_type, version)?,
                <Self as Codec<String>>::deserialize(self, Some(val), value_type, version)?,
            );
        }
        Ok(out)
    }
}

impl Codec<Vec<String>> for NativeCodec {
    fn serialize(
        &self,
        value: &Vec<String>,
        typ: &ColumnType,
        version: ProtocolVersion,
    ) -> Result<Option<Bytes>, CodecError> {
        let elem = match typ {
            ColumnType::List(elem) | ColumnType::Set(elem) => elem,
            _ => return Err(mismatch::<Vec<String>>(typ)),
        };
        let mut buf = Vec::new();
        write_collection_len(value.len(), version, &mut buf)?;
        for item in value {
            let serialized = <Self as Codec<String>>::serialize(self, item, elem, version)?;
            let serialized = serialized.unwrap_or_default();
            write_collection_len(serialized.len(), version, &mut buf)?;
            buf.extend_from_slice(&serialized);
        }
        Ok(Some(Bytes::from(buf)))
    }

    fn deserialize(
        &self,
        bytes: Option<&[u8]>,
        typ: &ColumnType,
        version: ProtocolVersion,
    ) -> Result<Vec<String>, CodecError> {
        let elem = match typ {
            ColumnType::List(elem) | ColumnType::Set(elem) => elem,
            _ => return Err(mismatch::<Vec<String>>(typ)),
        };
        // A null collection reads as empty.
        let Some(mut buf) = bytes else {
            return Ok(Vec::new());
        };
        let count = read_collection_len(&mut buf, version)?;
        let mut out = Vec::with_capacity(count.min(buf.len()));
        for _ in 0..count {
            let item = read_element(&mut buf, version)?;
            out.push(<Self as Codec<String>>::deserialize(
                self,
                Some(item),
                elem,
                version,
            )?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::net::Ipv4Addr;

    #[test]
    fn serialized_values_frame_layout() {
        let mut values = SerializedValues::new();
        values.add_raw(Some(Bytes::from_static(&[1, 2])));
        values.add_raw(None);

        let mut buf = Vec::new();
        values.write_to_request(&mut buf).unwrap();
        assert_eq!(buf, vec![0, 2, 0, 0, 0, 2, 1, 2, 0xff, 0xff, 0xff, 0xff]);

        let decoded = SerializedValues::new_from_frame(&mut &buf[..]).unwrap();
        assert_eq!(decoded, values);
        assert_eq!(decoded.get(1), Some(None));
    }

    #[test]
    fn native_codec_rejects_wrong_column_type() {
        let res = NativeCodec.serialize(&7_i32, &ColumnType::Text, ProtocolVersion::V4);
        assert_matches!(res, Err(CodecError::TypeMismatch { .. }));

        let res: Result<String, _> =
            NativeCodec.deserialize(None, &ColumnType::Text, ProtocolVersion::V4);
        assert_matches!(res, Err(CodecError::UnexpectedNull(_)));
    }

    #[test]
    fn inet_accepts_both_families() {
        let v4: IpAddr = NativeCodec
            .deserialize(Some(&[10, 0, 0, 1][..]), &ColumnType::Inet, ProtocolVersion::V4)
            .unwrap();
        assert_eq!(v4, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));

        let res: Result<IpAddr, _> =
            NativeCodec.deserialize(Some(&[1, 2, 3][..]), &ColumnType::Inet, ProtocolVersion::V4);
        assert_matches!(res, Err(CodecError::BadLength { received: 3, .. }));
    }

    #[test]
    fn timestamps_and_text_maps() {
        let started_at: i64 = NativeCodec
            .deserialize(
                Some(&1_700_000_000_123_i64.to_be_bytes()[..]),
                &ColumnType::Timestamp,
                ProtocolVersion::V4,
            )
            .unwrap();
        assert_eq!(started_at, 1_700_000_000_123);

        let typ = ColumnType::Map(Box::new(ColumnType::Text), Box::new(ColumnType::Text));
        let parameters = HashMap::from([
            ("consistency_level".to_owned(), "ONE".to_owned()),
            ("page_size".to_owned(), "5000".to_owned()),
        ]);
        let serialized = NativeCodec
            .serialize(&parameters, &typ, ProtocolVersion::V4)
            .unwrap();
        let back: HashMap<String, String> = NativeCodec
            .deserialize(serialized.as_deref(), &typ, ProtocolVersion::V4)
            .unwrap();
        assert_eq!(back, parameters);

        let truncated: Result<HashMap<String, String>, _> = NativeCodec.deserialize(
            Some(&[0, 0, 0, 1, 0, 0, 0, 9, b'k'][..]),
            &typ,
            ProtocolVersion::V4,
        );
        assert_matches!(truncated, Err(CodecError::BadLength { expected: 9, .. }));
    }

    #[test]
    fn text_set_element_lengths_depend_on_version() {
        let tokens = vec!["-42".to_owned(), "17".to_owned()];
        let typ = ColumnType::Set(Box::new(ColumnType::Text));

        let v2 = NativeCodec
            .serialize(&tokens, &typ, ProtocolVersion::V2)
            .unwrap()
            .unwrap();
        assert_eq!(&v2[..], b"\x00\x02\x00\x03-42\x00\x0217");

        let v4 = NativeCodec
            .serialize(&tokens, &typ, ProtocolVersion::V4)
            .unwrap()
            .unwrap();
        assert_eq!(v4.len(), 4 + (4 + 3) + (4 + 2));
        let back: Vec<String> = NativeCodec
            .deserialize(Some(&v4[..]), &typ, ProtocolVersion::V4)
            .unwrap();
        assert_eq!(back, tokens);
    }
}
