//! CQL binary protocol in-wire types.
//!
//! Readers take `&mut &[u8]` and advance it past what they consumed, writers
//! append to any [`BufMut`]. Everything is big-endian.

use super::frame_errors::LowLevelDeserializationError;
use super::TryFromPrimitiveError;
use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, Bytes};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum Consistency {
    Any = 0x0000,
    One = 0x0001,
    Two = 0x0002,
    Three = 0x0003,
    Quorum = 0x0004,
    All = 0x0005,
    #[default]
    LocalQuorum = 0x0006,
    EachQuorum = 0x0007,
    Serial = 0x0008,
    LocalSerial = 0x0009,
    LocalOne = 0x000A,
}

impl TryFrom<u16> for Consistency {
    type Error = TryFromPrimitiveError<u16>;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            0x0000 => Consistency::Any,
            0x0001 => Consistency::One,
            0x0002 => Consistency::Two,
            0x0003 => Consistency::Three,
            0x0004 => Consistency::Quorum,
            0x0005 => Consistency::All,
            0x0006 => Consistency::LocalQuorum,
            0x0007 => Consistency::EachQuorum,
            0x0008 => Consistency::Serial,
            0x0009 => Consistency::LocalSerial,
            0x000A => Consistency::LocalOne,
            _ => {
                return Err(TryFromPrimitiveError {
                    enum_name: "Consistency",
                    primitive: value,
                })
            }
        })
    }
}

impl Consistency {
    pub fn is_serial(&self) -> bool {
        matches!(self, Consistency::Serial | Consistency::LocalSerial)
    }
}

impl std::fmt::Display for Consistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Consistency of the Paxos phase of a lightweight transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum SerialConsistency {
    Serial = 0x0008,
    LocalSerial = 0x0009,
}

#[derive(Debug, Error)]
#[error("Expected Consistency Serial or LocalSerial, got: {0}")]
pub struct NonSerialConsistencyError(Consistency);

impl TryFrom<Consistency> for SerialConsistency {
    type Error = NonSerialConsistencyError;

    fn try_from(c: Consistency) -> Result<Self, Self::Error> {
        match c {
            Consistency::Serial => Ok(SerialConsistency::Serial),
            Consistency::LocalSerial => Ok(SerialConsistency::LocalSerial),
            other => Err(NonSerialConsistencyError(other)),
        }
    }
}

pub(crate) fn read_raw_bytes<'a>(
    count: usize,
    buf: &mut &'a [u8],
) -> Result<&'a [u8], LowLevelDeserializationError> {
    if buf.len() < count {
        return Err(LowLevelDeserializationError::TooFewBytesReceived {
            expected: count,
            received: buf.len(),
        });
    }
    let (ret, rest) = buf.split_at(count);
    *buf = rest;
    Ok(ret)
}

pub fn read_byte(buf: &mut &[u8]) -> Result<u8, LowLevelDeserializationError> {
    Ok(buf.read_u8()?)
}

pub fn read_int(buf: &mut &[u8]) -> Result<i32, LowLevelDeserializationError> {
    Ok(buf.read_i32::<BigEndian>()?)
}

pub fn write_int(v: i32, buf: &mut impl BufMut) {
    buf.put_i32(v);
}

pub fn read_int_length(buf: &mut &[u8]) -> Result<usize, LowLevelDeserializationError> {
    let v = read_int(buf)?;
    if v < 0 {
        return Err(LowLevelDeserializationError::InvalidValueLength(v));
    }
    Ok(v as usize)
}

pub(crate) fn write_int_length(
    v: usize,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    let v: i32 = v.try_into()?;
    write_int(v, buf);
    Ok(())
}

pub fn read_long(buf: &mut &[u8]) -> Result<i64, LowLevelDeserializationError> {
    Ok(buf.read_i64::<BigEndian>()?)
}

pub fn write_long(v: i64, buf: &mut impl BufMut) {
    buf.put_i64(v);
}

pub fn read_short(buf: &mut &[u8]) -> Result<u16, LowLevelDeserializationError> {
    Ok(buf.read_u16::<BigEndian>()?)
}

pub fn write_short(v: u16, buf: &mut impl BufMut) {
    buf.put_u16(v);
}

pub(crate) fn read_short_length(buf: &mut &[u8]) -> Result<usize, LowLevelDeserializationError> {
    Ok(read_short(buf)?.into())
}

pub(crate) fn write_short_length(
    v: usize,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    let v: u16 = v.try_into()?;
    write_short(v, buf);
    Ok(())
}

/// `[bytes]`: a negative length stands for null.
pub fn read_bytes_opt<'a>(
    buf: &mut &'a [u8],
) -> Result<Option<&'a [u8]>, LowLevelDeserializationError> {
    let len = read_int(buf)?;
    if len < 0 {
        return Ok(None);
    }
    Ok(Some(read_raw_bytes(len as usize, buf)?))
}

// Same as read_bytes_opt, but null is not expected
pub fn read_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], LowLevelDeserializationError> {
    let len = read_int_length(buf)?;
    read_raw_bytes(len, buf)
}

pub fn read_short_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    read_raw_bytes(len, buf)
}

pub fn write_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    write_int_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

pub fn write_bytes_opt(
    v: Option<impl AsRef<[u8]>>,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    match v {
        Some(bytes) => write_bytes(bytes.as_ref(), buf),
        None => {
            write_int(-1, buf);
            Ok(())
        }
    }
}

pub fn write_short_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

pub fn read_bytes_map(
    buf: &mut &[u8],
) -> Result<HashMap<String, Bytes>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut v = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = Bytes::copy_from_slice(read_bytes(buf)?);
        v.insert(key, val);
    }
    Ok(v)
}

pub fn write_bytes_map<B: AsRef<[u8]>>(
    v: &HashMap<String, B>,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    for (key, val) in v {
        write_string(key, buf)?;
        write_bytes(val.as_ref(), buf)?;
    }
    Ok(())
}

pub fn read_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let raw = read_raw_bytes(len, buf)?;
    Ok(str::from_utf8(raw)?)
}

pub fn write_string(v: &str, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    buf.put_slice(v.as_bytes());
    Ok(())
}

pub fn read_long_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, LowLevelDeserializationError> {
    let len = read_int_length(buf)?;
    let raw = read_raw_bytes(len, buf)?;
    Ok(str::from_utf8(raw)?)
}

pub fn write_long_string(v: &str, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    write_int_length(v.len(), buf)?;
    buf.put_slice(v.as_bytes());
    Ok(())
}

pub fn read_string_map(
    buf: &mut &[u8],
) -> Result<HashMap<String, String>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut v = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = read_string(buf)?.to_owned();
        v.insert(key, val);
    }
    Ok(v)
}

pub fn write_string_map(
    v: &HashMap<impl AsRef<str>, impl AsRef<str>>,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    for (key, val) in v {
        write_string(key.as_ref(), buf)?;
        write_string(val.as_ref(), buf)?;
    }
    Ok(())
}

pub fn read_string_list(buf: &mut &[u8]) -> Result<Vec<String>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut v = Vec::with_capacity(len);
    for _ in 0..len {
        v.push(read_string(buf)?.to_owned());
    }
    Ok(v)
}

pub fn write_string_list(
    v: &[String],
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    for s in v {
        write_string(s, buf)?;
    }
    Ok(())
}

pub fn read_string_multimap(
    buf: &mut &[u8],
) -> Result<HashMap<String, Vec<String>>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut v = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = read_string_list(buf)?;
        v.insert(key, val);
    }
    Ok(v)
}

pub fn write_string_multimap(
    v: &HashMap<String, Vec<String>>,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    for (key, val) in v {
        write_string(key, buf)?;
        write_string_list(val, buf)?;
    }
    Ok(())
}

/// `[uuid]`: 16 bytes in network (RFC 4122) order.
pub fn read_uuid(buf: &mut &[u8]) -> Result<Uuid, LowLevelDeserializationError> {
    let raw = read_raw_bytes(16, buf)?;
    let mut raw_array = [0u8; 16];
    raw_array.copy_from_slice(raw);
    Ok(Uuid::from_bytes(raw_array))
}

pub fn write_uuid(uuid: &Uuid, buf: &mut impl BufMut) {
    buf.put_slice(&uuid.as_bytes()[..]);
}

// Byte groups of a GUID that are stored in host order: time_low, time_mid, time_hi.
const GUID_HOST_ORDER_GROUPS: [(usize, usize); 3] = [(0, 4), (4, 6), (6, 8)];

fn reverse_host_order_groups(bytes: &mut [u8; 16]) {
    if cfg!(target_endian = "little") {
        for (start, end) in GUID_HOST_ORDER_GROUPS {
            bytes[start..end].reverse();
        }
    }
}

/// Converts a GUID laid out in host memory order (first three fields stored
/// as native integers) into the 16 bytes the protocol expects.
///
/// On little-endian hosts byte groups {0..3}, {4..5} and {6..7} are reversed;
/// on big-endian hosts the layouts already agree.
pub fn guid_to_network_order(host_layout: [u8; 16]) -> [u8; 16] {
    let mut bytes = host_layout;
    reverse_host_order_groups(&mut bytes);
    bytes
}

/// Inverse of [`guid_to_network_order`].
pub fn guid_from_network_order(network: [u8; 16]) -> [u8; 16] {
    let mut bytes = network;
    reverse_host_order_groups(&mut bytes);
    bytes
}

pub fn read_consistency(buf: &mut &[u8]) -> Result<Consistency, LowLevelDeserializationError> {
    let raw = read_short(buf)?;
    Consistency::try_from(raw).map_err(LowLevelDeserializationError::UnknownConsistency)
}

pub fn write_consistency(c: Consistency, buf: &mut impl BufMut) {
    write_short(c as u16, buf);
}

pub fn write_serial_consistency(c: SerialConsistency, buf: &mut impl BufMut) {
    write_short(c as u16, buf);
}

/// `[inet]`: address length, address bytes, then the port as `[int]`.
pub fn read_inet(buf: &mut &[u8]) -> Result<SocketAddr, LowLevelDeserializationError> {
    let len = read_byte(buf)?;
    let ip_addr = match len {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(read_raw_bytes(4, buf)?);
            IpAddr::from(octets)
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(read_raw_bytes(16, buf)?);
            IpAddr::from(octets)
        }
        v => return Err(LowLevelDeserializationError::InvalidInetLength(v)),
    };
    let port: u16 = read_int(buf)?.try_into()?;

    Ok(SocketAddr::new(ip_addr, port))
}

pub fn write_inet(addr: SocketAddr, buf: &mut impl BufMut) {
    match addr.ip() {
        IpAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(16);
            buf.put_slice(&v6.octets());
        }
    }

    write_int(addr.port() as i32, buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn type_int_and_long() {
        for val in [i32::MIN, -1, 0, 1, i32::MAX] {
            let mut buf = Vec::new();
            write_int(val, &mut buf);
            assert_eq!(read_int(&mut &buf[..]).unwrap(), val);
        }
        for val in [i64::MIN, -1, 0, 1, i64::MAX] {
            let mut buf = Vec::new();
            write_long(val, &mut buf);
            assert_eq!(read_long(&mut &buf[..]).unwrap(), val);
        }
    }

    #[test]
    fn strings_keep_the_rest_of_the_buffer() {
        let mut buf = Vec::new();
        write_string("kremówki", &mut buf).unwrap();
        write_long_string("", &mut buf).unwrap();
        buf.push(0xAA);

        let mut slice = &buf[..];
        assert_eq!(read_string(&mut slice).unwrap(), "kremówki");
        assert_eq!(read_long_string(&mut slice).unwrap(), "");
        assert_eq!(slice, &[0xAA]);
    }

    #[test]
    fn string_collections() {
        let list = vec!["".to_owned(), "CQL_VERSION".to_owned()];
        let mut buf = Vec::new();
        write_string_list(&list, &mut buf).unwrap();
        assert_eq!(read_string_list(&mut &buf[..]).unwrap(), list);

        let mut multimap = HashMap::new();
        multimap.insert("COMPRESSION".to_owned(), vec!["lz4".to_owned(), "snappy".to_owned()]);
        multimap.insert("empty".to_owned(), vec![]);
        let mut buf = Vec::new();
        write_string_multimap(&multimap, &mut buf).unwrap();
        assert_eq!(read_string_multimap(&mut &buf[..]).unwrap(), multimap);
    }

    #[test]
    fn null_bytes_use_minus_one_length() {
        let mut buf = Vec::new();
        write_bytes_opt(None::<&[u8]>, &mut buf).unwrap();
        assert_eq!(buf, [0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(read_bytes_opt(&mut &buf[..]).unwrap(), None);
        assert_matches!(
            read_bytes(&mut &buf[..]),
            Err(LowLevelDeserializationError::InvalidValueLength(-1))
        );

        let mut buf = Vec::new();
        write_bytes_opt(Some(&[][..]), &mut buf).unwrap();
        assert_eq!(read_bytes_opt(&mut &buf[..]).unwrap(), Some(&[][..]));
    }

    #[test]
    fn truncated_input_is_reported() {
        let mut buf = Vec::new();
        write_bytes(&[1, 2, 3, 4], &mut buf).unwrap();
        buf.truncate(6);
        assert_matches!(
            read_bytes(&mut &buf[..]),
            Err(LowLevelDeserializationError::TooFewBytesReceived {
                expected: 4,
                received: 2
            })
        );
        assert_matches!(
            read_int(&mut &[0u8, 1][..]),
            Err(LowLevelDeserializationError::IoError(_))
        );
    }

    #[test]
    fn uuid_is_written_in_network_order() {
        let u = Uuid::parse_str("f3b4958c-52a1-11e7-802a-010203040506").unwrap();
        let mut buf = Vec::new();
        write_uuid(&u, &mut buf);
        assert_eq!(buf[0], 0xf3);
        assert_eq!(buf[15], 0x06);
        assert_eq!(read_uuid(&mut &*buf).unwrap(), u);
    }

    #[test]
    fn guid_groups_follow_host_endianness() {
        let u = Uuid::new_v4();
        // to_bytes_le is the host layout of a GUID on little-endian machines.
        let host_layout = if cfg!(target_endian = "little") {
            u.to_bytes_le()
        } else {
            *u.as_bytes()
        };

        let network = guid_to_network_order(host_layout);
        assert_eq!(&network, u.as_bytes());
        assert_eq!(guid_from_network_order(network), host_layout);

        if cfg!(target_endian = "little") {
            assert_eq!(network[0..4], [host_layout[3], host_layout[2], host_layout[1], host_layout[0]]);
            assert_eq!(network[4..6], [host_layout[5], host_layout[4]]);
            assert_eq!(network[6..8], [host_layout[7], host_layout[6]]);
        }
        assert_eq!(network[8..], host_layout[8..]);
    }

    #[test]
    fn consistency_roundtrip_and_unknown_value() {
        let mut buf = Vec::new();
        write_consistency(Consistency::LocalOne, &mut buf);
        assert_eq!(buf, [0x00, 0x0A]);
        assert_eq!(read_consistency(&mut &*buf).unwrap(), Consistency::LocalOne);

        let err = read_consistency(&mut &[0x12u8, 0x34][..]).unwrap_err();
        assert!(err.to_string().contains(&0x1234.to_string()));
    }

    #[test]
    fn type_inet() {
        let iv4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9042);
        let iv6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 19042);
        for addr in [iv4, iv6] {
            let mut buf = Vec::new();
            write_inet(addr, &mut buf);
            assert_eq!(read_inet(&mut &*buf).unwrap(), addr);
        }
        assert_matches!(
            read_inet(&mut &[5u8, 1, 2, 3, 4, 5][..]),
            Err(LowLevelDeserializationError::InvalidInetLength(5))
        );
    }
}
