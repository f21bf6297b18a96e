pub mod frame_errors;
pub mod request;
pub mod response;
pub mod server_event_type;
pub mod types;

use crate::frame::frame_errors::{CqlRequestSerializationError, FrameError};
use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use std::collections::HashMap;
use std::fmt::Display;

use request::SerializableRequest;
use response::ResponseOpcode;

// Frame flags
pub const FLAG_COMPRESSION: u8 = 0x01;
pub const FLAG_TRACING: u8 = 0x02;
pub const FLAG_CUSTOM_PAYLOAD: u8 = 0x04;
pub const FLAG_WARNING: u8 = 0x08;

const RESPONSE_BIT: u8 = 0x80;

// Servers refuse anything above 256MiB, so a bigger length means a corrupted stream.
const MAX_BODY_LENGTH: usize = 256 * 1024 * 1024;

/// Version of the native protocol spoken on a connection.
///
/// The version decides the header layout: protocol v2 uses a one byte stream
/// id (8 byte header, 128 streams), v3 and newer use two bytes (9 byte header,
/// 32768 streams).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ProtocolVersion {
    V2 = 2,
    V3 = 3,
    #[default]
    V4 = 4,
}

impl ProtocolVersion {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn header_size(self) -> usize {
        3 + self.stream_id_width() + 4
    }

    pub fn stream_id_width(self) -> usize {
        match self {
            ProtocolVersion::V2 => 1,
            ProtocolVersion::V3 | ProtocolVersion::V4 => 2,
        }
    }

    /// Number of requests that may be in flight on one connection at once.
    pub fn max_stream_count(self) -> usize {
        match self {
            ProtocolVersion::V2 => 128,
            ProtocolVersion::V3 | ProtocolVersion::V4 => 32768,
        }
    }

    pub fn supports_warnings(self) -> bool {
        self >= ProtocolVersion::V4
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(ProtocolVersion::V2),
            3 => Ok(ProtocolVersion::V3),
            4 => Ok(ProtocolVersion::V4),
            _ => Err(TryFromPrimitiveError {
                enum_name: "ProtocolVersion",
                primitive: value,
            }),
        }
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.as_u8())
    }
}

/// The wire protocol compression algorithm.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Compression {
    /// LZ4 compression algorithm.
    Lz4,
    /// Snappy compression algorithm.
    Snappy,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Lz4 => "lz4",
            Compression::Snappy => "snappy",
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request frame with its header already written.
///
/// The stream id is left empty; the connection fills it in with
/// [`SerializedRequest::set_stream`] right before the bytes hit the socket.
#[derive(Debug, Clone)]
pub struct SerializedRequest {
    version: ProtocolVersion,
    data: Vec<u8>,
}

impl SerializedRequest {
    pub fn make<R: SerializableRequest>(
        req: &R,
        version: ProtocolVersion,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<SerializedRequest, CqlRequestSerializationError> {
        let header_size = version.header_size();
        let mut flags = 0;
        let mut data = vec![0; header_size];

        if let Some(compression) = compression {
            flags |= FLAG_COMPRESSION;
            let body = req.to_bytes()?;
            compress_append(&body, compression, &mut data)?;
        } else {
            req.serialize(&mut data)?;
        }

        if tracing {
            flags |= FLAG_TRACING;
        }

        let opcode_pos = 2 + version.stream_id_width();
        data[0] = version.as_u8();
        data[1] = flags;
        data[opcode_pos] = R::OPCODE as u8;

        let body_len: u32 = (data.len() - header_size).try_into()?;
        data[opcode_pos + 1..header_size].copy_from_slice(&body_len.to_be_bytes());

        Ok(Self { version, data })
    }

    pub fn set_stream(&mut self, stream: i16) {
        match self.version.stream_id_width() {
            1 => self.data[2] = stream as i8 as u8,
            _ => self.data[2..4].copy_from_slice(&stream.to_be_bytes()),
        }
    }

    pub fn opcode(&self) -> u8 {
        self.data[2 + self.version.stream_id_width()]
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data[..]
    }
}

/// Parts of the frame header which are not determined by the request/response type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::default().as_u8(),
            flags: 0x00,
            stream: 0,
        }
    }
}

fn read_header_stream(buf: &mut &[u8], version: ProtocolVersion) -> i16 {
    match version.stream_id_width() {
        1 => buf.get_i8() as i16,
        _ => buf.get_i16(),
    }
}

/// Reads one response frame. The whole body is pulled into a single buffer;
/// row payloads inside it are decoded later, on demand.
pub async fn read_response_frame(
    reader: &mut (impl AsyncRead + Unpin),
    version: ProtocolVersion,
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameError> {
    let header_size = version.header_size();
    let mut raw_header = [0u8; 9];
    reader.read_exact(&mut raw_header[..header_size]).await?;

    let mut buf = &raw_header[..header_size];

    let raw_version = buf.get_u8();
    if raw_version & RESPONSE_BIT != RESPONSE_BIT {
        return Err(FrameError::FrameFromClient);
    }
    if raw_version & 0x7F != version.as_u8() {
        return Err(FrameError::VersionMismatch {
            expected: version.as_u8(),
            received: raw_version & 0x7F,
        });
    }

    let flags = buf.get_u8();
    let stream = read_header_stream(&mut buf, version);

    let frame_params = FrameParams {
        version: raw_version,
        flags,
        stream,
    };

    let opcode = ResponseOpcode::try_from(buf.get_u8())?;

    let length = buf.get_u32() as usize;
    if length > MAX_BODY_LENGTH {
        return Err(FrameError::FrameTooLarge(length));
    }

    let mut raw_body = Vec::with_capacity(length).limit(length);
    while raw_body.has_remaining_mut() {
        let n = reader.read_buf(&mut raw_body).await?;
        if n == 0 {
            // EOF, too early
            return Err(FrameError::ConnectionClosed(
                raw_body.remaining_mut(),
                length,
            ));
        }
    }

    Ok((frame_params, opcode, raw_body.into_inner().into()))
}

/// Response body with the optional leading sections (tracing id, warnings,
/// custom payload) split off.
#[derive(Debug)]
pub struct ResponseBodyWithExtensions {
    pub trace_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub body: Bytes,
    pub custom_payload: Option<HashMap<String, Bytes>>,
}

pub fn parse_response_body_extensions(
    flags: u8,
    compression: Option<Compression>,
    mut body: Bytes,
) -> Result<ResponseBodyWithExtensions, FrameError> {
    if flags & FLAG_COMPRESSION != 0 {
        if let Some(compression) = compression {
            body = decompress(&body, compression)?.into();
        } else {
            return Err(FrameError::NoCompressionNegotiated);
        }
    }

    let trace_id = if flags & FLAG_TRACING != 0 {
        let buf = &mut &*body;
        let trace_id = types::read_uuid(buf)?;
        body.advance(16);
        Some(trace_id)
    } else {
        None
    };

    let warnings = if flags & FLAG_WARNING != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let warnings = types::read_string_list(buf)?;
        let consumed = body_len - buf.len();
        body.advance(consumed);
        warnings
    } else {
        Vec::new()
    };

    let custom_payload = if flags & FLAG_CUSTOM_PAYLOAD != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let payload_map = types::read_bytes_map(buf)?;
        let consumed = body_len - buf.len();
        body.advance(consumed);
        Some(payload_map)
    } else {
        None
    };

    Ok(ResponseBodyWithExtensions {
        trace_id,
        warnings,
        body,
        custom_payload,
    })
}

pub(crate) fn compress_append(
    uncomp_body: &[u8],
    compression: Compression,
    out: &mut Vec<u8>,
) -> Result<(), CqlRequestSerializationError> {
    match compression {
        Compression::Lz4 => {
            let uncomp_len: u32 = uncomp_body.len().try_into()?;
            let tmp = lz4_flex::compress(uncomp_body);
            out.reserve_exact(std::mem::size_of::<u32>() + tmp.len());
            out.put_u32(uncomp_len);
            out.extend_from_slice(&tmp[..]);
            Ok(())
        }
        Compression::Snappy => {
            let old_size = out.len();
            out.resize(old_size + snap::raw::max_compress_len(uncomp_body.len()), 0);
            let compressed_size =
                snap::raw::Encoder::new().compress(uncomp_body, &mut out[old_size..])?;
            out.truncate(old_size + compressed_size);
            Ok(())
        }
    }
}

pub(crate) fn decompress(mut comp_body: &[u8], compression: Compression) -> Result<Vec<u8>, FrameError> {
    match compression {
        Compression::Lz4 => {
            if comp_body.len() < 4 {
                return Err(FrameError::FrameDecompression);
            }
            let uncomp_len = comp_body.get_u32() as usize;
            if uncomp_len > MAX_BODY_LENGTH {
                return Err(FrameError::FrameTooLarge(uncomp_len));
            }
            lz4_flex::decompress(comp_body, uncomp_len).map_err(|_| FrameError::FrameDecompression)
        }
        Compression::Snappy => snap::raw::Decoder::new()
            .decompress_vec(comp_body)
            .map_err(|_| FrameError::FrameDecompression),
    }
}

/// An error type for parsing an enum value from a primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No discriminant in enum `{enum_name}` matches the value `{primitive:?}`")]
pub struct TryFromPrimitiveError<T: Copy + std::fmt::Debug> {
    pub(crate) enum_name: &'static str,
    pub(crate) primitive: T,
}
