//! RESULT responses: Void, Rows, SetKeyspace, Prepared and SchemaChange.

use crate::frame::frame_errors::ParseError;
use crate::frame::response::event::SchemaChangeEvent;
use crate::frame::types;
use crate::ProtocolVersion;
use bytes::Bytes;
use std::result::Result as StdResult;
use std::sync::Arc;

// Result metadata flags
const FLAG_GLOBAL_TABLES_SPEC: i32 = 0x0001;
const FLAG_HAS_MORE_PAGES: i32 = 0x0002;
const FLAG_NO_METADATA: i32 = 0x0004;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

#[derive(Debug, Clone)]
pub struct Prepared {
    pub id: Bytes,
    pub prepared_metadata: PreparedMetadata,
    pub result_metadata: Arc<ResultMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    pub event: SchemaChangeEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableSpec {
    pub ks_name: String,
    pub table_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Custom(String),
    Ascii,
    Boolean,
    Blob,
    Counter,
    Date,
    Decimal,
    Double,
    Duration,
    Float,
    Int,
    BigInt,
    Text,
    Timestamp,
    Inet,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    UserDefinedType {
        type_name: String,
        keyspace: String,
        field_types: Vec<(String, ColumnType)>,
    },
    SmallInt,
    TinyInt,
    Time,
    Timeuuid,
    Tuple(Vec<ColumnType>),
    Uuid,
    Varint,
}

impl ColumnType {
    pub fn deserialize(buf: &mut &[u8]) -> StdResult<ColumnType, ParseError> {
        use ColumnType::*;
        let id = types::read_short(buf)?;
        Ok(match id {
            0x0000 => {
                let type_str = types::read_string(buf)?;
                match type_str {
                    "org.apache.cassandra.db.marshal.DurationType" => Duration,
                    _ => Custom(type_str.to_owned()),
                }
            }
            0x0001 => Ascii,
            0x0002 => BigInt,
            0x0003 => Blob,
            0x0004 => Boolean,
            0x0005 => Counter,
            0x0006 => Decimal,
            0x0007 => Double,
            0x0008 => Float,
            0x0009 => Int,
            // 0x000A is the old `text` alias of varchar
            0x000A | 0x000D => Text,
            0x000B => Timestamp,
            0x000C => Uuid,
            0x000E => Varint,
            0x000F => Timeuuid,
            0x0010 => Inet,
            0x0011 => Date,
            0x0012 => Time,
            0x0013 => SmallInt,
            0x0014 => TinyInt,
            0x0015 => Duration,
            0x0020 => List(Box::new(ColumnType::deserialize(buf)?)),
            0x0021 => Map(
                Box::new(ColumnType::deserialize(buf)?),
                Box::new(ColumnType::deserialize(buf)?),
            ),
            0x0022 => Set(Box::new(ColumnType::deserialize(buf)?)),
            0x0030 => {
                let keyspace = types::read_string(buf)?.to_owned();
                let type_name = types::read_string(buf)?.to_owned();
                let fields_size = types::read_short(buf)? as usize;

                let mut field_types = Vec::with_capacity(fields_size);
                for _ in 0..fields_size {
                    let field_name = types::read_string(buf)?.to_owned();
                    let field_type = ColumnType::deserialize(buf)?;
                    field_types.push((field_name, field_type));
                }

                UserDefinedType {
                    type_name,
                    keyspace,
                    field_types,
                }
            }
            0x0031 => {
                let len = types::read_short(buf)? as usize;
                let mut types = Vec::with_capacity(len);
                for _ in 0..len {
                    types.push(ColumnType::deserialize(buf)?);
                }
                Tuple(types)
            }
            id => return Err(ParseError::TypeNotImplemented(id)),
        })
    }

    /// Option id of the type, the inverse of [`ColumnType::deserialize`] for
    /// the type's leading short.
    pub fn type_id(&self) -> u16 {
        use ColumnType::*;
        match self {
            Custom(_) => 0x0000,
            Ascii => 0x0001,
            BigInt => 0x0002,
            Blob => 0x0003,
            Boolean => 0x0004,
            Counter => 0x0005,
            Decimal => 0x0006,
            Double => 0x0007,
            Float => 0x0008,
            Int => 0x0009,
            Timestamp => 0x000B,
            Uuid => 0x000C,
            Text => 0x000D,
            Varint => 0x000E,
            Timeuuid => 0x000F,
            Inet => 0x0010,
            Date => 0x0011,
            Time => 0x0012,
            SmallInt => 0x0013,
            TinyInt => 0x0014,
            Duration => 0x0015,
            List(_) => 0x0020,
            Map(_, _) => 0x0021,
            Set(_) => 0x0022,
            UserDefinedType { .. } => 0x0030,
            Tuple(_) => 0x0031,
        }
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) -> StdResult<(), std::num::TryFromIntError> {
        types::write_short(self.type_id(), buf);
        match self {
            ColumnType::Custom(name) => types::write_string(name, buf)?,
            ColumnType::List(elem) | ColumnType::Set(elem) => elem.serialize(buf)?,
            ColumnType::Map(key, value) => {
                key.serialize(buf)?;
                value.serialize(buf)?;
            }
            ColumnType::UserDefinedType {
                type_name,
                keyspace,
                field_types,
            } => {
                types::write_string(keyspace, buf)?;
                types::write_string(type_name, buf)?;
                types::write_short(field_types.len().try_into()?, buf);
                for (name, typ) in field_types {
                    types::write_string(name, buf)?;
                    typ.serialize(buf)?;
                }
            }
            ColumnType::Tuple(elems) => {
                types::write_short(elems.len().try_into()?, buf);
                for typ in elems {
                    typ.serialize(buf)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub table_spec: TableSpec,
    pub name: String,
    pub typ: ColumnType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultMetadata {
    pub col_count: usize,
    pub col_specs: Vec<ColumnSpec>,
}

impl ResultMetadata {
    pub fn mock_empty() -> Self {
        Self::default()
    }

    pub fn col_count(&self) -> usize {
        self.col_count
    }

    pub fn col_specs(&self) -> &[ColumnSpec] {
        &self.col_specs
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.col_specs.iter().position(|spec| spec.name == name)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PartitionKeyIndex {
    /// index in the serialized values
    pub index: u16,
    /// sequence number in partition key
    pub sequence: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreparedMetadata {
    pub flags: i32,
    pub col_count: usize,
    /// Sorted by `index`; `sequence` gives the position inside the partition
    /// key. Empty before protocol v4, which does not report them.
    pub pk_indexes: Vec<PartitionKeyIndex>,
    pub col_specs: Vec<ColumnSpec>,
}

/// One row of a RESULT::Rows, as raw cells. `None` is a null cell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    pub columns: Vec<Option<Bytes>>,
}

/// A RESULT::Rows body. Rows stay encoded inside the frame buffer until
/// iterated.
#[derive(Debug, Clone)]
pub struct Rows {
    pub metadata: Arc<ResultMetadata>,
    pub paging_state: Option<Bytes>,
    pub rows_count: usize,
    raw_rows: Bytes,
}

impl Rows {
    pub fn rows_count(&self) -> usize {
        self.rows_count
    }

    /// Size in bytes of the encoded row data.
    pub fn serialized_size(&self) -> usize {
        self.raw_rows.len()
    }

    /// Iterates over the rows, decoding each one only when it is reached.
    pub fn iter(&self) -> RowIterator {
        RowIterator {
            remaining: self.rows_count,
            col_count: self.metadata.col_count,
            data: self.raw_rows.clone(),
        }
    }

    /// Decodes all rows at once; fails on the first malformed row.
    pub fn buffer_all(&self) -> StdResult<Vec<Row>, ParseError> {
        self.iter().collect()
    }
}

/// Lazily decodes rows from a shared frame buffer. Cells are zero-copy
/// slices of that buffer.
#[derive(Debug, Clone)]
pub struct RowIterator {
    remaining: usize,
    col_count: usize,
    data: Bytes,
}

impl RowIterator {
    fn read_row(&mut self) -> StdResult<Row, ParseError> {
        let mut buf = &self.data[..];
        let mut columns = Vec::with_capacity(self.col_count);
        for _ in 0..self.col_count {
            let cell = types::read_bytes_opt(&mut buf)?;
            columns.push(cell.map(|slice| self.data.slice_ref(slice)));
        }
        let consumed = self.data.len() - buf.len();
        self.data = self.data.slice(consumed..);
        Ok(Row { columns })
    }
}

impl Iterator for RowIterator {
    type Item = StdResult<Row, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let row = self.read_row();
        if row.is_err() {
            // The rest of the buffer can't be trusted after a decoding failure.
            self.remaining = 0;
        }
        Some(row)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

#[derive(Debug, Clone)]
pub enum Result {
    Void,
    Rows(Rows),
    SetKeyspace(SetKeyspace),
    Prepared(Prepared),
    SchemaChange(SchemaChange),
}

fn deser_table_spec(buf: &mut &[u8]) -> StdResult<TableSpec, ParseError> {
    let ks_name = types::read_string(buf)?.to_owned();
    let table_name = types::read_string(buf)?.to_owned();
    Ok(TableSpec {
        ks_name,
        table_name,
    })
}

fn deser_col_specs(
    buf: &mut &[u8],
    global_table_spec: Option<TableSpec>,
    col_count: usize,
) -> StdResult<Vec<ColumnSpec>, ParseError> {
    let mut col_specs = Vec::with_capacity(col_count);
    for _ in 0..col_count {
        let table_spec = match &global_table_spec {
            Some(spec) => spec.clone(),
            None => deser_table_spec(buf)?,
        };
        let name = types::read_string(buf)?.to_owned();
        let typ = ColumnType::deserialize(buf)?;
        col_specs.push(ColumnSpec {
            table_spec,
            name,
            typ,
        });
    }
    Ok(col_specs)
}

fn deser_result_metadata(
    buf: &mut &[u8],
) -> StdResult<(ResultMetadata, Option<Bytes>), ParseError> {
    let flags = types::read_int(buf)?;
    let global_tables_spec = flags & FLAG_GLOBAL_TABLES_SPEC != 0;
    let has_more_pages = flags & FLAG_HAS_MORE_PAGES != 0;
    let no_metadata = flags & FLAG_NO_METADATA != 0;

    let col_count = types::read_int_length(buf)?;

    let paging_state = has_more_pages
        .then(|| types::read_bytes(buf).map(Bytes::copy_from_slice))
        .transpose()?;

    let col_specs = if no_metadata {
        vec![]
    } else {
        let global_table_spec = global_tables_spec
            .then(|| deser_table_spec(buf))
            .transpose()?;

        deser_col_specs(buf, global_table_spec, col_count)?
    };

    Ok((
        ResultMetadata {
            col_count,
            col_specs,
        },
        paging_state,
    ))
}

fn deser_prepared_metadata(
    buf: &mut &[u8],
    version: ProtocolVersion,
) -> StdResult<PreparedMetadata, ParseError> {
    let flags = types::read_int(buf)?;
    let global_tables_spec = flags & FLAG_GLOBAL_TABLES_SPEC != 0;

    let col_count = types::read_int_length(buf)?;

    let mut pk_indexes = Vec::new();
    if version >= ProtocolVersion::V4 {
        let pk_count = types::read_int_length(buf)?;
        pk_indexes.reserve(pk_count);
        for i in 0..pk_count {
            pk_indexes.push(PartitionKeyIndex {
                index: types::read_short(buf)?,
                sequence: i as u16,
            });
        }
        pk_indexes.sort_unstable_by_key(|pki| pki.index);
    }

    let global_table_spec = global_tables_spec
        .then(|| deser_table_spec(buf))
        .transpose()?;

    let col_specs = deser_col_specs(buf, global_table_spec, col_count)?;

    Ok(PreparedMetadata {
        flags,
        col_count,
        pk_indexes,
        col_specs,
    })
}

fn deser_rows(
    buf_bytes: Bytes,
    cached_metadata: Option<&Arc<ResultMetadata>>,
) -> StdResult<Rows, ParseError> {
    let buf = &mut &*buf_bytes;
    let (server_metadata, paging_state) = deser_result_metadata(buf)?;

    let metadata = match cached_metadata {
        Some(cached) if server_metadata.col_specs.is_empty() => Arc::clone(cached),
        _ => {
            if server_metadata.col_count != server_metadata.col_specs.len() {
                return Err(ParseError::BadIncomingData(format!(
                    "Rows metadata announces {} columns but describes {}",
                    server_metadata.col_count,
                    server_metadata.col_specs.len()
                )));
            }
            Arc::new(server_metadata)
        }
    };

    let rows_count = types::read_int_length(buf)?;
    let raw_rows = buf_bytes.slice_ref(buf);

    Ok(Rows {
        metadata,
        paging_state,
        rows_count,
        raw_rows,
    })
}

fn deser_prepared(
    buf: &mut &[u8],
    version: ProtocolVersion,
) -> StdResult<Prepared, ParseError> {
    let id = Bytes::copy_from_slice(types::read_short_bytes(buf)?);
    let prepared_metadata = deser_prepared_metadata(buf, version)?;
    let (result_metadata, paging_state) = deser_result_metadata(buf)?;
    if paging_state.is_some() {
        return Err(ParseError::BadIncomingData(
            "Prepared result metadata must not carry a paging state".to_owned(),
        ));
    }

    Ok(Prepared {
        id,
        prepared_metadata,
        result_metadata: Arc::new(result_metadata),
    })
}

pub fn deserialize(
    buf_bytes: Bytes,
    version: ProtocolVersion,
    cached_metadata: Option<&Arc<ResultMetadata>>,
) -> StdResult<Result, ParseError> {
    let buf = &mut &*buf_bytes;
    use self::Result::*;
    Ok(match types::read_int(buf)? {
        0x0001 => Void,
        0x0002 => Rows(deser_rows(buf_bytes.slice_ref(buf), cached_metadata)?),
        0x0003 => SetKeyspace(self::SetKeyspace {
            keyspace_name: types::read_string(buf)?.to_string(),
        }),
        0x0004 => Prepared(deser_prepared(buf, version)?),
        0x0005 => SchemaChange(self::SchemaChange {
            event: SchemaChangeEvent::deserialize(buf, version)?,
        }),
        id => return Err(ParseError::UnknownResultKind(id)),
    })
}
