//! Server push notifications and the schema change payload shared with
//! `RESULT::SchemaChange`.

use crate::frame::frame_errors::ParseError;
use crate::frame::server_event_type::EventType;
use crate::frame::types;
use crate::ProtocolVersion;
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::enum_variant_names)]
pub enum Event {
    TopologyChange(TopologyChangeEvent),
    StatusChange(StatusChangeEvent),
    SchemaChange(SchemaChangeEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyChangeEvent {
    NewNode(SocketAddr),
    RemovedNode(SocketAddr),
    MovedNode(SocketAddr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChangeEvent {
    Up(SocketAddr),
    Down(SocketAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChangeType {
    Created,
    Updated,
    Dropped,
}

impl SchemaChangeType {
    fn parse(s: &str) -> Result<Self, ParseError> {
        match s {
            "CREATED" => Ok(Self::Created),
            "UPDATED" => Ok(Self::Updated),
            "DROPPED" => Ok(Self::Dropped),
            _ => Err(ParseError::UnknownEnumValue {
                what: "schema change type",
                value: s.to_owned(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Updated => "UPDATED",
            Self::Dropped => "DROPPED",
        }
    }
}

/// What a schema change touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChangeTarget {
    Keyspace,
    Table { name: String },
    Type { name: String },
    Function { name: String, arguments: Vec<String> },
    Aggregate { name: String, arguments: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChangeEvent {
    pub change_type: SchemaChangeType,
    pub keyspace: String,
    pub target: SchemaChangeTarget,
}

impl SchemaChangeEvent {
    /// Name of the affected table, type, function or aggregate; `None` for a
    /// keyspace level change.
    pub fn object_name(&self) -> Option<&str> {
        match &self.target {
            SchemaChangeTarget::Keyspace => None,
            SchemaChangeTarget::Table { name }
            | SchemaChangeTarget::Type { name }
            | SchemaChangeTarget::Function { name, .. }
            | SchemaChangeTarget::Aggregate { name, .. } => Some(name),
        }
    }

    pub fn deserialize(buf: &mut &[u8], version: ProtocolVersion) -> Result<Self, ParseError> {
        let change_type = SchemaChangeType::parse(types::read_string(buf)?)?;

        if version == ProtocolVersion::V2 {
            // <change><keyspace><table>, an empty table means the keyspace itself.
            let keyspace = types::read_string(buf)?.to_owned();
            let table = types::read_string(buf)?;
            let target = if table.is_empty() {
                SchemaChangeTarget::Keyspace
            } else {
                SchemaChangeTarget::Table {
                    name: table.to_owned(),
                }
            };
            return Ok(Self {
                change_type,
                keyspace,
                target,
            });
        }

        let target_kind = types::read_string(buf)?;
        let keyspace = types::read_string(buf)?.to_owned();
        let target = match target_kind {
            "KEYSPACE" => SchemaChangeTarget::Keyspace,
            "TABLE" => SchemaChangeTarget::Table {
                name: types::read_string(buf)?.to_owned(),
            },
            "TYPE" => SchemaChangeTarget::Type {
                name: types::read_string(buf)?.to_owned(),
            },
            "FUNCTION" => SchemaChangeTarget::Function {
                name: types::read_string(buf)?.to_owned(),
                arguments: types::read_string_list(buf)?,
            },
            "AGGREGATE" => SchemaChangeTarget::Aggregate {
                name: types::read_string(buf)?.to_owned(),
                arguments: types::read_string_list(buf)?,
            },
            other => {
                return Err(ParseError::UnknownEnumValue {
                    what: "schema change target",
                    value: other.to_owned(),
                })
            }
        };

        Ok(Self {
            change_type,
            keyspace,
            target,
        })
    }
}

impl Event {
    pub fn deserialize(buf: &mut &[u8], version: ProtocolVersion) -> Result<Self, ParseError> {
        let event_type: EventType = types::read_string(buf)?.parse()?;
        match event_type {
            EventType::TopologyChange => {
                Ok(Self::TopologyChange(TopologyChangeEvent::deserialize(buf)?))
            }
            EventType::StatusChange => Ok(Self::StatusChange(StatusChangeEvent::deserialize(buf)?)),
            EventType::SchemaChange => Ok(Self::SchemaChange(SchemaChangeEvent::deserialize(
                buf, version,
            )?)),
        }
    }
}

impl TopologyChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let type_of_change = types::read_string(buf)?;
        let addr = types::read_inet(buf)?;

        match type_of_change {
            "NEW_NODE" => Ok(Self::NewNode(addr)),
            "REMOVED_NODE" => Ok(Self::RemovedNode(addr)),
            "MOVED_NODE" => Ok(Self::MovedNode(addr)),
            _ => Err(ParseError::UnknownEnumValue {
                what: "topology change",
                value: type_of_change.to_string(),
            }),
        }
    }
}

impl StatusChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let type_of_change = types::read_string(buf)?;
        let addr = types::read_inet(buf)?;

        match type_of_change {
            "UP" => Ok(Self::Up(addr)),
            "DOWN" => Ok(Self::Down(addr)),
            _ => Err(ParseError::UnknownEnumValue {
                what: "status change",
                value: type_of_change.to_string(),
            }),
        }
    }
}
