use std::collections::HashMap;
use std::net::IpAddr;

use cqlmux_cql::frame::frame_errors::ParseError;
use cqlmux_cql::ProtocolVersion;
use itertools::Itertools;
use uuid::Uuid;

use crate::response::{column, RowsResult};

/// Tracing info retrieved from `system_traces.sessions`
/// with all events from `system_traces.events`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingInfo {
    pub client: Option<IpAddr>,
    pub command: Option<String>,
    pub coordinator: Option<IpAddr>,
    /// Microseconds the coordinator spent on the request.
    pub duration: Option<i32>,
    pub parameters: Option<HashMap<String, String>>,
    pub request: Option<String>,
    /// Milliseconds since the unix epoch.
    pub started_at: Option<i64>,

    pub events: Vec<TracingEvent>,
}

/// A single event happening during a traced query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingEvent {
    pub event_id: Uuid,
    pub activity: Option<String>,
    pub source: Option<IpAddr>,
    pub source_elapsed: Option<i32>,
    pub thread: Option<String>,
}

impl TracingInfo {
    /// Returns a list of unique nodes involved in the query
    pub fn nodes(&self) -> Vec<IpAddr> {
        self.events
            .iter()
            .filter_map(|e| e.source)
            .unique()
            .collect()
    }
}

pub(crate) const TRACES_SESSION_QUERY_STR: &str =
    "SELECT client, command, coordinator, duration, parameters, request, started_at \
    FROM system_traces.sessions WHERE session_id = ?";

pub(crate) const TRACES_EVENTS_QUERY_STR: &str =
    "SELECT event_id, activity, source, source_elapsed, thread \
    FROM system_traces.events WHERE session_id = ?";

/// Assembles the trace out of the rows of both tables. `None` while the
/// trace has not fully reached the node that answered: no session row yet,
/// or no events.
pub(crate) fn tracing_info_from_rows(
    session_rows: &RowsResult,
    event_rows: &RowsResult,
    version: ProtocolVersion,
) -> Result<Option<TracingInfo>, ParseError> {
    let Some(row) = session_rows.rows().next().transpose()? else {
        return Ok(None);
    };
    let metadata = session_rows.metadata();
    let mut info = TracingInfo {
        client: column(&row, metadata, "client", version)?,
        command: column(&row, metadata, "command", version)?,
        coordinator: column(&row, metadata, "coordinator", version)?,
        duration: column(&row, metadata, "duration", version)?,
        parameters: column(&row, metadata, "parameters", version)?,
        request: column(&row, metadata, "request", version)?,
        started_at: column(&row, metadata, "started_at", version)?,
        events: Vec::new(),
    };

    let metadata = event_rows.metadata();
    for row in event_rows.rows() {
        let row = row?;
        let event_id = column(&row, metadata, "event_id", version)?.ok_or_else(|| {
            ParseError::BadIncomingData("system_traces.events row without event_id".to_owned())
        })?;
        info.events.push(TracingEvent {
            event_id,
            activity: column(&row, metadata, "activity", version)?,
            source: column(&row, metadata, "source", version)?,
            source_elapsed: column(&row, metadata, "source_elapsed", version)?,
            thread: column(&row, metadata, "thread", version)?,
        });
    }

    if info.events.is_empty() {
        return Ok(None);
    }
    Ok(Some(info))
}
