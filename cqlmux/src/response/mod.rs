//! What a request produces: the raw response of one attempt, and the typed
//! result handed back to callers once an operation is done.

use std::net::SocketAddr;
use std::sync::Arc;

use cqlmux_cql::frame::frame_errors::ParseError;
use cqlmux_cql::frame::response::event::SchemaChangeEvent;
use cqlmux_cql::frame::response::result::{self, ColumnSpec, ResultMetadata, Row, Rows};
use cqlmux_cql::frame::response::{NonErrorResponse, Response};
use cqlmux_cql::value::{Codec, NativeCodec};
use cqlmux_cql::ProtocolVersion;
use bytes::Bytes;
use itertools::Either;
use uuid::Uuid;

use crate::errors::{RequestAttemptError, UsageError};
use crate::execution::CommandState;

/// A response to a single request, with the frame extensions split off.
#[derive(Debug)]
pub(crate) struct QueryResponse {
    pub(crate) response: Response,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
}

pub(crate) struct NonErrorQueryResponse {
    pub(crate) response: NonErrorResponse,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
}

impl QueryResponse {
    pub(crate) fn into_non_error_query_response(
        self,
    ) -> Result<NonErrorQueryResponse, RequestAttemptError> {
        Ok(NonErrorQueryResponse {
            response: self.response.into_non_error_response()?,
            tracing_id: self.tracing_id,
            warnings: self.warnings,
        })
    }
}

impl NonErrorQueryResponse {
    pub(crate) fn into_query_result(self) -> Result<QueryResult, RequestAttemptError> {
        let result = match self.response {
            NonErrorResponse::Result(res) => res,
            other => {
                return Err(RequestAttemptError::UnexpectedResponse(
                    other.to_response_kind(),
                ))
            }
        };

        Ok(match result {
            result::Result::Void => QueryResult::Void,
            result::Result::Rows(rows) => QueryResult::Rows(RowsResult::new(rows)),
            result::Result::SetKeyspace(sk) => QueryResult::SetKeyspace(sk.keyspace_name),
            result::Result::SchemaChange(sc) => QueryResult::SchemaChange(sc.event),
            // PREPARE is answered through its own path.
            result::Result::Prepared(_) => {
                return Err(RequestAttemptError::UnexpectedResponse("RESULT::Prepared"))
            }
        })
    }
}

/// Result of a QUERY or EXECUTE.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum QueryResult {
    Rows(RowsResult),
    Void,
    SchemaChange(SchemaChangeEvent),
    SetKeyspace(String),
}

impl QueryResult {
    pub fn kind(&self) -> &'static str {
        match self {
            QueryResult::Rows(_) => "RESULT::Rows",
            QueryResult::Void => "RESULT::Void",
            QueryResult::SchemaChange(_) => "RESULT::SchemaChange",
            QueryResult::SetKeyspace(_) => "RESULT::SetKeyspace",
        }
    }

    pub fn into_rows(self) -> Result<RowsResult, UsageError> {
        match self {
            QueryResult::Rows(rows) => Ok(rows),
            other => Err(UsageError::NotARowsResult(other.kind())),
        }
    }
}

/// Rows returned by a statement.
///
/// Rows are decoded from the response frame while iterating, unless
/// [`RowsResult::buffer`] was called, after which they are held decoded.
#[derive(Debug, Clone)]
pub struct RowsResult {
    raw: Rows,
    buffered: Option<Arc<[Row]>>,
}

impl RowsResult {
    pub(crate) fn new(raw: Rows) -> Self {
        RowsResult {
            raw,
            buffered: None,
        }
    }

    /// Decodes every row now, so later iteration cannot fail.
    pub fn buffer(&mut self) -> Result<(), ParseError> {
        if self.buffered.is_none() {
            self.buffered = Some(self.raw.buffer_all()?.into());
        }
        Ok(())
    }

    pub fn is_buffered(&self) -> bool {
        self.buffered.is_some()
    }

    pub fn rows_count(&self) -> usize {
        self.raw.rows_count()
    }

    pub fn metadata(&self) -> &Arc<ResultMetadata> {
        &self.raw.metadata
    }

    pub fn column_specs(&self) -> &[ColumnSpec] {
        self.raw.metadata.col_specs()
    }

    pub fn paging_state(&self) -> Option<&Bytes> {
        self.raw.paging_state.as_ref()
    }

    pub fn rows(&self) -> impl Iterator<Item = Result<Row, ParseError>> + '_ {
        match &self.buffered {
            Some(rows) => Either::Left(rows.iter().cloned().map(Ok)),
            None => Either::Right(self.raw.iter()),
        }
    }
}

// Reads a column by name. `None` if the table has no such column or the cell
// is null.
pub(crate) fn column<T>(
    row: &Row,
    metadata: &ResultMetadata,
    name: &str,
    version: ProtocolVersion,
) -> Result<Option<T>, ParseError>
where
    NativeCodec: Codec<T>,
{
    let Some(index) = metadata.column_index(name) else {
        return Ok(None);
    };
    let Some(Some(cell)) = row.columns.get(index) else {
        return Ok(None);
    };
    let typ = &metadata.col_specs()[index].typ;
    NativeCodec
        .deserialize(Some(&cell[..]), typ, version)
        .map(Some)
        .map_err(|err| ParseError::BadIncomingData(format!("column {}: {}", name, err)))
}

/// The outcome of a logical operation along with how it was obtained.
#[derive(Debug, Clone)]
pub struct ExecutionReport<T = QueryResult> {
    pub result: T,
    pub tracing_id: Option<Uuid>,
    pub warnings: Vec<String>,
    /// Number of attempts made, including the successful one.
    pub attempts: usize,
    pub coordinator: SocketAddr,
    pub state: CommandState,
}

impl<T> ExecutionReport<T> {
    pub(crate) fn map<U>(self, f: impl FnOnce(T) -> U) -> ExecutionReport<U> {
        ExecutionReport {
            result: f(self.result),
            tracing_id: self.tracing_id,
            warnings: self.warnings,
            attempts: self.attempts,
            coordinator: self.coordinator,
            state: self.state,
        }
    }

    pub(crate) fn try_map<U, E>(
        self,
        f: impl FnOnce(T) -> Result<U, E>,
    ) -> Result<ExecutionReport<U>, E> {
        Ok(ExecutionReport {
            result: f(self.result)?,
            tracing_id: self.tracing_id,
            warnings: self.warnings,
            attempts: self.attempts,
            coordinator: self.coordinator,
            state: self.state,
        })
    }
}
