//! Defines the [`Statement`] type, the unit of work handed to a
//! [`Session`](crate::client::session::Session).

use std::borrow::Cow;

use bytes::Bytes;
use cqlmux_cql::frame::request::query::QueryParameters;
use cqlmux_cql::value::{Codec, CodecError, SerializedValues};
use cqlmux_cql::frame::response::result::ColumnType;
use cqlmux_cql::{Consistency, ProtocolVersion, SerialConsistency};
use tokio_util::sync::CancellationToken;

use crate::routing::PartitionKey;

/// A CQL statement along with everything needed to run it once.
///
/// Statements are cheap to clone; the bound values are cloned with them.
#[derive(Debug, Clone)]
pub struct Statement {
    /// The CQL statement text.
    pub contents: String,
    values: SerializedValues,
    partition_key: Option<PartitionKey>,
    consistency: Consistency,
    serial_consistency: Option<SerialConsistency>,
    page_size: Option<i32>,
    load: usize,
    tracing: bool,
    buffer_rows: Option<bool>,
    cancellation: Option<CancellationToken>,
    prepared: bool,
}

impl Statement {
    /// Creates a new [`Statement`] from a CQL statement string.
    pub fn new(contents: impl Into<String>) -> Self {
        Statement {
            contents: contents.into(),
            values: SerializedValues::new(),
            partition_key: None,
            consistency: Consistency::default(),
            serial_consistency: None,
            page_size: None,
            load: 1,
            tracing: false,
            buffer_rows: None,
            cancellation: None,
            prepared: false,
        }
    }

    /// Replaces the bound values.
    pub fn with_values(mut self, values: SerializedValues) -> Self {
        self.values = values;
        self
    }

    /// Appends an already serialized value. `None` binds a null.
    pub fn bind_raw(mut self, value: Option<impl Into<Bytes>>) -> Self {
        self.values.add_raw(value.map(Into::into));
        self
    }

    /// Serializes `value` with `codec` and appends it.
    pub fn bind<T, C: Codec<T> + ?Sized>(
        &mut self,
        codec: &C,
        value: &T,
        typ: &ColumnType,
        version: ProtocolVersion,
    ) -> Result<(), CodecError> {
        self.values.add_value(codec, value, typ, version)
    }

    pub fn get_values(&self) -> &SerializedValues {
        &self.values
    }

    /// Routing hint. The partition-aware strategy sends the statement to
    /// the node owning this key.
    pub fn with_partition_key(mut self, partition_key: PartitionKey) -> Self {
        self.set_partition_key(Some(partition_key));
        self
    }

    pub fn set_partition_key(&mut self, partition_key: Option<PartitionKey>) {
        self.partition_key = partition_key;
    }

    pub fn get_partition_key(&self) -> Option<&PartitionKey> {
        self.partition_key.as_ref()
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.set_consistency(consistency);
        self
    }

    /// Sets the consistency to be used when executing this statement.
    pub fn set_consistency(&mut self, consistency: Consistency) {
        self.consistency = consistency;
    }

    pub fn get_consistency(&self) -> Consistency {
        self.consistency
    }

    /// Sets the serial consistency, used by conditional updates only.
    pub fn set_serial_consistency(&mut self, serial_consistency: Option<SerialConsistency>) {
        self.serial_consistency = serial_consistency;
    }

    pub fn get_serial_consistency(&self) -> Option<SerialConsistency> {
        self.serial_consistency
    }

    /// Asks the server for at most `page_size` rows. Only the first page is
    /// fetched; the paging state of the result tells whether more exist.
    pub fn set_page_size(&mut self, page_size: Option<i32>) {
        self.page_size = page_size.filter(|size| *size > 0);
    }

    pub fn get_page_size(&self) -> Option<i32> {
        self.page_size
    }

    /// Weight of the statement in the cluster's admission control.
    /// Zero counts as one.
    pub fn with_load(mut self, load: usize) -> Self {
        self.set_load(load);
        self
    }

    pub fn set_load(&mut self, load: usize) {
        self.load = load.max(1);
    }

    pub fn get_load(&self) -> usize {
        self.load
    }

    /// Enable or disable CQL Tracing for this statement.
    /// If enabled, the report carries the tracing session id.
    pub fn set_tracing(&mut self, should_trace: bool) {
        self.tracing = should_trace;
    }

    pub fn get_tracing(&self) -> bool {
        self.tracing
    }

    /// Whether rows are decoded before the result is returned, overriding
    /// the cluster default.
    pub fn set_buffer_rows(&mut self, buffer_rows: Option<bool>) {
        self.buffer_rows = buffer_rows;
    }

    pub fn get_buffer_rows(&self) -> Option<bool> {
        self.buffer_rows
    }

    /// Token that aborts the statement: promptly while it waits for
    /// admission or a connection, by ignoring the response after that.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn get_cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    /// Run as a prepared statement: prepared once per node, then executed
    /// by id.
    pub fn prepared(mut self) -> Self {
        self.set_prepared(true);
        self
    }

    pub fn set_prepared(&mut self, prepared: bool) {
        self.prepared = prepared;
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub(crate) fn parameters(&self) -> QueryParameters<'_> {
        QueryParameters {
            consistency: self.consistency,
            serial_consistency: self.serial_consistency,
            page_size: self.page_size,
            paging_state: None,
            skip_metadata: false,
            values: Cow::Borrowed(&self.values),
        }
    }
}

impl From<String> for Statement {
    fn from(s: String) -> Statement {
        Statement::new(s)
    }
}

impl<'a> From<&'a str> for Statement {
    fn from(s: &'a str) -> Statement {
        Statement::new(s.to_owned())
    }
}
