//! Defines the [`Batch`] type: several modifying statements sent as one
//! BATCH frame.

use std::borrow::Cow;

use cqlmux_cql::frame::request::batch::{self, BatchStatement};
use cqlmux_cql::{Consistency, SerialConsistency};
use tokio_util::sync::CancellationToken;

pub use cqlmux_cql::frame::request::batch::BatchType;

use crate::client::statement::Statement;
use crate::routing::PartitionKey;

/// A group of statements run as a single operation.
///
/// Each statement contributes its text, its bound values and whether it is
/// [prepared](Statement::prepared); the other settings of the individual
/// statements are ignored in favour of the batch's own.
#[derive(Debug, Clone)]
pub struct Batch {
    statements: Vec<Statement>,
    batch_type: BatchType,
    consistency: Consistency,
    serial_consistency: Option<SerialConsistency>,
    partition_key: Option<PartitionKey>,
    load: usize,
    tracing: bool,
    cancellation: Option<CancellationToken>,
}

impl Default for Batch {
    fn default() -> Self {
        Batch::new(BatchType::Logged)
    }
}

impl Batch {
    /// Creates an empty batch of the given type.
    pub fn new(batch_type: BatchType) -> Self {
        Batch {
            statements: Vec::new(),
            batch_type,
            consistency: Consistency::default(),
            serial_consistency: None,
            partition_key: None,
            load: 1,
            tracing: false,
            cancellation: None,
        }
    }

    /// Appends a statement to the batch.
    pub fn append_statement(&mut self, statement: impl Into<Statement>) {
        self.statements.push(statement.into());
    }

    pub fn with_statement(mut self, statement: impl Into<Statement>) -> Self {
        self.append_statement(statement);
        self
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn get_type(&self) -> BatchType {
        self.batch_type
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.set_consistency(consistency);
        self
    }

    pub fn set_consistency(&mut self, consistency: Consistency) {
        self.consistency = consistency;
    }

    pub fn get_consistency(&self) -> Consistency {
        self.consistency
    }

    pub fn set_serial_consistency(&mut self, serial_consistency: Option<SerialConsistency>) {
        self.serial_consistency = serial_consistency;
    }

    pub fn get_serial_consistency(&self) -> Option<SerialConsistency> {
        self.serial_consistency
    }

    /// Routing hint, usually the key shared by every statement of an
    /// unlogged batch.
    pub fn with_partition_key(mut self, partition_key: PartitionKey) -> Self {
        self.partition_key = Some(partition_key);
        self
    }

    pub fn get_partition_key(&self) -> Option<&PartitionKey> {
        self.partition_key.as_ref()
    }

    /// Weight of the whole batch in the cluster's admission control.
    /// Zero counts as one.
    pub fn with_load(mut self, load: usize) -> Self {
        self.load = load.max(1);
        self
    }

    pub fn get_load(&self) -> usize {
        self.load
    }

    pub fn set_tracing(&mut self, should_trace: bool) {
        self.tracing = should_trace;
    }

    pub fn get_tracing(&self) -> bool {
        self.tracing
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn get_cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    /// Builds the frame from already resolved statements, one per entry of
    /// [`Batch::statements`].
    pub(crate) fn request<'b>(&'b self, statements: Vec<BatchStatement<'b>>) -> batch::Batch<'b> {
        batch::Batch {
            statements,
            batch_type: self.batch_type,
            consistency: self.consistency,
            serial_consistency: self.serial_consistency,
            values: self
                .statements
                .iter()
                .map(|statement| statement.get_values().clone())
                .collect(),
        }
    }

    /// Entry for a statement sent as text.
    pub(crate) fn query_entry(statement: &Statement) -> BatchStatement<'_> {
        BatchStatement::Query {
            text: Cow::Borrowed(&statement.contents),
        }
    }
}
