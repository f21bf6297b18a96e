//! Running one logical operation: admission, connection choice, prepare,
//! execute, and retries.
//!
//! Lower layers report what went wrong; [`classify`] is the only place
//! deciding whether it is worth another attempt.

use std::borrow::Cow;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;

use cqlmux_cql::frame::request::batch::BatchStatement;
use cqlmux_cql::frame::request::{Execute, Query};
use cqlmux_cql::frame::response::{Error as CqlError, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::client::batch::Batch;
use crate::client::statement::Statement;
use crate::cluster::node::Node;
use crate::errors::{DbError, ExecutionError, RequestAttemptError, UsageError};
use crate::network::Connection;
use crate::response::{ExecutionReport, QueryResponse, QueryResult};
use crate::routing::PartitionKey;
use crate::strategy::{ConnectionScope, ConnectionStrategy};

mod prepared_cache;
mod throttle;

pub use prepared_cache::PreparedHandle;
pub(crate) use prepared_cache::PreparedStatementCache;
pub(crate) use throttle::Throttle;

/// Where a logical operation stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandState {
    NotPrepared,
    Preparing,
    Executing,
    Succeeded,
    Failed,
}

impl Display for CommandState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CommandState::NotPrepared => "not prepared",
            CommandState::Preparing => "preparing",
            CommandState::Executing => "executing",
            CommandState::Succeeded => "succeeded",
            CommandState::Failed => "failed",
        })
    }
}

/// Why a failed attempt may succeed if tried again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryKind {
    NodeOverloaded,
    NodeBootstrapping,
    /// The connection broke or could not be obtained.
    Transport,
}

/// Verdict on a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    RetryableFailure(RetryKind),
    TerminalFailure,
}

/// Decides what to do after an attempt.
///
/// With exclusive connections a transport failure is terminal: the state
/// the caller built on that connection is gone, and another connection
/// would not have it.
pub fn classify<T>(
    result: &Result<T, RequestAttemptError>,
    exclusive_connections: bool,
) -> AttemptOutcome {
    let error = match result {
        Ok(_) => return AttemptOutcome::Success,
        Err(error) => error,
    };
    match error {
        RequestAttemptError::DbError(DbError::Overloaded, _) => {
            AttemptOutcome::RetryableFailure(RetryKind::NodeOverloaded)
        }
        RequestAttemptError::DbError(DbError::IsBootstrapping, _) => {
            AttemptOutcome::RetryableFailure(RetryKind::NodeBootstrapping)
        }
        RequestAttemptError::Transport(_)
        | RequestAttemptError::UnableToAllocStreamId
        | RequestAttemptError::NoConnectionAvailable => {
            if exclusive_connections {
                AttemptOutcome::TerminalFailure
            } else {
                AttemptOutcome::RetryableFailure(RetryKind::Transport)
            }
        }
        _ => AttemptOutcome::TerminalFailure,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommandKind {
    /// QUERY, or EXECUTE when the statement is marked prepared.
    Run,
    /// PREPARE only.
    Prepare,
}

#[derive(Debug)]
pub(crate) enum CommandOutput {
    Result(QueryResult),
    Prepared(Arc<PreparedHandle>),
}

// What a command sends on each attempt.
#[derive(Clone, Copy)]
enum Operation<'a> {
    Statement(&'a Statement, CommandKind),
    Batch(&'a Batch),
}

impl Operation<'_> {
    fn validate(&self) -> Result<(), UsageError> {
        let empty = match self {
            Operation::Statement(statement, _) => statement.contents.trim().is_empty(),
            Operation::Batch(batch) => {
                batch.statements().is_empty()
                    || batch
                        .statements()
                        .iter()
                        .any(|statement| statement.contents.trim().is_empty())
            }
        };
        if empty {
            return Err(UsageError::EmptyStatement);
        }
        Ok(())
    }

    fn cancellation(&self) -> Option<&CancellationToken> {
        match self {
            Operation::Statement(statement, _) => statement.get_cancellation(),
            Operation::Batch(batch) => batch.get_cancellation(),
        }
    }

    fn load(&self) -> usize {
        match self {
            Operation::Statement(statement, _) => statement.get_load(),
            Operation::Batch(batch) => batch.get_load(),
        }
    }

    fn partition_key(&self) -> Option<&PartitionKey> {
        match self {
            Operation::Statement(statement, _) => statement.get_partition_key(),
            Operation::Batch(batch) => batch.get_partition_key(),
        }
    }
}

// Progress of one logical operation.
struct Command<'a> {
    operation: Operation<'a>,
    state: CommandState,
    attempts: usize,
}

impl Command<'_> {
    fn transition(&mut self, state: CommandState) {
        trace!(from = %self.state, to = %state, attempt = self.attempts, "Command state changed");
        self.state = state;
    }
}

struct AttemptSuccess {
    output: CommandOutput,
    tracing_id: Option<Uuid>,
    warnings: Vec<String>,
    coordinator: SocketAddr,
}

struct Attempt {
    node: Option<Arc<Node>>,
    result: Result<AttemptSuccess, RequestAttemptError>,
}

impl Attempt {
    fn failed(node: Option<Arc<Node>>, error: impl Into<RequestAttemptError>) -> Self {
        Attempt {
            node,
            result: Err(error.into()),
        }
    }
}

// Gives a command-scope connection back to the strategy on every path,
// cancellation included.
struct ConnectionLease<'a> {
    connection: Arc<Connection>,
    strategy: Option<&'a dyn ConnectionStrategy>,
}

impl Drop for ConnectionLease<'_> {
    fn drop(&mut self) {
        if let Some(strategy) = self.strategy {
            strategy.return_connection(self.connection.clone(), ConnectionScope::Command);
        }
    }
}

/// Runs commands of one cluster.
#[derive(Debug)]
pub(crate) struct Executor {
    strategy: Arc<dyn ConnectionStrategy>,
    cache: Arc<PreparedStatementCache>,
    throttle: Arc<Throttle>,
    max_attempts: usize,
}

impl Executor {
    pub(crate) fn new(
        strategy: Arc<dyn ConnectionStrategy>,
        cache: Arc<PreparedStatementCache>,
        throttle: Arc<Throttle>,
        max_attempts: usize,
    ) -> Self {
        Executor {
            strategy,
            cache,
            throttle,
            max_attempts: max_attempts.max(1),
        }
    }

    pub(crate) fn strategy(&self) -> &Arc<dyn ConnectionStrategy> {
        &self.strategy
    }

    pub(crate) fn cache(&self) -> &PreparedStatementCache {
        &self.cache
    }

    pub(crate) fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    /// Runs `statement` to completion.
    ///
    /// `held` is the connection a session keeps for its lifetime; when set
    /// every attempt uses it instead of asking the strategy.
    pub(crate) async fn run(
        &self,
        statement: &Statement,
        kind: CommandKind,
        held: Option<&Arc<Connection>>,
    ) -> Result<ExecutionReport<CommandOutput>, ExecutionError> {
        self.run_operation(Operation::Statement(statement, kind), held)
            .await
    }

    /// Runs `batch` as one BATCH frame, with the same admission and retries
    /// as a single statement.
    pub(crate) async fn run_batch(
        &self,
        batch: &Batch,
        held: Option<&Arc<Connection>>,
    ) -> Result<ExecutionReport<CommandOutput>, ExecutionError> {
        self.run_operation(Operation::Batch(batch), held).await
    }

    async fn run_operation(
        &self,
        operation: Operation<'_>,
        held: Option<&Arc<Connection>>,
    ) -> Result<ExecutionReport<CommandOutput>, ExecutionError> {
        operation.validate()?;

        let cancel = operation.cancellation();
        let _permit = self.throttle.acquire(operation.load(), cancel).await?;
        let exclusive = self.strategy.provides_exclusive_connections();

        let mut command = Command {
            operation,
            state: CommandState::NotPrepared,
            attempts: 0,
        };

        loop {
            command.attempts += 1;
            let attempt = match cancel {
                Some(cancel) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(attempt = command.attempts, "Command cancelled");
                        return Err(ExecutionError::Cancelled);
                    }
                    attempt = self.attempt(&mut command, held) => attempt?,
                },
                None => self.attempt(&mut command, held).await?,
            };

            let outcome = classify(&attempt.result, exclusive);
            let error = match attempt.result {
                Ok(success) => {
                    command.transition(CommandState::Succeeded);
                    return Ok(ExecutionReport {
                        result: success.output,
                        tracing_id: success.tracing_id,
                        warnings: success.warnings,
                        attempts: command.attempts,
                        coordinator: success.coordinator,
                        state: command.state,
                    });
                }
                Err(error) => error,
            };

            let node = attempt.node.as_ref().map(|node| node.address);
            match outcome {
                AttemptOutcome::RetryableFailure(retry_kind) => {
                    if retry_kind == RetryKind::NodeBootstrapping {
                        if let Some(node) = &attempt.node {
                            node.mark_bootstrapping();
                        }
                    }
                    if command.attempts >= self.max_attempts {
                        command.transition(CommandState::Failed);
                        warn!(
                            attempts = command.attempts,
                            node = ?node,
                            error = %error,
                            "Giving up on command, no attempts left"
                        );
                        return Err(ExecutionError::RetriesExhausted {
                            attempts: command.attempts,
                            last_error: Box::new(error),
                        });
                    }
                    debug!(
                        attempt = command.attempts,
                        node = ?node,
                        reason = ?retry_kind,
                        error = %error,
                        "Retrying command"
                    );
                }
                AttemptOutcome::TerminalFailure | AttemptOutcome::Success => {
                    command.transition(CommandState::Failed);
                    debug!(
                        attempt = command.attempts,
                        node = ?node,
                        error = %error,
                        "Command failed"
                    );
                    return Err(error.into());
                }
            }
        }
    }

    async fn attempt(
        &self,
        command: &mut Command<'_>,
        held: Option<&Arc<Connection>>,
    ) -> Result<Attempt, UsageError> {
        let operation = command.operation;
        let lease = match held {
            Some(connection) => ConnectionLease {
                connection: connection.clone(),
                strategy: None,
            },
            None => {
                let partition_key = operation.partition_key().cloned();
                match self
                    .strategy
                    .get_or_create_connection(ConnectionScope::Command, partition_key.as_ref())
                    .await
                {
                    Ok(Some(connection)) => ConnectionLease {
                        connection,
                        strategy: Some(self.strategy.as_ref()),
                    },
                    Ok(None) => {
                        return Ok(Attempt::failed(
                            None,
                            RequestAttemptError::NoConnectionAvailable,
                        ))
                    }
                    Err(err) => return Ok(Attempt::failed(None, err)),
                }
            }
        };

        let connection = &lease.connection;
        let node = Some(connection.node().clone());
        trace!(node = %connection.address(), attempt = command.attempts, "Sending command");

        let statement = match operation {
            Operation::Statement(statement, _) => statement,
            Operation::Batch(batch) => {
                let result = self
                    .send_batch(command, connection, batch)
                    .await?
                    .and_then(|response| into_attempt_success(response, connection.address()));
                return Ok(Attempt { node, result });
            }
        };

        if let Operation::Statement(_, CommandKind::Prepare) = operation {
            command.transition(CommandState::Preparing);
            return Ok(Attempt {
                node,
                result: self
                    .prepare_on(connection, &statement.contents)
                    .await
                    .map(|handle| AttemptSuccess {
                        output: CommandOutput::Prepared(handle),
                        tracing_id: None,
                        warnings: Vec::new(),
                        coordinator: connection.address(),
                    }),
            });
        }

        let response = if statement.is_prepared() {
            command.transition(CommandState::Preparing);
            let handle = match self.prepare_on(connection, &statement.contents).await {
                Ok(handle) => handle,
                Err(err) => return Ok(Attempt::failed(node, err)),
            };
            if handle.values_count() != statement.get_values().len() {
                return Err(UsageError::ValueCountMismatch {
                    expected: handle.values_count(),
                    received: statement.get_values().len(),
                });
            }

            command.transition(CommandState::Executing);
            let execute = Execute {
                id: handle.id().clone(),
                parameters: statement.parameters(),
            };
            let response = connection
                .send_request(&execute, statement.get_load(), statement.get_tracing())
                .await;
            if let Ok(QueryResponse {
                response:
                    Response::Error(CqlError {
                        error: DbError::Unprepared { .. },
                        ..
                    }),
                ..
            }) = &response
            {
                // The next operation prepares it again.
                self.cache.invalidate(connection.address(), &statement.contents);
            }
            response
        } else {
            command.transition(CommandState::Executing);
            let query = Query {
                contents: Cow::Borrowed(&statement.contents),
                parameters: statement.parameters(),
            };
            connection
                .send_request(&query, statement.get_load(), statement.get_tracing())
                .await
        };

        let result = response.and_then(|response| into_attempt_success(response, connection.address()));
        Ok(Attempt { node, result })
    }

    // Prepares the batch's prepared statements on `connection`, then sends
    // the BATCH frame. The outer error is a caller mistake, the inner one a
    // failed attempt.
    async fn send_batch(
        &self,
        command: &mut Command<'_>,
        connection: &Arc<Connection>,
        batch: &Batch,
    ) -> Result<Result<QueryResponse, RequestAttemptError>, UsageError> {
        let mut entries = Vec::with_capacity(batch.statements().len());
        let mut handles = Vec::new();
        for statement in batch.statements() {
            if !statement.is_prepared() {
                entries.push(Batch::query_entry(statement));
                continue;
            }
            command.transition(CommandState::Preparing);
            let handle = match self.prepare_on(connection, &statement.contents).await {
                Ok(handle) => handle,
                Err(err) => return Ok(Err(err)),
            };
            if handle.values_count() != statement.get_values().len() {
                return Err(UsageError::ValueCountMismatch {
                    expected: handle.values_count(),
                    received: statement.get_values().len(),
                });
            }
            entries.push(BatchStatement::Prepared {
                id: handle.id().clone(),
            });
            handles.push(handle);
        }

        command.transition(CommandState::Executing);
        let request = batch.request(entries);
        let response = connection
            .send_request(&request, batch.get_load(), batch.get_tracing())
            .await;
        if let Ok(QueryResponse {
            response:
                Response::Error(CqlError {
                    error: DbError::Unprepared { statement_id },
                    ..
                }),
            ..
        }) = &response
        {
            for handle in handles.iter().filter(|handle| handle.id() == statement_id) {
                self.cache.invalidate(connection.address(), handle.statement());
            }
        }
        Ok(response)
    }

    async fn prepare_on(
        &self,
        connection: &Arc<Connection>,
        statement: &str,
    ) -> Result<Arc<PreparedHandle>, RequestAttemptError> {
        let address = connection.address();
        self.cache
            .get_or_prepare(address, statement, || async move {
                let prepared = connection.prepare(statement).await?;
                Ok(PreparedHandle::new(statement, address, prepared))
            })
            .await
    }
}

fn into_attempt_success(
    response: QueryResponse,
    coordinator: SocketAddr,
) -> Result<AttemptSuccess, RequestAttemptError> {
    let response = response.into_non_error_query_response()?;
    let tracing_id = response.tracing_id;
    let warnings = response.warnings.clone();
    response.into_query_result().map(|result| AttemptSuccess {
        output: CommandOutput::Result(result),
        tracing_id,
        warnings,
        coordinator,
    })
}
