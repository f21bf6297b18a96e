//! `Session` is the main object used in the driver.
//! It represents a logical connection to a cluster and runs statements
//! through it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use cqlmux_cql::Consistency;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::client::batch::Batch;
use crate::client::registry::ClusterRegistry;
use crate::client::session_builder::{ClusterConfig, StrategyKind};
use crate::client::statement::Statement;
use crate::cluster::Cluster;
use crate::errors::{ExecutionError, RequestAttemptError, UsageError};
use crate::execution::{CommandKind, CommandOutput, PreparedHandle};
use crate::network::{Connection, VerifiedKeyspaceName};
use crate::observability::tracing::{
    tracing_info_from_rows, TracingInfo, TRACES_EVENTS_QUERY_STR, TRACES_SESSION_QUERY_STR,
};
use crate::response::{ExecutionReport, QueryResult, RowsResult};
use crate::strategy::ConnectionScope;

/// A logical connection to a cluster.
///
/// Sessions are cheap: the connections, the prepared statement cache and the
/// throttle belong to the shared [`Cluster`]. With the exclusive strategy a
/// session holds one private connection for its whole lifetime, which is
/// what makes [`Session::use_keyspace`] meaningful.
#[derive(Debug)]
pub struct Session {
    cluster: Arc<Cluster>,
    connection: Option<Arc<Connection>>,
    keyspace_changed: AtomicBool,
}

impl Session {
    /// Opens a session on the cluster of `config`, shared through
    /// [`ClusterRegistry::global`].
    pub async fn connect(config: ClusterConfig) -> Result<Session, ExecutionError> {
        Self::connect_with(ClusterRegistry::global(), config, &CancellationToken::new()).await
    }

    /// Opens a session on the cluster of `config` registered in `registry`.
    /// `cancel` aborts opening the cluster and acquiring the session's
    /// connection.
    pub async fn connect_with(
        registry: &ClusterRegistry,
        config: ClusterConfig,
        cancel: &CancellationToken,
    ) -> Result<Session, ExecutionError> {
        let cluster = registry.get_or_create(config)?;
        Self::on_cluster(cluster, cancel).await
    }

    /// Opens a session on an existing cluster, opening the cluster first if
    /// needed.
    pub async fn on_cluster(
        cluster: Arc<Cluster>,
        cancel: &CancellationToken,
    ) -> Result<Session, ExecutionError> {
        cluster.open(cancel).await?;
        cluster.ensure_not_closed()?;

        let strategy = cluster.executor().strategy().clone();
        let connection = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
            connection = strategy.get_or_create_connection(ConnectionScope::Connection, None) => {
                connection.map_err(ExecutionError::Transport)?
            }
        };
        if connection.is_none() && strategy.provides_exclusive_connections() {
            return Err(ExecutionError::NoConnection);
        }
        if let Some(connection) = &connection {
            debug!(node = %connection.address(), "Session holds a private connection");
        }

        Ok(Session {
            cluster,
            connection,
            keyspace_changed: AtomicBool::new(false),
        })
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Runs a statement that returns rows.
    ///
    /// Any other kind of result is an error,
    /// [`UsageError::NotARowsResult`]. The rows are decoded up front when the
    /// statement, or failing that the cluster configuration, asks for
    /// buffering.
    pub async fn execute_query(
        &self,
        statement: &Statement,
    ) -> Result<ExecutionReport<RowsResult>, ExecutionError> {
        let buffer_rows = self.buffer_rows(statement);
        self.run(statement, CommandKind::Run)
            .await?
            .try_map(|output| -> Result<RowsResult, ExecutionError> {
                let mut rows = query_result(output)?.into_rows()?;
                if buffer_rows {
                    rows.buffer().map_err(RequestAttemptError::from)?;
                }
                Ok(rows)
            })
    }

    /// Runs a statement for its effect. Whatever result the statement
    /// produces is returned as is.
    pub async fn execute_non_query(
        &self,
        statement: &Statement,
    ) -> Result<ExecutionReport<QueryResult>, ExecutionError> {
        let buffer_rows = self.buffer_rows(statement);
        self.run(statement, CommandKind::Run)
            .await?
            .try_map(|output| -> Result<QueryResult, ExecutionError> {
                let mut result = query_result(output)?;
                if let QueryResult::Rows(rows) = &mut result {
                    if buffer_rows {
                        rows.buffer().map_err(RequestAttemptError::from)?;
                    }
                }
                Ok(result)
            })
    }

    /// Runs the statements of `batch` as one BATCH request.
    ///
    /// Statements marked [`prepared`](Statement::prepared) are prepared on
    /// the coordinator first and sent by id. A conditional batch answers
    /// with rows telling whether it was applied.
    pub async fn execute_batch(
        &self,
        batch: &Batch,
    ) -> Result<ExecutionReport<QueryResult>, ExecutionError> {
        self.cluster.ensure_not_closed()?;
        self.cluster
            .executor()
            .run_batch(batch, self.connection.as_ref())
            .await?
            .try_map(query_result)
    }

    /// Prepares `statement` on a node and returns its handle.
    ///
    /// Handles are cached per node. Statements marked
    /// [`prepared`](Statement::prepared) are prepared transparently on
    /// whichever node runs them, so calling this is only needed to inspect
    /// the statement's metadata up front.
    pub async fn prepare(
        &self,
        statement: impl Into<Statement>,
    ) -> Result<Arc<PreparedHandle>, ExecutionError> {
        let statement = statement.into();
        let report = self.run(&statement, CommandKind::Prepare).await?;
        match report.result {
            CommandOutput::Prepared(handle) => Ok(handle),
            CommandOutput::Result(result) => {
                Err(RequestAttemptError::UnexpectedResponse(result.kind()).into())
            }
        }
    }

    /// Sends `USE <keyspace_name>` on the session's connection.
    ///
    /// The current keyspace is state of a single socket, so this needs the
    /// exclusive strategy. The connection is not handed back to the idle
    /// set once the session is dropped.
    pub async fn use_keyspace(&self, keyspace_name: impl AsRef<str>) -> Result<(), ExecutionError> {
        self.cluster.ensure_not_closed()?;
        let connection = match (&self.connection, self.cluster.config().strategy()) {
            (Some(connection), StrategyKind::Exclusive) => connection,
            _ => return Err(UsageError::KeyspaceChangeRequiresExclusive.into()),
        };
        let keyspace_name = VerifiedKeyspaceName::new(keyspace_name.as_ref())?;

        // Set before sending: if the response is lost the connection may
        // still have switched.
        self.keyspace_changed.store(true, Ordering::Release);
        connection.use_keyspace(&keyspace_name).await?;
        info!(
            node = %connection.address(),
            keyspace = keyspace_name.as_str(),
            "Session switched keyspace"
        );
        Ok(())
    }

    /// Get [`TracingInfo`] of a traced statement performed earlier, given
    /// the [`tracing_id`](ExecutionReport::tracing_id) of its report.
    ///
    /// The trace tables are written asynchronously, so they are read up to
    /// the configured number of times until both hold the trace.
    pub async fn get_tracing_info(&self, tracing_id: &Uuid) -> Result<TracingInfo, ExecutionError> {
        let config = self.cluster.config();
        let attempts = config.tracing_info_fetch_attempts.get();
        for _ in 0..attempts {
            match self
                .try_getting_tracing_info(tracing_id, config.tracing_info_fetch_consistency)
                .await?
            {
                Some(tracing_info) => return Ok(tracing_info),
                None => tokio::time::sleep(config.tracing_info_fetch_interval).await,
            }
        }
        Err(ExecutionError::TracingInfoUnavailable {
            tracing_id: *tracing_id,
            attempts,
        })
    }

    // Returns None while the trace has not fully reached the node that
    // answered.
    async fn try_getting_tracing_info(
        &self,
        tracing_id: &Uuid,
        consistency: Consistency,
    ) -> Result<Option<TracingInfo>, ExecutionError> {
        let traces_query = |text: &str| {
            let mut statement = Statement::new(text)
                .bind_raw(Some(Bytes::copy_from_slice(tracing_id.as_bytes())))
                .with_consistency(consistency);
            statement.set_page_size(Some(1024));
            statement
        };
        let traces_session_query = traces_query(TRACES_SESSION_QUERY_STR);
        let traces_events_query = traces_query(TRACES_EVENTS_QUERY_STR);

        let (session_rows, event_rows) = tokio::try_join!(
            self.execute_query(&traces_session_query),
            self.execute_query(&traces_events_query)
        )?;
        let tracing_info = tracing_info_from_rows(
            &session_rows.result,
            &event_rows.result,
            self.cluster.config().protocol_version,
        )
        .map_err(RequestAttemptError::from)?;
        if tracing_info.is_none() {
            trace!(tracing_id = %tracing_id, "Trace not complete yet");
        }
        Ok(tracing_info)
    }

    fn buffer_rows(&self, statement: &Statement) -> bool {
        statement
            .get_buffer_rows()
            .unwrap_or(self.cluster.config().buffer_rows)
    }

    async fn run(
        &self,
        statement: &Statement,
        kind: CommandKind,
    ) -> Result<ExecutionReport<CommandOutput>, ExecutionError> {
        self.cluster.ensure_not_closed()?;
        self.cluster
            .executor()
            .run(statement, kind, self.connection.as_ref())
            .await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        if self.keyspace_changed.load(Ordering::Acquire) {
            debug!(
                node = %connection.address(),
                "Not reusing the session's connection, its keyspace was changed"
            );
            return;
        }
        self.cluster
            .executor()
            .strategy()
            .return_connection(connection, ConnectionScope::Connection);
    }
}

fn query_result(output: CommandOutput) -> Result<QueryResult, ExecutionError> {
    match output {
        CommandOutput::Result(result) => Ok(result),
        CommandOutput::Prepared(_) => {
            Err(RequestAttemptError::UnexpectedResponse("RESULT::Prepared").into())
        }
    }
}
