use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use cqlmux_cql::frame::frame_errors::ParseError;
use cqlmux_cql::frame::response::result::{ResultMetadata, Row};
use cqlmux_cql::{Consistency, ProtocolVersion};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::cluster::node::Node;
use crate::errors::{RequestAttemptError, TransportError};
use crate::network::{open_connection, Connection, ConnectionConfig, ErrorReceiver};
use crate::response::{column, QueryResult, RowsResult};
use crate::routing::Token;

const LOCAL_QUERY: &str = "SELECT * FROM system.local WHERE key='local'";
const PEERS_QUERY: &str = "SELECT * FROM system.peers";

#[derive(Clone, Copy)]
enum NodeInfoSource {
    Local,
    Peer,
}

impl NodeInfoSource {
    fn describe(&self) -> &'static str {
        match self {
            Self::Local => "local node",
            Self::Peer => "peer",
        }
    }

    fn table(&self) -> &'static str {
        match self {
            Self::Local => "system.local",
            Self::Peer => "system.peers",
        }
    }
}

/// The connection reading topology from the system tables and receiving
/// server events.
#[derive(Debug)]
pub(crate) struct ControlConnection {
    connection: Connection,
}

impl ControlConnection {
    /// Connects to the first node of `candidates` that answers.
    pub(crate) async fn open(
        candidates: &[Arc<Node>],
        config: &ConnectionConfig,
    ) -> Result<(ControlConnection, ErrorReceiver), Option<TransportError>> {
        let mut last_error = None;
        for node in candidates {
            match open_connection(node, config).await {
                Ok((connection, error_receiver)) => {
                    debug!(node = %node.address, "Control connection established");
                    return Ok((ControlConnection { connection }, error_receiver));
                }
                Err(err) => {
                    warn!(node = %node.address, error = %err, "Could not open control connection");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error)
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.connection.address()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Reads every node of the cluster from `system.local` and
    /// `system.peers`. Rows that can't be understood are skipped.
    pub(crate) async fn fetch_topology(
        &self,
        retry_delay: Duration,
    ) -> Result<Vec<Node>, RequestAttemptError> {
        let (local, peers) = tokio::try_join!(
            self.query_rows(LOCAL_QUERY),
            self.query_rows(PEERS_QUERY)
        )?;

        let local_address = self.address();
        let version = self.connection.version();
        let mut nodes = Vec::with_capacity(local.rows_count() + peers.rows_count());
        let sources = [(NodeInfoSource::Local, &local), (NodeInfoSource::Peer, &peers)];
        for (source, rows) in sources {
            for row in rows.rows() {
                let row = row?;
                let node = node_from_row(
                    source,
                    &row,
                    rows.metadata(),
                    local_address,
                    version,
                    retry_delay,
                );
                match node {
                    Ok(node) => nodes.push(node),
                    Err(err) => warn!(
                        table = source.table(),
                        error = %err,
                        "{} has an invalid row, skipping it",
                        source.table()
                    ),
                }
            }
        }

        if nodes.is_empty() {
            return Err(RequestAttemptError::ResultParse(ParseError::BadIncomingData(
                "system.local and system.peers returned no usable rows".to_owned(),
            )));
        }
        trace!(nodes = nodes.len(), "Fetched topology");
        Ok(nodes)
    }

    async fn query_rows(&self, query: &str) -> Result<RowsResult, RequestAttemptError> {
        let result = self
            .connection
            .query_unpaged(query, Consistency::One)
            .await?
            .into_non_error_query_response()?
            .into_query_result()?;
        match result {
            QueryResult::Rows(rows) => Ok(rows),
            other => Err(RequestAttemptError::UnexpectedResponse(other.kind())),
        }
    }
}

fn node_from_row(
    source: NodeInfoSource,
    row: &Row,
    metadata: &ResultMetadata,
    local_address: SocketAddr,
    version: ProtocolVersion,
    retry_delay: Duration,
) -> Result<Node, ParseError> {
    let host_id: Option<Uuid> = column(row, metadata, "host_id", version)?;
    let datacenter: Option<String> = column(row, metadata, "data_center", version)?;
    let rack: Option<String> = column(row, metadata, "rack", version)?;
    let tokens: Option<Vec<String>> = column(row, metadata, "tokens", version)?;

    let address = match source {
        // rpc_address in system.local can be wrong, the address we reached
        // the node at is not.
        NodeInfoSource::Local => local_address,
        NodeInfoSource::Peer => {
            let rpc_address: Option<IpAddr> = column(row, metadata, "rpc_address", version)?;
            let peer: Option<IpAddr> = column(row, metadata, "peer", version)?;
            let ip = match (rpc_address, peer) {
                (Some(ip), _) if !ip.is_unspecified() => ip,
                (_, Some(ip)) => ip,
                _ => {
                    return Err(ParseError::BadIncomingData(
                        "peer has neither rpc_address nor peer set".to_owned(),
                    ))
                }
            };
            let port: Option<i32> = column(row, metadata, "native_port", version)?;
            let port = port
                .and_then(|port| u16::try_from(port).ok())
                .unwrap_or(local_address.port());
            SocketAddr::new(ip, port)
        }
    };

    let tokens = match tokens
        .unwrap_or_default()
        .iter()
        .map(|s| s.parse::<Token>())
        .collect::<Result<Vec<Token>, _>>()
    {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(
                node = %address,
                error = %e,
                "Couldn't parse tokens as 64-bit integers, the {} will own no partitions",
                source.describe()
            );
            Vec::new()
        }
    };

    Ok(Node::with_metadata(
        address,
        host_id,
        datacenter,
        rack,
        tokens,
        retry_delay,
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::utils::test_utils::{setup_tracing, MockServer};

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn topology_is_read_from_local_and_peers() {
        setup_tracing();
        let servers = MockServer::cluster(3).await;
        let mut expected = servers[0].topology();
        expected.sort_by_key(|mock| mock.address);

        let contact = Arc::new(Node::new(servers[1].address(), Duration::from_secs(1)));
        let (control, _errors) =
            ControlConnection::open(&[contact], &ConnectionConfig::default())
                .await
                .unwrap();
        assert_eq!(control.address(), servers[1].address());

        let mut nodes = control.fetch_topology(Duration::from_secs(1)).await.unwrap();
        nodes.sort_by_key(|node| node.address);
        assert_eq!(nodes.len(), 3);
        for (node, mock) in nodes.iter().zip(expected.iter()) {
            assert_eq!(node.address, mock.address);
            assert_eq!(node.host_id, Some(mock.host_id));
            assert_eq!(node.datacenter.as_deref(), Some("dc1"));
            assert_eq!(node.rack.as_deref(), Some(mock.rack.as_str()));
            assert_eq!(node.tokens, vec![Token::new(mock.tokens[0])]);
        }
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn unreachable_candidates_are_skipped() {
        setup_tracing();
        let server = MockServer::start().await;
        let dead = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let candidates = [
            Arc::new(Node::new(dead, Duration::from_secs(1))),
            Arc::new(Node::new(server.address(), Duration::from_secs(1))),
        ];
        let (control, _errors) = ControlConnection::open(&candidates, &ConnectionConfig::default())
            .await
            .unwrap();
        assert_eq!(control.address(), server.address());
        assert!(!candidates[0].is_usable());

        let err = ControlConnection::open(&candidates[..1], &ConnectionConfig::default())
            .await
            .unwrap_err();
        assert!(err.is_some());
        assert!(ControlConnection::open(&[], &ConnectionConfig::default())
            .await
            .unwrap_err()
            .is_none());
    }
}
