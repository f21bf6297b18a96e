use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use cqlmux_cql::frame::request::{self, RequestOpcode};
use cqlmux_cql::frame::response::event::{Event, StatusChangeEvent};
use cqlmux_cql::frame::response::result;
use cqlmux_cql::frame::response::NonErrorResponse;
use cqlmux_cql::value::SerializedValues;
use cqlmux_cql::{Compression, ProtocolVersion};
use futures::future::join_all;
use tokio::sync::mpsc;

use super::{open_connection, Connection, ConnectionConfig, ErrorReceiver, VerifiedKeyspaceName};
use crate::authentication::PlainTextAuthenticator;
use crate::cluster::node::Node;
use crate::errors::{
    BrokenConnectionError, ConnectionSetupError, RequestAttemptError, TransportError,
};
use crate::utils::test_utils::{first_value, setup_tracing, MockServer, Reaction, ReceivedRequest};

fn tagged_query(tag: &[u8]) -> request::Query<'static> {
    let mut values = SerializedValues::new();
    values.add_raw(Some(Bytes::copy_from_slice(tag)));
    request::Query {
        contents: "SELECT payload FROM payloads WHERE tag = ?".into(),
        parameters: request::query::QueryParameters {
            values: std::borrow::Cow::Owned(values),
            ..Default::default()
        },
    }
}

async fn connect(server: &MockServer, config: ConnectionConfig) -> (Connection, ErrorReceiver) {
    let node = Arc::new(Node::new(server.address(), Duration::from_secs(1)));
    open_connection(&node, &config).await.unwrap()
}

fn single_payload(response: crate::response::QueryResponse) -> Bytes {
    let response = response.into_non_error_query_response().unwrap();
    let rows = assert_matches!(
        response.response,
        NonErrorResponse::Result(result::Result::Rows(rows)) => rows
    );
    let row = rows.iter().next().unwrap().unwrap();
    row.columns[0].clone().unwrap()
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn concurrent_requests_get_their_own_responses() {
    setup_tracing();
    // Replies are delayed by a tag dependent amount, so they come back in a
    // different order than the requests went out.
    let server = MockServer::start_with(Arc::new(|req: &ReceivedRequest| {
        let tag = first_value(req)?;
        let delay = (u64::from(tag[0]) * 37) % 50;
        Some(Reaction::single_blob(&tag).delayed(Duration::from_millis(delay)))
    }))
    .await;
    let (connection, _error_receiver) = connect(&server, ConnectionConfig::default()).await;

    let requests = (0..=255u8).map(|tag| {
        let connection = &connection;
        async move {
            let query = tagged_query(&[tag, tag.wrapping_mul(3)]);
            let response = connection.send_request(&query, 1, false).await.unwrap();
            (tag, single_payload(response))
        }
    });

    for (tag, payload) in join_all(requests).await {
        assert_eq!(&payload[..], &[tag, tag.wrapping_mul(3)][..]);
    }
    assert_eq!(connection.load(), 0);
    assert_eq!(
        connection.available_streams(),
        ProtocolVersion::V4.max_stream_count()
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn request_waits_for_a_free_stream_id() {
    setup_tracing();
    let server = MockServer::start_with(Arc::new(|req: &ReceivedRequest| {
        let tag = first_value(req)?;
        Some(Reaction::single_blob(&tag).delayed(Duration::from_millis(500)))
    }))
    .await;
    let config = ConnectionConfig {
        version: ProtocolVersion::V2,
        ..Default::default()
    };
    let (connection, _error_receiver) = connect(&server, config).await;
    let connection = Arc::new(connection);

    let in_flight: Vec<_> = (0..128u8)
        .map(|tag| {
            let connection = connection.clone();
            tokio::spawn(async move {
                let response = connection
                    .send_request(&tagged_query(&[tag]), 1, false)
                    .await
                    .unwrap();
                single_payload(response)
            })
        })
        .collect();

    // Let all of them take a stream id.
    while connection.available_streams() > 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let extra_query = tagged_query(b"extra");
    let extra = connection.send_request(&extra_query, 1, false);
    tokio::pin!(extra);
    assert!(
        tokio::time::timeout(Duration::from_millis(100), &mut extra)
            .await
            .is_err(),
        "a 129th request must not go out on a protocol v2 connection"
    );

    for (tag, handle) in in_flight.into_iter().enumerate() {
        assert_eq!(&handle.await.unwrap()[..], &[tag as u8][..]);
    }
    let extra_payload = single_payload(extra.await.unwrap());
    assert_eq!(&extra_payload[..], b"extra");
    assert_eq!(server.count(RequestOpcode::Query), 129);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn dropping_a_waiting_request_frees_its_stream() {
    setup_tracing();
    let server = MockServer::start_with(Arc::new(|req: &ReceivedRequest| {
        let tag = first_value(req)?;
        Some(match &tag[..] {
            b"slow" => Reaction::single_blob(&tag).delayed(Duration::from_millis(300)),
            _ => Reaction::single_blob(&tag),
        })
    }))
    .await;
    let (connection, _error_receiver) = connect(&server, ConnectionConfig::default()).await;

    let slow = tagged_query(b"slow");
    let result = tokio::time::timeout(
        Duration::from_millis(20),
        connection.send_request(&slow, 5, false),
    )
    .await;
    assert!(result.is_err());
    assert_eq!(connection.load(), 0);

    // The abandoned response arrives later and must not be mistaken for
    // the answer to anything else.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(connection.is_connected());
    let fast = connection
        .send_request(&tagged_query(b"fast"), 1, false)
        .await
        .unwrap();
    assert_eq!(&single_payload(fast)[..], b"fast");
    assert_eq!(
        connection.available_streams(),
        ProtocolVersion::V4.max_stream_count()
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn broken_connection_fails_every_pending_request() {
    setup_tracing();
    let server = MockServer::start_with(Arc::new(|req: &ReceivedRequest| {
        let tag = first_value(req)?;
        Some(match &tag[..] {
            b"close" => Reaction::CloseConnection,
            _ => Reaction::NoReply,
        })
    }))
    .await;
    let (connection, error_receiver) = connect(&server, ConnectionConfig::default()).await;

    let pending = join_all((0..10u8).map(|tag| {
        let connection = &connection;
        async move {
            let query = tagged_query(&[tag]);
            connection.send_request(&query, 1, false).await
        }
    }));
    let close = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        connection
            .send_request(&tagged_query(b"close"), 1, false)
            .await
    };
    let (results, close_result) = tokio::join!(pending, close);

    assert_matches!(
        close_result,
        Err(RequestAttemptError::Transport(TransportError::BrokenConnection(_)))
    );
    for result in results {
        assert_matches!(
            result,
            Err(RequestAttemptError::Transport(TransportError::BrokenConnection(_)))
        );
    }
    assert_matches!(error_receiver.await, Ok(BrokenConnectionError::FrameError(_)));
    assert!(!connection.is_connected());

    // A broken connection stays broken.
    assert_matches!(
        connection.send_request(&tagged_query(b"after"), 1, false).await,
        Err(RequestAttemptError::Transport(TransportError::BrokenConnection(
            BrokenConnectionError::ChannelError
        )))
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn handshake_authenticates_with_plain_text_credentials() {
    setup_tracing();
    let server = MockServer::start_with(Arc::new(|req: &ReceivedRequest| match req.opcode {
        RequestOpcode::Startup => Some(Reaction::authenticate(
            "org.apache.cassandra.auth.PasswordAuthenticator",
        )),
        RequestOpcode::AuthResponse if req.auth_token.as_deref() == Some(&b"\0cassandra\0s3cret"[..]) => {
            Some(Reaction::auth_success())
        }
        _ => None,
    }))
    .await;

    let config = ConnectionConfig {
        authenticator: Some(Arc::new(PlainTextAuthenticator::new(
            "cassandra".to_owned(),
            "s3cret".to_owned(),
        ))),
        ..Default::default()
    };
    let (connection, _error_receiver) = connect(&server, config).await;
    assert!(connection.is_connected());
    assert_eq!(server.count(RequestOpcode::AuthResponse), 1);

    // Without credentials the handshake can not complete.
    let node = Arc::new(Node::new(server.address(), Duration::from_secs(1)));
    let err = open_connection(&node, &ConnectionConfig::default())
        .await
        .err()
        .unwrap();
    assert_matches!(
        err,
        TransportError::SetupFailed(_, ConnectionSetupError::MissingAuthentication(name))
            if name.ends_with("PasswordAuthenticator")
    );

    // Wrong password: the default reply to AUTH_RESPONSE is an error.
    let config = ConnectionConfig {
        authenticator: Some(Arc::new(PlainTextAuthenticator::new(
            "cassandra".to_owned(),
            "wrong".to_owned(),
        ))),
        ..Default::default()
    };
    let err = open_connection(&node, &config).await.err().unwrap();
    assert_matches!(
        err,
        TransportError::SetupFailed(_, ConnectionSetupError::DbError(_, _))
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn handshake_uses_keyspace_and_falls_back_to_no_compression() {
    setup_tracing();
    let server = MockServer::start().await;
    let config = ConnectionConfig {
        compression: Some(Compression::Lz4),
        keyspace: Some(VerifiedKeyspaceName::new("inventory").unwrap()),
        ..Default::default()
    };
    let (connection, _error_receiver) = connect(&server, config).await;

    assert_eq!(server.statements(), vec![r#"USE "inventory""#.to_owned()]);
    assert_eq!(server.count(RequestOpcode::Options), 1);
    assert_eq!(server.count(RequestOpcode::Startup), 1);

    // The server did not offer lz4, so this frame goes out uncompressed and
    // the mock can read it.
    let response = connection
        .send_request(&tagged_query(b"x"), 1, false)
        .await
        .unwrap();
    assert_matches!(
        response.into_non_error_query_response().unwrap().response,
        NonErrorResponse::Result(result::Result::Void)
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn keyspace_mismatch_is_reported() {
    setup_tracing();
    let server = MockServer::start_with(Arc::new(|req: &ReceivedRequest| {
        let text = req.text.as_deref()?;
        text.starts_with("USE ")
            .then(|| Reaction::set_keyspace("somewhere_else"))
    }))
    .await;
    let (connection, _error_receiver) = connect(&server, ConnectionConfig::default()).await;

    let keyspace = VerifiedKeyspaceName::new("inventory").unwrap();
    assert_matches!(
        connection.use_keyspace(&keyspace).await,
        Err(RequestAttemptError::KeyspaceNameMismatch { expected, received })
            if expected == "inventory" && received == "somewhere_else"
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn warnings_and_events_reach_the_owner() {
    setup_tracing();
    let server = MockServer::start_with(Arc::new(|req: &ReceivedRequest| {
        let tag = first_value(req)?;
        Some(Reaction::single_blob(&tag).with_warning("Aggregation query used without partition key"))
    }))
    .await;
    let (event_sender, mut event_receiver) = mpsc::channel(8);
    let config = ConnectionConfig {
        event_sender: Some(event_sender),
        ..Default::default()
    };
    let (connection, _error_receiver) = connect(&server, config).await;
    assert_eq!(server.count(RequestOpcode::Register), 1);

    let response = connection
        .send_request(&tagged_query(b"w"), 1, false)
        .await
        .unwrap();
    assert_eq!(
        response.warnings,
        vec!["Aggregation query used without partition key".to_owned()]
    );

    let peer = "127.0.0.9:9042".parse().unwrap();
    server.push_status_change(false, peer);
    assert_eq!(
        event_receiver.recv().await,
        Some(Event::StatusChange(StatusChangeEvent::Down(peer)))
    );
    assert!(connection.is_connected());
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn unanswered_handshake_times_out() {
    setup_tracing();
    let server = MockServer::start_with(Arc::new(|req: &ReceivedRequest| {
        (req.opcode == RequestOpcode::Options).then_some(Reaction::NoReply)
    }))
    .await;
    let node = Arc::new(Node::new(server.address(), Duration::from_secs(60)));
    let config = ConnectionConfig {
        connect_timeout: Duration::from_millis(200),
        ..Default::default()
    };

    let err = open_connection(&node, &config).await.err().unwrap();
    assert_matches!(err, TransportError::ConnectTimeout(addr) if addr == server.address());
    assert!(!node.is_usable());
}
