//! In-process CQL server used by the network tests.
//!
//! Every request is offered to the test's script first; whatever the script
//! does not answer gets a plausible default reply (handshake, system tables,
//! `USE`, prepare/execute bookkeeping). Frames are counted per opcode.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes};
use cqlmux_cql::frame::request::batch::BatchStatement;
use cqlmux_cql::frame::request::{Request, RequestOpcode};
use cqlmux_cql::frame::response::error::DbError;
use cqlmux_cql::frame::response::result::ColumnType;
use cqlmux_cql::frame::response::ResponseOpcode;
use cqlmux_cql::frame::{types, FLAG_TRACING, FLAG_WARNING};
use cqlmux_cql::value::{Codec, NativeCodec, SerializedValues};
use cqlmux_cql::ProtocolVersion;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

/// What the server got, in a form scripts can match on.
#[derive(Debug, Clone)]
pub(crate) struct ReceivedRequest {
    pub(crate) server: SocketAddr,
    pub(crate) opcode: RequestOpcode,
    pub(crate) version: ProtocolVersion,
    /// 1-based count of frames with this opcode seen by this server so far.
    pub(crate) nth: usize,
    /// Statement text of a QUERY or PREPARE.
    pub(crate) text: Option<String>,
    pub(crate) values: Option<SerializedValues>,
    pub(crate) prepared_id: Option<Bytes>,
    pub(crate) auth_token: Option<Vec<u8>>,
    /// Statements of a BATCH, prepared ones resolved to their text.
    pub(crate) batched: Vec<String>,
    /// Id of the first prepared statement of a BATCH this server does not know.
    pub(crate) unknown_batched_id: Option<Bytes>,
}

impl ReceivedRequest {
    pub(crate) fn is_query(&self, text: &str) -> bool {
        self.opcode == RequestOpcode::Query && self.text.as_deref() == Some(text)
    }
}

pub(crate) struct Reply {
    opcode: ResponseOpcode,
    body: Vec<u8>,
    delay: Option<Duration>,
    warnings: Vec<String>,
}

pub(crate) enum Reaction {
    Reply(Reply),
    /// Swallow the request; its stream stays busy.
    NoReply,
    /// Close the socket without answering.
    CloseConnection,
}

const RESULT_VOID: i32 = 0x0001;
const RESULT_ROWS: i32 = 0x0002;
const RESULT_SET_KEYSPACE: i32 = 0x0003;
const RESULT_PREPARED: i32 = 0x0004;
const GLOBAL_TABLES_SPEC: i32 = 0x0001;
const NO_METADATA: i32 = 0x0004;

impl Reaction {
    fn reply(opcode: ResponseOpcode, body: Vec<u8>) -> Self {
        Reaction::Reply(Reply {
            opcode,
            body,
            delay: None,
            warnings: Vec::new(),
        })
    }

    pub(crate) fn ready() -> Self {
        Self::reply(ResponseOpcode::Ready, Vec::new())
    }

    pub(crate) fn void() -> Self {
        let mut body = Vec::new();
        types::write_int(RESULT_VOID, &mut body);
        Self::reply(ResponseOpcode::Result, body)
    }

    pub(crate) fn set_keyspace(name: &str) -> Self {
        let mut body = Vec::new();
        types::write_int(RESULT_SET_KEYSPACE, &mut body);
        types::write_string(name, &mut body).unwrap();
        Self::reply(ResponseOpcode::Result, body)
    }

    pub(crate) fn authenticate(authenticator: &str) -> Self {
        let mut body = Vec::new();
        types::write_string(authenticator, &mut body).unwrap();
        Self::reply(ResponseOpcode::Authenticate, body)
    }

    pub(crate) fn auth_success() -> Self {
        let mut body = Vec::new();
        types::write_bytes_opt(None::<&[u8]>, &mut body).unwrap();
        Self::reply(ResponseOpcode::AuthSuccess, body)
    }

    pub(crate) fn error(error: DbError, reason: &str) -> Self {
        let mut body = Vec::new();
        error.serialize_with_reason(reason, &mut body).unwrap();
        Self::reply(ResponseOpcode::Error, body)
    }

    pub(crate) fn unprepared(statement_id: Bytes) -> Self {
        Self::error(DbError::Unprepared { statement_id }, "unknown statement")
    }

    pub(crate) fn supported(options: &HashMap<String, Vec<String>>) -> Self {
        let mut body = Vec::new();
        types::write_string_multimap(options, &mut body).unwrap();
        Self::reply(ResponseOpcode::Supported, body)
    }

    /// A rows result of `table` with the given columns.
    pub(crate) fn rows(
        table: &str,
        columns: &[(&str, ColumnType)],
        rows: &[Vec<Option<Bytes>>],
    ) -> Self {
        let mut body = Vec::new();
        types::write_int(RESULT_ROWS, &mut body);
        types::write_int(GLOBAL_TABLES_SPEC, &mut body);
        types::write_int(columns.len() as i32, &mut body);
        types::write_string("ks", &mut body).unwrap();
        types::write_string(table, &mut body).unwrap();
        for (name, typ) in columns {
            types::write_string(name, &mut body).unwrap();
            typ.serialize(&mut body).unwrap();
        }
        types::write_int(rows.len() as i32, &mut body);
        for row in rows {
            for cell in row {
                types::write_bytes_opt(cell.as_ref(), &mut body).unwrap();
            }
        }
        Self::reply(ResponseOpcode::Result, body)
    }

    /// A single blob column `payload` holding `value`.
    pub(crate) fn single_blob(value: &[u8]) -> Self {
        Self::rows(
            "payloads",
            &[("payload", ColumnType::Blob)],
            &[vec![Some(Bytes::copy_from_slice(value))]],
        )
    }

    pub(crate) fn delayed(mut self, delay: Duration) -> Self {
        if let Reaction::Reply(reply) = &mut self {
            reply.delay = Some(delay);
        }
        self
    }

    pub(crate) fn with_warning(mut self, warning: &str) -> Self {
        if let Reaction::Reply(reply) = &mut self {
            reply.warnings.push(warning.to_owned());
        }
        self
    }
}

pub(crate) type Script = Arc<dyn Fn(&ReceivedRequest) -> Option<Reaction> + Send + Sync>;

/// A node of a mocked cluster, as described by its system tables.
#[derive(Debug, Clone)]
pub(crate) struct MockNode {
    pub(crate) address: SocketAddr,
    pub(crate) host_id: Uuid,
    pub(crate) datacenter: String,
    pub(crate) rack: String,
    pub(crate) tokens: Vec<i64>,
}

enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

struct Shared {
    address: SocketAddr,
    script: Mutex<Option<Script>>,
    topology: Arc<Mutex<Vec<MockNode>>>,
    counts: Mutex<HashMap<RequestOpcode, usize>>,
    queries: Mutex<Vec<String>>,
    prepared: Mutex<HashMap<Bytes, String>>,
    accepted: AtomicUsize,
    registered: Mutex<Vec<(ProtocolVersion, mpsc::UnboundedSender<Outgoing>)>>,
    stop: CancellationToken,
    kill: Mutex<CancellationToken>,
}

pub(crate) struct MockServer {
    shared: Arc<Shared>,
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shared.stop.cancel();
    }
}

impl MockServer {
    /// A one node cluster owning the whole ring.
    pub(crate) async fn start() -> MockServer {
        let mut servers = Self::cluster(1).await;
        servers.remove(0)
    }

    pub(crate) async fn start_with(script: Script) -> MockServer {
        let server = Self::start().await;
        server.set_script(script);
        server
    }

    /// `n` servers on loopback that report each other as peers. Tokens split
    /// the ring evenly, node `i` owning the range ending at its token.
    pub(crate) async fn cluster(n: usize) -> Vec<MockServer> {
        let mut listeners = Vec::with_capacity(n);
        for _ in 0..n {
            listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
        }

        let step = u64::MAX as i128 / n as i128;
        let topology: Vec<MockNode> = listeners
            .iter()
            .enumerate()
            .map(|(i, listener)| MockNode {
                address: listener.local_addr().unwrap(),
                host_id: Uuid::new_v4(),
                datacenter: "dc1".to_owned(),
                rack: format!("rack{}", i % 2),
                tokens: vec![(i64::MIN as i128 + step * (i as i128 + 1)) as i64],
            })
            .collect();
        let topology = Arc::new(Mutex::new(topology));

        listeners
            .into_iter()
            .map(|listener| {
                let stop = CancellationToken::new();
                let shared = Arc::new(Shared {
                    address: listener.local_addr().unwrap(),
                    script: Mutex::new(None),
                    topology: topology.clone(),
                    counts: Mutex::new(HashMap::new()),
                    queries: Mutex::new(Vec::new()),
                    prepared: Mutex::new(HashMap::new()),
                    accepted: AtomicUsize::new(0),
                    registered: Mutex::new(Vec::new()),
                    kill: Mutex::new(stop.child_token()),
                    stop,
                });
                tokio::spawn(accept_loop(listener, shared.clone()));
                MockServer { shared }
            })
            .collect()
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.shared.address
    }

    pub(crate) fn set_script(&self, script: Script) {
        *self.shared.script.lock().unwrap() = Some(script);
    }

    pub(crate) fn count(&self, opcode: RequestOpcode) -> usize {
        self.shared
            .counts
            .lock()
            .unwrap()
            .get(&opcode)
            .copied()
            .unwrap_or(0)
    }

    /// QUERY and PREPARE texts in arrival order.
    pub(crate) fn statements(&self) -> Vec<String> {
        self.shared.queries.lock().unwrap().clone()
    }

    pub(crate) fn accepted_connections(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    pub(crate) fn topology(&self) -> Vec<MockNode> {
        self.shared.topology.lock().unwrap().clone()
    }

    pub(crate) fn set_topology(&self, nodes: Vec<MockNode>) {
        *self.shared.topology.lock().unwrap() = nodes;
    }

    /// Forgets every prepared statement, as a restarted node would.
    pub(crate) fn forget_prepared(&self) {
        self.shared.prepared.lock().unwrap().clear();
    }

    /// Closes every open connection; the server keeps accepting new ones.
    pub(crate) fn drop_connections(&self) {
        let mut kill = self.shared.kill.lock().unwrap();
        kill.cancel();
        *kill = self.shared.stop.child_token();
    }

    /// Sends `STATUS_CHANGE` to every connection that registered for events.
    pub(crate) fn push_status_change(&self, up: bool, node: SocketAddr) {
        self.push_event(|buf| {
            types::write_string("STATUS_CHANGE", buf).unwrap();
            types::write_string(if up { "UP" } else { "DOWN" }, buf).unwrap();
            types::write_inet(node, buf);
        });
    }

    pub(crate) fn push_topology_change(&self, new_node: bool, node: SocketAddr) {
        self.push_event(|buf| {
            types::write_string("TOPOLOGY_CHANGE", buf).unwrap();
            types::write_string(if new_node { "NEW_NODE" } else { "REMOVED_NODE" }, buf)
                .unwrap();
            types::write_inet(node, buf);
        });
    }

    fn push_event(&self, write_body: impl Fn(&mut Vec<u8>)) {
        let mut body = Vec::new();
        write_body(&mut body);
        let mut registered = self.shared.registered.lock().unwrap();
        registered.retain(|(version, sender)| {
            let frame = encode_frame(*version, 0, -1, ResponseOpcode::Event, &body);
            sender.send(Outgoing::Frame(frame)).is_ok()
        });
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        let socket = tokio::select! {
            _ = shared.stop.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((socket, _)) => socket,
                Err(_) => return,
            },
        };
        shared.accepted.fetch_add(1, Ordering::SeqCst);
        let kill = shared.kill.lock().unwrap().clone();
        tokio::spawn(serve_connection(socket, shared.clone(), kill));
    }
}

struct RawRequest {
    version: ProtocolVersion,
    flags: u8,
    stream: i16,
    opcode: RequestOpcode,
    body: Bytes,
}

async fn read_request(read_half: &mut (impl AsyncRead + Unpin)) -> Option<RawRequest> {
    let version = read_half.read_u8().await.ok()? & 0x7F;
    let version = ProtocolVersion::try_from(version).ok()?;
    let flags = read_half.read_u8().await.ok()?;
    let stream = match version.stream_id_width() {
        1 => read_half.read_i8().await.ok()? as i16,
        _ => read_half.read_i16().await.ok()?,
    };
    let opcode = RequestOpcode::try_from(read_half.read_u8().await.ok()?).ok()?;
    let length = read_half.read_u32().await.ok()? as usize;
    let mut body = vec![0; length];
    read_half.read_exact(&mut body).await.ok()?;
    Some(RawRequest {
        version,
        flags,
        stream,
        opcode,
        body: body.into(),
    })
}

fn encode_frame(
    version: ProtocolVersion,
    flags: u8,
    stream: i16,
    opcode: ResponseOpcode,
    body: &[u8],
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(version.header_size() + body.len());
    frame.put_u8(0x80 | version.as_u8());
    frame.put_u8(flags);
    match version.stream_id_width() {
        1 => frame.put_i8(stream as i8),
        _ => frame.put_i16(stream),
    }
    frame.put_u8(opcode as u8);
    frame.put_u32(body.len() as u32);
    frame.extend_from_slice(body);
    frame
}

async fn serve_connection(socket: TcpStream, shared: Arc<Shared>, kill: CancellationToken) {
    let (mut read_half, mut write_half) = socket.into_split();
    let (sender, mut receiver) = mpsc::unbounded_channel::<Outgoing>();

    let writer_kill = kill.clone();
    tokio::spawn(async move {
        loop {
            let outgoing = tokio::select! {
                _ = writer_kill.cancelled() => break,
                outgoing = receiver.recv() => outgoing,
            };
            match outgoing {
                Some(Outgoing::Frame(frame)) => {
                    if write_half.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                Some(Outgoing::Close) | None => break,
            }
        }
        // Dropping the write half shuts the socket down.
    });

    loop {
        let raw = tokio::select! {
            _ = kill.cancelled() => return,
            raw = read_request(&mut read_half) => match raw {
                Some(raw) => raw,
                None => return,
            },
        };

        let request = match Request::deserialize(&mut &raw.body[..], raw.opcode) {
            Ok(request) => request,
            Err(_) => {
                let reply = Reaction::error(DbError::ProtocolError, "malformed request");
                send_reaction(reply, &raw, &sender);
                continue;
            }
        };

        let received = describe(&shared, &raw, &request);
        let script = shared.script.lock().unwrap().clone();
        let reaction = script
            .and_then(|script| script(&received))
            .unwrap_or_else(|| default_reaction(&shared, &received));

        if raw.opcode == RequestOpcode::Register {
            shared
                .registered
                .lock()
                .unwrap()
                .push((raw.version, sender.clone()));
        }

        if matches!(reaction, Reaction::CloseConnection) {
            let _ = sender.send(Outgoing::Close);
            return;
        }
        send_reaction(reaction, &raw, &sender);
    }
}

fn describe(shared: &Shared, raw: &RawRequest, request: &Request<'_>) -> ReceivedRequest {
    let nth = {
        let mut counts = shared.counts.lock().unwrap();
        let count = counts.entry(raw.opcode).or_insert(0);
        *count += 1;
        *count
    };

    let auth_token = match request {
        Request::AuthResponse(auth) => auth.response.clone(),
        _ => None,
    };
    let (text, values, prepared_id) = match request {
        Request::Query(query) => (
            Some(query.contents.to_string()),
            Some(query.parameters.values.clone().into_owned()),
            None,
        ),
        Request::Prepare(prepare) => (Some(prepare.query.to_string()), None, None),
        Request::Execute(execute) => (
            None,
            Some(execute.parameters.values.clone().into_owned()),
            Some(execute.id.clone()),
        ),
        _ => (None, None, None),
    };
    if let Some(text) = &text {
        shared.queries.lock().unwrap().push(text.clone());
    }

    let mut batched = Vec::new();
    let mut unknown_batched_id = None;
    if let Request::Batch(batch) = request {
        let prepared = shared.prepared.lock().unwrap();
        for statement in &batch.statements {
            match statement {
                BatchStatement::Query { text } => batched.push(text.to_string()),
                BatchStatement::Prepared { id } => match prepared.get(id) {
                    Some(text) => batched.push(text.clone()),
                    None => {
                        unknown_batched_id.get_or_insert_with(|| id.clone());
                    }
                },
            }
        }
    }

    ReceivedRequest {
        server: shared.address,
        opcode: raw.opcode,
        version: raw.version,
        nth,
        text,
        values,
        prepared_id,
        auth_token,
        batched,
        unknown_batched_id,
    }
}

fn send_reaction(reaction: Reaction, raw: &RawRequest, sender: &mpsc::UnboundedSender<Outgoing>) {
    let Reaction::Reply(reply) = reaction else {
        return;
    };

    let mut flags = 0;
    let mut body = Vec::new();
    if raw.flags & FLAG_TRACING != 0 && reply.opcode == ResponseOpcode::Result {
        flags |= FLAG_TRACING;
        types::write_uuid(&TRACE_ID, &mut body);
    }
    if !reply.warnings.is_empty() && raw.version.supports_warnings() {
        flags |= FLAG_WARNING;
        types::write_string_list(&reply.warnings, &mut body).unwrap();
    }
    body.extend_from_slice(&reply.body);
    let frame = encode_frame(raw.version, flags, raw.stream, reply.opcode, &body);

    match reply.delay {
        None => {
            let _ = sender.send(Outgoing::Frame(frame));
        }
        Some(delay) => {
            let sender = sender.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = sender.send(Outgoing::Frame(frame));
            });
        }
    }
}

/// Tracing session id of every traced request this server answers.
pub(crate) const TRACE_ID: Uuid = Uuid::from_u128(0x7ace_0000_0000_1000_8000_0000_0000_0001);

pub(crate) const SYSTEM_LOCAL_QUERY: &str = "SELECT * FROM system.local WHERE key='local'";
pub(crate) const SYSTEM_PEERS_QUERY: &str = "SELECT * FROM system.peers";

fn default_reaction(shared: &Shared, request: &ReceivedRequest) -> Reaction {
    match request.opcode {
        RequestOpcode::Options => Reaction::supported(&HashMap::from([(
            "CQL_VERSION".to_owned(),
            vec!["3.4.5".to_owned()],
        )])),
        RequestOpcode::Startup | RequestOpcode::Register => Reaction::ready(),
        RequestOpcode::AuthResponse => Reaction::error(
            DbError::AuthenticationError,
            "authentication is not configured",
        ),
        RequestOpcode::Query => {
            let text = request.text.as_deref().unwrap_or_default();
            if text == SYSTEM_LOCAL_QUERY {
                system_local(shared, request.version)
            } else if text == SYSTEM_PEERS_QUERY {
                system_peers(shared, request.version)
            } else if let Some(keyspace) = text.strip_prefix("USE ") {
                Reaction::set_keyspace(keyspace.trim_matches('"'))
            } else {
                Reaction::void()
            }
        }
        RequestOpcode::Prepare => {
            let text = request.text.clone().unwrap_or_default();
            let id = prepared_id(shared.address, &text);
            let reaction = prepared(&id, text.matches('?').count(), request.version);
            shared.prepared.lock().unwrap().insert(id, text);
            reaction
        }
        RequestOpcode::Execute => {
            let id = request.prepared_id.clone().unwrap_or_default();
            if shared.prepared.lock().unwrap().contains_key(&id) {
                Reaction::void()
            } else {
                Reaction::unprepared(id)
            }
        }
        RequestOpcode::Batch => match &request.unknown_batched_id {
            Some(id) => Reaction::unprepared(id.clone()),
            None => Reaction::void(),
        },
    }
}

/// Statement ids are node local: the same text gets a different id on
/// every server.
pub(crate) fn prepared_id(server: SocketAddr, text: &str) -> Bytes {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    let mut id = Vec::with_capacity(10);
    id.put_u16(server.port());
    id.put_u64(hasher.finish());
    id.into()
}

fn prepared(id: &[u8], bind_markers: usize, version: ProtocolVersion) -> Reaction {
    let mut body = Vec::new();
    types::write_int(RESULT_PREPARED, &mut body);
    types::write_short_bytes(id, &mut body).unwrap();

    types::write_int(GLOBAL_TABLES_SPEC, &mut body);
    types::write_int(bind_markers as i32, &mut body);
    if version >= ProtocolVersion::V4 {
        // The first marker is the partition key.
        let pk_count = bind_markers.min(1);
        types::write_int(pk_count as i32, &mut body);
        if pk_count == 1 {
            types::write_short(0, &mut body);
        }
    }
    types::write_string("ks", &mut body).unwrap();
    types::write_string("tab", &mut body).unwrap();
    for i in 0..bind_markers {
        types::write_string(&format!("c{i}"), &mut body).unwrap();
        ColumnType::Blob.serialize(&mut body).unwrap();
    }

    types::write_int(NO_METADATA, &mut body);
    types::write_int(0, &mut body);
    Reaction::reply(ResponseOpcode::Result, body)
}

pub(crate) fn cell<T>(value: &T, typ: &ColumnType, version: ProtocolVersion) -> Option<Bytes>
where
    NativeCodec: Codec<T>,
{
    NativeCodec.serialize(value, typ, version).unwrap()
}

fn text_set() -> ColumnType {
    ColumnType::Set(Box::new(ColumnType::Text))
}

fn token_strings(node: &MockNode) -> Vec<String> {
    node.tokens.iter().map(i64::to_string).collect()
}

fn system_local(shared: &Shared, version: ProtocolVersion) -> Reaction {
    let topology = shared.topology.lock().unwrap();
    let rows: Vec<Vec<Option<Bytes>>> = topology
        .iter()
        .filter(|node| node.address == shared.address)
        .map(|node| {
            vec![
                cell(&"local".to_owned(), &ColumnType::Text, version),
                cell(&node.host_id, &ColumnType::Uuid, version),
                cell(&node.datacenter, &ColumnType::Text, version),
                cell(&node.rack, &ColumnType::Text, version),
                cell(&token_strings(node), &text_set(), version),
            ]
        })
        .collect();
    Reaction::rows(
        "local",
        &[
            ("key", ColumnType::Text),
            ("host_id", ColumnType::Uuid),
            ("data_center", ColumnType::Text),
            ("rack", ColumnType::Text),
            ("tokens", text_set()),
        ],
        &rows,
    )
}

fn system_peers(shared: &Shared, version: ProtocolVersion) -> Reaction {
    let topology = shared.topology.lock().unwrap();
    let rows: Vec<Vec<Option<Bytes>>> = topology
        .iter()
        .filter(|node| node.address != shared.address)
        .map(|node| {
            vec![
                cell(&node.address.ip(), &ColumnType::Inet, version),
                cell(&node.address.ip(), &ColumnType::Inet, version),
                cell(&i32::from(node.address.port()), &ColumnType::Int, version),
                cell(&node.host_id, &ColumnType::Uuid, version),
                cell(&node.datacenter, &ColumnType::Text, version),
                cell(&node.rack, &ColumnType::Text, version),
                cell(&token_strings(node), &text_set(), version),
            ]
        })
        .collect();
    Reaction::rows(
        "peers",
        &[
            ("peer", ColumnType::Inet),
            ("rpc_address", ColumnType::Inet),
            ("native_port", ColumnType::Int),
            ("host_id", ColumnType::Uuid),
            ("data_center", ColumnType::Text),
            ("rack", ColumnType::Text),
            ("tokens", text_set()),
        ],
        &rows,
    )
}

/// Reads the first bound value of a request, which tests use as a tag.
pub(crate) fn first_value(request: &ReceivedRequest) -> Option<Bytes> {
    let values = request.values.as_ref()?;
    values.get(0).flatten().map(Bytes::copy_from_slice)
}

