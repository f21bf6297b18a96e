use bytes::Bytes;
use cqlmux_cql::frame::request::{self, SerializableRequest};
use cqlmux_cql::frame::response::event::Event;
use cqlmux_cql::frame::response::result::{self, Prepared};
use cqlmux_cql::frame::response::{
    authenticate::Authenticate, NonErrorResponse, Response, ResponseOpcode,
};
use cqlmux_cql::frame::server_event_type::EventType;
use cqlmux_cql::frame::{self, FrameParams, SerializedRequest};
use cqlmux_cql::{Compression, Consistency, ProtocolVersion};
use futures::{future::RemoteHandle, FutureExt};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, trace, warn};

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::authentication::AuthenticatorProvider;
use crate::cluster::node::Node;
use crate::errors::{
    BadKeyspaceName, BrokenConnectionError, ConnectionSetupError, RequestAttemptError,
    TransportError,
};
use crate::response::QueryResponse;

// Room for requests between the callers and the writer. The stream permits
// bound the number of requests on the wire, not this queue.
const SUBMIT_QUEUE_SIZE: usize = 1024;

/// Settings of a single connection, derived from the cluster configuration.
#[derive(Clone)]
pub(crate) struct ConnectionConfig {
    pub(crate) version: ProtocolVersion,
    pub(crate) compression: Option<Compression>,
    pub(crate) tcp_nodelay: bool,
    pub(crate) tcp_keepalive_interval: Option<Duration>,
    pub(crate) connect_timeout: Duration,
    pub(crate) authenticator: Option<Arc<dyn AuthenticatorProvider>>,
    pub(crate) keyspace: Option<VerifiedKeyspaceName>,
    /// Set only for the control connection, which REGISTERs for events.
    pub(crate) event_sender: Option<mpsc::Sender<Event>>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::default(),
            compression: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            connect_timeout: Duration::from_secs(5),
            authenticator: None,
            keyspace: None,
            event_sender: None,
        }
    }
}

pub(crate) type ErrorReceiver = oneshot::Receiver<BrokenConnectionError>;

/// One multiplexed socket to one node.
///
/// Any number of tasks may call [`Connection::send_request`] at the same
/// time; requests are tagged with free stream ids and responses are routed
/// back by stream id, in whatever order the server answers.
pub struct Connection {
    _worker_handle: RemoteHandle<()>,

    node: Arc<Node>,
    config: ConnectionConfig,
    router_handle: Arc<RouterHandle>,

    // Sum of the loads of requests in flight.
    load: AtomicUsize,
    // Holders that got this connection from a strategy and did not return it.
    in_use: AtomicUsize,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.node.address)
            .field("version", &self.config.version)
            .field("load", &self.load())
            .field("in_use", &self.in_use())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

struct RouterHandle {
    submit_channel: mpsc::Sender<Task>,
    // One permit per stream id the protocol allows. Closed when the router
    // stops, which wakes every waiter.
    stream_permits: Arc<Semaphore>,
}

impl RouterHandle {
    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        version: ProtocolVersion,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<TaskResponse, RequestAttemptError> {
        let serialized_request = SerializedRequest::make(request, version, compression, tracing)?;

        let permit = match self.stream_permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                trace!("All stream ids are in use, waiting for a response to free one");
                self.stream_permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| BrokenConnectionError::ChannelError)?
            }
        };

        let (response_sender, receiver) = oneshot::channel();
        let response_handler = ResponseHandler {
            response_sender,
            _stream_permit: permit,
        };

        self.submit_channel
            .send(Task {
                serialized_request,
                response_handler,
            })
            .await
            .map_err(|_| BrokenConnectionError::ChannelError)?;

        // From here on, dropping this future leaves the handler registered;
        // the response still frees the stream id when it arrives.
        receiver
            .await
            .map_err(|_| BrokenConnectionError::ChannelError)?
    }
}

struct ResponseHandler {
    response_sender: oneshot::Sender<Result<TaskResponse, RequestAttemptError>>,
    // Released together with the handler, i.e. after the stream id is freed.
    _stream_permit: OwnedSemaphorePermit,
}

struct Task {
    serialized_request: SerializedRequest,
    response_handler: ResponseHandler,
}

struct TaskResponse {
    params: FrameParams,
    opcode: ResponseOpcode,
    body: Bytes,
}

// Decrements the connection load however the request ends.
struct LoadGuard<'a> {
    counter: &'a AtomicUsize,
    load: usize,
}

impl<'a> LoadGuard<'a> {
    fn new(counter: &'a AtomicUsize, load: usize) -> Self {
        counter.fetch_add(load, AtomicOrdering::Relaxed);
        LoadGuard { counter, load }
    }
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(self.load, AtomicOrdering::Relaxed);
    }
}

impl Connection {
    /// Opens a TCP connection and starts the router, without any handshake.
    async fn new(
        node: Arc<Node>,
        config: ConnectionConfig,
    ) -> Result<(Self, ErrorReceiver), TransportError> {
        let address = node.address;
        let stream = connect(address)
            .await
            .map_err(|e| TransportError::ConnectFailed(address, Arc::new(e)))?;
        let configure = |stream: &TcpStream| -> std::io::Result<()> {
            stream.set_nodelay(config.tcp_nodelay)?;
            if let Some(tcp_keepalive_interval) = config.tcp_keepalive_interval {
                Self::setup_tcp_keepalive(stream, tcp_keepalive_interval)?;
            }
            Ok(())
        };
        configure(&stream).map_err(|e| TransportError::ConnectFailed(address, Arc::new(e)))?;

        let (sender, receiver) = mpsc::channel(SUBMIT_QUEUE_SIZE);
        let (error_sender, error_receiver) = oneshot::channel();
        let stream_permits = Arc::new(Semaphore::new(config.version.max_stream_count()));

        let router_handle = Arc::new(RouterHandle {
            submit_channel: sender,
            stream_permits: stream_permits.clone(),
        });

        let (task, _worker_handle) = Self::router(
            RouterConfig {
                version: config.version,
                compression: config.compression,
                event_sender: config.event_sender.clone(),
            },
            stream,
            receiver,
            error_sender,
            stream_permits,
            node.clone(),
        )
        .remote_handle();
        tokio::task::spawn(task);

        let connection = Connection {
            _worker_handle,
            node,
            config,
            router_handle,
            load: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
        };

        Ok((connection, error_receiver))
    }

    fn setup_tcp_keepalive(
        stream: &TcpStream,
        tcp_keepalive_interval: Duration,
    ) -> std::io::Result<()> {
        // Our interval is the idle time before the first keepalive packet,
        // which socket2 calls "time"; its "interval" is the gap between packets.
        let tcp_keepalive = TcpKeepalive::new().with_time(tcp_keepalive_interval);

        #[cfg(any(
            target_os = "android",
            target_os = "freebsd",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "windows",
        ))]
        let tcp_keepalive = tcp_keepalive.with_interval(Duration::from_secs(1));

        let sf = SockRef::from(&stream);
        sf.set_tcp_keepalive(&tcp_keepalive)
    }

    /// Sends a request and waits for its response.
    ///
    /// `load` is added to [`Connection::load`] while the request is in
    /// flight. Waiting for a free stream id can be cancelled by dropping the
    /// future; once the frame is submitted, dropping only discards the
    /// response.
    pub async fn send_request(
        &self,
        request: &impl SerializableRequest,
        load: usize,
        tracing: bool,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let _load_guard = LoadGuard::new(&self.load, load);
        self.send_request_inner(request, true, tracing).await
    }

    async fn send_request_inner(
        &self,
        request: &impl SerializableRequest,
        compress: bool,
        tracing: bool,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let compression = if compress {
            self.config.compression
        } else {
            None
        };

        let task_response = self
            .router_handle
            .send_request(request, self.config.version, compression, tracing)
            .await?;

        Self::parse_response(task_response, self.config.version, self.config.compression)
    }

    fn parse_response(
        task_response: TaskResponse,
        version: ProtocolVersion,
        compression: Option<Compression>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let body_with_ext = frame::parse_response_body_extensions(
            task_response.params.flags,
            compression,
            task_response.body,
        )
        .map_err(RequestAttemptError::BodyExtensions)?;

        for warn_description in &body_with_ext.warnings {
            warn!(
                warning = warn_description.as_str(),
                "Response from the database contains a warning",
            );
        }

        let response =
            Response::deserialize(version, task_response.opcode, body_with_ext.body, None)?;

        Ok(QueryResponse {
            response,
            warnings: body_with_ext.warnings,
            tracing_id: body_with_ext.trace_id,
        })
    }

    async fn get_options(&self) -> Result<cqlmux_cql::frame::response::Supported, ConnectionSetupError> {
        let response = self
            .send_request_inner(&request::Options, false, false)
            .await?
            .into_non_error_query_response()?;
        match response.response {
            NonErrorResponse::Supported(supported) => Ok(supported),
            other => Err(ConnectionSetupError::UnexpectedResponse {
                request: "OPTIONS",
                response: other.to_response_kind(),
            }),
        }
    }

    async fn startup(
        &self,
        options: HashMap<Cow<'_, str>, Cow<'_, str>>,
    ) -> Result<Option<Authenticate>, ConnectionSetupError> {
        let response = self
            .send_request_inner(&request::Startup { options }, false, false)
            .await?
            .into_non_error_query_response()?;
        match response.response {
            NonErrorResponse::Ready => Ok(None),
            NonErrorResponse::Authenticate(auth) => Ok(Some(auth)),
            other => Err(ConnectionSetupError::UnexpectedResponse {
                request: "STARTUP",
                response: other.to_response_kind(),
            }),
        }
    }

    async fn perform_authenticate(
        &self,
        authenticate: &Authenticate,
    ) -> Result<(), ConnectionSetupError> {
        let authenticator_name = authenticate.authenticator_name.as_str();
        let Some(provider) = &self.config.authenticator else {
            return Err(ConnectionSetupError::MissingAuthentication(
                authenticator_name.to_owned(),
            ));
        };

        let (mut response, mut auth_session) = provider
            .start_authentication_session(authenticator_name)
            .await
            .map_err(ConnectionSetupError::Authentication)?;

        loop {
            let reply = self
                .send_request_inner(&request::AuthResponse { response }, false, false)
                .await?
                .into_non_error_query_response()?;
            match reply.response {
                NonErrorResponse::AuthChallenge(challenge) => {
                    response = auth_session
                        .evaluate_challenge(challenge.authenticate_message.as_deref())
                        .await
                        .map_err(ConnectionSetupError::Authentication)?;
                }
                NonErrorResponse::AuthSuccess(success) => {
                    auth_session
                        .success(success.success_message.as_deref())
                        .await
                        .map_err(ConnectionSetupError::Authentication)?;
                    return Ok(());
                }
                other => {
                    return Err(ConnectionSetupError::UnexpectedResponse {
                        request: "AUTH_RESPONSE",
                        response: other.to_response_kind(),
                    })
                }
            }
        }
    }

    async fn register(&self, event_types: Vec<EventType>) -> Result<(), ConnectionSetupError> {
        let register_frame = request::Register {
            event_types_to_register_for: event_types,
        };
        let response = self
            .send_request_inner(&register_frame, true, false)
            .await?
            .into_non_error_query_response()?;
        match response.response {
            NonErrorResponse::Ready => Ok(()),
            other => Err(ConnectionSetupError::UnexpectedResponse {
                request: "REGISTER",
                response: other.to_response_kind(),
            }),
        }
    }

    /// Runs a statement without bound values. Used for the driver's own
    /// queries (system tables, `USE`).
    pub(crate) async fn query_unpaged(
        &self,
        contents: &str,
        consistency: Consistency,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let query = request::Query {
            contents: Cow::Borrowed(contents),
            parameters: request::query::QueryParameters {
                consistency,
                ..Default::default()
            },
        };
        self.send_request(&query, 1, false).await
    }

    pub(crate) async fn prepare(&self, query: &str) -> Result<Prepared, RequestAttemptError> {
        let response = self
            .send_request(
                &request::Prepare {
                    query: Cow::Borrowed(query),
                },
                1,
                false,
            )
            .await?
            .into_non_error_query_response()?;
        match response.response {
            NonErrorResponse::Result(result::Result::Prepared(prepared)) => Ok(prepared),
            other => Err(RequestAttemptError::UnexpectedResponse(
                other.to_response_kind(),
            )),
        }
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<(), RequestAttemptError> {
        // Quoted, so the name is taken as given.
        let query = format!("USE \"{}\"", keyspace_name.as_str());
        let response = self
            .query_unpaged(&query, Consistency::default())
            .await?
            .into_non_error_query_response()?;
        match response.response {
            NonErrorResponse::Result(result::Result::SetKeyspace(set_keyspace)) => {
                if set_keyspace.keyspace_name != keyspace_name.as_str() {
                    return Err(RequestAttemptError::KeyspaceNameMismatch {
                        expected: keyspace_name.as_str().to_owned(),
                        received: set_keyspace.keyspace_name,
                    });
                }
                Ok(())
            }
            other => Err(RequestAttemptError::UnexpectedResponse(
                other.to_response_kind(),
            )),
        }
    }

    /// Whether the router is still running. A broken connection never
    /// recovers.
    pub fn is_connected(&self) -> bool {
        !self.router_handle.submit_channel.is_closed()
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn address(&self) -> SocketAddr {
        self.node.address
    }

    pub fn version(&self) -> ProtocolVersion {
        self.config.version
    }

    /// Sum of the loads of the requests in flight on this connection.
    pub fn load(&self) -> usize {
        self.load.load(AtomicOrdering::Relaxed)
    }

    /// Number of stream ids currently free.
    pub fn available_streams(&self) -> usize {
        self.router_handle.stream_permits.available_permits()
    }

    pub(crate) fn in_use(&self) -> usize {
        self.in_use.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn mark_taken(&self) {
        self.in_use.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn mark_returned(&self) {
        // Saturating, a connection returned twice must not wrap around.
        let _ = self
            .in_use
            .fetch_update(AtomicOrdering::Relaxed, AtomicOrdering::Relaxed, |n| {
                n.checked_sub(1)
            });
    }

    async fn router(
        config: RouterConfig,
        stream: impl AsyncRead + AsyncWrite,
        receiver: mpsc::Receiver<Task>,
        error_sender: oneshot::Sender<BrokenConnectionError>,
        stream_permits: Arc<Semaphore>,
        node: Arc<Node>,
    ) {
        let (read_half, write_half) = split(stream);
        // Reader and writer run on this one task and never hold the lock
        // across an .await, so it is never contended.
        let handler_map = StdMutex::new(ResponseHandlerMap::new(config.version.max_stream_count()));

        let r = Self::reader(
            BufReader::with_capacity(8192, read_half),
            &handler_map,
            &config,
        );
        let w = Self::writer(BufWriter::with_capacity(8192, write_half), &handler_map, receiver);

        let result = futures::try_join!(r, w);

        let error: BrokenConnectionError = match result {
            Ok(_) => return, // Connection was dropped, we can return
            Err(err) => err,
        };

        debug!(node = %node.address, error = %error, "Connection broken");
        stream_permits.close();

        // Respond to all pending requests with the error
        let response_handlers = handler_map.into_inner().unwrap().into_handlers();
        for (_, handler) in response_handlers {
            // Ignore sending error, request was dropped
            let _ = handler.response_sender.send(Err(error.clone().into()));
        }

        // If someone is listening for connection errors notify them
        let _ = error_sender.send(error);
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        config: &RouterConfig,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let (params, opcode, body) =
                frame::read_response_frame(&mut read_half, config.version).await?;
            let response = TaskResponse {
                params,
                opcode,
                body,
            };

            match params.stream.cmp(&-1) {
                Ordering::Less => {
                    // Negative streams other than -1 are reserved, nothing uses them.
                    continue;
                }
                Ordering::Equal => {
                    if let Some(event_sender) = config.event_sender.as_ref() {
                        Self::handle_event(response, config, event_sender).await?;
                    }
                    continue;
                }
                _ => {}
            }

            let handler = {
                // We are guaranteed here that handler_map will not be locked
                // by anybody else, so we can do try_lock().unwrap()
                let mut handler_map_guard = handler_map.try_lock().unwrap();
                handler_map_guard.take(params.stream)
            };

            match handler {
                Some(handler) => {
                    // The caller may have given up waiting; that's fine.
                    let _ = handler.response_sender.send(Ok(response));
                }
                None => {
                    // Unsolicited frame. This should not happen and indicates
                    // a bug either in the driver, or in the database
                    error!(
                        "Received response with unexpected StreamId {}",
                        params.stream
                    );
                    return Err(BrokenConnectionError::UnexpectedStreamId(params.stream));
                }
            }
        }
    }

    fn alloc_stream_id(
        handler_map: &StdMutex<ResponseHandlerMap>,
        response_handler: ResponseHandler,
    ) -> Option<i16> {
        let mut handler_map_guard = handler_map.try_lock().unwrap();
        match handler_map_guard.allocate(response_handler) {
            Ok(stream_id) => Some(stream_id),
            Err(response_handler) => {
                error!("Could not allocate stream id");
                let _ = response_handler
                    .response_sender
                    .send(Err(RequestAttemptError::UnableToAllocStreamId));
                None
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        mut task_receiver: mpsc::Receiver<Task>,
    ) -> Result<(), BrokenConnectionError> {
        // When the Connection is dropped the channel closes, this loop ends
        // and the worker handle drop stops the reader too.
        while let Some(task) = task_receiver.recv().await {
            let mut next = Some(task);
            let mut num_requests = 0;
            let mut total_sent = 0;
            // Write everything already queued before flushing once.
            while let Some(task) = next.take() {
                if let Some(stream_id) = Self::alloc_stream_id(handler_map, task.response_handler)
                {
                    let mut req = task.serialized_request;
                    req.set_stream(stream_id);
                    let req_data: &[u8] = req.get_data();
                    total_sent += req_data.len();
                    num_requests += 1;
                    write_half.write_all(req_data).await?;
                }
                next = task_receiver.try_recv().ok();
            }
            trace!("Sending {} requests; {} bytes", num_requests, total_sent);
            write_half.flush().await?;
        }

        Ok(())
    }

    async fn handle_event(
        task_response: TaskResponse,
        config: &RouterConfig,
        event_sender: &mpsc::Sender<Event>,
    ) -> Result<(), BrokenConnectionError> {
        let response = Self::parse_response(task_response, config.version, config.compression)
            .map_err(|e| BrokenConnectionError::EventHandling(e.to_string()))?;
        let event = match response.response {
            Response::Event(event) => event,
            other => {
                return Err(BrokenConnectionError::EventHandling(format!(
                    "expected EVENT on stream -1, got {:?}",
                    other.opcode()
                )))
            }
        };

        if event_sender.send(event).await.is_err() {
            debug!("Event receiver is gone, dropping event");
        }
        Ok(())
    }
}

struct RouterConfig {
    version: ProtocolVersion,
    compression: Option<Compression>,
    event_sender: Option<mpsc::Sender<Event>>,
}

async fn connect(address: SocketAddr) -> std::io::Result<TcpStream> {
    let socket = match address {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.connect(address).await
}

/// Opens a connection to `node` and runs the OPTIONS / STARTUP / auth
/// handshake, then `USE` and `REGISTER` when configured. The whole sequence
/// is bounded by the connect timeout.
pub(crate) async fn open_connection(
    node: &Arc<Node>,
    config: &ConnectionConfig,
) -> Result<(Connection, ErrorReceiver), TransportError> {
    let address = node.address;
    let opened = tokio::time::timeout(config.connect_timeout, open_connection_inner(node, config))
        .await
        .unwrap_or(Err(TransportError::ConnectTimeout(address)));

    match &opened {
        Ok(_) => {
            debug!(node = %address, "Connection opened");
            node.mark_up();
        }
        Err(
            err @ (TransportError::ConnectFailed(..)
            | TransportError::ConnectTimeout(_)
            | TransportError::BrokenConnection(_)),
        ) => {
            warn!(node = %address, error = %err, "Failed to open connection");
            node.mark_down();
        }
        Err(err) => {
            warn!(node = %address, error = %err, "Connection handshake failed");
        }
    }
    opened
}

async fn open_connection_inner(
    node: &Arc<Node>,
    config: &ConnectionConfig,
) -> Result<(Connection, ErrorReceiver), TransportError> {
    let address = node.address;
    let (mut connection, error_receiver) = Connection::new(node.clone(), config.clone()).await?;
    let setup_err = |e: ConnectionSetupError| TransportError::SetupFailed(address, e);

    let mut supported = connection.get_options().await.map_err(setup_err)?;
    let supported_compression = supported
        .options
        .remove(request::options::COMPRESSION)
        .unwrap_or_default();

    let mut options = HashMap::new();
    options.insert(
        Cow::Borrowed(request::options::CQL_VERSION),
        Cow::Borrowed(request::options::DEFAULT_CQL_VERSION),
    );
    options.insert(
        Cow::Borrowed(request::options::DRIVER_NAME),
        Cow::Borrowed(request::options::DEFAULT_DRIVER_NAME),
    );
    options.insert(
        Cow::Borrowed(request::options::DRIVER_VERSION),
        Cow::Borrowed(request::options::DEFAULT_DRIVER_VERSION),
    );

    if let Some(compression) = config.compression {
        let compression_str = compression.as_str();
        if supported_compression
            .iter()
            .any(|c| c.eq_ignore_ascii_case(compression_str))
        {
            options.insert(
                Cow::Borrowed(request::options::COMPRESSION),
                Cow::Borrowed(compression_str),
            );
        } else {
            warn!(
                "Requested compression <{}> is not supported by the cluster. Falling back to no compression",
                compression_str
            );
            connection.config.compression = None;
        }
    }

    if let Some(authenticate) = connection.startup(options).await.map_err(setup_err)? {
        connection
            .perform_authenticate(&authenticate)
            .await
            .map_err(setup_err)?;
    }

    if let Some(keyspace) = &config.keyspace {
        connection
            .use_keyspace(keyspace)
            .await
            .map_err(|e| setup_err(e.into()))?;
    }

    if config.event_sender.is_some() {
        let all_event_types = vec![
            EventType::TopologyChange,
            EventType::StatusChange,
            EventType::SchemaChange,
        ];
        connection.register(all_event_types).await.map_err(setup_err)?;
    }

    Ok((connection, error_receiver))
}

struct ResponseHandlerMap {
    stream_set: StreamIdSet,
    handlers: HashMap<i16, ResponseHandler>,
}

impl ResponseHandlerMap {
    fn new(max_streams: usize) -> Self {
        Self {
            stream_set: StreamIdSet::new(max_streams),
            handlers: HashMap::new(),
        }
    }

    fn allocate(&mut self, response_handler: ResponseHandler) -> Result<i16, ResponseHandler> {
        match self.stream_set.allocate() {
            Some(stream_id) => {
                let prev_handler = self.handlers.insert(stream_id, response_handler);
                debug_assert!(prev_handler.is_none());
                Ok(stream_id)
            }
            None => Err(response_handler),
        }
    }

    // Frees the stream id only if a request was registered on it, so a
    // stray frame can not release a stream id that is still in flight.
    fn take(&mut self, stream_id: i16) -> Option<ResponseHandler> {
        let handler = self.handlers.remove(&stream_id)?;
        self.stream_set.free(stream_id);
        Some(handler)
    }

    // Retrieves the map of handlers, used after connection breaks
    // and we have to respond to all of them with an error
    fn into_handlers(self) -> HashMap<i16, ResponseHandler> {
        self.handlers
    }
}

/// Bitmap of stream ids in use, lowest free id first.
struct StreamIdSet {
    used_bitmap: Box<[u64]>,
    max_streams: usize,
}

impl StreamIdSet {
    fn new(max_streams: usize) -> Self {
        Self {
            used_bitmap: vec![0; max_streams.div_ceil(64)].into_boxed_slice(),
            max_streams,
        }
    }

    fn allocate(&mut self) -> Option<i16> {
        for (block_id, block) in self.used_bitmap.iter_mut().enumerate() {
            if *block != !0 {
                let off = block.trailing_ones() as usize;
                let stream_id = block_id * 64 + off;
                if stream_id >= self.max_streams {
                    return None;
                }
                *block |= 1u64 << off;
                return Some(stream_id as i16);
            }
        }
        None
    }

    fn free(&mut self, stream_id: i16) {
        let Ok(stream_id) = usize::try_from(stream_id) else {
            return;
        };
        if let Some(block) = self.used_bitmap.get_mut(stream_id / 64) {
            *block &= !(1 << (stream_id % 64));
        }
    }
}

/// This type can only hold a valid keyspace name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct VerifiedKeyspaceName {
    name: Arc<str>,
}

impl VerifiedKeyspaceName {
    pub(crate) fn new(keyspace_name: &str) -> Result<Self, BadKeyspaceName> {
        Self::verify_keyspace_name_is_valid(keyspace_name)?;
        Ok(VerifiedKeyspaceName {
            name: keyspace_name.into(),
        })
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.name
    }

    // Up to 48 characters, ASCII letters, digits and underscores only.
    fn verify_keyspace_name_is_valid(keyspace_name: &str) -> Result<(), BadKeyspaceName> {
        if keyspace_name.is_empty() {
            return Err(BadKeyspaceName::Empty);
        }

        let keyspace_name_len = keyspace_name.chars().count();
        if keyspace_name_len > 48 {
            return Err(BadKeyspaceName::TooLong(
                keyspace_name.to_string(),
                keyspace_name_len,
            ));
        }

        if let Some(character) = keyspace_name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
        {
            return Err(BadKeyspaceName::IllegalCharacter(
                keyspace_name.to_string(),
                character,
            ));
        }

        Ok(())
    }
}
