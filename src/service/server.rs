//! Server session manager.
//!
//! A [`NetworkServer`] accepts TCP connections, pumps each one through a
//! [`ConnectionEndpoint`], and funnels every event into one dispatch task.
//! Handlers, lifecycle listeners, and the zero-protocol state machine all run
//! there, in event order, so application code never sees two of its callbacks
//! racing.
//!
//! New connections speak only the zero protocol until the version handshake
//! admits them; frames for any other protocol are answered with `NotReady`
//! and dropped. Once admitted, per-protocol connected listeners fire in table
//! order, and the matching disconnected listeners fire on teardown before the
//! connection id can be reused.

use crate::config::{NetmuxConfig, ServerConfig, TransportConfig};
use crate::core::codec::{encode_body, MessageHeader};
use crate::error::{ProtocolError, Result};
use crate::protocol::definition::{DynMessage, Payload, ProtocolDefinition};
use crate::protocol::zero::{self, HandshakeTracker, Version, VersionOutcome};
use crate::service::idpool::IdPool;
use crate::service::{ConnectionId, ProtocolTable};
use crate::transport::{
    ConnectionEndpoint, EndpointHooks, EndpointOptions, SendCompletion, TlsServerConfig,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, instrument, warn};

/// Boxed handler for one client→server message: `(handle, connection, body)`.
pub type MessageHandler =
    Box<dyn Fn(ServerHandle, ConnectionId, DynMessage) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Boxed per-connection lifecycle listener.
pub type ConnectionListener =
    Box<dyn Fn(ServerHandle, ConnectionId) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Boxed whole-server lifecycle listener.
pub type ServerListener =
    Box<dyn Fn(ServerHandle) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// One protocol's registration against a server: its definition, declared
/// dependencies, message handlers, and lifecycle listeners.
///
/// Handlers are bound by message name and checked against the definition at
/// registration time, so a wrong payload type or a doubled handler fails
/// before the server ever listens.
pub struct ServerProtocolBuilder {
    definition: Arc<ProtocolDefinition>,
    dependencies: Vec<&'static str>,
    handlers: HashMap<u16, MessageHandler>,
    connected: Vec<ConnectionListener>,
    disconnected: Vec<ConnectionListener>,
    started: Vec<ServerListener>,
    stopped: Vec<ServerListener>,
}

impl ServerProtocolBuilder {
    pub fn new(definition: ProtocolDefinition) -> Self {
        Self {
            definition: Arc::new(definition),
            dependencies: Vec::new(),
            handlers: HashMap::new(),
            connected: Vec::new(),
            disconnected: Vec::new(),
            started: Vec::new(),
            stopped: Vec::new(),
        }
    }

    /// Declares that this protocol's listeners must run after `name`'s.
    pub fn depends_on(mut self, name: &'static str) -> Self {
        self.dependencies.push(name);
        self
    }

    /// Installs the handler for a client→server message carrying a `T` body.
    ///
    /// # Errors
    /// [`ProtocolError::UnexpectedMessage`] for an unregistered message name,
    /// [`ProtocolError::TypeMismatch`] when `T` differs from the defined
    /// payload type, [`ProtocolError::HandlerAlreadyRegistered`] for a second
    /// handler on the same message.
    pub fn handle<T, F, Fut>(mut self, message: &str, handler: F) -> Result<Self>
    where
        T: Payload,
        F: Fn(ServerHandle, ConnectionId, T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let tag = self.definition.client_tag(message)?;
        let entry = match self.definition.client_entry(tag) {
            Some(entry) => entry,
            None => unreachable!(),
        };
        if entry.type_id() != TypeId::of::<T>() {
            return Err(ProtocolError::TypeMismatch(format!(
                "message {}.{message} carries {}, not {}",
                self.definition.name(),
                entry.type_name(),
                std::any::type_name::<T>()
            )));
        }
        if self.handlers.contains_key(&tag) {
            return Err(ProtocolError::HandlerAlreadyRegistered(format!(
                "{}.{message}",
                self.definition.name()
            )));
        }

        let expected = entry.type_name();
        let wrapped: MessageHandler = Box::new(move |handle, conn, message| {
            match message.downcast::<T>() {
                Ok(value) => handler(handle, conn, *value).boxed(),
                Err(_) => {
                    let detail = format!("handler expected a {expected} body");
                    async move { Err(ProtocolError::TypeMismatch(detail)) }.boxed()
                }
            }
        });
        self.handlers.insert(tag, wrapped);
        Ok(self)
    }

    /// Installs the handler for a bodiless client→server message.
    pub fn handle_empty<F, Fut>(self, message: &str, handler: F) -> Result<Self>
    where
        F: Fn(ServerHandle, ConnectionId) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.handle::<crate::protocol::Nothing, _, _>(message, move |handle, conn, _| {
            handler(handle, conn)
        })
    }

    /// Runs after the handshake admits a connection. Listeners fire in table
    /// order across protocols and in registration order within one.
    pub fn on_connected<F, Fut>(mut self, listener: F) -> Self
    where
        F: Fn(ServerHandle, ConnectionId) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.connected
            .push(Box::new(move |handle, conn| listener(handle, conn).boxed()));
        self
    }

    /// Runs when an admitted connection goes away, before its id is released.
    pub fn on_disconnected<F, Fut>(mut self, listener: F) -> Self
    where
        F: Fn(ServerHandle, ConnectionId) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.disconnected
            .push(Box::new(move |handle, conn| listener(handle, conn).boxed()));
        self
    }

    /// Runs once, right after the server starts listening.
    pub fn on_server_started<F, Fut>(mut self, listener: F) -> Self
    where
        F: Fn(ServerHandle) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.started
            .push(Box::new(move |handle| listener(handle).boxed()));
        self
    }

    /// Runs once, after every connection has been torn down during stop.
    pub fn on_server_stopped<F, Fut>(mut self, listener: F) -> Self
    where
        F: Fn(ServerHandle) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.stopped
            .push(Box::new(move |handle| listener(handle).boxed()));
        self
    }

    pub fn definition(&self) -> &Arc<ProtocolDefinition> {
        &self.definition
    }
}

enum ServerEvent {
    Started,
    Connected(ConnectionId),
    Frame(ConnectionId, MessageHeader, DynMessage),
    // Ids recycle, so timers carry the serial of the connection they armed
    // against; a stale timer for a reused id must stay inert.
    HandshakeTimeout(ConnectionId, u64),
    Disconnected(ConnectionId, Option<ProtocolError>),
    StopRequested,
}

// Zero-protocol tags, resolved once at startup.
#[derive(Clone, Copy)]
struct ZeroTags {
    my_version: u16,
    lets_agree: u16,
    timeout: u16,
    version_match: u16,
    version_mismatch: u16,
    not_ready: u16,
    already_done: u16,
}

impl ZeroTags {
    fn from_definition(def: &ProtocolDefinition) -> Result<Self> {
        Ok(Self {
            my_version: def.client_tag(zero::messages::MY_VERSION)?,
            lets_agree: def.server_tag(zero::messages::LETS_AGREE)?,
            timeout: def.server_tag(zero::messages::TIMEOUT)?,
            version_match: def.server_tag(zero::messages::VERSION_MATCH)?,
            version_mismatch: def.server_tag(zero::messages::VERSION_MISMATCH)?,
            not_ready: def.server_tag(zero::messages::NOT_READY)?,
            already_done: def.server_tag(zero::messages::ALREADY_DONE)?,
        })
    }
}

struct Shared {
    table: Arc<ProtocolTable>,
    endpoints: Mutex<HashMap<ConnectionId, ConnectionEndpoint>>,
    ids: Mutex<IdPool>,
    events: mpsc::UnboundedSender<ServerEvent>,
    options: EndpointOptions,
    zero: ZeroTags,
}

impl Shared {
    fn endpoints(&self) -> MutexGuard<'_, HashMap<ConnectionId, ConnectionEndpoint>> {
        match self.endpoints.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ids(&self) -> MutexGuard<'_, IdPool> {
        match self.ids.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Cheap-to-clone handle for talking to a running server's connections.
///
/// This is what handlers and listeners receive; it is also reachable through
/// [`NetworkServer::handle`].
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Sends one message to one connection.
    ///
    /// Returns `Ok(None)` when the target id names no live connection (it may
    /// have just gone away); sending to a wrong target is not an error.
    ///
    /// # Errors
    /// [`ProtocolError::UnknownProtocol`] / [`ProtocolError::UnexpectedMessage`]
    /// for names missing from the table, [`ProtocolError::TypeMismatch`] when
    /// `T` is not the message's defined payload type.
    pub async fn send<T: Payload>(
        &self,
        conn: ConnectionId,
        protocol: &str,
        message: &str,
        value: &T,
    ) -> Result<Option<SendCompletion>> {
        let (protocol_id, tag) = self.resolve::<T>(protocol, message)?;
        let body = encode_body(value, self.shared.options.max_message_size)?;
        self.send_raw(conn, protocol_id, tag, body).await
    }

    /// Sends one message to many connections; `None` targets everyone.
    ///
    /// Each target gets its own entry: a completion when the frame was
    /// enqueued, `None` when the target was unknown or refused the enqueue.
    /// One bad target never aborts the rest.
    pub async fn broadcast<T: Payload>(
        &self,
        targets: Option<&[ConnectionId]>,
        protocol: &str,
        message: &str,
        value: &T,
    ) -> Result<HashMap<ConnectionId, Option<SendCompletion>>> {
        let (protocol_id, tag) = self.resolve::<T>(protocol, message)?;
        let body = encode_body(value, self.shared.options.max_message_size)?;
        Ok(self.broadcast_raw(targets, protocol_id, tag, body).await)
    }

    /// Binds protocol, message, and payload type once, for repeated sends.
    pub fn make_sender<T: Payload>(
        &self,
        protocol: &str,
        message: &str,
    ) -> Result<ServerSender<T>> {
        let (protocol_id, tag) = self.resolve::<T>(protocol, message)?;
        Ok(ServerSender {
            handle: self.clone(),
            protocol_id,
            tag,
            _payload: PhantomData,
        })
    }

    /// Like [`Self::make_sender`], for broadcasts.
    pub fn make_broadcaster<T: Payload>(
        &self,
        protocol: &str,
        message: &str,
    ) -> Result<ServerBroadcaster<T>> {
        let (protocol_id, tag) = self.resolve::<T>(protocol, message)?;
        Ok(ServerBroadcaster {
            handle: self.clone(),
            protocol_id,
            tag,
            _payload: PhantomData,
        })
    }

    /// Requests a close of one connection. Returns `false` for unknown ids.
    /// Teardown is asynchronous: disconnected listeners still run afterwards.
    pub fn close(&self, conn: ConnectionId) -> bool {
        match self.shared.endpoints().get(&conn) {
            Some(endpoint) => {
                endpoint.close();
                true
            }
            None => false,
        }
    }

    /// Whether the id names a live connection.
    pub fn connection_exists(&self, conn: ConnectionId) -> bool {
        self.shared.endpoints().contains_key(&conn)
    }

    /// Ids of all live connections.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.shared.endpoints().keys().copied().collect()
    }

    fn resolve<T: Payload>(&self, protocol: &str, message: &str) -> Result<(u16, u16)> {
        let protocol_id = self.shared.table.id_of(protocol)?;
        let def = match self.shared.table.definition(protocol_id) {
            Some(def) => def,
            None => unreachable!(),
        };
        let tag = def.server_tag(message)?;
        let entry = match def.server_entry(tag) {
            Some(entry) => entry,
            None => unreachable!(),
        };
        if entry.type_id() != TypeId::of::<T>() {
            return Err(ProtocolError::TypeMismatch(format!(
                "message {protocol}.{message} carries {}, not {}",
                entry.type_name(),
                std::any::type_name::<T>()
            )));
        }
        Ok((protocol_id, tag))
    }

    async fn send_raw(
        &self,
        conn: ConnectionId,
        protocol_id: u16,
        tag: u16,
        body: Vec<u8>,
    ) -> Result<Option<SendCompletion>> {
        let endpoint = self.shared.endpoints().get(&conn).cloned();
        let Some(endpoint) = endpoint else {
            return Ok(None);
        };
        match endpoint.send(protocol_id, tag, body).await {
            Ok(completion) => Ok(Some(completion)),
            // The pump died between lookup and enqueue; same as unknown.
            Err(ProtocolError::NotConnected) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn broadcast_raw(
        &self,
        targets: Option<&[ConnectionId]>,
        protocol_id: u16,
        tag: u16,
        body: Vec<u8>,
    ) -> HashMap<ConnectionId, Option<SendCompletion>> {
        let picked: Vec<(ConnectionId, Option<ConnectionEndpoint>)> = {
            let endpoints = self.shared.endpoints();
            match targets {
                Some(ids) => ids
                    .iter()
                    .map(|id| (*id, endpoints.get(id).cloned()))
                    .collect(),
                None => endpoints
                    .iter()
                    .map(|(id, ep)| (*id, Some(ep.clone())))
                    .collect(),
            }
        };

        let mut results = HashMap::with_capacity(picked.len());
        for (conn, endpoint) in picked {
            let completion = match endpoint {
                Some(endpoint) => endpoint.send(protocol_id, tag, body.clone()).await.ok(),
                None => None,
            };
            results.insert(conn, completion);
        }
        results
    }
}

/// A pre-resolved single-target sender.
pub struct ServerSender<T> {
    handle: ServerHandle,
    protocol_id: u16,
    tag: u16,
    _payload: PhantomData<fn(T)>,
}

impl<T: Payload> ServerSender<T> {
    pub async fn send(&self, conn: ConnectionId, value: &T) -> Result<Option<SendCompletion>> {
        let body = encode_body(value, self.handle.shared.options.max_message_size)?;
        self.handle
            .send_raw(conn, self.protocol_id, self.tag, body)
            .await
    }
}

/// A pre-resolved broadcaster.
pub struct ServerBroadcaster<T> {
    handle: ServerHandle,
    protocol_id: u16,
    tag: u16,
    _payload: PhantomData<fn(T)>,
}

impl<T: Payload> ServerBroadcaster<T> {
    pub async fn broadcast(
        &self,
        targets: Option<&[ConnectionId]>,
        value: &T,
    ) -> Result<HashMap<ConnectionId, Option<SendCompletion>>> {
        let body = encode_body(value, self.handle.shared.options.max_message_size)?;
        Ok(self
            .handle
            .broadcast_raw(targets, self.protocol_id, self.tag, body)
            .await)
    }
}

struct Runtime {
    handle: ServerHandle,
    accept_task: JoinHandle<()>,
    dispatch_task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// The server session manager.
pub struct NetworkServer {
    server_config: ServerConfig,
    transport_config: TransportConfig,
    registrations: Vec<ServerProtocolBuilder>,
    tls: Option<TlsServerConfig>,
    runtime: Option<Runtime>,
}

impl NetworkServer {
    pub fn new(config: &NetmuxConfig) -> Self {
        Self {
            server_config: config.server.clone(),
            transport_config: config.transport.clone(),
            registrations: Vec::new(),
            tls: None,
            runtime: None,
        }
    }

    /// Serves every accepted connection over TLS with this certificate
    /// material. Without this call the server speaks plain TCP.
    ///
    /// # Errors
    /// [`ProtocolError::AlreadyRunning`] after `listen`.
    pub fn with_tls(&mut self, tls: TlsServerConfig) -> Result<&mut Self> {
        if self.runtime.is_some() {
            return Err(ProtocolError::AlreadyRunning);
        }
        self.tls = Some(tls);
        Ok(self)
    }

    /// Registers one protocol. All registration happens before [`Self::listen`].
    ///
    /// # Errors
    /// [`ProtocolError::AlreadyRunning`] after `listen`;
    /// [`ProtocolError::DefinitionError`] for a duplicate or reserved name.
    pub fn register(&mut self, registration: ServerProtocolBuilder) -> Result<&mut Self> {
        if self.runtime.is_some() {
            return Err(ProtocolError::AlreadyRunning);
        }
        let name = registration.definition.name();
        if name == zero::ZERO_PROTOCOL_NAME {
            return Err(ProtocolError::DefinitionError(format!(
                "protocol name {name:?} is reserved"
            )));
        }
        if self
            .registrations
            .iter()
            .any(|r| r.definition.name() == name)
        {
            return Err(ProtocolError::DefinitionError(format!(
                "protocol name registered twice: {name}"
            )));
        }
        self.registrations.push(registration);
        Ok(self)
    }

    /// Starts listening on the configured address and returns the bound
    /// address (useful with port 0).
    #[instrument(skip(self), fields(address = %self.server_config.address))]
    pub async fn listen(&mut self) -> Result<SocketAddr> {
        if self.runtime.is_some() {
            return Err(ProtocolError::AlreadyRunning);
        }

        let registrations = std::mem::take(&mut self.registrations);
        let table = Arc::new(ProtocolTable::build(
            registrations
                .iter()
                .map(|r| (Arc::clone(&r.definition), r.dependencies.clone()))
                .collect(),
        )?);
        let zero_tags = match table.definition(0) {
            Some(def) => ZeroTags::from_definition(def)?,
            None => unreachable!(),
        };

        // Per-protocol dispatch state, indexed by table id. Slot 0 stays
        // empty: zero-protocol frames never reach the handler path.
        let mut handlers: Vec<HashMap<u16, MessageHandler>> =
            (0..table.len()).map(|_| HashMap::new()).collect();
        let mut connected: Vec<Vec<ConnectionListener>> =
            (0..table.len()).map(|_| Vec::new()).collect();
        let mut disconnected: Vec<Vec<ConnectionListener>> =
            (0..table.len()).map(|_| Vec::new()).collect();
        let mut started: Vec<Vec<ServerListener>> =
            (0..table.len()).map(|_| Vec::new()).collect();
        let mut stopped: Vec<Vec<ServerListener>> =
            (0..table.len()).map(|_| Vec::new()).collect();
        for registration in registrations {
            let id = usize::from(table.id_of(registration.definition.name())?);
            handlers[id] = registration.handlers;
            connected[id] = registration.connected;
            disconnected[id] = registration.disconnected;
            started[id] = registration.started;
            stopped[id] = registration.stopped;
        }

        let acceptor = match &self.tls {
            Some(tls) => Some(tls.load()?),
            None => None,
        };
        let listener = TcpListener::bind(&self.server_config.address).await?;
        let local_addr = listener.local_addr()?;

        // The event channel stays unbounded: the pumps must never block on
        // dispatch, or a handler awaiting a full outgoing queue would wedge
        // the connection that feeds it. Backpressure lives in the bounded
        // per-connection outgoing queues.
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            table: Arc::clone(&table),
            endpoints: Mutex::new(HashMap::new()),
            ids: Mutex::new(IdPool::new()),
            events: events_tx.clone(),
            options: EndpointOptions::from_transport(
                &self.transport_config,
                self.server_config.backpressure_limit,
            ),
            zero: zero_tags,
        });
        let handle = ServerHandle {
            shared: Arc::clone(&shared),
        };

        let _ = events_tx.send(ServerEvent::Started);

        let accept_task = tokio::spawn(accept_loop(
            listener,
            acceptor,
            self.server_config.handshake_timeout,
            Arc::clone(&shared),
        ));
        let dispatch = Dispatch {
            handle: handle.clone(),
            handlers,
            connected,
            disconnected,
            started: started.into_iter().flatten().collect(),
            stopped: stopped.into_iter().flatten().collect(),
            tracker: HandshakeTracker::new(self.server_config.version),
            handshake_timeout: self.server_config.handshake_timeout,
            serials: HashMap::new(),
            next_serial: 0,
            stopping: false,
        };
        let dispatch_task = tokio::spawn(dispatch.run(events_rx));

        info!(%local_addr, protocols = table.len(), "server listening");
        self.runtime = Some(Runtime {
            handle,
            accept_task,
            dispatch_task,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Stops accepting, closes every connection, waits for teardown, and
    /// fires the server-stopped listeners.
    pub async fn stop(&mut self) -> Result<()> {
        let runtime = self.runtime.take().ok_or(ProtocolError::NotConnected)?;
        runtime.accept_task.abort();
        // The abort lands asynchronously; an accept already past the listener
        // could still be inserting its endpoint. Await the task so every
        // insertion precedes the stop snapshot.
        let _ = runtime.accept_task.await;
        let _ = runtime.handle.shared.events.send(ServerEvent::StopRequested);
        let _ = runtime.dispatch_task.await;
        info!("server stopped");
        Ok(())
    }

    pub fn is_listening(&self) -> bool {
        self.runtime.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime.as_ref().map(|r| r.local_addr)
    }

    /// Handle for sending while the server runs.
    pub fn handle(&self) -> Result<ServerHandle> {
        self.runtime
            .as_ref()
            .map(|r| r.handle.clone())
            .ok_or(ProtocolError::NotConnected)
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    tls_handshake_timeout: Duration,
    shared: Arc<Shared>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }

        match &acceptor {
            Some(acceptor) => {
                // The handshake runs inline: stop() relies on no endpoint
                // being inserted after this loop is awaited, which a
                // spawned-per-connection handshake would break.
                let accepted =
                    tokio::time::timeout(tls_handshake_timeout, acceptor.accept(stream)).await;
                match accepted {
                    Ok(Ok(stream)) => attach_stream(&shared, stream, peer),
                    Ok(Err(e)) => warn!(%peer, error = %e, "TLS handshake failed"),
                    Err(_) => warn!(%peer, "TLS handshake timed out"),
                }
            }
            None => attach_stream(&shared, stream, peer),
        }
    }
}

fn attach_stream<S>(shared: &Arc<Shared>, stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let conn = shared.ids().allocate();
    debug!(conn, %peer, "connection accepted");

    let events = shared.events.clone();
    let frame_events = shared.events.clone();
    let endpoint = ConnectionEndpoint::spawn(
        stream,
        shared.table.client_resolver(),
        EndpointHooks {
            // Connected is announced after the insert below, so the endpoint
            // is in the map before dispatch needs it.
            on_connect: Box::new(|| {}),
            on_frame: Box::new(move |header, message| {
                let _ = frame_events.send(ServerEvent::Frame(conn, header, message));
            }),
            on_disconnect: Box::new(move |reason| {
                let _ = events.send(ServerEvent::Disconnected(conn, reason));
            }),
        },
        shared.options.clone(),
    );
    shared.endpoints().insert(conn, endpoint);
    let _ = shared.events.send(ServerEvent::Connected(conn));
}

struct Dispatch {
    handle: ServerHandle,
    handlers: Vec<HashMap<u16, MessageHandler>>,
    connected: Vec<Vec<ConnectionListener>>,
    disconnected: Vec<Vec<ConnectionListener>>,
    started: Vec<ServerListener>,
    stopped: Vec<ServerListener>,
    tracker: HandshakeTracker,
    handshake_timeout: Duration,
    serials: HashMap<ConnectionId, u64>,
    next_serial: u64,
    stopping: bool,
}

impl Dispatch {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<ServerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::Started => {
                    for listener in &self.started {
                        if let Err(e) = listener(self.handle.clone()).await {
                            error!(error = %e, "server-started listener failed");
                        }
                    }
                }
                ServerEvent::Connected(conn) => self.on_connected(conn).await,
                ServerEvent::Frame(conn, header, message) => {
                    self.on_frame(conn, header, message).await
                }
                ServerEvent::HandshakeTimeout(conn, serial) => {
                    self.on_handshake_timeout(conn, serial).await
                }
                ServerEvent::Disconnected(conn, reason) => {
                    self.on_disconnected(conn, reason).await;
                    if self.stopping && self.handle.shared.endpoints().is_empty() {
                        break;
                    }
                }
                ServerEvent::StopRequested => {
                    self.stopping = true;
                    let endpoints: Vec<ConnectionEndpoint> =
                        self.handle.shared.endpoints().values().cloned().collect();
                    if endpoints.is_empty() {
                        break;
                    }
                    for endpoint in endpoints {
                        endpoint.close();
                    }
                }
            }
        }

        for listener in &self.stopped {
            if let Err(e) = listener(self.handle.clone()).await {
                error!(error = %e, "server-stopped listener failed");
            }
        }
    }

    async fn on_connected(&mut self, conn: ConnectionId) {
        let serial = self.next_serial;
        self.next_serial += 1;
        self.serials.insert(conn, serial);

        self.tracker.on_connected(conn);
        self.send_zero(conn, self.handle.shared.zero.lets_agree).await;

        let events = self.handle.shared.events.clone();
        let timeout = self.handshake_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(ServerEvent::HandshakeTimeout(conn, serial));
        });
    }

    async fn on_handshake_timeout(&mut self, conn: ConnectionId, serial: u64) {
        if self.serials.get(&conn) != Some(&serial) {
            return;
        }
        // Inert unless the connection is still awaiting its version.
        if !self.tracker.on_timeout(conn) {
            return;
        }
        warn!(conn, "handshake timed out, closing");
        if let Some(completion) = self
            .send_zero_completion(conn, self.handle.shared.zero.timeout)
            .await
        {
            // Make sure the notice hits the wire before the close.
            let _ = completion.wait().await;
        }
        self.handle.close(conn);
    }

    async fn on_frame(&mut self, conn: ConnectionId, header: MessageHeader, message: DynMessage) {
        if header.protocol_id == 0 {
            self.on_zero_frame(conn, header, message).await;
            return;
        }

        if !self.tracker.is_ready(conn) {
            debug!(conn, protocol_id = header.protocol_id, "frame before handshake, refusing");
            self.send_zero(conn, self.handle.shared.zero.not_ready).await;
            return;
        }

        let handler = self
            .handlers
            .get(usize::from(header.protocol_id))
            .and_then(|per_protocol| per_protocol.get(&header.message_tag));
        match handler {
            Some(handler) => {
                if let Err(e) = handler(self.handle.clone(), conn, message).await {
                    error!(
                        conn,
                        protocol_id = header.protocol_id,
                        message_tag = header.message_tag,
                        error = %e,
                        "message handler failed"
                    );
                }
            }
            None => debug!(
                conn,
                protocol_id = header.protocol_id,
                message_tag = header.message_tag,
                "message has no handler, dropping"
            ),
        }
    }

    async fn on_zero_frame(
        &mut self,
        conn: ConnectionId,
        header: MessageHeader,
        message: DynMessage,
    ) {
        if header.message_tag != self.handle.shared.zero.my_version {
            debug!(conn, tag = header.message_tag, "unexpected zero-protocol tag, dropping");
            return;
        }
        let offered = match message.downcast::<Version>() {
            Ok(version) => *version,
            Err(_) => {
                warn!(conn, "zero-protocol body was not a version, dropping");
                return;
            }
        };

        match self.tracker.on_my_version(conn, &offered) {
            VersionOutcome::Match => {
                self.send_zero(conn, self.handle.shared.zero.version_match).await;
                for per_protocol in &self.connected {
                    for listener in per_protocol {
                        if let Err(e) = listener(self.handle.clone(), conn).await {
                            error!(conn, error = %e, "connected listener failed");
                        }
                    }
                }
            }
            VersionOutcome::Mismatch => {
                if let Some(completion) = self
                    .send_zero_completion(conn, self.handle.shared.zero.version_mismatch)
                    .await
                {
                    let _ = completion.wait().await;
                }
                self.handle.close(conn);
            }
            VersionOutcome::AlreadyDone => {
                self.send_zero(conn, self.handle.shared.zero.already_done).await;
            }
            VersionOutcome::Ignored => {}
        }
    }

    async fn on_disconnected(&mut self, conn: ConnectionId, reason: Option<ProtocolError>) {
        match &reason {
            Some(e) => debug!(conn, error = %e, "connection lost"),
            None => debug!(conn, "connection closed"),
        }

        if self.tracker.on_disconnected(conn) {
            for per_protocol in &self.disconnected {
                for listener in per_protocol {
                    if let Err(e) = listener(self.handle.clone(), conn).await {
                        error!(conn, error = %e, "disconnected listener failed");
                    }
                }
            }
        }

        // Only now, with every teardown event dispatched, may the id recycle.
        self.serials.remove(&conn);
        self.handle.shared.endpoints().remove(&conn);
        self.handle.shared.ids().release(conn);
    }

    async fn send_zero(&self, conn: ConnectionId, tag: u16) {
        let _ = self.send_zero_completion(conn, tag).await;
    }

    async fn send_zero_completion(&self, conn: ConnectionId, tag: u16) -> Option<SendCompletion> {
        let body = match encode_body(
            &crate::protocol::Nothing,
            self.handle.shared.options.max_message_size,
        ) {
            Ok(body) => body,
            Err(_) => unreachable!(),
        };
        match self.handle.send_raw(conn, 0, tag, body).await {
            Ok(completion) => completion,
            Err(e) => {
                debug!(conn, tag, error = %e, "zero-protocol send failed");
                None
            }
        }
    }
}
