//! Client session manager.
//!
//! A [`NetworkClient`] keeps a single pumped connection and mirrors the
//! server's structure: one dispatch task runs every handler and listener, and
//! the zero protocol is answered automatically: `LetsAgree` in, `MyVersion`
//! out, then readiness tracking and listener fan-out on the verdict.
//!
//! Registrations are kept across connections, so a closed client can connect
//! again without re-registering its protocols.

use crate::config::{ClientConfig, NetmuxConfig, TransportConfig};
use crate::core::codec::{encode_body, MessageHeader};
use crate::error::{ProtocolError, Result};
use crate::protocol::definition::{DynMessage, Payload, ProtocolDefinition};
use crate::protocol::zero::{self, HandshakeEvent, HandshakeFollower, Version};
use crate::service::ProtocolTable;
use crate::transport::{
    ConnectionEndpoint, EndpointHooks, EndpointOptions, SendCompletion, TlsClientConfig,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Handler for one server→client message. Clients have a single connection,
/// so there is no connection id argument.
pub type ClientMessageHandler =
    Arc<dyn Fn(ClientHandle, DynMessage) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Lifecycle listener on the client side.
pub type ClientListener =
    Arc<dyn Fn(ClientHandle) -> BoxFuture<'static, Result<()>> + Send + Sync>;

type HandshakeListener = Arc<dyn Fn(HandshakeEvent) + Send + Sync>;

/// One protocol's registration against a client.
pub struct ClientProtocolBuilder {
    definition: Arc<ProtocolDefinition>,
    dependencies: Vec<&'static str>,
    handlers: HashMap<u16, ClientMessageHandler>,
    connected: Vec<ClientListener>,
    disconnected: Vec<ClientListener>,
}

impl ClientProtocolBuilder {
    pub fn new(definition: ProtocolDefinition) -> Self {
        Self {
            definition: Arc::new(definition),
            dependencies: Vec::new(),
            handlers: HashMap::new(),
            connected: Vec::new(),
            disconnected: Vec::new(),
        }
    }

    pub fn depends_on(mut self, name: &'static str) -> Self {
        self.dependencies.push(name);
        self
    }

    /// Installs the handler for a server→client message carrying a `T` body.
    ///
    /// Same registration-time checks as the server side: unknown names,
    /// payload type mismatches, and doubled handlers all fail here.
    pub fn handle<T, F, Fut>(mut self, message: &str, handler: F) -> Result<Self>
    where
        T: Payload,
        F: Fn(ClientHandle, T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let tag = self.definition.server_tag(message)?;
        let entry = match self.definition.server_entry(tag) {
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
        let wrapped: ClientMessageHandler = Arc::new(move |handle, message| {
            match message.downcast::<T>() {
                Ok(value) => handler(handle, *value).boxed(),
                Err(_) => {
                    let detail = format!("handler expected a {expected} body");
                    async move { Err(ProtocolError::TypeMismatch(detail)) }.boxed()
                }
            }
        });
        self.handlers.insert(tag, wrapped);
        Ok(self)
    }

    /// Installs the handler for a bodiless server→client message.
    pub fn handle_empty<F, Fut>(self, message: &str, handler: F) -> Result<Self>
    where
        F: Fn(ClientHandle) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.handle::<crate::protocol::Nothing, _, _>(message, move |handle, _| handler(handle))
    }

    /// Runs after the handshake admits this client.
    pub fn on_connected<F, Fut>(mut self, listener: F) -> Self
    where
        F: Fn(ClientHandle) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.connected
            .push(Arc::new(move |handle| listener(handle).boxed()));
        self
    }

    /// Runs when an admitted connection goes away.
    pub fn on_disconnected<F, Fut>(mut self, listener: F) -> Self
    where
        F: Fn(ClientHandle) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.disconnected
            .push(Arc::new(move |handle| listener(handle).boxed()));
        self
    }

    pub fn definition(&self) -> &Arc<ProtocolDefinition> {
        &self.definition
    }
}

enum ClientEvent {
    Connected,
    Frame(MessageHeader, DynMessage),
    Disconnected(Option<ProtocolError>),
}

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

/// Cheap-to-clone handle for sending on the client's connection.
#[derive(Clone)]
pub struct ClientHandle {
    endpoint: ConnectionEndpoint,
    table: Arc<ProtocolTable>,
    max_message_size: usize,
    ready: Arc<AtomicBool>,
}

impl ClientHandle {
    /// Sends one client→server message.
    ///
    /// # Errors
    /// [`ProtocolError::NotConnected`] when the link is down; resolution and
    /// type errors as on the server side.
    pub async fn send<T: Payload>(
        &self,
        protocol: &str,
        message: &str,
        value: &T,
    ) -> Result<SendCompletion> {
        let (protocol_id, tag) = self.resolve::<T>(protocol, message)?;
        let body = encode_body(value, self.max_message_size)?;
        self.endpoint.send(protocol_id, tag, body).await
    }

    /// Binds protocol, message, and payload type once, for repeated sends.
    pub fn make_sender<T: Payload>(
        &self,
        protocol: &str,
        message: &str,
    ) -> Result<ClientSender<T>> {
        let (protocol_id, tag) = self.resolve::<T>(protocol, message)?;
        Ok(ClientSender {
            handle: self.clone(),
            protocol_id,
            tag,
            _payload: PhantomData,
        })
    }

    /// Whether the handshake has admitted this connection.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.endpoint.is_connected()
    }

    fn resolve<T: Payload>(&self, protocol: &str, message: &str) -> Result<(u16, u16)> {
        let protocol_id = self.table.id_of(protocol)?;
        let def = match self.table.definition(protocol_id) {
            Some(def) => def,
            None => unreachable!(),
        };
        let tag = def.client_tag(message)?;
        let entry = match def.client_entry(tag) {
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
}

/// A pre-resolved sender on the client's connection.
pub struct ClientSender<T> {
    handle: ClientHandle,
    protocol_id: u16,
    tag: u16,
    _payload: PhantomData<fn(T)>,
}

impl<T: Payload> ClientSender<T> {
    pub async fn send(&self, value: &T) -> Result<SendCompletion> {
        let body = encode_body(value, self.handle.max_message_size)?;
        self.handle
            .endpoint
            .send(self.protocol_id, self.tag, body)
            .await
    }
}

struct Runtime {
    handle: ClientHandle,
    dispatch_task: JoinHandle<()>,
}

/// The client session manager.
pub struct NetworkClient {
    client_config: ClientConfig,
    transport_config: TransportConfig,
    registrations: Vec<ClientProtocolBuilder>,
    handshake_listeners: Vec<HandshakeListener>,
    tls: Option<TlsClientConfig>,
    runtime: Option<Runtime>,
}

impl NetworkClient {
    pub fn new(config: &NetmuxConfig) -> Self {
        Self {
            client_config: config.client.clone(),
            transport_config: config.transport.clone(),
            registrations: Vec::new(),
            handshake_listeners: Vec::new(),
            tls: None,
            runtime: None,
        }
    }

    /// Wraps the connection in TLS with this trust material. Without this
    /// call the client speaks plain TCP. Kept across reconnects, like
    /// registrations.
    ///
    /// # Errors
    /// [`ProtocolError::AlreadyConnected`] while a connection is live.
    pub fn with_tls(&mut self, tls: TlsClientConfig) -> Result<&mut Self> {
        if self.is_connected() {
            return Err(ProtocolError::AlreadyConnected);
        }
        self.tls = Some(tls);
        Ok(self)
    }

    /// Registers one protocol. Registrations survive reconnects.
    pub fn register(&mut self, registration: ClientProtocolBuilder) -> Result<&mut Self> {
        if self.is_connected() {
            return Err(ProtocolError::AlreadyConnected);
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

    /// Adds a listener for handshake progress notices (started, match,
    /// mismatch, timeout, not-ready, already-done), fired in registration
    /// order on the dispatch task.
    pub fn on_handshake<F>(&mut self, listener: F)
    where
        F: Fn(HandshakeEvent) + Send + Sync + 'static,
    {
        self.handshake_listeners.push(Arc::new(listener));
    }

    /// Connects to the configured address and starts dispatching.
    #[instrument(skip(self), fields(address = %self.client_config.address))]
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Err(ProtocolError::AlreadyConnected);
        }
        self.runtime = None;

        let table = Arc::new(ProtocolTable::build(
            self.registrations
                .iter()
                .map(|r| (Arc::clone(&r.definition), r.dependencies.clone()))
                .collect(),
        )?);
        let zero_tags = match table.definition(0) {
            Some(def) => ZeroTags::from_definition(def)?,
            None => unreachable!(),
        };

        let mut handlers: Vec<HashMap<u16, ClientMessageHandler>> =
            (0..table.len()).map(|_| HashMap::new()).collect();
        let mut connected: Vec<Vec<ClientListener>> =
            (0..table.len()).map(|_| Vec::new()).collect();
        let mut disconnected: Vec<Vec<ClientListener>> =
            (0..table.len()).map(|_| Vec::new()).collect();
        for registration in &self.registrations {
            let id = usize::from(table.id_of(registration.definition.name())?);
            handlers[id] = registration.handlers.clone();
            connected[id] = registration.connected.clone();
            disconnected[id] = registration.disconnected.clone();
        }

        let connecting = TcpStream::connect(&self.client_config.address);
        let stream = match tokio::time::timeout(self.client_config.connection_timeout, connecting)
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(ProtocolError::Timeout),
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }

        match &self.tls {
            Some(tls) => {
                let connector = tls.load()?;
                let name = tls.server_name()?;
                let handshaking = connector.connect(name, stream);
                let stream = match tokio::time::timeout(
                    self.client_config.connection_timeout,
                    handshaking,
                )
                .await
                {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        return Err(ProtocolError::TlsError(format!("handshake failed: {e}")))
                    }
                    Err(_) => return Err(ProtocolError::Timeout),
                };
                self.spawn_session(stream, table, zero_tags, handlers, connected, disconnected);
            }
            None => {
                self.spawn_session(stream, table, zero_tags, handlers, connected, disconnected);
            }
        }

        info!(address = %self.client_config.address, "client connected");
        Ok(())
    }

    fn spawn_session<S>(
        &mut self,
        stream: S,
        table: Arc<ProtocolTable>,
        zero: ZeroTags,
        handlers: Vec<HashMap<u16, ClientMessageHandler>>,
        connected: Vec<Vec<ClientListener>>,
        disconnected: Vec<Vec<ClientListener>>,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let options = EndpointOptions::from_transport(
            &self.transport_config,
            self.client_config.backpressure_limit,
        );
        // Unbounded, as on the server: the pump must never block on
        // dispatch. Backpressure lives in the bounded outgoing queue.
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connect_events = events_tx.clone();
        let frame_events = events_tx.clone();
        let endpoint = ConnectionEndpoint::spawn(
            stream,
            table.server_resolver(),
            EndpointHooks {
                on_connect: Box::new(move || {
                    let _ = connect_events.send(ClientEvent::Connected);
                }),
                on_frame: Box::new(move |header, message| {
                    let _ = frame_events.send(ClientEvent::Frame(header, message));
                }),
                on_disconnect: Box::new(move |reason| {
                    let _ = events_tx.send(ClientEvent::Disconnected(reason));
                }),
            },
            options.clone(),
        );

        let handle = ClientHandle {
            endpoint,
            table,
            max_message_size: options.max_message_size,
            ready: Arc::new(AtomicBool::new(false)),
        };

        let mut follower = HandshakeFollower::new(self.client_config.version);
        for listener in &self.handshake_listeners {
            let listener = Arc::clone(listener);
            follower.add_listener(Box::new(move |event| listener(event)));
        }

        let dispatch = Dispatch {
            handle: handle.clone(),
            handlers,
            connected,
            disconnected,
            follower,
            zero,
        };
        let dispatch_task = tokio::spawn(dispatch.run(events_rx));

        self.runtime = Some(Runtime {
            handle,
            dispatch_task,
        });
    }

    /// Closes the connection and waits for dispatch to drain.
    pub async fn close(&mut self) -> Result<()> {
        let runtime = self.runtime.take().ok_or(ProtocolError::NotConnected)?;
        runtime.handle.endpoint.close();
        let _ = runtime.dispatch_task.await;
        info!("client closed");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.runtime
            .as_ref()
            .map(|r| r.handle.endpoint.is_active())
            .unwrap_or(false)
    }

    /// Whether the handshake has admitted this client.
    pub fn is_ready(&self) -> bool {
        self.runtime
            .as_ref()
            .map(|r| r.handle.is_ready())
            .unwrap_or(false)
    }

    /// Handle for sending while connected.
    pub fn handle(&self) -> Result<ClientHandle> {
        self.runtime
            .as_ref()
            .map(|r| r.handle.clone())
            .ok_or(ProtocolError::NotConnected)
    }

    /// Convenience for [`ClientHandle::send`].
    pub async fn send<T: Payload>(
        &self,
        protocol: &str,
        message: &str,
        value: &T,
    ) -> Result<SendCompletion> {
        self.handle()?.send(protocol, message, value).await
    }
}

struct Dispatch {
    handle: ClientHandle,
    handlers: Vec<HashMap<u16, ClientMessageHandler>>,
    connected: Vec<Vec<ClientListener>>,
    disconnected: Vec<Vec<ClientListener>>,
    follower: HandshakeFollower,
    zero: ZeroTags,
}

impl Dispatch {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<ClientEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::Connected => {
                    debug!("link up, awaiting handshake greeting");
                }
                ClientEvent::Frame(header, message) => self.on_frame(header, message).await,
                ClientEvent::Disconnected(reason) => {
                    self.on_disconnected(reason).await;
                    break;
                }
            }
        }
    }

    async fn on_frame(&mut self, header: MessageHeader, message: DynMessage) {
        if header.protocol_id == 0 {
            self.on_zero_frame(header).await;
            return;
        }

        let handler = self
            .handlers
            .get(usize::from(header.protocol_id))
            .and_then(|per_protocol| per_protocol.get(&header.message_tag))
            .cloned();
        match handler {
            Some(handler) => {
                if let Err(e) = handler(self.handle.clone(), message).await {
                    error!(
                        protocol_id = header.protocol_id,
                        message_tag = header.message_tag,
                        error = %e,
                        "message handler failed"
                    );
                }
            }
            None => debug!(
                protocol_id = header.protocol_id,
                message_tag = header.message_tag,
                "message has no handler, dropping"
            ),
        }
    }

    async fn on_zero_frame(&mut self, header: MessageHeader) {
        let tag = header.message_tag;
        if tag == self.zero.lets_agree {
            let version = self.follower.on_lets_agree();
            self.send_my_version(version).await;
        } else if tag == self.zero.version_match {
            self.follower.on_match();
            self.handle.ready.store(true, Ordering::SeqCst);
            for per_protocol in &self.connected {
                for listener in per_protocol {
                    if let Err(e) = listener(self.handle.clone()).await {
                        error!(error = %e, "connected listener failed");
                    }
                }
            }
        } else if tag == self.zero.version_mismatch {
            warn!("server rejected our version");
            self.follower.on_mismatch();
            self.handle.ready.store(false, Ordering::SeqCst);
        } else if tag == self.zero.timeout {
            warn!("server timed out our handshake");
            self.follower.on_timeout();
            self.handle.ready.store(false, Ordering::SeqCst);
        } else if tag == self.zero.not_ready {
            debug!("server refused a message sent before admission");
            self.follower.on_not_ready();
        } else if tag == self.zero.already_done {
            debug!("server reports the handshake was already complete");
            self.follower.on_already_done();
        } else {
            debug!(tag, "unexpected zero-protocol tag, dropping");
        }
    }

    async fn send_my_version(&self, version: Version) {
        let body = match encode_body(&version, self.handle.max_message_size) {
            Ok(body) => body,
            Err(_) => unreachable!(),
        };
        match self
            .handle
            .endpoint
            .send(0, self.zero.my_version, body)
            .await
        {
            Ok(_) => {}
            Err(e) => debug!(error = %e, "failed to answer handshake greeting"),
        }
    }

    async fn on_disconnected(&mut self, reason: Option<ProtocolError>) {
        match &reason {
            Some(e) => debug!(error = %e, "connection lost"),
            None => debug!("connection closed"),
        }

        let was_ready = self.follower.is_ready();
        self.follower.on_disconnected();
        self.handle.ready.store(false, Ordering::SeqCst);
        if was_ready {
            for per_protocol in &self.disconnected {
                for listener in per_protocol {
                    if let Err(e) = listener(self.handle.clone()).await {
                        error!(error = %e, "disconnected listener failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_definition() -> ProtocolDefinition {
        ProtocolDefinition::build("chat", |b| {
            b.client_message::<String>("Say")?;
            b.server_message::<String>("Said")?;
            b.server_message_empty("Kicked")?;
            Ok(())
        })
        .unwrap()
    }

    #[test]
    fn handler_with_wrong_type_fails_registration() {
        let result = ClientProtocolBuilder::new(chat_definition())
            .handle::<u32, _, _>("Said", |_, _| async { Ok(()) });
        assert!(matches!(result, Err(ProtocolError::TypeMismatch(_))));
    }

    #[test]
    fn empty_handler_binds_to_bodiless_messages_only() {
        let ok = ClientProtocolBuilder::new(chat_definition())
            .handle_empty("Kicked", |_| async { Ok(()) });
        assert!(ok.is_ok());

        let bad = ClientProtocolBuilder::new(chat_definition())
            .handle_empty("Said", |_| async { Ok(()) });
        assert!(matches!(bad, Err(ProtocolError::TypeMismatch(_))));
    }

    #[tokio::test]
    async fn send_without_connect_is_not_connected() {
        let client = NetworkClient::new(&NetmuxConfig::default());
        let result = client.send("chat", "Say", &"hi".to_string()).await;
        assert!(matches!(result, Err(ProtocolError::NotConnected)));
    }

    #[tokio::test]
    async fn close_without_connect_is_not_connected() {
        let mut client = NetworkClient::new(&NetmuxConfig::default());
        assert!(matches!(
            client.close().await,
            Err(ProtocolError::NotConnected)
        ));
    }
}
