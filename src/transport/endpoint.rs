//! Connection endpoint: one pump task per live stream.
//!
//! The pump owns the stream exclusively and alternates between three steps per
//! pass: decode at most one inbound frame, drain the entire outgoing queue in
//! enqueue order, and sleep briefly when neither side moved data. Both
//! directions therefore run on a single task and messages keep their order
//! within each direction.
//!
//! Any framing or I/O error is fatal to the connection: a bad frame is never
//! skipped, because nothing after it on the stream can be trusted. The
//! disconnect hook fires exactly once, with the error that killed the pump or
//! with `None` on a graceful close.

use crate::config::TransportConfig;
use crate::core::codec::{InboundFrame, MessageCodec, MessageHeader, OutboundFrame, PayloadResolver};
use crate::error::{ProtocolError, Result};
use crate::protocol::definition::DynMessage;
use bytes::BytesMut;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

const READ_CHUNK: usize = 4096;

/// Callbacks through which the pump reports to its session manager.
///
/// `on_connect` and `on_frame` must not block: session managers use them to
/// push events into their dispatch channel. `on_disconnect` is consumed on the
/// first (only) teardown.
pub struct EndpointHooks {
    pub on_connect: Box<dyn Fn() + Send + Sync>,
    pub on_frame: Box<dyn Fn(MessageHeader, DynMessage) + Send + Sync>,
    pub on_disconnect: Box<dyn FnOnce(Option<ProtocolError>) + Send + Sync>,
}

/// Pump tuning knobs, derived from [`TransportConfig`] with the clamps applied.
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    pub max_message_size: usize,
    pub idle_sleep: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
}

impl EndpointOptions {
    pub fn from_transport(transport: &TransportConfig, queue_capacity: usize) -> Self {
        Self {
            max_message_size: transport.effective_max_message_size(),
            idle_sleep: transport.effective_idle_sleep(),
            write_timeout: transport.write_timeout,
            queue_capacity,
        }
    }
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self::from_transport(&TransportConfig::default(), 64)
    }
}

/// Resolves once the frame has been written to the stream, or failed.
///
/// Dropping the completion is allowed; the frame is still sent.
pub struct SendCompletion {
    rx: oneshot::Receiver<Result<()>>,
}

impl SendCompletion {
    /// Waits for the write outcome of the enqueued frame.
    pub async fn wait(self) -> Result<()> {
        match self.rx.await {
            Ok(outcome) => outcome,
            // The pump died before reaching this frame.
            Err(_) => Err(ProtocolError::ConnectionClosed),
        }
    }
}

struct QueuedFrame {
    protocol_id: u16,
    message_tag: u16,
    body: Vec<u8>,
    done: oneshot::Sender<Result<()>>,
}

/// Handle to a pumped connection.
///
/// Cheap to clone; all clones refer to the same pump task.
#[derive(Clone)]
pub struct ConnectionEndpoint {
    queue: mpsc::Sender<QueuedFrame>,
    connected: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
}

impl ConnectionEndpoint {
    /// Takes ownership of `stream` and spawns its pump task.
    ///
    /// The stream type is the TLS seam: anything `AsyncRead + AsyncWrite`
    /// works, so a TLS session established by the caller pumps exactly like a
    /// plain socket.
    pub fn spawn<S>(
        stream: S,
        resolver: PayloadResolver,
        hooks: EndpointHooks,
        options: EndpointOptions,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (queue_tx, queue_rx) = mpsc::channel(options.queue_capacity.max(1));
        let endpoint = Self {
            queue: queue_tx,
            connected: Arc::new(AtomicBool::new(true)),
            active: Arc::new(AtomicBool::new(true)),
            closing: Arc::new(AtomicBool::new(false)),
        };

        let pump = Pump {
            stream,
            codec: MessageCodec::new(resolver, options.max_message_size),
            queue: queue_rx,
            connected: Arc::clone(&endpoint.connected),
            active: Arc::clone(&endpoint.active),
            closing: Arc::clone(&endpoint.closing),
            idle_sleep: options.idle_sleep,
            write_timeout: options.write_timeout,
        };
        tokio::spawn(pump.run(hooks));

        endpoint
    }

    /// Enqueues one pre-serialized frame for delivery.
    ///
    /// Frames go out in enqueue order. The returned [`SendCompletion`]
    /// resolves once this frame hits the stream (or the write fails).
    ///
    /// # Errors
    /// [`ProtocolError::NotConnected`] immediately when the link is down or
    /// closing; this call never silently drops a message.
    pub async fn send(
        &self,
        protocol_id: u16,
        message_tag: u16,
        body: Vec<u8>,
    ) -> Result<SendCompletion> {
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected);
        }
        let (done, rx) = oneshot::channel();
        let frame = QueuedFrame {
            protocol_id,
            message_tag,
            body,
            done,
        };
        self.queue
            .send(frame)
            .await
            .map_err(|_| ProtocolError::NotConnected)?;
        Ok(SendCompletion { rx })
    }

    /// Requests a graceful close. The pump notices on its next pass, flushes
    /// nothing further, and fires the disconnect hook with no error.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// Whether the pump task is still running (teardown may be in progress).
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Whether the link is up and accepting sends.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closing.load(Ordering::SeqCst)
    }
}

struct Pump<S> {
    stream: S,
    codec: MessageCodec,
    queue: mpsc::Receiver<QueuedFrame>,
    connected: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    idle_sleep: Duration,
    write_timeout: Duration,
}

impl<S> Pump<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn run(mut self, hooks: EndpointHooks) {
        (hooks.on_connect)();
        let reason = self.pump_loop(&hooks).await;

        self.connected.store(false, Ordering::SeqCst);
        // Fail every frame that was queued but never written.
        self.queue.close();
        while let Ok(stale) = self.queue.try_recv() {
            let _ = stale.done.send(Err(ProtocolError::ConnectionClosed));
        }
        let _ = self.stream.shutdown().await;
        self.active.store(false, Ordering::SeqCst);

        match &reason {
            Some(e) => debug!(error = %e, "connection pump stopped"),
            None => trace!("connection pump stopped gracefully"),
        }
        (hooks.on_disconnect)(reason);
    }

    /// Runs passes until close, EOF, or a fatal error. Returns the error that
    /// stopped the loop, or `None` for a graceful stop.
    async fn pump_loop(&mut self, hooks: &EndpointHooks) -> Option<ProtocolError> {
        let mut read_buf = BytesMut::with_capacity(READ_CHUNK);

        loop {
            if self.closing.load(Ordering::SeqCst) {
                return None;
            }
            let mut moved = false;

            // Inbound: at most one frame per pass.
            match self.codec.decode(&mut read_buf) {
                Ok(Some(frame)) => {
                    self.deliver(hooks, frame);
                    moved = true;
                }
                Ok(None) => match read_available(&mut self.stream, &mut read_buf).await {
                    Some(Ok(0)) => return self.drain_at_eof(hooks, &mut read_buf),
                    Some(Ok(_)) => moved = true,
                    Some(Err(e)) => return Some(e.into()),
                    None => {}
                },
                Err(e) => return Some(e),
            }

            // Outbound: the whole queue, in enqueue order.
            while let Ok(frame) = self.queue.try_recv() {
                if let Err(e) = self.write_frame(frame).await {
                    return Some(e);
                }
                moved = true;
            }

            if !moved {
                tokio::time::sleep(self.idle_sleep).await;
            }
        }
    }

    fn deliver(&self, hooks: &EndpointHooks, frame: InboundFrame) {
        trace!(
            protocol_id = frame.header.protocol_id,
            message_tag = frame.header.message_tag,
            body_len = frame.header.body_len,
            "frame received"
        );
        (hooks.on_frame)(frame.header, frame.message);
    }

    /// The peer closed its write side. Remaining buffered frames are still
    /// delivered; leftover bytes mean the stream died mid-frame.
    fn drain_at_eof(
        &mut self,
        hooks: &EndpointHooks,
        read_buf: &mut BytesMut,
    ) -> Option<ProtocolError> {
        loop {
            match self.codec.decode_eof(read_buf) {
                Ok(Some(frame)) => self.deliver(hooks, frame),
                Ok(None) => return None,
                Err(e) => return Some(e),
            }
        }
    }

    async fn write_frame(&mut self, frame: QueuedFrame) -> Result<()> {
        let mut out = BytesMut::new();
        self.codec.encode(
            OutboundFrame {
                protocol_id: frame.protocol_id,
                message_tag: frame.message_tag,
                body: frame.body,
            },
            &mut out,
        )?;

        let write = async {
            self.stream.write_all(&out).await?;
            self.stream.flush().await
        };
        let outcome = match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ProtocolError::Io(e)),
            Err(_) => Err(ProtocolError::Timeout),
        };

        match outcome {
            Ok(()) => {
                let _ = frame.done.send(Ok(()));
                Ok(())
            }
            Err(e) => {
                // The completion gets its own copy of the failure; the loop
                // dies with the original.
                let _ = frame.done.send(Err(replicate(&e)));
                Err(e)
            }
        }
    }
}

/// Reads whatever bytes are ready right now, without waiting for more.
/// `None` means the stream had nothing available.
async fn read_available<S>(stream: &mut S, buf: &mut BytesMut) -> Option<io::Result<usize>>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    let polled = futures::future::poll_fn(|cx| {
        let mut rb = ReadBuf::new(&mut chunk);
        match Pin::new(&mut *stream).poll_read(cx, &mut rb) {
            Poll::Ready(Ok(())) => Poll::Ready(Some(Ok(rb.filled().len()))),
            Poll::Ready(Err(e)) => Poll::Ready(Some(Err(e))),
            Poll::Pending => Poll::Ready(None),
        }
    })
    .await;

    if let Some(Ok(n)) = &polled {
        buf.extend_from_slice(&chunk[..*n]);
    }
    polled
}

// ProtocolError is not Clone (io::Error isn't); errors that reach both a send
// completion and the pump exit are rebuilt from their message.
fn replicate(e: &ProtocolError) -> ProtocolError {
    match e {
        ProtocolError::Timeout => ProtocolError::Timeout,
        ProtocolError::Io(io) => ProtocolError::Io(io::Error::new(io.kind(), io.to_string())),
        other => ProtocolError::SerializeError(other.to_string()),
    }
}
