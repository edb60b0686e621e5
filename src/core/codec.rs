//! Frame encoding and decoding.
//!
//! One frame carries exactly one message: a 6-byte header (protocol-id,
//! message-tag, body-length) followed by the bincode-serialized body. The
//! decoder is two-phase: it parses the header as soon as 6 bytes are buffered,
//! resolves the payload decoder for the (protocol-id, tag) pair through a
//! caller-supplied resolver, and only then consumes the declared body bytes.
//! An unresolvable pair or an oversized body is fatal to the connection.

use crate::error::{ProtocolError, Result};
use crate::protocol::definition::{DynMessage, Payload, PayloadDecoder};
use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

/// Size of the fixed frame header, in bytes.
pub const HEADER_LEN: usize = 6;

/// The fixed 6-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Dense 0-based id of the sub-protocol this message belongs to.
    pub protocol_id: u16,
    /// Per-direction message tag within the sub-protocol.
    pub message_tag: u16,
    /// Length of the serialized body that follows.
    pub body_len: u16,
}

impl MessageHeader {
    /// Parses a header from a buffer holding at least [`HEADER_LEN`] bytes.
    pub fn read(buf: &mut impl Buf) -> Self {
        Self {
            protocol_id: buf.get_u16(),
            message_tag: buf.get_u16(),
            body_len: buf.get_u16(),
        }
    }

    /// Writes the header in wire order.
    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.protocol_id);
        buf.put_u16(self.message_tag);
        buf.put_u16(self.body_len);
    }

    /// Validates the declared body length against the negotiated maximum.
    pub fn check_size(&self, max_message_size: usize) -> Result<()> {
        if usize::from(self.body_len) > max_message_size {
            return Err(ProtocolError::MessageOverflow(format!(
                "declared body length {} exceeds the maximum allowed size {max_message_size}",
                self.body_len
            )));
        }
        Ok(())
    }
}

/// Serializes a message body, enforcing the configured maximum size.
///
/// The body is serialized into a scratch buffer first so its final length is
/// known before anything touches the wire.
///
/// # Errors
/// [`ProtocolError::MessageOverflow`] when the serialized body exceeds
/// `max_message_size` (or the u16 length field).
pub fn encode_body<T: Payload>(value: &T, max_message_size: usize) -> Result<Vec<u8>> {
    let body = bincode::serialize(value)
        .map_err(|e| ProtocolError::SerializeError(e.to_string()))?;
    let limit = max_message_size.min(usize::from(u16::MAX));
    if body.len() > limit {
        return Err(ProtocolError::MessageOverflow(format!(
            "serialized body length {} exceeds the maximum allowed size {limit}",
            body.len()
        )));
    }
    Ok(body)
}

/// Deserializes a message body of a known concrete type.
///
/// A deserializer that runs past the end of the declared body indicates a
/// corrupt frame and is reported as [`ProtocolError::MessageOverflow`].
pub fn decode_body<T: Payload>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| match *e {
        bincode::ErrorKind::Io(ref io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
            ProtocolError::MessageOverflow(
                "deserialization consumed more bytes than declared in the header; \
                 the frame is most likely corrupt"
                    .to_string(),
            )
        }
        _ => ProtocolError::DeserializeError(e.to_string()),
    })
}

/// Resolves the payload decoder for a (protocol-id, message-tag) pair.
/// Returning `None` means the pair is unknown and the connection must close.
pub type PayloadResolver = Arc<dyn Fn(u16, u16) -> Option<PayloadDecoder> + Send + Sync>;

/// One decoded inbound frame.
pub struct InboundFrame {
    pub header: MessageHeader,
    pub message: DynMessage,
}

/// One outbound frame: header fields plus a pre-serialized body.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub protocol_id: u16,
    pub message_tag: u16,
    pub body: Vec<u8>,
}

/// Stateful frame codec for one connection.
///
/// Holds the registry resolver and the negotiated maximum message size; keeps
/// the parsed header across passes while waiting for the body bytes to arrive.
pub struct MessageCodec {
    resolver: PayloadResolver,
    max_message_size: usize,
    pending: Option<(MessageHeader, PayloadDecoder)>,
}

impl MessageCodec {
    pub fn new(resolver: PayloadResolver, max_message_size: usize) -> Self {
        Self {
            resolver,
            max_message_size,
            pending: None,
        }
    }

    /// Whether the codec is mid-frame (header seen, body incomplete).
    pub fn mid_frame(&self) -> bool {
        self.pending.is_some()
    }
}

impl Decoder for MessageCodec {
    type Item = InboundFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<InboundFrame>> {
        if self.pending.is_none() {
            if src.len() < HEADER_LEN {
                return Ok(None);
            }
            let header = MessageHeader::read(src);
            header.check_size(self.max_message_size)?;
            // Resolve the payload type before touching the body, so the body
            // can deserialize straight into a value of the right shape.
            let decoder = (self.resolver)(header.protocol_id, header.message_tag).ok_or_else(
                || {
                    ProtocolError::UnexpectedMessage(format!(
                        "unexpected incoming message protocol/tag: ({}, {})",
                        header.protocol_id, header.message_tag
                    ))
                },
            )?;
            self.pending = Some((header, decoder));
        }

        let body_len = match &self.pending {
            Some((header, _)) => usize::from(header.body_len),
            None => unreachable!(),
        };
        if src.len() < body_len {
            src.reserve(body_len - src.len());
            return Ok(None);
        }
        let body = src.split_to(body_len);
        let (header, decoder) = self.pending.take().unwrap_or_else(|| unreachable!());
        let message = decoder(&body)?;
        Ok(Some(InboundFrame { header, message }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<InboundFrame>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        // EOF at a frame boundary is a graceful close; anything else means the
        // stream ended inside a frame.
        if self.pending.is_some() || !src.is_empty() {
            return Err(ProtocolError::InvalidHeader);
        }
        Ok(None)
    }
}

impl Encoder<OutboundFrame> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: OutboundFrame, dst: &mut BytesMut) -> Result<()> {
        debug_assert!(frame.body.len() <= usize::from(u16::MAX));
        let header = MessageHeader {
            protocol_id: frame.protocol_id,
            message_tag: frame.message_tag,
            body_len: frame.body.len() as u16,
        };
        dst.reserve(HEADER_LEN + frame.body.len());
        header.write(dst);
        dst.put_slice(&frame.body);
        Ok(())
    }
}
