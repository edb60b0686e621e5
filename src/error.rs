//! # Error Types
//!
//! Comprehensive error handling for the multiplexer.
//!
//! This module defines all error variants that can occur during protocol
//! operations, from low-level framing failures to session-manager usage errors.
//!
//! ## Error Categories
//! - **Framing errors**: malformed headers, oversized or corrupt bodies; always
//!   fatal to the connection that produced them.
//! - **Registry errors**: unknown protocol/tag combinations, unregistered message
//!   names, payload type mismatches; programming errors, raised synchronously.
//! - **Lifecycle errors**: operations attempted in the wrong session state
//!   (`NotConnected`, `AlreadyRunning`, ...).
//!
//! All errors implement `std::error::Error` for interoperability.

use std::io;
use thiserror::Error;

/// ProtocolError is the primary error type for all multiplexer operations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    /// The 6-byte header could not be parsed, or the stream ended inside a
    /// frame. Fatal to the connection.
    #[error("Invalid or truncated frame header")]
    InvalidHeader,

    /// A message body exceeded the negotiated maximum size, or a deserializer
    /// consumed more bytes than the header declared (corrupt frame).
    #[error("Message overflow: {0}")]
    MessageOverflow(String),

    /// A protocol-id/tag combination (or message name) that is not in the
    /// registry. Fatal to the connection when raised while decoding.
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    /// A message was sent or handled with a payload type different from the
    /// one it was registered with. Raised synchronously, never coerced.
    #[error("Message type mismatch: {0}")]
    TypeMismatch(String),

    /// A second handler was installed for a message that already has one.
    #[error("Handler already registered for message: {0}")]
    HandlerAlreadyRegistered(String),

    /// Definition-time failure while building a protocol definition
    /// (duplicate name, empty name, too many messages per direction).
    #[error("Protocol definition error: {0}")]
    DefinitionError(String),

    /// A protocol name was referenced that is not part of the session's table.
    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Already running")]
    AlreadyRunning,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Connection closed")]
    ConnectionClosed,

    /// The throttler was asked to guard a connection it does not track.
    #[error("Connection {0} is not tracked by the throttler")]
    UntrackedConnection(u64),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<bincode::Error> for ProtocolError {
    fn from(e: bincode::Error) -> Self {
        ProtocolError::DeserializeError(e.to_string())
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
