//! # Transport Layer
//!
//! Per-connection stream pumping.
//!
//! The endpoint in this module is generic over the byte stream
//! (`AsyncRead + AsyncWrite`): plain TCP, TLS-wrapped TCP, or an in-memory
//! duplex all plug in unchanged. Certificate and session policy belong to
//! whoever constructs the stream, not to this crate.

pub mod endpoint;
pub mod tls;

pub use endpoint::{ConnectionEndpoint, EndpointHooks, EndpointOptions, SendCompletion};
pub use tls::{TlsClientConfig, TlsServerConfig};
