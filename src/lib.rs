//! # netmux
//!
//! A message-oriented sub-protocol multiplexer over a single TCP (or TLS)
//! stream.
//!
//! One connection carries many independent *protocols*, each with its own
//! vocabulary of typed messages per direction. Frames are tiny: a 6-byte
//! header (protocol id, message tag, body length) followed by a
//! bincode-serialized body. Protocol ids and message tags are never
//! hard-coded; both derive deterministically from the registered definitions,
//! so two peers sharing the same definitions agree on the whole wire format.
//!
//! ## Layers
//! - [`core`]: framing and body serialization
//! - [`protocol`]: definitions, the zero-protocol handshake, throttling
//! - [`transport`]: the per-connection pump (generic over the stream type;
//!   TLS plugs in here)
//! - [`service`]: the [`service::NetworkServer`] and
//!   [`service::NetworkClient`] session managers
//! - [`config`] / [`utils`]: configuration and logging setup
//!
//! ## Example
//! ```no_run
//! use netmux::config::NetmuxConfig;
//! use netmux::protocol::ProtocolDefinition;
//! use netmux::service::{NetworkServer, ServerProtocolBuilder};
//!
//! # async fn run() -> netmux::Result<()> {
//! let chat = ProtocolDefinition::build("chat", |b| {
//!     b.client_message::<String>("Say")?;
//!     b.server_message::<String>("Said")?;
//!     Ok(())
//! })?;
//!
//! let mut server = NetworkServer::new(&NetmuxConfig::default());
//! server.register(
//!     ServerProtocolBuilder::new(chat).handle::<String, _, _>(
//!         "Say",
//!         |handle, conn, text| async move {
//!             handle.broadcast(None, "chat", "Said", &text).await?;
//!             let _ = conn;
//!             Ok(())
//!         },
//!     )?,
//! )?;
//! server.listen().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Every connection starts in the zero protocol: the server greets, the
//! client answers with its version, and only a compatible pair unlocks the
//! rest of the table. See [`protocol::zero`].

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::NetmuxConfig;
pub use error::{ProtocolError, Result};
pub use protocol::definition::{Nothing, Payload, ProtocolDefinition};
pub use protocol::zero::{HandshakeEvent, ReleaseType, Version};
pub use service::{
    ClientProtocolBuilder, ConnectionId, NetworkClient, NetworkServer, ServerProtocolBuilder,
    HOST_CONNECTION_ID,
};
pub use transport::{ConnectionEndpoint, SendCompletion, TlsClientConfig, TlsServerConfig};
