//! # Protocol Layer
//!
//! Everything about *what* travels over a connection, as opposed to *how*.
//!
//! ## Components
//! - **Definition**: the per-sub-protocol message vocabulary (name ⇄ tag ⇄ type)
//! - **Zero**: the mandatory version handshake spoken by every connection
//! - **Throttle**: per-connection command rate guards

pub mod definition;
pub mod throttle;
pub mod zero;

pub use definition::{DynMessage, Nothing, Payload, ProtocolDefinition};
pub use throttle::{ClientThrottler, ServerThrottler, ThrottleOutcome, ThrottleProfile};
pub use zero::{ReleaseType, Version};
