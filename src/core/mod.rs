//! # Core Wire Components
//!
//! Low-level framing and binary serialization.
//!
//! This module provides the foundation of the multiplexer: the fixed message
//! header, frame encoding/decoding, and body serialization.
//!
//! ## Wire Format
//! ```text
//! [ProtocolId(2)] [MessageTag(2)] [BodyLen(2)] [Body(BodyLen)]
//! ```
//! All header fields are unsigned 16-bit, big-endian. Frames are not
//! self-delimiting beyond this header: any framing error makes the rest of the
//! stream unparseable and terminates the connection.
//!
//! ## Safety
//! - Body length is validated against the configured maximum before any
//!   allocation or read.
//! - The payload type is resolved from the registry *before* the body is
//!   consumed, so bodies deserialize directly into a correctly-shaped value.

pub mod codec;
