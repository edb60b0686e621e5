//! # Protocol Definitions
//!
//! A protocol definition is the shared vocabulary of one sub-protocol: two
//! ordered collections of message types, one per direction (client→server and
//! server→client), each mapping message name ⇄ numeric tag ⇄ payload type.
//!
//! Definitions are built once and then frozen. Tags are assigned per direction
//! in **sorted name order**, which makes the name↔tag maps a pure function of
//! the set of defined messages: two peers building the same definition always
//! derive identical tables, regardless of the order the `define_*` calls were
//! written in. This is the compatibility invariant the wire format relies on.
//!
//! Payload resolution is table-driven: every entry carries an explicit decode
//! closure for its concrete type, so inbound bodies deserialize directly into a
//! value of the right shape without any runtime type reflection.

use crate::error::{ProtocolError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Marker for types that can travel as message bodies.
///
/// Blanket-implemented; any serde-serializable owned type qualifies.
pub trait Payload: Serialize + DeserializeOwned + Send + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Send + 'static {}

/// An empty message body. Messages defined without a payload type use this
/// marker; it serializes to zero bytes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Nothing;

/// A decoded message body, type-erased for dispatch. Handlers downcast it back
/// to the concrete payload type they registered with.
pub type DynMessage = Box<dyn Any + Send>;

/// Decodes a raw body into a [`DynMessage`] of the entry's concrete type.
pub type PayloadDecoder = Arc<dyn Fn(&[u8]) -> Result<DynMessage> + Send + Sync>;

fn decoder_for<T: Payload>() -> PayloadDecoder {
    Arc::new(|bytes: &[u8]| {
        let value: T = crate::core::codec::decode_body(bytes)?;
        Ok(Box::new(value) as DynMessage)
    })
}

/// One registered message within a direction.
pub struct MessageEntry {
    name: String,
    type_id: TypeId,
    type_name: &'static str,
    decoder: PayloadDecoder,
}

impl MessageEntry {
    /// The message's registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `TypeId` of the payload type this message was defined with.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Human-readable payload type name, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// The decode closure for this entry's payload type.
    pub fn decoder(&self) -> PayloadDecoder {
        Arc::clone(&self.decoder)
    }
}

// One direction of a definition: dense tag-indexed entries plus the reverse
// name lookup. Frozen after build.
struct DirectionTable {
    entries: Vec<MessageEntry>,
    tag_by_name: HashMap<String, u16>,
}

impl DirectionTable {
    fn from_pending(pending: BTreeMap<String, (TypeId, &'static str, PayloadDecoder)>) -> Self {
        let mut entries = Vec::with_capacity(pending.len());
        let mut tag_by_name = HashMap::with_capacity(pending.len());
        // BTreeMap iteration is sorted by name; the position is the tag.
        for (tag, (name, (type_id, type_name, decoder))) in pending.into_iter().enumerate() {
            tag_by_name.insert(name.clone(), tag as u16);
            entries.push(MessageEntry {
                name,
                type_id,
                type_name,
                decoder,
            });
        }
        Self {
            entries,
            tag_by_name,
        }
    }

    fn tag(&self, name: &str) -> Option<u16> {
        self.tag_by_name.get(name).copied()
    }

    fn entry(&self, tag: u16) -> Option<&MessageEntry> {
        self.entries.get(tag as usize)
    }
}

/// An immutable sub-protocol definition: the name↔tag↔type bijections for both
/// directions. Built through [`ProtocolDefinition::build`].
pub struct ProtocolDefinition {
    name: &'static str,
    client: DirectionTable,
    server: DirectionTable,
}

impl ProtocolDefinition {
    /// Builds a definition by running `define` against a fresh builder and
    /// freezing the result.
    ///
    /// # Errors
    /// Returns [`ProtocolError::DefinitionError`] on duplicate or empty message
    /// names, or when a direction exceeds 65535 messages.
    pub fn build<F>(name: &'static str, define: F) -> Result<Self>
    where
        F: FnOnce(&mut ProtocolDefinitionBuilder) -> Result<()>,
    {
        let mut builder = ProtocolDefinitionBuilder {
            name,
            client: BTreeMap::new(),
            server: BTreeMap::new(),
        };
        define(&mut builder)?;
        Ok(Self {
            name,
            client: DirectionTable::from_pending(builder.client),
            server: DirectionTable::from_pending(builder.server),
        })
    }

    /// The protocol's name, used to address it from session managers.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Tag for a client→server message name.
    pub fn client_tag(&self, message: &str) -> Result<u16> {
        self.client.tag(message).ok_or_else(|| {
            ProtocolError::UnexpectedMessage(format!(
                "protocol {} does not define a client message {message:?}",
                self.name
            ))
        })
    }

    /// Tag for a server→client message name.
    pub fn server_tag(&self, message: &str) -> Result<u16> {
        self.server.tag(message).ok_or_else(|| {
            ProtocolError::UnexpectedMessage(format!(
                "protocol {} does not define a server message {message:?}",
                self.name
            ))
        })
    }

    /// Entry for a client→server tag, or `None` when out of range.
    pub fn client_entry(&self, tag: u16) -> Option<&MessageEntry> {
        self.client.entry(tag)
    }

    /// Entry for a server→client tag, or `None` when out of range.
    pub fn server_entry(&self, tag: u16) -> Option<&MessageEntry> {
        self.server.entry(tag)
    }

    /// Number of client→server messages.
    pub fn client_count(&self) -> usize {
        self.client.entries.len()
    }

    /// Number of server→client messages.
    pub fn server_count(&self) -> usize {
        self.server.entries.len()
    }
}

/// Accumulates message definitions until the definition is frozen.
///
/// Obtained inside the closure passed to [`ProtocolDefinition::build`]; there
/// is no way to define further messages after `build` returns.
pub struct ProtocolDefinitionBuilder {
    name: &'static str,
    client: BTreeMap<String, (TypeId, &'static str, PayloadDecoder)>,
    server: BTreeMap<String, (TypeId, &'static str, PayloadDecoder)>,
}

impl ProtocolDefinitionBuilder {
    /// Defines a client→server message carrying a `T` body.
    pub fn client_message<T: Payload>(&mut self, message: &str) -> Result<&mut Self> {
        Self::define::<T>(self.name, "client", &mut self.client, message)?;
        Ok(self)
    }

    /// Defines a client→server message without a body.
    pub fn client_message_empty(&mut self, message: &str) -> Result<&mut Self> {
        self.client_message::<Nothing>(message)
    }

    /// Defines a server→client message carrying a `T` body.
    pub fn server_message<T: Payload>(&mut self, message: &str) -> Result<&mut Self> {
        Self::define::<T>(self.name, "server", &mut self.server, message)?;
        Ok(self)
    }

    /// Defines a server→client message without a body.
    pub fn server_message_empty(&mut self, message: &str) -> Result<&mut Self> {
        self.server_message::<Nothing>(message)
    }

    fn define<T: Payload>(
        protocol: &str,
        scope: &str,
        pending: &mut BTreeMap<String, (TypeId, &'static str, PayloadDecoder)>,
        message: &str,
    ) -> Result<()> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ProtocolError::DefinitionError(format!(
                "protocol {protocol}: message name is empty"
            )));
        }
        if pending.len() >= usize::from(u16::MAX) {
            return Err(ProtocolError::DefinitionError(format!(
                "protocol {protocol}: the {scope} direction already has {} messages",
                u16::MAX
            )));
        }
        if pending.contains_key(message) {
            return Err(ProtocolError::DefinitionError(format!(
                "protocol {protocol}: message name already registered as a {scope} message: {message}"
            )));
        }
        pending.insert(
            message.to_string(),
            (
                TypeId::of::<T>(),
                std::any::type_name::<T>(),
                decoder_for::<T>(),
            ),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProtocolDefinition {
        ProtocolDefinition::build("sample", |b| {
            b.client_message::<String>("Say")?;
            b.client_message_empty("Quit")?;
            b.server_message::<u32>("Count")?;
            Ok(())
        })
        .unwrap()
    }

    #[test]
    fn tags_follow_sorted_name_order() {
        let def = sample();
        // "Quit" < "Say" lexicographically, so it gets the lower tag even
        // though it was defined second.
        assert_eq!(def.client_tag("Quit").unwrap(), 0);
        assert_eq!(def.client_tag("Say").unwrap(), 1);
        assert_eq!(def.server_tag("Count").unwrap(), 0);
    }

    #[test]
    fn identical_definitions_derive_identical_maps() {
        let a = sample();
        let b = sample();
        for name in ["Say", "Quit"] {
            assert_eq!(a.client_tag(name).unwrap(), b.client_tag(name).unwrap());
        }
        assert_eq!(a.client_count(), b.client_count());
        assert_eq!(a.server_count(), b.server_count());
    }

    #[test]
    fn duplicate_name_is_a_definition_error() {
        let result = ProtocolDefinition::build("dup", |b| {
            b.client_message::<String>("Say")?;
            b.client_message::<u32>("Say")?;
            Ok(())
        });
        assert!(matches!(result, Err(ProtocolError::DefinitionError(_))));
    }

    #[test]
    fn empty_name_is_a_definition_error() {
        let result = ProtocolDefinition::build("empty", |b| {
            b.client_message_empty("  ")?;
            Ok(())
        });
        assert!(matches!(result, Err(ProtocolError::DefinitionError(_))));
    }

    #[test]
    fn unknown_lookups_fail() {
        let def = sample();
        assert!(matches!(
            def.client_tag("Missing"),
            Err(ProtocolError::UnexpectedMessage(_))
        ));
        assert!(def.server_entry(7).is_none());
    }

    #[test]
    fn entry_reports_registered_type() {
        let def = sample();
        let entry = def.client_entry(1).unwrap();
        assert_eq!(entry.name(), "Say");
        assert_eq!(entry.type_id(), TypeId::of::<String>());
    }
}
