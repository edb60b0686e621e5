//! # Session Managers
//!
//! Server and client endpoints over the protocol stack.
//!
//! A session manager owns a set of pumped connections, a table of protocol
//! definitions, and one dispatch task. Every handler and lifecycle listener in
//! the process runs on that dispatch task, so application code observes a
//! single logical context: no handler ever races another handler of the same
//! manager.
//!
//! ## Components
//! - **ProtocolTable**: the dense, ordered list of protocols a session speaks
//! - **IdPool**: connection id allocation with reuse
//! - **NetworkServer** / **NetworkClient**: the two managers

pub mod client;
pub mod idpool;
pub mod server;

use crate::error::{ProtocolError, Result};
use crate::protocol::definition::ProtocolDefinition;
use crate::protocol::zero;
use std::collections::HashMap;
use std::sync::Arc;

pub use client::{ClientHandle, ClientProtocolBuilder, ClientSender, NetworkClient};
pub use server::{
    NetworkServer, ServerBroadcaster, ServerHandle, ServerProtocolBuilder, ServerSender,
};

/// Identifies one connection within a server. Ids are unique among live
/// connections and may be reused after teardown completes.
pub type ConnectionId = u64;

/// Reserved id for the in-process host peer. Never assigned to a socket; the
/// pool allocates from 1.
pub const HOST_CONNECTION_ID: ConnectionId = 0;

/// The ordered set of protocols a session speaks.
///
/// Entry 0 is always the zero protocol. Entries from 1 up follow the
/// registrations' declared dependencies in a deterministic topological order:
/// a protocol always comes after everything it depends on, and independent
/// protocols keep their registration order. Both peers building the same
/// registrations therefore agree on every protocol id.
pub struct ProtocolTable {
    entries: Vec<Arc<ProtocolDefinition>>,
    index_by_name: HashMap<&'static str, u16>,
}

impl ProtocolTable {
    /// Builds the table from registrations of `(definition, dependency names)`.
    /// The zero protocol is installed at id 0 automatically.
    ///
    /// # Errors
    /// [`ProtocolError::DefinitionError`] for duplicate protocol names or a
    /// dependency cycle; [`ProtocolError::UnknownProtocol`] when a declared
    /// dependency names no registration.
    pub fn build(
        registrations: Vec<(Arc<ProtocolDefinition>, Vec<&'static str>)>,
    ) -> Result<Self> {
        let mut entries = vec![Arc::new(zero::definition()?)];
        let order = dependency_order(&registrations)?;
        for position in order {
            entries.push(Arc::clone(&registrations[position].0));
        }

        let mut index_by_name = HashMap::with_capacity(entries.len());
        for (id, definition) in entries.iter().enumerate() {
            if index_by_name.insert(definition.name(), id as u16).is_some() {
                return Err(ProtocolError::DefinitionError(format!(
                    "protocol name registered twice: {}",
                    definition.name()
                )));
            }
        }

        Ok(Self {
            entries,
            index_by_name,
        })
    }

    /// Definition for a protocol id, or `None` when out of range.
    pub fn definition(&self, id: u16) -> Option<&Arc<ProtocolDefinition>> {
        self.entries.get(usize::from(id))
    }

    /// Id of a protocol by name.
    pub fn id_of(&self, name: &str) -> Result<u16> {
        self.index_by_name.get(name).copied().ok_or_else(|| {
            ProtocolError::UnknownProtocol(name.to_string())
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolver for a server: decodes client→server messages.
    pub fn client_resolver(self: &Arc<Self>) -> crate::core::codec::PayloadResolver {
        let table = Arc::clone(self);
        Arc::new(move |protocol_id, tag| {
            table
                .definition(protocol_id)
                .and_then(|def| def.client_entry(tag))
                .map(|entry| entry.decoder())
        })
    }

    /// Resolver for a client: decodes server→client messages.
    pub fn server_resolver(self: &Arc<Self>) -> crate::core::codec::PayloadResolver {
        let table = Arc::clone(self);
        Arc::new(move |protocol_id, tag| {
            table
                .definition(protocol_id)
                .and_then(|def| def.server_entry(tag))
                .map(|entry| entry.decoder())
        })
    }
}

/// Kahn's algorithm over the registration list, breaking ties by registration
/// order so the result is deterministic.
fn dependency_order(
    registrations: &[(Arc<ProtocolDefinition>, Vec<&'static str>)],
) -> Result<Vec<usize>> {
    let position_of: HashMap<&str, usize> = registrations
        .iter()
        .enumerate()
        .map(|(i, (def, _))| (def.name(), i))
        .collect();

    // dependents[i] lists registrations that must come after i.
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); registrations.len()];
    let mut blockers = vec![0usize; registrations.len()];
    for (i, (def, deps)) in registrations.iter().enumerate() {
        for dep in deps {
            if *dep == zero::ZERO_PROTOCOL_NAME {
                continue; // always present, never blocks
            }
            let j = *position_of.get(dep).ok_or_else(|| {
                ProtocolError::UnknownProtocol(format!(
                    "protocol {} depends on unregistered protocol {dep}",
                    def.name()
                ))
            })?;
            dependents[j].push(i);
            blockers[i] += 1;
        }
    }

    let mut order = Vec::with_capacity(registrations.len());
    let mut ready: Vec<usize> = (0..registrations.len())
        .filter(|&i| blockers[i] == 0)
        .collect();
    while let Some(next) = ready.iter().copied().min() {
        ready.retain(|&i| i != next);
        order.push(next);
        for &dependent in &dependents[next] {
            blockers[dependent] -= 1;
            if blockers[dependent] == 0 {
                ready.push(dependent);
            }
        }
    }

    if order.len() != registrations.len() {
        return Err(ProtocolError::DefinitionError(
            "protocol dependencies form a cycle".to_string(),
        ));
    }
    Ok(order)
}
