//! The zero protocol: a mandatory version handshake.
//!
//! Every connection speaks this protocol first, at protocol id 0. The server
//! greets with `LetsAgree`, the client answers with `MyVersion`, and the
//! server either admits the connection (`VersionMatch`) or rejects it
//! (`VersionMismatch` and close). A connection that never answers is timed
//! out. Until a connection is admitted, traffic for every other protocol is
//! refused with `NotReady`.
//!
//! The server side here is a pure state machine: it decides transitions and
//! returns what happened, while the session manager owns the actual sending,
//! timers, and closing. That keeps every transition unit-testable without a
//! socket.

use crate::error::Result;
use crate::protocol::definition::ProtocolDefinition;
use crate::service::ConnectionId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Name of the zero protocol in every protocol table.
pub const ZERO_PROTOCOL_NAME: &str = "zero";

/// Zero protocol message names. Tags derive from these via the definition's
/// sorted-name rule, so the names themselves are the wire contract.
pub mod messages {
    /// Server→client: greeting, asks the client for its version.
    pub const LETS_AGREE: &str = "LetsAgree";
    /// Server→client: the client took too long to answer.
    pub const TIMEOUT: &str = "Timeout";
    /// Server→client: versions are compatible, the connection is admitted.
    pub const VERSION_MATCH: &str = "VersionMatch";
    /// Server→client: versions are incompatible, the connection will close.
    pub const VERSION_MISMATCH: &str = "VersionMismatch";
    /// Server→client: a non-zero-protocol message arrived before admission.
    pub const NOT_READY: &str = "NotReady";
    /// Server→client: a `MyVersion` arrived on an already admitted connection.
    pub const ALREADY_DONE: &str = "AlreadyDone";
    /// Client→server: the client's version, answering `LetsAgree`.
    pub const MY_VERSION: &str = "MyVersion";
}

/// Release channel of a [`Version`]. Informational only; compatibility is
/// decided on the numeric fields.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReleaseType {
    Alpha,
    Beta,
    ReleaseCandidate,
    #[default]
    Release,
}

/// A protocol version as exchanged during the handshake.
///
/// Two versions are compatible when `major` and `minor` match; `revision` and
/// `release_type` never influence admission.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub revision: u8,
    pub release_type: ReleaseType,
}

impl Version {
    pub fn new(major: u8, minor: u8, revision: u8, release_type: ReleaseType) -> Self {
        Self {
            major,
            minor,
            revision,
            release_type,
        }
    }

    /// Whether a peer offering `other` may join a session speaking `self`.
    pub fn compatible_with(&self, other: &Version) -> bool {
        self.major == other.major && self.minor == other.minor
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{} ({:?})",
            self.major, self.minor, self.revision, self.release_type
        )
    }
}

/// Builds the zero protocol's message vocabulary.
pub fn definition() -> Result<ProtocolDefinition> {
    ProtocolDefinition::build(ZERO_PROTOCOL_NAME, |b| {
        b.client_message::<Version>(messages::MY_VERSION)?;
        b.server_message_empty(messages::LETS_AGREE)?;
        b.server_message_empty(messages::TIMEOUT)?;
        b.server_message_empty(messages::VERSION_MATCH)?;
        b.server_message_empty(messages::VERSION_MISMATCH)?;
        b.server_message_empty(messages::NOT_READY)?;
        b.server_message_empty(messages::ALREADY_DONE)?;
        Ok(())
    })
}

/// Handshake progress of one server-side connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Greeted, waiting for `MyVersion`.
    AwaitingVersion,
    /// Admitted; full traffic flows.
    Ready,
    /// Version incompatible; the connection is being closed.
    Rejected,
    /// Never answered; the connection is being closed.
    TimedOut,
}

/// What a `MyVersion` message did to the connection's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOutcome {
    /// Compatible: answer `VersionMatch`, connection becomes ready.
    Match,
    /// Incompatible: answer `VersionMismatch` and close.
    Mismatch,
    /// The connection was already admitted: answer `AlreadyDone`, keep state.
    AlreadyDone,
    /// The connection is already being torn down; drop the message.
    Ignored,
}

/// Server-side handshake state for all live connections.
///
/// Owned by the server's dispatch task; no interior locking.
pub struct HandshakeTracker {
    version: Version,
    states: HashMap<ConnectionId, HandshakeState>,
}

impl HandshakeTracker {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            states: HashMap::new(),
        }
    }

    /// Registers a freshly connected peer. The caller must send `LetsAgree`
    /// and arm the handshake timer.
    pub fn on_connected(&mut self, conn: ConnectionId) {
        self.states.insert(conn, HandshakeState::AwaitingVersion);
    }

    /// Applies an incoming `MyVersion`.
    pub fn on_my_version(&mut self, conn: ConnectionId, offered: &Version) -> VersionOutcome {
        match self.states.get(&conn) {
            Some(HandshakeState::AwaitingVersion) => {
                if self.version.compatible_with(offered) {
                    self.states.insert(conn, HandshakeState::Ready);
                    debug!(conn, version = %offered, "handshake accepted");
                    VersionOutcome::Match
                } else {
                    self.states.insert(conn, HandshakeState::Rejected);
                    debug!(conn, offered = %offered, expected = %self.version, "handshake rejected");
                    VersionOutcome::Mismatch
                }
            }
            Some(HandshakeState::Ready) => VersionOutcome::AlreadyDone,
            _ => VersionOutcome::Ignored,
        }
    }

    /// Fires the handshake timer for a connection. Returns `true` only when
    /// the connection was still awaiting its version, so the timeout path
    /// (send `Timeout`, close) runs at most once per connection.
    pub fn on_timeout(&mut self, conn: ConnectionId) -> bool {
        match self.states.get(&conn) {
            Some(HandshakeState::AwaitingVersion) => {
                self.states.insert(conn, HandshakeState::TimedOut);
                debug!(conn, "handshake timed out");
                true
            }
            _ => false,
        }
    }

    /// Whether full traffic is admitted for the connection.
    pub fn is_ready(&self, conn: ConnectionId) -> bool {
        matches!(self.states.get(&conn), Some(HandshakeState::Ready))
    }

    /// Removes the connection's state. Returns `true` when it was ready, in
    /// which case ready-closing listeners must fire before the id is reused.
    pub fn on_disconnected(&mut self, conn: ConnectionId) -> bool {
        matches!(
            self.states.remove(&conn),
            Some(HandshakeState::Ready)
        )
    }

    pub fn state(&self, conn: ConnectionId) -> Option<HandshakeState> {
        self.states.get(&conn).copied()
    }
}

/// Client-side notification of handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// `LetsAgree` arrived; our version is being sent.
    Started,
    /// Admitted by the server.
    Matched,
    /// Rejected; the server will close the connection.
    Mismatched,
    /// We answered too late; the server will close the connection.
    TimedOut,
    /// We sent non-zero traffic before admission.
    NotReady,
    /// We re-sent our version after admission.
    AlreadyDone,
}

type EventListener = Box<dyn Fn(HandshakeEvent) + Send + Sync>;

/// Client-side handshake companion.
///
/// Tracks readiness and fans handshake notices out to listeners in
/// registration order. Owned by the client's dispatch task; listeners are
/// registered before connecting.
pub struct HandshakeFollower {
    version: Version,
    ready: bool,
    listeners: Vec<EventListener>,
}

impl HandshakeFollower {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            ready: false,
            listeners: Vec::new(),
        }
    }

    /// Adds a listener for handshake notices. Listeners run on the dispatch
    /// task and must not block.
    pub fn add_listener(&mut self, listener: EventListener) {
        self.listeners.push(listener);
    }

    /// Answers `LetsAgree`: returns the version to send back.
    pub fn on_lets_agree(&mut self) -> Version {
        self.notify(HandshakeEvent::Started);
        self.version
    }

    pub fn on_match(&mut self) {
        self.ready = true;
        self.notify(HandshakeEvent::Matched);
    }

    pub fn on_mismatch(&mut self) {
        self.ready = false;
        self.notify(HandshakeEvent::Mismatched);
    }

    pub fn on_timeout(&mut self) {
        self.ready = false;
        self.notify(HandshakeEvent::TimedOut);
    }

    pub fn on_not_ready(&mut self) {
        self.notify(HandshakeEvent::NotReady);
    }

    pub fn on_already_done(&mut self) {
        self.notify(HandshakeEvent::AlreadyDone);
    }

    /// Clears readiness when the connection goes away.
    pub fn on_disconnected(&mut self) {
        self.ready = false;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    fn notify(&self, event: HandshakeEvent) {
        for listener in &self.listeners {
            listener(event);
        }
    }
}
