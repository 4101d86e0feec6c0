//! Core event types for Beacon.
//!
//! An [`Event`] is one captured observation inside a user session: the
//! session it belongs to, what happened, when, and any extra properties.
//! Events are immutable once constructed — they are appended to the queue
//! and only ever removed in bulk when a batch is flushed.
//!
//! # Example
//!
//! ```json
//! {
//!   "session_id": "8c2e1c1e-4f5a-4a57-9f2e-1b7a3d9c0e44",
//!   "type": "phase_change",
//!   "ts": 1756000000,
//!   "props": {
//!     "phase": "lobby",
//!     "previous": null
//!   }
//! }
//! ```

use chrono::Utc;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The kind of a captured event.
///
/// Built-in kinds cover the session lifecycle; [`EventKind::Custom`] carries
/// host-defined marks. The wire representation is a plain string so the
/// collector never needs to know about new custom marks in advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A user session was created (explicit join or lazy creation)
    SessionStart,

    /// A user session ended (user left the server)
    SessionEnd,

    /// First meaningful input observed for the session (monotonic, once)
    FirstInput,

    /// First interaction observed for the session (monotonic, once)
    FirstInteraction,

    /// The host application changed the session's phase
    PhaseChange,

    /// A host-defined custom mark
    Custom(String),
}

impl EventKind {
    /// The string sent over the wire for this kind.
    pub fn as_wire(&self) -> &str {
        match self {
            EventKind::SessionStart => "session_start",
            EventKind::SessionEnd => "session_end",
            EventKind::FirstInput => "first_input",
            EventKind::FirstInteraction => "first_interaction",
            EventKind::PhaseChange => "phase_change",
            EventKind::Custom(name) => name,
        }
    }

    /// Parse a wire string back into a kind.
    ///
    /// Unknown strings become [`EventKind::Custom`], so a consumer built
    /// against an older kind set still round-trips newer events.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "session_start" => EventKind::SessionStart,
            "session_end" => EventKind::SessionEnd,
            "first_input" => EventKind::FirstInput,
            "first_interaction" => EventKind::FirstInteraction,
            "phase_change" => EventKind::PhaseChange,
            other => EventKind::Custom(other.to_string()),
        }
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_wire())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(EventKind::from_wire(&s))
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// A captured telemetry event.
///
/// # Fields
///
/// - `session_id`: the session this event belongs to
/// - `kind`: what happened (serialized as `"type"`)
/// - `ts`: unix seconds when the event was captured
/// - `props`: arbitrary JSON properties, may be an empty object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Session the event belongs to
    pub session_id: String,

    /// Event kind, serialized as the `type` field
    #[serde(rename = "type")]
    pub kind: EventKind,

    /// Unix timestamp (seconds) at capture time
    pub ts: i64,

    /// Arbitrary JSON properties
    pub props: Value,
}

impl Event {
    /// Create a new event stamped with the current time.
    pub fn new(session_id: impl Into<String>, kind: EventKind, props: Value) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
            ts: Utc::now().timestamp(),
            props,
        }
    }

    /// Override the timestamp (used by tests).
    pub fn with_ts(mut self, ts: i64) -> Self {
        self.ts = ts;
        self
    }
}

/// Generate a fresh session identifier.
///
/// A random 128-bit value formatted as a canonical version-4 UUID string.
/// Statistically unique across concurrent sessions; not security-sensitive
/// and never derived from persistent user identity.
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}
