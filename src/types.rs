//! # Domain Types for Transom
//!
//! Core types used throughout the proxy: identifier newtypes, the parsed
//! [`Event`] envelope, and the nid position type.
//!
//! ## Invariants
//!
//! - [`EventNid`]: strictly increasing per store, assigned once at first
//!   insert of an `event_id`, never reused.
//! - [`Event`]: the raw JSON text is authoritative and is served back to
//!   clients byte-for-byte; the extracted envelope fields are a read-only
//!   projection of it.

use std::fmt;

use crate::error::{Error, Result};

// =============================================================================
// Identifier Newtypes
// =============================================================================

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier from a string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the string representation.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

id_type! {
    /// A room identifier, e.g. `!foo:example.org`.
    RoomId
}

id_type! {
    /// A user identifier, e.g. `@alice:example.org`.
    UserId
}

id_type! {
    /// An upstream device identifier. Devices are the unit of polling: one
    /// poller per device, one since token per device.
    DeviceId
}

// =============================================================================
// Event Position
// =============================================================================

/// Monotonic numeric ID assigned to an event by the event store at first
/// insert.
///
/// Nids define the canonical order of a room's timeline log and key the
/// state snapshot chain. Valid nids start at 1; [`EventNid::NONE`] marks
/// "before any event".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventNid(i64);

impl EventNid {
    /// Sentinel for "no event": lower than every assigned nid.
    pub const NONE: EventNid = EventNid(0);

    /// Creates a nid from a raw database value.
    pub fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Returns the raw i64 value.
    pub fn as_raw(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for EventNid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Event
// =============================================================================

/// Event types whose arrival moves a room to the top of recency-sorted
/// lists. Receipts, typing and account-data never enter the timeline log,
/// so they can never bump.
pub(crate) const BUMP_EVENT_TYPES: &[&str] = &[
    "m.room.message",
    "m.room.encrypted",
    "m.room.member",
    "m.room.name",
    "m.room.topic",
    "m.room.avatar",
    "m.room.canonical_alias",
    "m.room.create",
];

/// Envelope fields extracted from a raw event, used only for parsing.
#[derive(serde::Deserialize)]
struct EventEnvelope {
    event_id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    state_key: Option<String>,
    sender: Option<String>,
    origin_server_ts: Option<i64>,
    #[serde(default)]
    content: serde_json::Value,
    #[serde(default)]
    unsigned: serde_json::Value,
}

/// A parsed event: the raw JSON text plus the envelope fields the proxy
/// needs. The blob stays opaque beyond those fields.
#[derive(Debug, Clone)]
pub struct Event {
    /// Globally unique event identifier.
    pub event_id: String,
    /// The `type` field, e.g. `m.room.message`.
    pub kind: String,
    /// Present exactly when this is a state event.
    pub state_key: Option<String>,
    /// The sending user.
    pub sender: UserId,
    /// Millisecond timestamp assigned by the origin server.
    pub origin_server_ts: i64,
    /// `unsigned.transaction_id` if the sender's client attached one.
    pub transaction_id: Option<String>,
    /// Parsed `content` object, used for cache derivations (membership,
    /// room name). Serving always uses `raw`.
    pub content: serde_json::Value,
    /// The original JSON text, byte-for-byte.
    pub raw: String,
}

impl Event {
    /// Parses a raw JSON event, extracting the envelope.
    ///
    /// # Errors
    ///
    /// [`Error::BadEvent`] when the blob is not a JSON object or lacks
    /// `event_id`, `type` or `sender`.
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let env: EventEnvelope = serde_json::from_str(&raw)
            .map_err(|e| Error::BadEvent(format!("not a JSON event: {e}")))?;
        let event_id = env
            .event_id
            .ok_or_else(|| Error::BadEvent("missing event_id".to_string()))?;
        let kind = env
            .kind
            .ok_or_else(|| Error::BadEvent(format!("event {event_id} missing type")))?;
        let sender = env
            .sender
            .ok_or_else(|| Error::BadEvent(format!("event {event_id} missing sender")))?;
        let transaction_id = env
            .unsigned
            .get("transaction_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        Ok(Self {
            event_id,
            kind,
            state_key: env.state_key,
            sender: UserId::new(sender),
            origin_server_ts: env.origin_server_ts.unwrap_or(0),
            transaction_id,
            content: env.content,
            raw,
        })
    }

    /// Whether this is a state event (has a `state_key`, possibly empty).
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// The `content.membership` value for `m.room.member` events.
    pub fn membership(&self) -> Option<&str> {
        if self.kind != "m.room.member" {
            return None;
        }
        self.content.get("membership").and_then(|v| v.as_str())
    }

    /// Whether this event moves its room to the top of recency sorts.
    pub fn bumps_ordering(&self) -> bool {
        BUMP_EVENT_TYPES.contains(&self.kind.as_str())
    }

    /// `content.name` for `m.room.name` events, `content.alias` for
    /// `m.room.canonical_alias` events, `None` otherwise.
    pub fn content_name(&self) -> Option<&str> {
        match self.kind.as_str() {
            "m.room.name" => self.content.get("name").and_then(|v| v.as_str()),
            "m.room.canonical_alias" => self.content.get("alias").and_then(|v| v.as_str()),
            _ => None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
