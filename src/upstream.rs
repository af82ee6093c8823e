//! # Upstream Sync Client Interface
//!
//! The trait the poller drives plus the wire shape of an upstream sync
//! response. The proxy never performs network I/O itself: production code
//! supplies an HTTP-backed implementation, tests supply scripted fakes.
//!
//! Event payloads are carried as [`RawValue`] so the original bytes survive
//! all the way into the store; only the accumulator parses them.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::Result;
use crate::types::{RoomId, UserId};

// =============================================================================
// Client Trait
// =============================================================================

/// A client for the upstream sync-v2 long-poll endpoint.
///
/// Implementations map HTTP 401 to [`crate::Error::UpstreamAuth`] and every
/// other failure (network, 5xx, 429, non-auth 4xx) to
/// [`crate::Error::UpstreamTransient`]. The poller decides retry policy from
/// those two kinds alone.
#[async_trait]
pub trait SyncV2Client: Send + Sync {
    /// Performs one long-poll against the upstream `/sync` endpoint.
    ///
    /// `since` is `None` for the very first poll of a device. The call may
    /// block for the upstream long-poll timeout (typically 30s).
    async fn do_sync_v2(&self, auth_header: &str, since: Option<&str>) -> Result<SyncV2Response>;

    /// Resolves the user that owns `auth_header`, used once when a device
    /// is first registered.
    async fn who_am_i(&self, auth_header: &str) -> Result<UserId>;
}

// =============================================================================
// Response Types
// =============================================================================

/// A parsed upstream sync response. Every section is optional: the upstream
/// sends deltas and omits anything unchanged.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SyncV2Response {
    /// Opaque token to resume from; becomes the device's new `since` once
    /// the response is durably accumulated.
    #[serde(default)]
    pub next_batch: String,

    #[serde(default)]
    pub rooms: SyncV2Rooms,

    /// Messages addressed to this device.
    #[serde(default)]
    pub to_device: EventList,

    /// Global (non-room) account data for this user.
    #[serde(default)]
    pub account_data: EventList,
}

/// Per-membership room maps of a sync response.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SyncV2Rooms {
    #[serde(default)]
    pub join: BTreeMap<RoomId, SyncV2JoinResponse>,
    #[serde(default)]
    pub invite: BTreeMap<RoomId, SyncV2InviteResponse>,
    #[serde(default)]
    pub leave: BTreeMap<RoomId, SyncV2LeaveResponse>,
}

/// A joined room's delta.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SyncV2JoinResponse {
    /// Historical state catch-up. These events seed or repair the state
    /// store and must NEVER surface as timeline entries.
    #[serde(default)]
    pub state: EventList,

    /// New timeline events, oldest first.
    #[serde(default)]
    pub timeline: SyncV2Timeline,

    /// Ephemeral events (typing, receipts). Never persisted to the log.
    #[serde(default)]
    pub ephemeral: EventList,

    /// Per-room account data for this user.
    #[serde(default)]
    pub account_data: EventList,

    #[serde(default)]
    pub unread_notifications: UnreadNotifications,
}

/// An invited room's delta: a stripped-state preview.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SyncV2InviteResponse {
    #[serde(default)]
    pub invite_state: EventList,
}

/// A left room's delta. May carry the final events up to and including the
/// departure.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SyncV2LeaveResponse {
    #[serde(default)]
    pub state: EventList,
    #[serde(default)]
    pub timeline: SyncV2Timeline,
}

/// A timeline chunk.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SyncV2Timeline {
    /// Events in chronological order.
    #[serde(default)]
    pub events: Vec<Box<RawValue>>,

    /// Pagination token for history preceding this chunk. Stored against
    /// the chunk's first event.
    #[serde(default)]
    pub prev_batch: Option<String>,

    /// True when the upstream truncated the gap since the last poll.
    #[serde(default)]
    pub limited: bool,
}

/// A bare `{"events": [...]}` wrapper, shared by several sections.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct EventList {
    #[serde(default)]
    pub events: Vec<Box<RawValue>>,
}

/// Unread counters the upstream computed for this user in this room.
#[derive(Debug, Default, Clone, Copy, Deserialize, Serialize)]
pub struct UnreadNotifications {
    #[serde(default)]
    pub notification_count: Option<u64>,
    #[serde(default)]
    pub highlight_count: Option<u64>,
}

impl EventList {
    /// Convenience constructor used by fakes and the load generator.
    pub fn from_raw(events: Vec<Box<RawValue>>) -> Self {
        Self { events }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_partial_response() {
        let json = r#"{
            "next_batch": "s1",
            "rooms": {
                "join": {
                    "!foo:bar": {
                        "timeline": {
                            "events": [{"event_id":"$e1","type":"m.room.message","sender":"@a:hs"}],
                            "prev_batch": "pb",
                            "limited": true
                        },
                        "unread_notifications": {"notification_count": 2}
                    }
                }
            }
        }"#;
        let resp: SyncV2Response = serde_json::from_str(json).unwrap();
        assert_eq!(resp.next_batch, "s1");
        let room = resp.rooms.join.get(&RoomId::from("!foo:bar")).unwrap();
        assert_eq!(room.timeline.events.len(), 1);
        assert_eq!(room.timeline.prev_batch.as_deref(), Some("pb"));
        assert!(room.timeline.limited);
        assert_eq!(room.unread_notifications.notification_count, Some(2));
        assert!(room.state.events.is_empty());
        assert!(resp.rooms.invite.is_empty());
    }

    #[test]
    fn test_raw_events_preserve_bytes() {
        let json = r#"{"rooms":{"join":{"!r:hs":{"timeline":{"events":[{"b":1,"a":2}]}}}}}"#;
        let resp: SyncV2Response = serde_json::from_str(json).unwrap();
        let room = resp.rooms.join.get(&RoomId::from("!r:hs")).unwrap();
        // field order of the original text survives
        assert_eq!(room.timeline.events[0].get(), r#"{"b":1,"a":2}"#);
    }

    #[test]
    fn test_empty_response() {
        let resp: SyncV2Response = serde_json::from_str(r#"{"next_batch":"x"}"#).unwrap();
        assert!(resp.rooms.join.is_empty());
        assert!(resp.to_device.events.is_empty());
    }
}
