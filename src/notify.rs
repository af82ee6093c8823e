//! # Post-Commit Notifications
//!
//! The accumulator publishes a [`Notification`] for every durable change,
//! strictly after the transaction that produced it commits, in nid order per
//! room. A broadcast channel fans them out to the cache dispatcher; caches
//! in turn wake the connections they serve.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::types::{DeviceId, Event, EventNid, RoomId, UserId};

// =============================================================================
// Notification
// =============================================================================

/// A durable change some consumer may care about.
#[derive(Debug, Clone)]
pub enum Notification {
    /// A room was seen for the first time and its state snapshot seeded.
    /// Carries the seed state so caches learn membership, name and an
    /// initial ordering key without touching the store.
    RoomSeeded {
        room_id: RoomId,
        state: Arc<Vec<(EventNid, Event)>>,
    },

    /// A new timeline entry was written for a room.
    NewEvent {
        room_id: RoomId,
        nid: EventNid,
        event: Arc<Event>,
        /// Whether this event moves the room in recency sorts.
        bumps: bool,
    },

    /// Upstream recomputed unread counters for one user in one room.
    UnreadCounts {
        room_id: RoomId,
        user_id: UserId,
        notification_count: u64,
        highlight_count: u64,
    },

    /// A user was invited to a room; the preview is in the store.
    Invite { room_id: RoomId, user_id: UserId },

    /// An invite resolved (join or leave) and was removed from the store.
    InviteGone { room_id: RoomId, user_id: UserId },

    /// A transaction id became known for an event that was already
    /// published. Wakes the sender's suspended connections so they can
    /// serve the event with the id attached.
    TransactionId {
        room_id: RoomId,
        event_id: String,
        user_id: UserId,
    },

    /// A device's upstream session died (401). Suspended connections for
    /// this device return immediately with a session-expired error.
    DeviceEvicted { device_id: DeviceId, user_id: UserId },
}

impl Notification {
    /// The room this notification concerns, when there is one.
    pub fn room_id(&self) -> Option<&RoomId> {
        match self {
            Notification::RoomSeeded { room_id, .. }
            | Notification::NewEvent { room_id, .. }
            | Notification::UnreadCounts { room_id, .. }
            | Notification::Invite { room_id, .. }
            | Notification::InviteGone { room_id, .. }
            | Notification::TransactionId { room_id, .. } => Some(room_id),
            Notification::DeviceEvicted { .. } => None,
        }
    }
}

// =============================================================================
// Hub
// =============================================================================

/// Default broadcast capacity. The dispatcher drains promptly; lag here
/// means the process is badly overloaded and is logged as an error.
pub const DEFAULT_NOTIFY_CAPACITY: usize = 16_384;

/// Fan-out point between the accumulator and everything downstream.
#[derive(Debug, Clone)]
pub struct NotifierHub {
    tx: broadcast::Sender<Notification>,
}

impl NotifierHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribes from "now": only notifications published after this call
    /// are received.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Publishes one notification. A send with no live receivers is not an
    /// error; the caches simply haven't started yet.
    pub fn publish(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }

    /// Publishes a batch in order.
    pub fn publish_all(&self, notifications: impl IntoIterator<Item = Notification>) {
        for n in notifications {
            self.publish(n);
        }
    }
}

impl Default for NotifierHub {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFY_CAPACITY)
    }
}

// =============================================================================
// Tests
// =============================================================================
