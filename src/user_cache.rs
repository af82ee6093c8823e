//! # Per-User Cache
//!
//! The per-user view derived from the global cache: which rooms the user is
//! joined to, per-room unread counters, pending invites, and the listener
//! registry that wakes this user's suspended connections.
//!
//! Connections hold strong references to their user cache and register a
//! listener channel; the cache holds only the channel (dropped senders are
//! pruned on send), so destruction of a connection deregisters cleanly.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use tokio::sync::mpsc;

use crate::notify::Notification;
use crate::types::{RoomId, UserId};

// =============================================================================
// Per-Room User Data
// =============================================================================

/// Counters the upstream computes per user per room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserRoomData {
    pub notification_count: u64,
    pub highlight_count: u64,
}

// =============================================================================
// User Cache
// =============================================================================

/// One user's derived view. Created lazily the first time a poller or a
/// connection shows up for the user.
#[derive(Debug)]
pub struct UserCache {
    user_id: UserId,
    rooms: RwLock<HashMap<RoomId, UserRoomData>>,
    invites: RwLock<HashSet<RoomId>>,
    listeners: Mutex<HashMap<u64, mpsc::UnboundedSender<Notification>>>,
    next_listener_id: AtomicU64,
}

impl UserCache {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            rooms: RwLock::new(HashMap::new()),
            invites: RwLock::new(HashSet::new()),
            listeners: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Seeds membership at startup or first contact.
    pub fn seed_joined(&self, room_ids: impl IntoIterator<Item = RoomId>) {
        let mut rooms = self.rooms.write().expect("user cache lock poisoned");
        for room_id in room_ids {
            rooms.entry(room_id).or_default();
        }
    }

    /// Folds a notification already filtered to this user, then fans it out
    /// to registered listeners. Locks are released before the fan-out.
    pub fn on_notification(&self, notification: &Notification) {
        match notification {
            Notification::RoomSeeded { room_id, state } => {
                let joined = state.iter().rev().find_map(|(_, event)| {
                    if event.state_key.as_deref() == Some(self.user_id.as_str()) {
                        event.membership().map(|m| m == "join")
                    } else {
                        None
                    }
                });
                if joined == Some(true) {
                    self.rooms
                        .write()
                        .expect("user cache lock poisoned")
                        .entry(room_id.clone())
                        .or_default();
                }
            }
            Notification::NewEvent { room_id, event, .. } => {
                if let (Some(state_key), Some(membership)) =
                    (&event.state_key, event.membership())
                {
                    if state_key == self.user_id.as_str() {
                        match membership {
                            "join" => {
                                self.rooms
                                    .write()
                                    .expect("user cache lock poisoned")
                                    .entry(room_id.clone())
                                    .or_default();
                                self.invites
                                    .write()
                                    .expect("user cache lock poisoned")
                                    .remove(room_id);
                            }
                            "leave" | "ban" => {
                                self.rooms
                                    .write()
                                    .expect("user cache lock poisoned")
                                    .remove(room_id);
                                self.invites
                                    .write()
                                    .expect("user cache lock poisoned")
                                    .remove(room_id);
                            }
                            _ => {}
                        }
                    }
                }
            }
            Notification::UnreadCounts {
                room_id,
                notification_count,
                highlight_count,
                ..
            } => {
                let mut rooms = self.rooms.write().expect("user cache lock poisoned");
                let data = rooms.entry(room_id.clone()).or_default();
                data.notification_count = *notification_count;
                data.highlight_count = *highlight_count;
            }
            Notification::Invite { room_id, .. } => {
                self.invites
                    .write()
                    .expect("user cache lock poisoned")
                    .insert(room_id.clone());
            }
            Notification::InviteGone { room_id, .. } => {
                self.invites
                    .write()
                    .expect("user cache lock poisoned")
                    .remove(room_id);
            }
            Notification::TransactionId { .. } | Notification::DeviceEvicted { .. } => {}
        }

        self.fan_out(notification);
    }

    fn fan_out(&self, notification: &Notification) {
        let mut listeners = self.listeners.lock().expect("listener lock poisoned");
        listeners.retain(|_, tx| tx.send(notification.clone()).is_ok());
    }

    /// Registers a connection's wake channel; the returned id deregisters.
    pub fn register_listener(&self, tx: mpsc::UnboundedSender<Notification>) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .insert(id, tx);
        id
    }

    pub fn deregister_listener(&self, id: u64) {
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .remove(&id);
    }

    /// The rooms this user is joined to.
    pub fn joined_rooms(&self) -> Vec<RoomId> {
        self.rooms
            .read()
            .expect("user cache lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn is_joined(&self, room_id: &RoomId) -> bool {
        self.rooms
            .read()
            .expect("user cache lock poisoned")
            .contains_key(room_id)
    }

    /// Per-room counters, zeroes when unknown.
    pub fn room_data(&self, room_id: &RoomId) -> UserRoomData {
        self.rooms
            .read()
            .expect("user cache lock poisoned")
            .get(room_id)
            .copied()
            .unwrap_or_default()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::types::{Event, EventNid};

    fn member_event(target: &str, membership: &str) -> Notification {
        let event = Event::parse(format!(
            r#"{{"event_id":"$m{target}{membership}","type":"m.room.member","state_key":"{target}","sender":"{target}","origin_server_ts":1,"content":{{"membership":"{membership}"}}}}"#
        ))
        .unwrap();
        Notification::NewEvent {
            room_id: RoomId::from("!r:hs"),
            nid: EventNid::new(1),
            event: Arc::new(event),
            bumps: true,
        }
    }

    #[test]
    fn test_join_and_leave_update_membership() {
        let cache = UserCache::new(UserId::from("@a:hs"));
        cache.on_notification(&member_event("@a:hs", "join"));
        assert!(cache.is_joined(&RoomId::from("!r:hs")));

        // someone else's membership is not ours
        cache.on_notification(&member_event("@b:hs", "leave"));
        assert!(cache.is_joined(&RoomId::from("!r:hs")));

        cache.on_notification(&member_event("@a:hs", "leave"));
        assert!(!cache.is_joined(&RoomId::from("!r:hs")));
    }

    #[test]
    fn test_unread_counts_stored() {
        let cache = UserCache::new(UserId::from("@a:hs"));
        cache.on_notification(&Notification::UnreadCounts {
            room_id: RoomId::from("!r:hs"),
            user_id: UserId::from("@a:hs"),
            notification_count: 3,
            highlight_count: 1,
        });
        let data = cache.room_data(&RoomId::from("!r:hs"));
        assert_eq!(data.notification_count, 3);
        assert_eq!(data.highlight_count, 1);
    }

    #[tokio::test]
    async fn test_listeners_receive_and_prune() {
        let cache = UserCache::new(UserId::from("@a:hs"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = cache.register_listener(tx);

        cache.on_notification(&member_event("@a:hs", "join"));
        assert!(matches!(rx.recv().await, Some(Notification::NewEvent { .. })));

        cache.deregister_listener(id);
        cache.on_notification(&member_event("@a:hs", "leave"));
        assert!(rx.try_recv().is_err());
    }
}
