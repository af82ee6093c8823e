//! # Global Room Cache
//!
//! Process-wide, in-memory index of every room the proxy knows: latest
//! event, display name, recency key, joined-user set. Updated strictly from
//! accumulator notifications, never from client requests; loadable from the
//! store at startup so a restart serves identical windows.
//!
//! A connection materialising a sorted list reads
//! [`GlobalCache::rooms_for_user`] under a single lock acquisition, so the
//! view is never torn across rooms.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use crate::types::{Event, EventNid, RoomId, UserId};

// =============================================================================
// Room Metadata
// =============================================================================

/// Everything the cache tracks for one room.
#[derive(Debug, Clone, Default)]
pub struct GlobalRoom {
    /// From `m.room.name`, the current state value.
    pub name: Option<String>,
    /// From `m.room.canonical_alias`.
    pub canonical_alias: Option<String>,
    /// Most recent timeline event of any type.
    pub latest_event: Option<Arc<Event>>,
    /// Nid of `latest_event`.
    pub latest_nid: EventNid,
    /// Recency sort key: timestamp of the most recent ordering-bumping
    /// event, with the nid as tiebreak.
    pub bump_ts: i64,
    pub bump_nid: EventNid,
    /// Users whose membership is currently `join`.
    pub joined_users: BTreeSet<UserId>,
}

/// The per-room slice a connection needs to sort a list.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    pub room_id: RoomId,
    pub name: Option<String>,
    pub bump_ts: i64,
    pub bump_nid: EventNid,
}

// =============================================================================
// Cache
// =============================================================================

/// The index. Writes come only from the notification dispatcher; reads from
/// connections and user caches.
#[derive(Debug, Default)]
pub struct GlobalCache {
    rooms: RwLock<HashMap<RoomId, GlobalRoom>>,
}

impl GlobalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the cache from the store at startup. `seed_state` is the
    /// room's current state, `latest` its newest timeline event, `bump` the
    /// newest ordering-bumping timeline event as `(nid, origin_ts)`.
    pub fn load_room(
        &self,
        room_id: RoomId,
        seed_state: &[(EventNid, Event)],
        latest: Option<(EventNid, Event)>,
        bump: Option<(EventNid, i64)>,
    ) {
        let mut room = GlobalRoom::default();
        for (nid, event) in seed_state {
            Self::fold_state(&mut room, event);
            if event.bumps_ordering() && event.origin_server_ts >= room.bump_ts {
                room.bump_ts = event.origin_server_ts;
                room.bump_nid = *nid;
            }
        }
        if let Some((nid, event)) = latest {
            room.latest_nid = nid;
            room.latest_event = Some(Arc::new(event));
        }
        if let Some((nid, ts)) = bump {
            room.bump_ts = ts;
            room.bump_nid = nid;
        }
        let mut rooms = self.rooms.write().expect("global cache lock poisoned");
        rooms.insert(room_id, room);
    }

    /// Folds a freshly seeded room's state, returning the users now joined
    /// to it. The state events' timestamps stand in as the ordering key
    /// until a timeline event arrives.
    pub fn seed_room(&self, room_id: &RoomId, state: &[(EventNid, Event)]) -> Vec<UserId> {
        let mut rooms = self.rooms.write().expect("global cache lock poisoned");
        let room = rooms.entry(room_id.clone()).or_default();
        for (nid, event) in state {
            Self::fold_state(room, event);
            if event.bumps_ordering() && event.origin_server_ts >= room.bump_ts {
                room.bump_ts = event.origin_server_ts;
                room.bump_nid = *nid;
            }
        }
        room.joined_users.iter().cloned().collect()
    }

    /// Applies one new timeline event, returning the users who should hear
    /// about it (the joined set, plus the target of a membership change).
    pub fn apply_event(
        &self,
        room_id: &RoomId,
        nid: EventNid,
        event: &Arc<Event>,
        bumps: bool,
    ) -> Vec<UserId> {
        let mut rooms = self.rooms.write().expect("global cache lock poisoned");
        let room = rooms.entry(room_id.clone()).or_default();

        if nid > room.latest_nid {
            room.latest_nid = nid;
            room.latest_event = Some(event.clone());
        }
        if bumps && (event.origin_server_ts, nid) > (room.bump_ts, room.bump_nid) {
            room.bump_ts = event.origin_server_ts;
            room.bump_nid = nid;
        }
        Self::fold_state(room, event);

        let mut affected: Vec<UserId> = room.joined_users.iter().cloned().collect();
        if let (Some(state_key), Some(_)) = (&event.state_key, event.membership()) {
            let target = UserId::new(state_key.clone());
            if !affected.contains(&target) {
                affected.push(target);
            }
        }
        affected
    }

    fn fold_state(room: &mut GlobalRoom, event: &Event) {
        match event.kind.as_str() {
            "m.room.name" => {
                room.name = event.content_name().map(|s| s.to_string());
            }
            "m.room.canonical_alias" => {
                room.canonical_alias = event.content_name().map(|s| s.to_string());
            }
            "m.room.member" => {
                if let (Some(state_key), Some(membership)) = (&event.state_key, event.membership())
                {
                    let target = UserId::new(state_key.clone());
                    match membership {
                        "join" => {
                            room.joined_users.insert(target);
                        }
                        "leave" | "ban" => {
                            room.joined_users.remove(&target);
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    /// Metadata snapshot for one room.
    pub fn room(&self, room_id: &RoomId) -> Option<GlobalRoom> {
        self.rooms
            .read()
            .expect("global cache lock poisoned")
            .get(room_id)
            .cloned()
    }

    /// Whether `user_id` is currently joined to `room_id`.
    pub fn is_joined(&self, room_id: &RoomId, user_id: &UserId) -> bool {
        self.rooms
            .read()
            .expect("global cache lock poisoned")
            .get(room_id)
            .map(|r| r.joined_users.contains(user_id))
            .unwrap_or(false)
    }

    /// Sort handles for every room the user is joined to, read under one
    /// lock acquisition.
    pub fn rooms_for_user(&self, user_id: &UserId) -> Vec<RoomHandle> {
        let rooms = self.rooms.read().expect("global cache lock poisoned");
        rooms
            .iter()
            .filter(|(_, room)| room.joined_users.contains(user_id))
            .map(|(room_id, room)| RoomHandle {
                room_id: room_id.clone(),
                name: room.name.clone(),
                bump_ts: room.bump_ts,
                bump_nid: room.bump_nid,
            })
            .collect()
    }

    /// Sort handle for a single room.
    pub fn handle(&self, room_id: &RoomId) -> Option<RoomHandle> {
        let rooms = self.rooms.read().expect("global cache lock poisoned");
        rooms.get(room_id).map(|room| RoomHandle {
            room_id: room_id.clone(),
            name: room.name.clone(),
            bump_ts: room.bump_ts,
            bump_nid: room.bump_nid,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
