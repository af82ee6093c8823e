//! # Write-Side Storage
//!
//! The synchronous storage layer the accumulator drives. One [`Storage`]
//! owns the single read-write connection; every accumulation runs inside a
//! [`StoreTx`] so a response is applied entirely or not at all.
//!
//! ## Invariants
//!
//! 1. `nid` strictly increases and is assigned exactly once per `event_id`;
//!    re-inserting a known event returns the existing nid.
//! 2. A room's current state snapshot always equals its initial snapshot
//!    forward-applied with every state-bearing timeline event, in nid order.
//! 3. Events delivered only in `state` catch-up blocks carry
//!    `is_timeline = 0` and never satisfy timeline queries.

use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::error::Result;
use crate::types::{Event, EventNid, RoomId};

// =============================================================================
// Storage
// =============================================================================

/// Owner of the read-write connection.
pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Wraps an initialised connection (see [`crate::schema::Database`]).
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Begins a write transaction.
    pub fn transaction(&mut self) -> Result<StoreTx<'_>> {
        Ok(StoreTx {
            tx: self.conn.transaction()?,
        })
    }

    /// Read-only access for serving queries in single-connection setups.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// One write transaction over the store. Dropping without [`StoreTx::commit`]
/// rolls back.
pub struct StoreTx<'a> {
    tx: Transaction<'a>,
}

/// Outcome of inserting one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertedEvent {
    /// The nid now associated with the event (fresh or pre-existing).
    pub nid: EventNid,
    /// Whether this call created the timeline entry. Duplicates and
    /// state-only re-deliveries report `false`.
    pub new_timeline_entry: bool,
}

impl<'a> StoreTx<'a> {
    /// Commits the transaction.
    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }

    // =========================================================================
    // Event Log
    // =========================================================================

    /// Inserts a timeline chunk for a room, deduplicating on `event_id`.
    ///
    /// Returns one entry per input event, in order. The first event of the
    /// chunk has `prev_batch` attached to its row when the chunk carried a
    /// token and the row doesn't already have one. An event previously seen
    /// only in a `state` block is promoted to the timeline here and counts
    /// as a new timeline entry.
    pub fn insert_timeline_events(
        &self,
        room_id: &RoomId,
        events: &[Event],
        prev_batch: Option<&str>,
    ) -> Result<Vec<InsertedEvent>> {
        let mut out = Vec::with_capacity(events.len());
        for event in events {
            let inserted = self.insert_event(room_id, event, true)?;
            out.push(inserted);
        }
        if let (Some(token), Some(first)) = (prev_batch, events.first()) {
            self.tx.execute(
                "UPDATE events SET prev_batch = ?1 WHERE event_id = ?2 AND prev_batch IS NULL",
                params![token, first.event_id],
            )?;
        }
        Ok(out)
    }

    /// Inserts state-block events (never part of the timeline).
    pub fn insert_state_events(
        &self,
        room_id: &RoomId,
        events: &[Event],
    ) -> Result<Vec<InsertedEvent>> {
        let mut out = Vec::with_capacity(events.len());
        for event in events {
            out.push(self.insert_event(room_id, event, false)?);
        }
        Ok(out)
    }

    fn insert_event(
        &self,
        room_id: &RoomId,
        event: &Event,
        timeline: bool,
    ) -> Result<InsertedEvent> {
        let changed = self.tx.execute(
            "INSERT INTO events (event_id, room_id, event_type, state_key, sender, origin_ts, is_timeline, json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(event_id) DO NOTHING",
            params![
                event.event_id,
                room_id.as_str(),
                event.kind,
                event.state_key,
                event.sender.as_str(),
                event.origin_server_ts,
                timeline as i64,
                event.raw,
            ],
        )?;
        if changed == 1 {
            return Ok(InsertedEvent {
                nid: EventNid::new(self.tx.last_insert_rowid()),
                new_timeline_entry: timeline,
            });
        }

        // duplicate: hand back the existing nid, promoting a state-only row
        // if the event now genuinely appears in a timeline chunk
        let (nid, was_timeline): (i64, i64) = self.tx.query_row(
            "SELECT nid, is_timeline FROM events WHERE event_id = ?1",
            params![event.event_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let mut new_timeline_entry = false;
        if timeline && was_timeline == 0 {
            self.tx.execute(
                "UPDATE events SET is_timeline = 1 WHERE nid = ?1",
                params![nid],
            )?;
            new_timeline_entry = true;
        }
        Ok(InsertedEvent {
            nid: EventNid::new(nid),
            new_timeline_entry,
        })
    }

    /// Highest timeline nid for a room, [`EventNid::NONE`] when empty.
    pub fn latest_timeline_nid(&self, room_id: &RoomId) -> Result<EventNid> {
        let nid: i64 = self.tx.query_row(
            "SELECT COALESCE(MAX(nid), 0) FROM events WHERE room_id = ?1 AND is_timeline = 1",
            params![room_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(EventNid::new(nid))
    }

    // =========================================================================
    // State Snapshots
    // =========================================================================

    /// Whether the proxy has ever seen this room.
    pub fn room_exists(&self, room_id: &RoomId) -> Result<bool> {
        let exists: Option<i64> = self
            .tx
            .query_row(
                "SELECT 1 FROM rooms WHERE room_id = ?1",
                params![room_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    /// Seeds a room's state from a `state` catch-up block.
    ///
    /// No-op returning `None` when the room already exists: catch-up state
    /// never rewrites history. Otherwise returns the nids assigned to the
    /// block, aligned with the input. The events land in the event table
    /// with `is_timeline = 0` and form the room's initial snapshot (last
    /// writer wins per `(type, state_key)` within the block).
    pub fn initialise_room(&self, room_id: &RoomId, state: &[Event]) -> Result<Option<Vec<EventNid>>> {
        if self.room_exists(room_id)? {
            return Ok(None);
        }

        let inserted = self.insert_state_events(room_id, state)?;

        // last event wins per state slot, preserving block order
        let mut slots: Vec<((String, String), i64)> = Vec::new();
        for (event, ins) in state.iter().zip(&inserted) {
            if let Some(state_key) = &event.state_key {
                let key = (event.kind.clone(), state_key.clone());
                if let Some(slot) = slots.iter_mut().find(|(k, _)| *k == key) {
                    slot.1 = ins.nid.as_raw();
                } else {
                    slots.push((key, ins.nid.as_raw()));
                }
            }
        }
        let nids: Vec<i64> = slots.into_iter().map(|(_, nid)| nid).collect();
        let snapshot_id = self.insert_snapshot(room_id, &nids)?;

        self.tx.execute(
            "INSERT INTO rooms (room_id, initial_snapshot_id, current_snapshot_id) VALUES (?1, ?2, ?3)",
            params![room_id.as_str(), snapshot_id, snapshot_id],
        )?;
        Ok(Some(inserted.into_iter().map(|i| i.nid).collect()))
    }

    /// Applies state-bearing timeline events to the room's snapshot chain,
    /// in nid order. One snapshot row is written per event so historical
    /// state is addressable at every nid boundary.
    ///
    /// Callers must pass only events whose timeline entry is new; replaying
    /// a duplicate chunk therefore leaves the chain untouched.
    pub fn apply_state_events(&self, room_id: &RoomId, events: &[(EventNid, &Event)]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut slots = self.load_current_slots(room_id)?;
        let mut last_snapshot = None;
        for (nid, event) in events {
            let state_key = match &event.state_key {
                Some(k) => k.clone(),
                None => continue,
            };
            let key = (event.kind.clone(), state_key);
            if let Some(slot) = slots.iter_mut().find(|(k, _)| *k == key) {
                slot.1 = nid.as_raw();
            } else {
                slots.push((key, nid.as_raw()));
            }
            let nids: Vec<i64> = slots.iter().map(|(_, n)| *n).collect();
            let snapshot_id = self.insert_snapshot(room_id, &nids)?;
            self.tx.execute(
                "UPDATE events SET snapshot_id = ?1 WHERE nid = ?2",
                params![snapshot_id, nid.as_raw()],
            )?;
            last_snapshot = Some(snapshot_id);
        }

        if let Some(snapshot_id) = last_snapshot {
            self.tx.execute(
                "UPDATE rooms SET current_snapshot_id = ?1 WHERE room_id = ?2",
                params![snapshot_id, room_id.as_str()],
            )?;
        }
        Ok(())
    }

    fn load_current_slots(&self, room_id: &RoomId) -> Result<Vec<((String, String), i64)>> {
        let snapshot_id: i64 = self.tx.query_row(
            "SELECT current_snapshot_id FROM rooms WHERE room_id = ?1",
            params![room_id.as_str()],
            |row| row.get(0),
        )?;
        let nids_json: String = self.tx.query_row(
            "SELECT nids FROM state_snapshots WHERE snapshot_id = ?1",
            params![snapshot_id],
            |row| row.get(0),
        )?;
        let nids: Vec<i64> = serde_json::from_str(&nids_json)
            .map_err(|e| crate::Error::Schema(format!("corrupt snapshot {snapshot_id}: {e}")))?;

        let mut slots = Vec::with_capacity(nids.len());
        let mut stmt = self
            .tx
            .prepare("SELECT event_type, state_key FROM events WHERE nid = ?1")?;
        for nid in nids {
            let (kind, state_key): (String, Option<String>) =
                stmt.query_row(params![nid], |row| Ok((row.get(0)?, row.get(1)?)))?;
            slots.push(((kind, state_key.unwrap_or_default()), nid));
        }
        Ok(slots)
    }

    fn insert_snapshot(&self, room_id: &RoomId, nids: &[i64]) -> Result<i64> {
        let nids_json = serde_json::to_string(nids)
            .map_err(|e| crate::Error::Schema(format!("encode snapshot: {e}")))?;
        self.tx.execute(
            "INSERT INTO state_snapshots (room_id, nids) VALUES (?1, ?2)",
            params![room_id.as_str(), nids_json],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    // =========================================================================
    // Invites
    // =========================================================================

    /// Stores (or refreshes) an invite preview for a user.
    pub fn set_invite(
        &self,
        room_id: &RoomId,
        user_id: &crate::types::UserId,
        invite_state: &str,
    ) -> Result<()> {
        self.tx.execute(
            "INSERT INTO invites (room_id, user_id, invite_state) VALUES (?1, ?2, ?3)
             ON CONFLICT(room_id, user_id) DO UPDATE SET invite_state = excluded.invite_state",
            params![room_id.as_str(), user_id.as_str(), invite_state],
        )?;
        Ok(())
    }

    /// Drops an invite once the membership resolved to join or leave.
    /// Returns whether an invite actually existed.
    pub fn remove_invite(&self, room_id: &RoomId, user_id: &crate::types::UserId) -> Result<bool> {
        let changed = self.tx.execute(
            "DELETE FROM invites WHERE room_id = ?1 AND user_id = ?2",
            params![room_id.as_str(), user_id.as_str()],
        )?;
        Ok(changed > 0)
    }

    pub(crate) fn raw_tx(&self) -> &Transaction<'a> {
        &self.tx
    }
}

// =============================================================================
// Tests
// =============================================================================
