//! # Read-Side Queries
//!
//! Direct SQL reads used to serve connections and warm the caches. These
//! run on read-only connections (WAL mode keeps them consistent with the
//! writer) or, for in-memory databases, on the writer thread itself.
//!
//! Event rows that fail to parse are logged and skipped: the cache
//! self-heals on the next notification rather than failing a whole
//! response.

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::warn;

use crate::error::Result;
use crate::types::{DeviceId, Event, EventNid, RoomId, UserId, BUMP_EVENT_TYPES};

// =============================================================================
// Connections
// =============================================================================

/// Opens a read-only connection to a database file.
pub fn open_read_only(path: impl AsRef<std::path::Path>) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    Ok(conn)
}

// =============================================================================
// Timeline Queries
// =============================================================================

fn parse_row(nid: i64, json: String) -> Option<(EventNid, Event)> {
    match Event::parse(json) {
        Ok(event) => Some((EventNid::new(nid), event)),
        Err(e) => {
            warn!(nid, error = %e, "dropping unparseable stored event");
            None
        }
    }
}

/// The last `limit` timeline events of a room, ascending by nid.
pub fn timeline_tail(conn: &Connection, room_id: &RoomId, limit: usize) -> Result<Vec<(EventNid, Event)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT nid, json FROM events
         WHERE room_id = ?1 AND is_timeline = 1
         ORDER BY nid DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![room_id.as_str(), limit as i64], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (nid, json) = row?;
        if let Some(parsed) = parse_row(nid, json) {
            out.push(parsed);
        }
    }
    out.reverse();
    Ok(out)
}

/// Timeline events with nid in `(lo, hi]`, ascending.
pub fn timeline_range(
    conn: &Connection,
    room_id: &RoomId,
    lo_excl: EventNid,
    hi_incl: EventNid,
) -> Result<Vec<(EventNid, Event)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT nid, json FROM events
         WHERE room_id = ?1 AND is_timeline = 1 AND nid > ?2 AND nid <= ?3
         ORDER BY nid ASC",
    )?;
    let rows = stmt.query_map(
        params![room_id.as_str(), lo_excl.as_raw(), hi_incl.as_raw()],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
    )?;
    let mut out = Vec::new();
    for row in rows {
        let (nid, json) = row?;
        if let Some(parsed) = parse_row(nid, json) {
            out.push(parsed);
        }
    }
    Ok(out)
}

/// Up to `limit` timeline events strictly older than `before`, ascending.
/// Used when a client widens its timeline limit (trickling).
pub fn timeline_before(
    conn: &Connection,
    room_id: &RoomId,
    before: EventNid,
    limit: usize,
) -> Result<Vec<(EventNid, Event)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT nid, json FROM events
         WHERE room_id = ?1 AND is_timeline = 1 AND nid < ?2
         ORDER BY nid DESC LIMIT ?3",
    )?;
    let rows = stmt.query_map(
        params![room_id.as_str(), before.as_raw(), limit as i64],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
    )?;
    let mut out = Vec::new();
    for row in rows {
        let (nid, json) = row?;
        if let Some(parsed) = parse_row(nid, json) {
            out.push(parsed);
        }
    }
    out.reverse();
    Ok(out)
}

/// Highest timeline nid of a room.
pub fn latest_timeline_nid(conn: &Connection, room_id: &RoomId) -> Result<EventNid> {
    let nid: i64 = conn.query_row(
        "SELECT COALESCE(MAX(nid), 0) FROM events WHERE room_id = ?1 AND is_timeline = 1",
        params![room_id.as_str()],
        |row| row.get(0),
    )?;
    Ok(EventNid::new(nid))
}

/// Most recent timeline event of a room.
pub fn latest_timeline_event(conn: &Connection, room_id: &RoomId) -> Result<Option<(EventNid, Event)>> {
    Ok(timeline_tail(conn, room_id, 1)?.pop())
}

/// Most recent ordering-bumping timeline event: `(nid, origin_server_ts)`.
pub fn latest_bump(conn: &Connection, room_id: &RoomId) -> Result<Option<(EventNid, i64)>> {
    // the type list is a compile-time constant, safe to inline
    let types = BUMP_EVENT_TYPES
        .iter()
        .map(|t| format!("'{t}'"))
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT nid, origin_ts FROM events
         WHERE room_id = ?1 AND is_timeline = 1 AND event_type IN ({types})
         ORDER BY nid DESC LIMIT 1"
    );
    let mut stmt = conn.prepare(&sql)?;
    let row = stmt
        .query_row(params![room_id.as_str()], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })
        .optional()?;
    Ok(row.map(|(nid, ts)| (EventNid::new(nid), ts)))
}

/// The prev_batch token covering a timeline slice whose oldest event is
/// `oldest`: an exact match on the chunk boundary, or the closest later
/// token. No token at or after the boundary means no prev_batch (returning
/// an older one would make clients skip the events in between).
pub fn prev_batch_for(conn: &Connection, room_id: &RoomId, oldest: EventNid) -> Result<Option<String>> {
    let token: Option<String> = conn
        .query_row(
            "SELECT prev_batch FROM events
             WHERE room_id = ?1 AND is_timeline = 1 AND nid >= ?2 AND prev_batch IS NOT NULL
             ORDER BY nid ASC LIMIT 1",
            params![room_id.as_str(), oldest.as_raw()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(token)
}

// =============================================================================
// State Queries
// =============================================================================

fn snapshot_events(conn: &Connection, snapshot_id: i64) -> Result<Vec<(EventNid, Event)>> {
    let nids_json: String = conn.query_row(
        "SELECT nids FROM state_snapshots WHERE snapshot_id = ?1",
        params![snapshot_id],
        |row| row.get(0),
    )?;
    let nids: Vec<i64> = serde_json::from_str(&nids_json)
        .map_err(|e| crate::Error::Schema(format!("corrupt snapshot {snapshot_id}: {e}")))?;

    let mut out = Vec::with_capacity(nids.len());
    let mut stmt = conn.prepare_cached("SELECT json FROM events WHERE nid = ?1")?;
    for nid in nids {
        let json: String = stmt.query_row(params![nid], |row| row.get(0))?;
        if let Some(parsed) = parse_row(nid, json) {
            out.push(parsed);
        }
    }
    Ok(out)
}

/// The room's current state, one event per `(type, state_key)` slot.
pub fn current_state(conn: &Connection, room_id: &RoomId) -> Result<Vec<(EventNid, Event)>> {
    let snapshot_id: Option<i64> = conn
        .query_row(
            "SELECT current_snapshot_id FROM rooms WHERE room_id = ?1",
            params![room_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    match snapshot_id {
        Some(id) => snapshot_events(conn, id),
        None => Ok(Vec::new()),
    }
}

/// The room's state as of nid `at`: the snapshot produced by the last
/// state-bearing event with nid ≤ `at`, or the initial snapshot when no
/// state event precedes it.
pub fn state_at(conn: &Connection, room_id: &RoomId, at: EventNid) -> Result<Vec<(EventNid, Event)>> {
    let snapshot_id: Option<i64> = conn
        .query_row(
            "SELECT snapshot_id FROM events
             WHERE room_id = ?1 AND nid <= ?2 AND snapshot_id IS NOT NULL
             ORDER BY nid DESC LIMIT 1",
            params![room_id.as_str(), at.as_raw()],
            |row| row.get(0),
        )
        .optional()?;
    let snapshot_id = match snapshot_id {
        Some(id) => Some(id),
        None => conn
            .query_row(
                "SELECT initial_snapshot_id FROM rooms WHERE room_id = ?1",
                params![room_id.as_str()],
                |row| row.get(0),
            )
            .optional()?,
    };
    match snapshot_id {
        Some(id) => snapshot_events(conn, id),
        None => Ok(Vec::new()),
    }
}

// =============================================================================
// Warmup & Device Queries
// =============================================================================

/// Every room the store knows.
pub fn all_room_ids(conn: &Connection) -> Result<Vec<RoomId>> {
    let mut stmt = conn.prepare("SELECT room_id FROM rooms")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(RoomId::new(row?));
    }
    Ok(out)
}

/// Every registered device: `(device, user, since)`.
pub fn all_devices(conn: &Connection) -> Result<Vec<(DeviceId, UserId, Option<String>)>> {
    let mut stmt = conn.prepare("SELECT device_id, user_id, since FROM devices")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (device, user, since) = row?;
        out.push((DeviceId::new(device), UserId::new(user), since));
    }
    Ok(out)
}

/// A device's stored since token.
pub fn device_since(conn: &Connection, device_id: &DeviceId) -> Result<Option<String>> {
    let since: Option<Option<String>> = conn
        .query_row(
            "SELECT since FROM devices WHERE device_id = ?1",
            params![device_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(since.flatten())
}

/// To-device messages for a device in `(from, to]`, oldest first.
pub fn to_device_messages(
    conn: &Connection,
    device_id: &DeviceId,
    from_excl: i64,
    to_incl: i64,
) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT json FROM to_device_messages
         WHERE device_id = ?1 AND position > ?2 AND position <= ?3
         ORDER BY position ASC",
    )?;
    let rows = stmt.query_map(params![device_id.as_str(), from_excl, to_incl], |row| {
        row.get(0)
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Highest queued to-device position for a device (0 when empty).
pub fn latest_to_device_position(conn: &Connection, device_id: &DeviceId) -> Result<i64> {
    let pos: i64 = conn.query_row(
        "SELECT COALESCE(MAX(position), 0) FROM to_device_messages WHERE device_id = ?1",
        params![device_id.as_str()],
        |row| row.get(0),
    )?;
    Ok(pos)
}

/// Users typing in a room when its stream id falls in `(from, to]`.
pub fn typing(
    conn: &Connection,
    room_id: &RoomId,
    from_excl: i64,
    to_incl: i64,
) -> Result<Vec<UserId>> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT stream_id, user_ids FROM typing WHERE room_id = ?1",
            params![room_id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((stream_id, encoded)) = row else {
        return Ok(Vec::new());
    };
    if stream_id <= from_excl || stream_id > to_incl {
        return Ok(Vec::new());
    }
    let users: Vec<String> = serde_json::from_str(&encoded)
        .map_err(|e| crate::Error::Schema(format!("corrupt typing set: {e}")))?;
    Ok(users.into_iter().map(UserId::new).collect())
}

/// Pending invites for a user: `(room, invite_state_json)`.
pub fn invites_for_user(conn: &Connection, user_id: &UserId) -> Result<Vec<(RoomId, String)>> {
    let mut stmt =
        conn.prepare("SELECT room_id, invite_state FROM invites WHERE user_id = ?1")?;
    let rows = stmt.query_map(params![user_id.as_str()], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (room, state) = row?;
        out.push((RoomId::new(room), state));
    }
    Ok(out)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;
    use crate::storage::Storage;

    fn event(id: &str, kind: &str, state_key: Option<&str>, ts: i64) -> Event {
        let sk = state_key
            .map(|k| format!(r#""state_key":"{k}","#))
            .unwrap_or_default();
        Event::parse(format!(
            r#"{{"event_id":"{id}","type":"{kind}",{sk}"sender":"@a:hs","origin_server_ts":{ts},"content":{{}}}}"#
        ))
        .unwrap()
    }

    fn seeded_storage() -> Storage {
        let mut storage = Storage::new(Database::open_in_memory().unwrap().into_connection());
        let room = RoomId::from("!r:hs");
        {
            let tx = storage.transaction().unwrap();
            tx.initialise_room(&room, &[event("$create", "m.room.create", Some(""), 1)])
                .unwrap();
            tx.insert_timeline_events(
                &room,
                &[
                    event("$t1", "m.room.message", None, 10),
                    event("$t2", "m.room.message", None, 20),
                ],
                Some("chunk1"),
            )
            .unwrap();
            tx.insert_timeline_events(&room, &[event("$t3", "m.room.message", None, 30)], Some("chunk2"))
                .unwrap();
            tx.commit().unwrap();
        }
        storage
    }

    #[test]
    fn test_timeline_tail_and_range() {
        let storage = seeded_storage();
        let conn = storage.connection();
        let room = RoomId::from("!r:hs");

        let tail = timeline_tail(conn, &room, 2).unwrap();
        let ids: Vec<&str> = tail.iter().map(|(_, e)| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["$t2", "$t3"]);

        let range = timeline_range(conn, &room, tail[0].0, EventNid::new(i64::MAX)).unwrap();
        let ids: Vec<&str> = range.iter().map(|(_, e)| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["$t3"]);

        let older = timeline_before(conn, &room, tail[0].0, 5).unwrap();
        let ids: Vec<&str> = older.iter().map(|(_, e)| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["$t1"]);
    }

    #[test]
    fn test_state_block_never_in_timeline_reads() {
        let storage = seeded_storage();
        let conn = storage.connection();
        let room = RoomId::from("!r:hs");

        let tail = timeline_tail(conn, &room, 100).unwrap();
        assert!(tail.iter().all(|(_, e)| e.event_id != "$create"));
    }

    #[test]
    fn test_prev_batch_boundary_rules() {
        let storage = seeded_storage();
        let conn = storage.connection();
        let room = RoomId::from("!r:hs");

        // nids: $t1=2 (chunk1 token), $t2=3, $t3=4 (chunk2 token)
        let t1 = EventNid::new(2);
        let t2 = EventNid::new(3);
        let t3 = EventNid::new(4);
        assert_eq!(prev_batch_for(conn, &room, t3).unwrap().as_deref(), Some("chunk2"));
        // no token on $t2: fall forward to the closest later one
        assert_eq!(prev_batch_for(conn, &room, t2).unwrap().as_deref(), Some("chunk2"));
        assert_eq!(prev_batch_for(conn, &room, t1).unwrap().as_deref(), Some("chunk1"));
    }

    #[test]
    fn test_current_state() {
        let storage = seeded_storage();
        let conn = storage.connection();
        let room = RoomId::from("!r:hs");
        let state = current_state(conn, &room).unwrap();
        assert_eq!(state.len(), 1);
        assert_eq!(state[0].1.event_id, "$create");
    }
}
