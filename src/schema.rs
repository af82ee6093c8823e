//! # SQLite Schema for Transom
//!
//! Schema definition and database initialisation.
//!
//! ## Table Overview
//!
//! ```text
//! events                      state_snapshots            rooms
//! ┌──────────────────┐        ┌──────────────────┐       ┌─────────────────────┐
//! │ nid (PK)         │        │ snapshot_id (PK) │◄──────│ room_id (PK)        │
//! │ event_id (UNIQ)  │   ┌───►│ room_id          │       │ initial_snapshot_id │
//! │ room_id          │   │    │ nids (JSON)      │       │ current_snapshot_id │
//! │ is_timeline      │   │    └──────────────────┘       └─────────────────────┘
//! │ snapshot_id ─────┼───┘
//! │ prev_batch       │        devices                    to_device_messages
//! │ json             │        ┌──────────────┐           ┌───────────────┐
//! └──────────────────┘        │ device_id PK │           │ position (PK) │
//!                             │ user_id      │           │ device_id     │
//! typing    invites           │ since        │           │ json          │
//! ┌─────┐   ┌──────┐          └──────────────┘           └───────────────┘
//! ```
//!
//! ## Design Notes
//!
//! - `events.nid` is the AUTOINCREMENT rowid: strictly increasing, never
//!   reused, assigned once per unique `event_id`. The UNIQUE constraint on
//!   `event_id` is what makes accumulation idempotent.
//! - `events.is_timeline` separates genuine timeline entries from events
//!   that arrived only in a `state` catch-up block. Timeline queries always
//!   filter on it; state events delivered inside a timeline chunk have it
//!   set and so appear in both views.
//! - A state snapshot is the full set of event nids making up a room's
//!   current state; each state-bearing timeline event records the snapshot
//!   it produced in `events.snapshot_id`, giving O(1) historical lookup for
//!   any nid boundary.
//! - `events.prev_batch` is set on the first event of each upstream
//!   timeline chunk; boundary lookup walks forward to the nearest token.

use rusqlite::Connection;

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Opening a database with a different version is an
/// error; there is no migration support yet.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// Deduplicated event log for every room the proxy has observed.
const CREATE_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    nid         INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id    TEXT NOT NULL UNIQUE,
    room_id     TEXT NOT NULL,
    event_type  TEXT NOT NULL,
    state_key   TEXT,
    sender      TEXT NOT NULL,
    origin_ts   INTEGER NOT NULL,
    is_timeline INTEGER NOT NULL,
    snapshot_id INTEGER,
    prev_batch  TEXT,
    json        TEXT NOT NULL
)
"#;

/// Timeline reads are always `WHERE room_id = ? AND is_timeline = 1` with a
/// nid range.
const CREATE_EVENTS_ROOM_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS events_room_nid
ON events(room_id, is_timeline, nid)
"#;

/// Full state membership per snapshot, as a JSON array of event nids. Rows
/// are written only when state actually changes; unchanged state reuses the
/// previous snapshot id.
const CREATE_STATE_SNAPSHOTS: &str = r#"
CREATE TABLE IF NOT EXISTS state_snapshots (
    snapshot_id INTEGER PRIMARY KEY AUTOINCREMENT,
    room_id     TEXT NOT NULL,
    nids        TEXT NOT NULL
)
"#;

/// One row per room the proxy has seen, pointing at the seed snapshot from
/// `initialise` and the current snapshot.
const CREATE_ROOMS: &str = r#"
CREATE TABLE IF NOT EXISTS rooms (
    room_id             TEXT PRIMARY KEY,
    initial_snapshot_id INTEGER NOT NULL,
    current_snapshot_id INTEGER NOT NULL
)
"#;

/// Device registry: the since token is the device's only resume position
/// and is written strictly after the response it came from is accumulated.
const CREATE_DEVICES: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    device_id TEXT PRIMARY KEY,
    user_id   TEXT NOT NULL,
    since     TEXT
)
"#;

/// FIFO queue of to-device messages, positions monotonic per table.
const CREATE_TO_DEVICE: &str = r#"
CREATE TABLE IF NOT EXISTS to_device_messages (
    position  INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT NOT NULL,
    json      TEXT NOT NULL
)
"#;

const CREATE_TO_DEVICE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS to_device_device_pos
ON to_device_messages(device_id, position)
"#;

/// Latest typing set per room with a strictly increasing stream id, so
/// readers can ask "anything newer than X?".
const CREATE_TYPING: &str = r#"
CREATE TABLE IF NOT EXISTS typing (
    room_id   TEXT PRIMARY KEY,
    stream_id INTEGER NOT NULL,
    user_ids  TEXT NOT NULL
)
"#;

/// Stripped-state invite previews, keyed by (room, invited user). Deleted
/// when the invite resolves to a join or leave.
const CREATE_INVITES: &str = r#"
CREATE TABLE IF NOT EXISTS invites (
    room_id      TEXT NOT NULL,
    user_id      TEXT NOT NULL,
    invite_state TEXT NOT NULL,
    PRIMARY KEY (room_id, user_id)
)
"#;

/// Account data, global (empty room_id) and per-room, latest blob per type.
const CREATE_ACCOUNT_DATA: &str = r#"
CREATE TABLE IF NOT EXISTS account_data (
    user_id TEXT NOT NULL,
    room_id TEXT NOT NULL DEFAULT '',
    type    TEXT NOT NULL,
    json    TEXT NOT NULL,
    PRIMARY KEY (user_id, room_id, type)
)
"#;

const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS transom_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the Transom schema applied and verified.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initialising it if necessary.
    ///
    /// # Errors
    ///
    /// - [`Error::Sqlite`] if the file can't be opened or created
    /// - [`Error::Schema`] if the stored schema version doesn't match
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database, used by tests and the load generator.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Consumes the wrapper, returning the initialised connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    fn initialize(&mut self) -> Result<()> {
        // WAL so the reader pool sees committed data without blocking the
        // writer; NORMAL sync is acceptable because the poller can replay
        // from the last persisted since token.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        self.conn.execute_batch("PRAGMA foreign_keys = ON")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_EVENTS)?;
        self.conn.execute_batch(CREATE_EVENTS_ROOM_INDEX)?;
        self.conn.execute_batch(CREATE_STATE_SNAPSHOTS)?;
        self.conn.execute_batch(CREATE_ROOMS)?;
        self.conn.execute_batch(CREATE_DEVICES)?;
        self.conn.execute_batch(CREATE_TO_DEVICE)?;
        self.conn.execute_batch(CREATE_TO_DEVICE_INDEX)?;
        self.conn.execute_batch(CREATE_TYPING)?;
        self.conn.execute_batch(CREATE_INVITES)?;
        self.conn.execute_batch(CREATE_ACCOUNT_DATA)?;

        self.verify_or_set_version()?;

        Ok(())
    }

    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<i32> = self
            .conn
            .query_row(
                "SELECT value FROM transom_metadata WHERE key = 'schema_version'",
                [],
                |row| {
                    let s: String = row.get(0)?;
                    Ok(s.parse().unwrap_or(0))
                },
            )
            .ok();

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO transom_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but this build requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    /// Test-only access to the raw connection.
    #[cfg(test)]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================
