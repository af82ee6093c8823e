//! # Device Store
//!
//! Per-device persistence: the since token (the only resume position a
//! poller has), the to-device message queue, and the typing stream.
//!
//! The since token is written strictly after the response it came from has
//! been accumulated; writing it earlier could lose events on restart.

use rusqlite::{params, OptionalExtension};

use crate::error::Result;
use crate::storage::StoreTx;
use crate::types::{DeviceId, RoomId, UserId};

impl StoreTx<'_> {
    // =========================================================================
    // Device Registry
    // =========================================================================

    /// Registers a device, recording which user owns it. Idempotent.
    pub fn register_device(&self, device_id: &DeviceId, user_id: &UserId) -> Result<()> {
        self.raw_tx().execute(
            "INSERT INTO devices (device_id, user_id, since) VALUES (?1, ?2, NULL)
             ON CONFLICT(device_id) DO NOTHING",
            params![device_id.as_str(), user_id.as_str()],
        )?;
        Ok(())
    }

    /// The user that owns `device_id`, if registered.
    pub fn device_user(&self, device_id: &DeviceId) -> Result<Option<UserId>> {
        let user: Option<String> = self
            .raw_tx()
            .query_row(
                "SELECT user_id FROM devices WHERE device_id = ?1",
                params![device_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(user.map(UserId::new))
    }

    /// Overwrites the device's since token.
    pub fn update_device_since(&self, device_id: &DeviceId, since: &str) -> Result<()> {
        self.raw_tx().execute(
            "UPDATE devices SET since = ?1 WHERE device_id = ?2",
            params![since, device_id.as_str()],
        )?;
        Ok(())
    }

    /// The device's stored since token, `None` before its first successful
    /// poll.
    pub fn device_since(&self, device_id: &DeviceId) -> Result<Option<String>> {
        let since: Option<Option<String>> = self
            .raw_tx()
            .query_row(
                "SELECT since FROM devices WHERE device_id = ?1",
                params![device_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(since.flatten())
    }

    /// Removes a device after an upstream 401. Its queue goes with it.
    pub fn delete_device(&self, device_id: &DeviceId) -> Result<()> {
        self.raw_tx().execute(
            "DELETE FROM devices WHERE device_id = ?1",
            params![device_id.as_str()],
        )?;
        self.raw_tx().execute(
            "DELETE FROM to_device_messages WHERE device_id = ?1",
            params![device_id.as_str()],
        )?;
        Ok(())
    }

    // =========================================================================
    // To-Device Queue
    // =========================================================================

    /// Appends messages to a device's queue, returning the position of the
    /// last one. Positions are monotonic across the table.
    pub fn insert_to_device_messages(
        &self,
        device_id: &DeviceId,
        messages: &[&str],
    ) -> Result<i64> {
        let mut last_pos = 0;
        for message in messages {
            self.raw_tx().execute(
                "INSERT INTO to_device_messages (device_id, json) VALUES (?1, ?2)",
                params![device_id.as_str(), message],
            )?;
            last_pos = self.raw_tx().last_insert_rowid();
        }
        Ok(last_pos)
    }

    /// Messages for a device in `(from, to]`, oldest first.
    pub fn to_device_messages(
        &self,
        device_id: &DeviceId,
        from_excl: i64,
        to_incl: i64,
    ) -> Result<Vec<String>> {
        let mut stmt = self.raw_tx().prepare(
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

    /// Deletes acknowledged messages up to and including `pos`.
    pub fn delete_to_device_messages_up_to(&self, device_id: &DeviceId, pos: i64) -> Result<()> {
        self.raw_tx().execute(
            "DELETE FROM to_device_messages WHERE device_id = ?1 AND position <= ?2",
            params![device_id.as_str(), pos],
        )?;
        Ok(())
    }

    // =========================================================================
    // Account Data
    // =========================================================================

    /// Upserts an account-data blob for a user; `room_id` is `None` for
    /// global account data.
    pub fn set_account_data(
        &self,
        user_id: &UserId,
        room_id: Option<&RoomId>,
        data_type: &str,
        json: &str,
    ) -> Result<()> {
        self.raw_tx().execute(
            "INSERT INTO account_data (user_id, room_id, type, json) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, room_id, type) DO UPDATE SET json = excluded.json",
            params![
                user_id.as_str(),
                room_id.map(RoomId::as_str).unwrap_or(""),
                data_type,
                json,
            ],
        )?;
        Ok(())
    }

    // =========================================================================
    // Typing Stream
    // =========================================================================

    /// Replaces the set of users currently typing in a room, returning a
    /// strictly increasing stream id.
    pub fn set_typing(&self, room_id: &RoomId, user_ids: &[UserId]) -> Result<i64> {
        let stream_id: i64 = self.raw_tx().query_row(
            "SELECT COALESCE(MAX(stream_id), 0) + 1 FROM typing",
            [],
            |row| row.get(0),
        )?;
        let encoded = serde_json::to_string(&user_ids.iter().map(UserId::as_str).collect::<Vec<_>>())
            .map_err(|e| crate::Error::Schema(format!("encode typing set: {e}")))?;
        self.raw_tx().execute(
            "INSERT INTO typing (room_id, stream_id, user_ids) VALUES (?1, ?2, ?3)
             ON CONFLICT(room_id) DO UPDATE SET stream_id = excluded.stream_id, user_ids = excluded.user_ids",
            params![room_id.as_str(), stream_id, encoded],
        )?;
        Ok(stream_id)
    }

    /// The users typing in a room, when the room's stream id lies in
    /// `(from, to]`; empty otherwise.
    pub fn typing(&self, room_id: &RoomId, from_excl: i64, to_incl: i64) -> Result<Vec<UserId>> {
        let row: Option<(i64, String)> = self
            .raw_tx()
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
}

// =============================================================================
// Tests
// =============================================================================
