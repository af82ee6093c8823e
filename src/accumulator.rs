//! # Accumulator
//!
//! Folds one parsed upstream sync response into the store, in a single
//! transaction, and reports what changed so the caller can publish
//! notifications strictly after commit.
//!
//! Per joined room, in order: initialise state on first sight (the `state`
//! block never touches the timeline), then insert the timeline chunk with
//! dedup, then evolve the state snapshot chain with the chunk's new
//! state-bearing events. The device's since token is written last; a
//! failure anywhere rolls the whole response back, so the poller retries
//! from the old since without gaps.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::notify::Notification;
use crate::storage::Storage;
use crate::types::{DeviceId, Event, RoomId, UserId};
use crate::upstream::{SyncV2Response, SyncV2Timeline};

// =============================================================================
// Outcome
// =============================================================================

/// What one accumulation changed. Published by the caller after commit.
#[derive(Debug, Default)]
pub struct AccumulateOutcome {
    /// New-event and membership notifications, nid-ordered per room.
    pub notifications: Vec<Notification>,
    /// Every `(room, event_id, sender, txn_id)` sighting in the response,
    /// including duplicates of already-stored events: the store keeps
    /// whichever raw blob arrived first, so duplicates are the only way
    /// the sender's txn_id reaches the cache.
    pub txn_ids: Vec<(RoomId, String, UserId, String)>,
    /// Rooms touched by this response, for logging.
    pub rooms_touched: usize,
}

// =============================================================================
// Accumulator
// =============================================================================

/// Owns the write side of the store. One per process, driven from the
/// writer thread.
pub struct Accumulator {
    storage: Storage,
}

impl Accumulator {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Read access for single-connection (in-memory) deployments.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Mutable access for maintenance operations outside a sync response.
    pub fn storage_mut(&mut self) -> &mut Storage {
        &mut self.storage
    }

    /// Registers a device → user binding.
    pub fn register_device(&mut self, device_id: &DeviceId, user_id: &UserId) -> Result<()> {
        let tx = self.storage.transaction()?;
        tx.register_device(device_id, user_id)?;
        tx.commit()
    }

    /// Removes a device after an upstream 401.
    pub fn evict_device(&mut self, device_id: &DeviceId) -> Result<()> {
        let tx = self.storage.transaction()?;
        tx.delete_device(device_id)?;
        tx.commit()
    }

    /// The device's persisted since token.
    pub fn device_since(&mut self, device_id: &DeviceId) -> Result<Option<String>> {
        let tx = self.storage.transaction()?;
        let since = tx.device_since(device_id)?;
        tx.commit()?;
        Ok(since)
    }

    /// Applies a whole sync response atomically.
    pub fn process(
        &mut self,
        device_id: &DeviceId,
        user_id: &UserId,
        response: &SyncV2Response,
    ) -> Result<AccumulateOutcome> {
        let mut outcome = AccumulateOutcome::default();
        let tx = self.storage.transaction()?;

        tx.register_device(device_id, user_id)?;

        for (room_id, join) in &response.rooms.join {
            accumulate_room_state(&tx, room_id, &join.state.events, &mut outcome)?;
            accumulate_timeline(&tx, room_id, &join.timeline, &mut outcome)?;
            resolve_invites(&tx, room_id, &join.timeline, &mut outcome)?;
            // a room in the join section means this user's invite, if any,
            // has resolved even when the membership event sits in the
            // state block
            if tx.remove_invite(room_id, user_id)? {
                outcome.notifications.push(Notification::InviteGone {
                    room_id: room_id.clone(),
                    user_id: user_id.clone(),
                });
            }

            let unread = &join.unread_notifications;
            if unread.notification_count.is_some() || unread.highlight_count.is_some() {
                outcome.notifications.push(Notification::UnreadCounts {
                    room_id: room_id.clone(),
                    user_id: user_id.clone(),
                    notification_count: unread.notification_count.unwrap_or(0),
                    highlight_count: unread.highlight_count.unwrap_or(0),
                });
            }

            for raw in &join.ephemeral.events {
                accumulate_ephemeral(&tx, room_id, raw.get())?;
            }
            for raw in &join.account_data.events {
                accumulate_account_data(&tx, user_id, Some(room_id), raw.get())?;
            }
            outcome.rooms_touched += 1;
        }

        for (room_id, invite) in &response.rooms.invite {
            let raws: Vec<&str> = invite.invite_state.events.iter().map(|e| e.get()).collect();
            let encoded = serde_json::to_string(&raws)
                .map_err(|e| crate::Error::Schema(format!("encode invite state: {e}")))?;
            tx.set_invite(room_id, user_id, &encoded)?;
            outcome.notifications.push(Notification::Invite {
                room_id: room_id.clone(),
                user_id: user_id.clone(),
            });
            outcome.rooms_touched += 1;
        }

        for (room_id, leave) in &response.rooms.leave {
            // the final events (including the departure) flow through the
            // normal path, which marks membership leave in state
            accumulate_room_state(&tx, room_id, &leave.state.events, &mut outcome)?;
            accumulate_timeline(&tx, room_id, &leave.timeline, &mut outcome)?;
            if tx.remove_invite(room_id, user_id)? {
                outcome.notifications.push(Notification::InviteGone {
                    room_id: room_id.clone(),
                    user_id: user_id.clone(),
                });
            }
            outcome.rooms_touched += 1;
        }

        if !response.to_device.events.is_empty() {
            let msgs: Vec<&str> = response.to_device.events.iter().map(|e| e.get()).collect();
            tx.insert_to_device_messages(device_id, &msgs)?;
        }
        for raw in &response.account_data.events {
            accumulate_account_data(&tx, user_id, None, raw.get())?;
        }

        // last: advancing since commits us to never replaying this response
        tx.update_device_since(device_id, &response.next_batch)?;
        tx.commit()?;

        debug!(
            device = %device_id,
            rooms = outcome.rooms_touched,
            new_events = outcome.notifications.len(),
            next_batch = %response.next_batch,
            "accumulated sync response"
        );
        Ok(outcome)
    }
}

// =============================================================================
// Per-Section Helpers
// =============================================================================

fn parse_events(raws: &[Box<serde_json::value::RawValue>]) -> Vec<Event> {
    let mut out = Vec::with_capacity(raws.len());
    for raw in raws {
        match Event::parse(raw.get()) {
            Ok(event) => out.push(event),
            Err(e) => warn!(error = %e, "dropping malformed upstream event"),
        }
    }
    out
}

fn accumulate_room_state(
    tx: &crate::storage::StoreTx<'_>,
    room_id: &RoomId,
    raw_state: &[Box<serde_json::value::RawValue>],
    outcome: &mut AccumulateOutcome,
) -> Result<()> {
    let state = parse_events(raw_state);
    // first sight of the room seeds the snapshot; later catch-up blocks are
    // ignored, matching the rule that catch-up never rewrites history
    if let Some(nids) = tx.initialise_room(room_id, &state)? {
        if !state.is_empty() {
            let seeded: Vec<_> = nids.into_iter().zip(state).collect();
            outcome.notifications.push(Notification::RoomSeeded {
                room_id: room_id.clone(),
                state: Arc::new(seeded),
            });
        }
    }
    Ok(())
}

fn accumulate_timeline(
    tx: &crate::storage::StoreTx<'_>,
    room_id: &RoomId,
    timeline: &SyncV2Timeline,
    outcome: &mut AccumulateOutcome,
) -> Result<()> {
    let events = parse_events(&timeline.events);
    if events.is_empty() {
        return Ok(());
    }

    // an unseen room can arrive with a timeline and no state block
    tx.initialise_room(room_id, &[])?;

    for event in &events {
        if let Some(txn_id) = &event.transaction_id {
            outcome.txn_ids.push((
                room_id.clone(),
                event.event_id.clone(),
                event.sender.clone(),
                txn_id.clone(),
            ));
        }
    }

    let inserted = tx.insert_timeline_events(room_id, &events, timeline.prev_batch.as_deref())?;

    let mut new_state: Vec<(crate::types::EventNid, &Event)> = Vec::new();
    for (event, ins) in events.iter().zip(&inserted) {
        if ins.new_timeline_entry && event.is_state() {
            new_state.push((ins.nid, event));
        }
    }
    new_state.sort_by_key(|(nid, _)| *nid);
    tx.apply_state_events(room_id, &new_state)?;

    let mut new_entries: Vec<(crate::types::EventNid, &Event)> = events
        .iter()
        .zip(&inserted)
        .filter(|(_, ins)| ins.new_timeline_entry)
        .map(|(event, ins)| (ins.nid, event))
        .collect();
    new_entries.sort_by_key(|(nid, _)| *nid);
    for (nid, event) in new_entries {
        outcome.notifications.push(Notification::NewEvent {
            room_id: room_id.clone(),
            nid,
            event: Arc::new(event.clone()),
            bumps: event.bumps_ordering(),
        });
    }
    Ok(())
}

/// A membership event resolves any stored invite for its target.
fn resolve_invites(
    tx: &crate::storage::StoreTx<'_>,
    room_id: &RoomId,
    timeline: &SyncV2Timeline,
    outcome: &mut AccumulateOutcome,
) -> Result<()> {
    for raw in &timeline.events {
        let Ok(event) = Event::parse(raw.get()) else {
            continue;
        };
        if let (Some(state_key), Some(membership)) = (&event.state_key, event.membership()) {
            if matches!(membership, "join" | "leave" | "ban") {
                let target = UserId::new(state_key.clone());
                if tx.remove_invite(room_id, &target)? {
                    outcome.notifications.push(Notification::InviteGone {
                        room_id: room_id.clone(),
                        user_id: target,
                    });
                }
            }
        }
    }
    Ok(())
}

fn accumulate_ephemeral(
    tx: &crate::storage::StoreTx<'_>,
    room_id: &RoomId,
    raw: &str,
) -> Result<()> {
    #[derive(serde::Deserialize)]
    struct Ephemeral {
        #[serde(rename = "type")]
        kind: Option<String>,
        #[serde(default)]
        content: serde_json::Value,
    }
    let Ok(parsed) = serde_json::from_str::<Ephemeral>(raw) else {
        warn!("dropping malformed ephemeral event");
        return Ok(());
    };
    if parsed.kind.as_deref() == Some("m.typing") {
        let users: Vec<UserId> = parsed
            .content
            .get("user_ids")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(UserId::from)
                    .collect()
            })
            .unwrap_or_default();
        tx.set_typing(room_id, &users)?;
    }
    Ok(())
}

fn accumulate_account_data(
    tx: &crate::storage::StoreTx<'_>,
    user_id: &UserId,
    room_id: Option<&RoomId>,
    raw: &str,
) -> Result<()> {
    #[derive(serde::Deserialize)]
    struct AccountData {
        #[serde(rename = "type")]
        kind: Option<String>,
    }
    let Ok(parsed) = serde_json::from_str::<AccountData>(raw) else {
        warn!("dropping malformed account data event");
        return Ok(());
    };
    let Some(kind) = parsed.kind else {
        return Ok(());
    };
    tx.set_account_data(user_id, room_id, &kind, raw)?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
