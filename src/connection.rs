//! # Connection Sessions
//!
//! Per-client-connection state: the declared lists, the per-room
//! subscription overrides, the sorted room projections the client has seen,
//! and the bookkeeping needed to emit minimal deltas between round-trips.
//!
//! This module is pure bookkeeping: it decides WHAT changed and what needs
//! fetching ([`RoomPlan`]); the engine performs the reads and calls back
//! with [`ConnState::record_sent`]. That keeps every windowing rule unit
//! testable without a database.
//!
//! `pos` is a logical clock per connection. The client echoes the last pos
//! it saw: matching the last issued pos means an incremental request, one
//! behind means the previous response was lost (replay it verbatim),
//! anything else means the session restarts as an initial sync.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::lists::{self, ListOp, Movement, RoomKey, SortOrder, SortedRoomList};
use crate::notify::Notification;
use crate::types::{DeviceId, EventNid, RoomId, UserId};

// =============================================================================
// Wire Types
// =============================================================================

/// A client sliding-sync request body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlidingSyncRequest {
    /// Echo of the last pos the client saw; absent on a fresh connection.
    #[serde(default)]
    pub pos: Option<String>,
    /// Stable connection name so one device can hold several sessions.
    #[serde(default)]
    pub conn_id: Option<String>,
    /// Long-poll budget for this request.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Declared lists. Parameters are sticky: omitted fields keep their
    /// previous value.
    #[serde(default)]
    pub lists: BTreeMap<String, ListRequest>,
    /// Per-room overrides, also sticky.
    #[serde(default)]
    pub room_subscriptions: BTreeMap<RoomId, RoomSubscription>,
}

/// One list declaration. Every field is optional so clients can resend only
/// what changed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListRequest {
    #[serde(default)]
    pub ranges: Option<Vec<[usize; 2]>>,
    #[serde(default)]
    pub sort: Option<Vec<SortOrder>>,
    #[serde(default)]
    pub timeline_limit: Option<usize>,
    #[serde(default)]
    pub required_state: Option<Vec<(String, String)>>,
}

/// Per-room subscription parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RoomSubscription {
    #[serde(default)]
    pub timeline_limit: Option<usize>,
    #[serde(default)]
    pub required_state: Option<Vec<(String, String)>>,
}

/// A client sliding-sync response body.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SlidingSyncResponse {
    pub pos: String,
    pub lists: BTreeMap<String, ListResult>,
    pub rooms: BTreeMap<RoomId, RoomPayload>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ListResult {
    /// Total rooms in the list (not just the windowed ones).
    pub count: usize,
    pub ops: Vec<ListOp>,
}

/// One room's payload.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoomPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// True exactly the first time this connection sends this room.
    pub initial: bool,
    /// Raw event JSON, oldest first, transaction ids already adjusted for
    /// the receiving user.
    pub timeline: Vec<Box<RawValue>>,
    pub required_state: Vec<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<String>,
    /// Timeline events delivered via live notification since the last
    /// response; resets every response.
    pub num_live: u64,
    pub notification_count: u64,
    pub highlight_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invite_state: Option<Vec<Box<RawValue>>>,
}

// =============================================================================
// Effective Subscription
// =============================================================================

/// Resolved (non-sticky-optional) subscription parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectiveSub {
    pub timeline_limit: usize,
    pub required_state: Vec<(String, String)>,
}

// =============================================================================
// Fetch Plans
// =============================================================================

/// What the engine should read for one room this response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelinePlan {
    /// First send: the last `limit` events.
    Initial { limit: usize },
    /// Only events newer than `after`, capped at `limit`.
    NewOnly { after: EventNid, limit: usize },
    /// Limit widened with no new events: `extra` events older than
    /// `before`, served as if new.
    Widen { before: EventNid, extra: usize },
}

/// Per-room fetch instruction handed to the engine.
#[derive(Debug, Clone)]
pub struct RoomPlan {
    pub room_id: RoomId,
    pub timeline: TimelinePlan,
    pub required_state: Vec<(String, String)>,
    /// State entries (slot → nid) the client already has; only newer or
    /// unseen entries are sent (trickling, never retraction).
    pub sent_state: HashMap<(String, String), EventNid>,
    pub initial: bool,
    pub num_live: u64,
    /// The timeline depth the client effectively holds after this send,
    /// recorded for future widening arithmetic.
    pub effective_limit: usize,
}

// =============================================================================
// Internal Tracking
// =============================================================================

#[derive(Debug, Clone)]
struct ListState {
    ranges: Vec<[usize; 2]>,
    sort: Vec<SortOrder>,
    sub: EffectiveSub,
    sorted: SortedRoomList,
    /// Ops accumulated since the last response.
    ops: Vec<ListOp>,
}

#[derive(Debug, Clone, Default)]
struct RoomTracking {
    initial_sent: bool,
    last_sent_nid: EventNid,
    oldest_sent_nid: EventNid,
    sent_timeline_limit: usize,
    sent_state: HashMap<(String, String), EventNid>,
    pending_live: u64,
}

// =============================================================================
// ConnState
// =============================================================================

/// All server-side state for one client connection.
pub struct ConnState {
    user_id: UserId,
    device_id: DeviceId,
    lists: BTreeMap<String, ListState>,
    subscriptions: BTreeMap<RoomId, RoomSubscription>,
    tracking: HashMap<RoomId, RoomTracking>,
    /// Rooms with data to report (new events or counter changes).
    dirty: BTreeSet<RoomId>,
    /// Last issued pos; 0 before the first response.
    pos: u64,
    cached_response: Option<SlidingSyncResponse>,
}

/// How an incoming pos relates to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PosKind {
    /// No pos, or one we never issued: full restart.
    Initial,
    /// The pos we issued last: normal incremental request.
    Current,
    /// One behind: the previous response was lost in transit.
    Retry,
}

impl ConnState {
    pub fn new(user_id: UserId, device_id: DeviceId) -> Self {
        Self {
            user_id,
            device_id,
            lists: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
            tracking: HashMap::new(),
            dirty: BTreeSet::new(),
            pos: 0,
            cached_response: None,
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Classifies an incoming pos against the session clock.
    pub fn classify_pos(&self, pos: Option<&str>) -> PosKind {
        let Some(pos) = pos else {
            return PosKind::Initial;
        };
        match pos.parse::<u64>() {
            Ok(p) if p == self.pos && self.pos > 0 => PosKind::Current,
            Ok(p) if p + 1 == self.pos => PosKind::Retry,
            _ => PosKind::Initial,
        }
    }

    /// The cached response for a retry, if any.
    pub fn cached_response(&self) -> Option<SlidingSyncResponse> {
        self.cached_response.clone()
    }

    // =========================================================================
    // Sticky Request Merging
    // =========================================================================

    /// Folds sticky request parameters into the session. Returns the list
    /// names whose sort changed (they need a full re-SYNC) and the spans
    /// newly covered by range changes.
    pub fn apply_sticky(&mut self, request: &SlidingSyncRequest) -> StickyOutcome {
        let mut outcome = StickyOutcome::default();
        for (name, req) in &request.lists {
            let entry = self.lists.entry(name.clone()).or_insert_with(|| {
                outcome.new_lists.push(name.clone());
                ListState {
                    ranges: Vec::new(),
                    sort: vec![SortOrder::ByRecency],
                    sub: EffectiveSub::default(),
                    sorted: SortedRoomList::new(vec![SortOrder::ByRecency]),
                    ops: Vec::new(),
                }
            });
            if let Some(sort) = &req.sort {
                if *sort != entry.sort {
                    entry.sort = sort.clone();
                    entry.sorted = SortedRoomList::new(sort.clone());
                    if !outcome.new_lists.contains(name) {
                        outcome.resorted_lists.push(name.clone());
                    }
                }
            }
            if let Some(ranges) = &req.ranges {
                if *ranges != entry.ranges {
                    let added = spans_added(&entry.ranges, ranges);
                    if !added.is_empty() && !outcome.new_lists.contains(name) {
                        outcome.widened_ranges.insert(name.clone(), added);
                    }
                    entry.ranges = ranges.clone();
                }
            }
            if let Some(limit) = req.timeline_limit {
                entry.sub.timeline_limit = limit;
            }
            if let Some(rs) = &req.required_state {
                if *rs != entry.sub.required_state {
                    entry.sub.required_state = rs.clone();
                    if !outcome.new_lists.contains(name) {
                        outcome.state_changed_lists.push(name.clone());
                    }
                }
            }
        }
        for (room_id, sub) in &request.room_subscriptions {
            let entry = self.subscriptions.entry(room_id.clone()).or_default();
            if sub.timeline_limit.is_some() {
                entry.timeline_limit = sub.timeline_limit;
            }
            if sub.required_state.is_some() {
                entry.required_state = sub.required_state.clone();
            }
            outcome.subscribed_rooms.push(room_id.clone());
        }
        outcome
    }

    // =========================================================================
    // Initial Sync
    // =========================================================================

    /// Rebuilds every list from a fresh membership snapshot and emits SYNC
    /// ops. All previous tracking is discarded.
    pub fn rebuild(&mut self, rooms: &[(RoomId, RoomKey)]) {
        self.tracking.clear();
        self.dirty.clear();
        for list in self.lists.values_mut() {
            list.sorted = SortedRoomList::new(list.sort.clone());
            list.sorted.populate(rooms.to_vec());
            list.ops = lists::sync_ops(&list.ranges, &list.sorted);
        }
    }

    /// SYNC ops for one list's newly covered spans (range widening).
    pub fn sync_spans(&mut self, list_name: &str, spans: &[[usize; 2]]) {
        if let Some(list) = self.lists.get_mut(list_name) {
            let mut ops = lists::sync_ops(spans, &list.sorted);
            list.ops.append(&mut ops);
        }
    }

    /// Re-populates one list in place (sort change) and emits SYNC ops.
    pub fn resync_list(&mut self, list_name: &str, rooms: &[(RoomId, RoomKey)]) {
        if let Some(list) = self.lists.get_mut(list_name) {
            list.sorted = SortedRoomList::new(list.sort.clone());
            list.sorted.populate(rooms.to_vec());
            list.ops = lists::sync_ops(&list.ranges, &list.sorted);
        }
    }

    // =========================================================================
    // Live Notifications
    // =========================================================================

    /// Applies one notification to every list. Named-room key data comes
    /// from the caller (read from the global cache at dispatch time).
    pub fn process_notification(&mut self, notification: &Notification, key: Option<RoomKey>) {
        match notification {
            Notification::RoomSeeded { room_id, .. } => {
                // a room joined mid-connection through a full state seed:
                // slot it into every list like a fresh arrival
                let Some(key) = key else { return };
                for list in self.lists.values_mut() {
                    if list.sorted.index_of(room_id).is_some() {
                        continue;
                    }
                    if let Movement::Added { to } = list.sorted.update_key(room_id, key.clone()) {
                        let mut ops = lists::insert_ops(&list.ranges, &list.sorted, to);
                        list.ops.append(&mut ops);
                    }
                }
                self.dirty.insert(room_id.clone());
            }
            Notification::NewEvent {
                room_id,
                nid,
                event,
                bumps,
            } => {
                let our_membership_change = event.state_key.as_deref() == Some(self.user_id.as_str());
                let leave = our_membership_change
                    && matches!(event.membership(), Some("leave") | Some("ban"));

                if leave {
                    for list in self.lists.values_mut() {
                        if let Some(Movement::Removed { from }) = list.sorted.remove(room_id) {
                            let mut ops = lists::remove_ops(&list.ranges, &list.sorted, from);
                            list.ops.append(&mut ops);
                        }
                    }
                    self.tracking.remove(room_id);
                    self.dirty.remove(room_id);
                    return;
                }

                if let Some(key) = key {
                    for list in self.lists.values_mut() {
                        if !*bumps && list.sorted.index_of(room_id).is_some() {
                            // no reordering: the event only dirties the room
                            continue;
                        }
                        match list.sorted.update_key(room_id, key.clone()) {
                            Movement::Moved { from, to } => {
                                let mut ops =
                                    lists::move_ops(&list.ranges, &list.sorted, from, to);
                                list.ops.append(&mut ops);
                            }
                            Movement::Stay { index } => {
                                let mut ops =
                                    lists::move_ops(&list.ranges, &list.sorted, index, index);
                                list.ops.append(&mut ops);
                            }
                            Movement::Added { to } => {
                                let mut ops = lists::insert_ops(&list.ranges, &list.sorted, to);
                                list.ops.append(&mut ops);
                            }
                            Movement::Removed { .. } => {}
                        }
                    }
                }

                let tracking = self.tracking.entry(room_id.clone()).or_default();
                if tracking.initial_sent && *nid > tracking.last_sent_nid {
                    tracking.pending_live += 1;
                }
                self.dirty.insert(room_id.clone());
            }
            Notification::UnreadCounts { room_id, .. } => {
                self.dirty.insert(room_id.clone());
            }
            Notification::Invite { room_id, .. } | Notification::InviteGone { room_id, .. } => {
                if self.subscriptions.contains_key(room_id) {
                    self.dirty.insert(room_id.clone());
                }
            }
            Notification::TransactionId { .. } | Notification::DeviceEvicted { .. } => {}
        }
    }

    // =========================================================================
    // Response Planning
    // =========================================================================

    /// Whether anything is waiting to be told to the client.
    pub fn has_deltas(&self) -> bool {
        if self.lists.values().any(|l| !l.ops.is_empty()) {
            return true;
        }
        let windowed = self.windowed_rooms();
        self.dirty
            .iter()
            .any(|r| windowed.contains(r) || self.subscriptions.contains_key(r))
    }

    /// Rooms currently inside any declared window.
    pub fn windowed_rooms(&self) -> BTreeSet<RoomId> {
        let mut out = BTreeSet::new();
        for list in self.lists.values() {
            for &[lo, hi] in &list.ranges {
                if list.sorted.is_empty() || lo >= list.sorted.len() {
                    continue;
                }
                for i in lo..=hi.min(list.sorted.len() - 1) {
                    if let Some(room) = list.sorted.room_at(i) {
                        out.insert(room.clone());
                    }
                }
            }
        }
        out
    }

    /// The effective subscription for a room: the explicit override, else
    /// the union of the lists windowing it.
    pub fn effective_sub(&self, room_id: &RoomId) -> EffectiveSub {
        if let Some(sub) = self.subscriptions.get(room_id) {
            return EffectiveSub {
                timeline_limit: sub.timeline_limit.unwrap_or(0),
                required_state: sub.required_state.clone().unwrap_or_default(),
            };
        }
        let mut merged = EffectiveSub::default();
        for list in self.lists.values() {
            let Some(index) = list.sorted.index_of(room_id) else {
                continue;
            };
            let windowed = list
                .ranges
                .iter()
                .any(|&[lo, hi]| index >= lo && index <= hi);
            if !windowed {
                continue;
            }
            merged.timeline_limit = merged.timeline_limit.max(list.sub.timeline_limit);
            for filter in &list.sub.required_state {
                if !merged.required_state.contains(filter) {
                    merged.required_state.push(filter.clone());
                }
            }
        }
        merged
    }

    /// Computes the fetch plans for this response: rooms that entered a
    /// window (from buffered INSERT/SYNC/UPDATE ops), dirty rooms already
    /// windowed, and dirty subscribed rooms.
    pub fn plan_rooms(&mut self) -> Vec<RoomPlan> {
        let mut emit: BTreeSet<RoomId> = BTreeSet::new();
        for list in self.lists.values() {
            for op in &list.ops {
                match op {
                    ListOp::Sync { room_ids, .. } => emit.extend(room_ids.iter().cloned()),
                    ListOp::Insert { room_id, .. } | ListOp::Update { room_id, .. } => {
                        emit.insert(room_id.clone());
                    }
                    _ => {}
                }
            }
        }
        let windowed = self.windowed_rooms();
        for room in &self.dirty {
            if windowed.contains(room) || self.subscriptions.contains_key(room) {
                emit.insert(room.clone());
            }
        }
        for room in self.subscriptions.keys() {
            let sent = self.tracking.get(room).map(|t| t.initial_sent).unwrap_or(false);
            if !sent {
                emit.insert(room.clone());
            }
        }

        let mut plans = Vec::with_capacity(emit.len());
        for room_id in emit {
            let sub = self.effective_sub(&room_id);
            let tracking = self.tracking.entry(room_id.clone()).or_default();
            let (timeline, effective_limit) = if !tracking.initial_sent {
                (
                    TimelinePlan::Initial {
                        limit: sub.timeline_limit,
                    },
                    sub.timeline_limit,
                )
            } else if self.dirty.contains(&room_id) && tracking.last_sent_nid != EventNid::NONE {
                let limit = sub.timeline_limit.max(tracking.sent_timeline_limit);
                (
                    TimelinePlan::NewOnly {
                        after: tracking.last_sent_nid,
                        limit,
                    },
                    limit,
                )
            } else if sub.timeline_limit > tracking.sent_timeline_limit {
                (
                    TimelinePlan::Widen {
                        before: tracking.oldest_sent_nid,
                        extra: sub.timeline_limit - tracking.sent_timeline_limit,
                    },
                    sub.timeline_limit,
                )
            } else {
                let limit = sub.timeline_limit.max(tracking.sent_timeline_limit);
                (
                    TimelinePlan::NewOnly {
                        after: tracking.last_sent_nid,
                        limit,
                    },
                    limit,
                )
            };
            plans.push(RoomPlan {
                room_id: room_id.clone(),
                timeline,
                required_state: sub.required_state,
                sent_state: tracking.sent_state.clone(),
                initial: !tracking.initial_sent,
                num_live: tracking.pending_live,
                effective_limit,
            });
        }
        plans
    }

    /// Rooms whose limit was widened by this request with no new data:
    /// plans them without requiring dirtiness or ops.
    pub fn plan_widened_rooms(&self) -> Vec<RoomPlan> {
        let windowed = self.windowed_rooms();
        let mut plans = Vec::new();
        for room_id in windowed {
            let sub = self.effective_sub(&room_id);
            let Some(tracking) = self.tracking.get(&room_id) else {
                continue;
            };
            if !tracking.initial_sent
                || self.dirty.contains(&room_id)
                || sub.timeline_limit <= tracking.sent_timeline_limit
            {
                continue;
            }
            plans.push(RoomPlan {
                room_id: room_id.clone(),
                timeline: TimelinePlan::Widen {
                    before: tracking.oldest_sent_nid,
                    extra: sub.timeline_limit - tracking.sent_timeline_limit,
                },
                required_state: sub.required_state,
                sent_state: tracking.sent_state.clone(),
                initial: false,
                num_live: 0,
                effective_limit: sub.timeline_limit,
            });
        }
        plans
    }

    /// Plans windowed rooms of the given lists whose required_state filters
    /// just changed: newly matched state entries trickle out with no list
    /// ops and no timeline.
    pub fn plan_state_changed(&self, list_names: &[String]) -> Vec<RoomPlan> {
        let mut rooms: BTreeSet<RoomId> = BTreeSet::new();
        for name in list_names {
            let Some(list) = self.lists.get(name) else {
                continue;
            };
            for &[lo, hi] in &list.ranges {
                if list.sorted.is_empty() || lo >= list.sorted.len() {
                    continue;
                }
                for i in lo..=hi.min(list.sorted.len() - 1) {
                    if let Some(room) = list.sorted.room_at(i) {
                        rooms.insert(room.clone());
                    }
                }
            }
        }
        let mut plans = Vec::new();
        for room_id in rooms {
            let Some(tracking) = self.tracking.get(&room_id) else {
                continue;
            };
            if !tracking.initial_sent || self.dirty.contains(&room_id) {
                continue;
            }
            let sub = self.effective_sub(&room_id);
            plans.push(RoomPlan {
                room_id: room_id.clone(),
                timeline: TimelinePlan::NewOnly {
                    after: tracking.last_sent_nid,
                    limit: sub.timeline_limit.max(1),
                },
                required_state: sub.required_state,
                sent_state: tracking.sent_state.clone(),
                initial: false,
                num_live: 0,
                effective_limit: tracking.sent_timeline_limit,
            });
        }
        plans
    }

    /// Records what a built payload actually delivered, so the next
    /// incremental send picks up where this one left off.
    pub fn record_sent(
        &mut self,
        room_id: &RoomId,
        timeline_nids: &[EventNid],
        state_slots: &[((String, String), EventNid)],
        effective_limit: usize,
    ) {
        let tracking = self.tracking.entry(room_id.clone()).or_default();
        tracking.initial_sent = true;
        tracking.pending_live = 0;
        if let Some(first) = timeline_nids.first() {
            if tracking.oldest_sent_nid == EventNid::NONE || *first < tracking.oldest_sent_nid {
                tracking.oldest_sent_nid = *first;
            }
        }
        if let Some(last) = timeline_nids.last() {
            if *last > tracking.last_sent_nid {
                tracking.last_sent_nid = *last;
            }
        }
        tracking.sent_timeline_limit = tracking.sent_timeline_limit.max(effective_limit);
        for (slot, nid) in state_slots {
            tracking.sent_state.insert(slot.clone(), *nid);
        }
        self.dirty.remove(room_id);
    }

    /// Drains buffered ops into a response skeleton and advances pos.
    pub fn finish_response(&mut self, rooms: BTreeMap<RoomId, RoomPayload>) -> SlidingSyncResponse {
        self.pos += 1;
        let mut list_results = BTreeMap::new();
        for (name, list) in &mut self.lists {
            list_results.insert(
                name.clone(),
                ListResult {
                    count: list.sorted.len(),
                    ops: std::mem::take(&mut list.ops),
                },
            );
        }
        self.dirty.clear();
        let response = SlidingSyncResponse {
            pos: self.pos.to_string(),
            lists: list_results,
            rooms,
        };
        self.cached_response = Some(response.clone());
        response
    }

    /// List names currently declared.
    pub fn list_names(&self) -> Vec<String> {
        self.lists.keys().cloned().collect()
    }

    /// The explicit subscriptions map.
    pub fn subscriptions(&self) -> &BTreeMap<RoomId, RoomSubscription> {
        &self.subscriptions
    }
}

/// What sticky merging changed.
#[derive(Debug, Default)]
pub struct StickyOutcome {
    /// Lists seen for the first time: need populate + full SYNC.
    pub new_lists: Vec<String>,
    /// Lists whose sort changed: need re-populate + full SYNC.
    pub resorted_lists: Vec<String>,
    /// Newly covered spans per list (range widening): need SYNC of the span.
    pub widened_ranges: BTreeMap<String, Vec<[usize; 2]>>,
    /// Lists whose required_state filters changed: their windowed rooms may
    /// owe newly matched state entries (trickling).
    pub state_changed_lists: Vec<String>,
    /// Rooms explicitly subscribed in this request.
    pub subscribed_rooms: Vec<RoomId>,
}

/// Index spans present in `new` but not covered by `old`.
fn spans_added(old: &[[usize; 2]], new: &[[usize; 2]]) -> Vec<[usize; 2]> {
    let covered = |i: usize| old.iter().any(|&[lo, hi]| i >= lo && i <= hi);
    let mut out = Vec::new();
    for &[lo, hi] in new {
        let mut start: Option<usize> = None;
        for i in lo..=hi {
            if !covered(i) {
                start.get_or_insert(i);
            } else if let Some(s) = start.take() {
                out.push([s, i - 1]);
            }
        }
        if let Some(s) = start {
            out.push([s, hi]);
        }
    }
    out
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::types::Event;

    fn conn() -> ConnState {
        ConnState::new(UserId::from("@a:hs"), DeviceId::from("D"))
    }

    fn request_with_list(ranges: Vec<[usize; 2]>, limit: usize) -> SlidingSyncRequest {
        let mut lists = BTreeMap::new();
        lists.insert(
            "a".to_string(),
            ListRequest {
                ranges: Some(ranges),
                sort: None,
                timeline_limit: Some(limit),
                required_state: None,
            },
        );
        SlidingSyncRequest {
            lists,
            ..Default::default()
        }
    }

    fn room_keys(n: usize) -> Vec<(RoomId, RoomKey)> {
        (0..n)
            .map(|i| {
                (
                    RoomId::new(format!("room{i}")),
                    RoomKey {
                        bump_ts: (n - i) as i64 * 1000,
                        bump_nid: EventNid::new((n - i) as i64),
                        name: None,
                    },
                )
            })
            .collect()
    }

    fn live_event(room: &str, id: &str, ts: i64, nid: i64) -> Notification {
        let event = Event::parse(format!(
            r#"{{"event_id":"{id}","type":"m.room.message","sender":"@a:hs","origin_server_ts":{ts},"content":{{}}}}"#
        ))
        .unwrap();
        Notification::NewEvent {
            room_id: RoomId::from(room),
            nid: EventNid::new(nid),
            event: Arc::new(event),
            bumps: true,
        }
    }

    #[test]
    fn test_pos_classification() {
        let mut state = conn();
        assert_eq!(state.classify_pos(None), PosKind::Initial);
        assert_eq!(state.classify_pos(Some("1")), PosKind::Initial);

        state.apply_sticky(&request_with_list(vec![[0, 3]], 1));
        state.rebuild(&room_keys(5));
        let r1 = state.finish_response(BTreeMap::new());
        assert_eq!(r1.pos, "1");

        assert_eq!(state.classify_pos(Some("1")), PosKind::Current);
        assert_eq!(state.classify_pos(Some("0")), PosKind::Retry);
        assert_eq!(state.classify_pos(Some("7")), PosKind::Initial);
        assert_eq!(state.classify_pos(Some("bogus")), PosKind::Initial);
    }

    #[test]
    fn test_pos_monotone() {
        let mut state = conn();
        state.apply_sticky(&request_with_list(vec![[0, 3]], 1));
        state.rebuild(&room_keys(3));
        let mut last = 0u64;
        for _ in 0..5 {
            let r = state.finish_response(BTreeMap::new());
            let p: u64 = r.pos.parse().unwrap();
            assert!(p > last);
            last = p;
        }
    }

    #[test]
    fn test_initial_sync_ops_and_plans() {
        let mut state = conn();
        state.apply_sticky(&request_with_list(vec![[0, 2]], 5));
        state.rebuild(&room_keys(10));

        let plans = state.plan_rooms();
        let ids: Vec<&str> = plans.iter().map(|p| p.room_id.as_str()).collect();
        assert_eq!(ids, vec!["room0", "room1", "room2"]);
        assert!(plans
            .iter()
            .all(|p| p.initial && p.timeline == TimelinePlan::Initial { limit: 5 }));
    }

    #[test]
    fn test_live_bump_produces_ops_and_plan() {
        let mut state = conn();
        state.apply_sticky(&request_with_list(vec![[0, 3]], 1));
        state.rebuild(&room_keys(20));
        for plan in state.plan_rooms() {
            state.record_sent(&plan.room_id, &[EventNid::new(1)], &[], 1);
        }
        state.finish_response(BTreeMap::new());
        assert!(!state.has_deltas());

        state.process_notification(
            &live_event("room7", "$live", 99_000, 100),
            Some(RoomKey {
                bump_ts: 99_000,
                bump_nid: EventNid::new(100),
                name: None,
            }),
        );
        assert!(state.has_deltas());
        let plans = state.plan_rooms();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].room_id.as_str(), "room7");
        // room7 was never sent: it enters the window as initial
        assert!(plans[0].initial);
    }

    #[test]
    fn test_dirty_room_outside_window_is_not_planned() {
        let mut state = conn();
        state.apply_sticky(&request_with_list(vec![[0, 1]], 1));
        state.rebuild(&room_keys(10));
        for plan in state.plan_rooms() {
            state.record_sent(&plan.room_id, &[], &[], 1);
        }
        state.finish_response(BTreeMap::new());

        // non-bumping dirtiness on a room far outside the window
        state.process_notification(
            &Notification::UnreadCounts {
                room_id: RoomId::from("room9"),
                user_id: UserId::from("@a:hs"),
                notification_count: 1,
                highlight_count: 0,
            },
            None,
        );
        assert!(!state.has_deltas());
        assert!(state.plan_rooms().is_empty());
    }

    #[test]
    fn test_widen_timeline_limit_plans_trickle() {
        let mut state = conn();
        state.apply_sticky(&request_with_list(vec![[0, 0]], 1));
        state.rebuild(&room_keys(1));
        for plan in state.plan_rooms() {
            // pretend we sent event nid 5 (the latest of 5)
            state.record_sent(&plan.room_id, &[EventNid::new(5)], &[], 1);
        }
        state.finish_response(BTreeMap::new());

        // client raises the limit to 3; no new events
        state.apply_sticky(&request_with_list(vec![[0, 0]], 3));
        assert!(state.plan_rooms().is_empty());
        let plans = state.plan_widened_rooms();
        assert_eq!(plans.len(), 1);
        assert_eq!(
            plans[0].timeline,
            TimelinePlan::Widen {
                before: EventNid::new(5),
                extra: 2
            }
        );
        assert!(!plans[0].initial);
    }

    #[test]
    fn test_leave_removes_and_backfills() {
        let mut state = conn();
        state.apply_sticky(&request_with_list(vec![[0, 2]], 1));
        state.rebuild(&room_keys(5));
        state.finish_response(BTreeMap::new());

        let leave = Event::parse(
            r#"{"event_id":"$l","type":"m.room.member","state_key":"@a:hs","sender":"@a:hs","origin_server_ts":9,"content":{"membership":"leave"}}"#,
        )
        .unwrap();
        state.process_notification(
            &Notification::NewEvent {
                room_id: RoomId::from("room1"),
                nid: EventNid::new(50),
                event: Arc::new(leave),
                bumps: true,
            },
            None,
        );
        let response = state.finish_response(BTreeMap::new());
        let ops = &response.lists["a"].ops;
        assert_eq!(
            ops.as_slice(),
            &[
                ListOp::Delete { index: 1 },
                ListOp::Insert {
                    index: 2,
                    room_id: RoomId::from("room3")
                },
            ]
        );
        // count reflects the shrunken list
        assert_eq!(response.lists["a"].count, 4);
    }

    #[test]
    fn test_spans_added() {
        assert_eq!(spans_added(&[[0, 3]], &[[0, 5]]), vec![[4, 5]]);
        assert_eq!(spans_added(&[], &[[0, 2]]), vec![[0, 2]]);
        assert_eq!(spans_added(&[[0, 5]], &[[0, 3]]), Vec::<[usize; 2]>::new());
        assert_eq!(spans_added(&[[2, 3]], &[[0, 5]]), vec![[0, 1], [4, 5]]);
    }

    #[test]
    fn test_retry_serves_cached_response() {
        let mut state = conn();
        state.apply_sticky(&request_with_list(vec![[0, 1]], 1));
        state.rebuild(&room_keys(3));
        let r1 = state.finish_response(BTreeMap::new());
        let r2 = state.finish_response(BTreeMap::new());
        assert_eq!(state.classify_pos(Some(&r1.pos)), PosKind::Retry);
        let cached = state.cached_response().unwrap();
        assert_eq!(cached.pos, r2.pos);
    }
}
