//! # Sorted Room Lists & Delta Operations
//!
//! Pure windowing logic: a sorted room list per client list declaration and
//! the minimal DELETE/INSERT/UPDATE operation sequences that carry a client
//! from its previous view of a window to the current one.
//!
//! Each live change (a bump, a join, a leave) is applied to the list one at
//! a time; every application yields the ops for that single movement. The
//! transform invariant: replaying the emitted ops against the client's
//! previous array yields exactly the new sorted array restricted to each
//! declared window.
//!
//! Op shape conventions, per window `[lo, hi]`:
//! - delete before insert, always;
//! - a room moving towards index 0 deletes at the window's high edge and
//!   inserts at its low edge; a room moving away does the reverse;
//! - the window containing the moved room's old index is emitted first,
//!   then the window containing its new index, then remaining affected
//!   windows in ascending order.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{EventNid, RoomId};

// =============================================================================
// Sort Orders
// =============================================================================

/// A client-declared sort key. Keys compose: later entries break ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    /// Most recently bumped first.
    #[serde(rename = "by_recency")]
    ByRecency,
    /// Lexicographic room name, unnamed rooms last.
    #[serde(rename = "by_name")]
    ByName,
}

/// Sort inputs for one room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomKey {
    pub bump_ts: i64,
    pub bump_nid: EventNid,
    pub name: Option<String>,
}

// =============================================================================
// List Operations
// =============================================================================

/// A window delta operation, in wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum ListOp {
    /// Initial fill of (part of) a window.
    #[serde(rename = "SYNC")]
    Sync {
        range: [usize; 2],
        room_ids: Vec<RoomId>,
    },
    /// Remove the room at `index`, shifting later entries up.
    #[serde(rename = "DELETE")]
    Delete { index: usize },
    /// Insert `room_id` at `index`, shifting later entries down.
    #[serde(rename = "INSERT")]
    Insert { index: usize, room_id: RoomId },
    /// The room at `index` has new data but did not move.
    #[serde(rename = "UPDATE")]
    Update { index: usize, room_id: RoomId },
    /// Reserved: the engine never emits this; a vacated window slot is
    /// filled by DELETE plus a replacement INSERT instead.
    #[serde(rename = "INVALIDATE")]
    Invalidate { range: [usize; 2] },
}

/// Outcome of applying one change to a [`SortedRoomList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Movement {
    /// Key changed but the room kept its index.
    Stay { index: usize },
    /// The room moved between indexes.
    Moved { from: usize, to: usize },
    /// The room is new to the list.
    Added { to: usize },
    /// The room left the list (was at `from`).
    Removed { from: usize },
}

// =============================================================================
// Sorted Room List
// =============================================================================

/// One client list's sorted projection of the user's rooms.
#[derive(Debug, Clone)]
pub struct SortedRoomList {
    orders: Vec<SortOrder>,
    rooms: Vec<RoomId>,
    keys: HashMap<RoomId, RoomKey>,
}

impl SortedRoomList {
    pub fn new(orders: Vec<SortOrder>) -> Self {
        let orders = if orders.is_empty() {
            vec![SortOrder::ByRecency]
        } else {
            orders
        };
        Self {
            orders,
            rooms: Vec::new(),
            keys: HashMap::new(),
        }
    }

    /// Replaces the contents wholesale (initial sync or list respecification).
    pub fn populate(&mut self, entries: Vec<(RoomId, RoomKey)>) {
        self.keys = entries.iter().cloned().collect();
        self.rooms = entries.into_iter().map(|(room_id, _)| room_id).collect();
        let orders = self.orders.clone();
        let keys = self.keys.clone();
        self.rooms
            .sort_by(|a, b| Self::cmp_with(&orders, &keys, a, b));
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn room_at(&self, index: usize) -> Option<&RoomId> {
        self.rooms.get(index)
    }

    pub fn index_of(&self, room_id: &RoomId) -> Option<usize> {
        self.rooms.iter().position(|r| r == room_id)
    }

    pub fn rooms(&self) -> &[RoomId] {
        &self.rooms
    }

    /// Applies a key change (or arrival) for one room, re-sorting it.
    pub fn update_key(&mut self, room_id: &RoomId, key: RoomKey) -> Movement {
        let old_index = self.index_of(room_id);
        if let Some(index) = old_index {
            self.rooms.remove(index);
        }
        self.keys.insert(room_id.clone(), key);
        let to = self.insertion_index(room_id);
        self.rooms.insert(to, room_id.clone());

        match old_index {
            Some(from) if from == to => Movement::Stay { index: to },
            Some(from) => Movement::Moved { from, to },
            None => Movement::Added { to },
        }
    }

    /// Removes a room (membership left).
    pub fn remove(&mut self, room_id: &RoomId) -> Option<Movement> {
        let from = self.index_of(room_id)?;
        self.rooms.remove(from);
        self.keys.remove(room_id);
        Some(Movement::Removed { from })
    }

    fn insertion_index(&self, room_id: &RoomId) -> usize {
        self.rooms
            .partition_point(|existing| {
                Self::cmp_with(&self.orders, &self.keys, existing, room_id)
                    == std::cmp::Ordering::Less
            })
    }

    fn cmp_with(
        orders: &[SortOrder],
        keys: &HashMap<RoomId, RoomKey>,
        a: &RoomId,
        b: &RoomId,
    ) -> std::cmp::Ordering {
        const EMPTY: RoomKey = RoomKey {
            bump_ts: 0,
            bump_nid: EventNid::NONE,
            name: None,
        };
        let ka = keys.get(a).unwrap_or(&EMPTY);
        let kb = keys.get(b).unwrap_or(&EMPTY);
        for order in orders {
            let ord = match order {
                SortOrder::ByRecency => (kb.bump_ts, kb.bump_nid).cmp(&(ka.bump_ts, ka.bump_nid)),
                SortOrder::ByName => match (&ka.name, &kb.name) {
                    (Some(na), Some(nb)) => na.cmp(nb),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                },
            };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        a.cmp(b)
    }
}

// =============================================================================
// Op Generation
// =============================================================================

/// Clamps a declared range to the list, `None` when it starts past the end.
fn clamp(range: [usize; 2], len: usize) -> Option<(usize, usize)> {
    let [lo, hi] = range;
    if len == 0 || lo >= len || hi < lo {
        return None;
    }
    Some((lo, hi.min(len - 1)))
}

/// Initial SYNC fill, one op per (non-empty) declared range.
pub fn sync_ops(ranges: &[[usize; 2]], list: &SortedRoomList) -> Vec<ListOp> {
    let mut ops = Vec::new();
    for &range in ranges {
        let Some((lo, hi)) = clamp(range, list.len()) else {
            continue;
        };
        ops.push(ListOp::Sync {
            range: [lo, hi],
            room_ids: list.rooms()[lo..=hi].to_vec(),
        });
    }
    ops
}

/// Ranges affected by a movement, emitted in protocol order: the range
/// holding the old index first, then the range holding the new index, then
/// the rest ascending.
fn affected_ranges(
    ranges: &[[usize; 2]],
    len: usize,
    span: (usize, usize),
    old: Option<usize>,
    new: Option<usize>,
) -> Vec<(usize, usize)> {
    let (span_lo, span_hi) = span;

    let mut clamped: Vec<(usize, usize)> = ranges
        .iter()
        .filter_map(|&r| clamp(r, len))
        .filter(|&(lo, hi)| hi >= span_lo && lo <= span_hi)
        .collect();
    clamped.sort();
    clamped.dedup();

    let contains = |idx: Option<usize>, r: &(usize, usize)| {
        idx.map(|i| i >= r.0 && i <= r.1).unwrap_or(false)
    };

    let mut ordered = Vec::with_capacity(clamped.len());
    if let Some(r) = clamped.iter().find(|r| contains(old, r)).copied() {
        ordered.push(r);
    }
    if let Some(r) = clamped
        .iter()
        .find(|r| contains(new, r) && !ordered.contains(r))
        .copied()
    {
        ordered.push(r);
    }
    for r in clamped {
        if !ordered.contains(&r) {
            ordered.push(r);
        }
    }
    ordered
}

/// Ops for a room that moved from `from` to `to`. `list` is the
/// post-movement state. `from == to` yields a single UPDATE; the caller
/// suppresses it when the room payload did not change.
pub fn move_ops(ranges: &[[usize; 2]], list: &SortedRoomList, from: usize, to: usize) -> Vec<ListOp> {
    let Some(moved) = list.room_at(to).cloned() else {
        return Vec::new();
    };
    if from == to {
        let in_window = ranges
            .iter()
            .filter_map(|&r| clamp(r, list.len()))
            .any(|(lo, hi)| to >= lo && to <= hi);
        return if in_window {
            vec![ListOp::Update {
                index: to,
                room_id: moved,
            }]
        } else {
            Vec::new()
        };
    }

    let upward = to < from;
    let span = (from.min(to), from.max(to));
    let mut ops = Vec::new();
    for (lo, hi) in affected_ranges(ranges, list.len(), span, Some(from), Some(to)) {
        let has_from = from >= lo && from <= hi;
        let has_to = to >= lo && to <= hi;
        match (has_from, has_to) {
            (true, true) => {
                ops.push(ListOp::Delete { index: from });
                ops.push(ListOp::Insert {
                    index: to,
                    room_id: moved.clone(),
                });
            }
            (true, false) if upward => {
                // moved room departed above this window; everything slides
                // down, refilled at the low edge
                ops.push(ListOp::Delete { index: from });
                if let Some(room) = list.room_at(lo) {
                    ops.push(ListOp::Insert {
                        index: lo,
                        room_id: room.clone(),
                    });
                }
            }
            (true, false) => {
                ops.push(ListOp::Delete { index: from });
                if let Some(room) = list.room_at(hi) {
                    ops.push(ListOp::Insert {
                        index: hi,
                        room_id: room.clone(),
                    });
                }
            }
            (false, true) if upward => {
                ops.push(ListOp::Delete { index: hi });
                ops.push(ListOp::Insert {
                    index: to,
                    room_id: moved.clone(),
                });
            }
            (false, true) => {
                ops.push(ListOp::Delete { index: lo });
                ops.push(ListOp::Insert {
                    index: to,
                    room_id: moved.clone(),
                });
            }
            (false, false) if upward => {
                // window sits between the endpoints: contents shift down
                ops.push(ListOp::Delete { index: hi });
                if let Some(room) = list.room_at(lo) {
                    ops.push(ListOp::Insert {
                        index: lo,
                        room_id: room.clone(),
                    });
                }
            }
            (false, false) => {
                ops.push(ListOp::Delete { index: lo });
                if let Some(room) = list.room_at(hi) {
                    ops.push(ListOp::Insert {
                        index: hi,
                        room_id: room.clone(),
                    });
                }
            }
        }
    }
    ops
}

/// Ops for a room newly added at `to`. `list` is post-addition.
pub fn insert_ops(ranges: &[[usize; 2]], list: &SortedRoomList, to: usize) -> Vec<ListOp> {
    let Some(added) = list.room_at(to).cloned() else {
        return Vec::new();
    };
    // pre-addition length decides whether windows were full; every index
    // from the insertion point onwards shifts
    let pre_len = list.len() - 1;
    let span = (to, list.len().saturating_sub(1));
    let mut ops = Vec::new();
    for (lo, hi) in affected_ranges(ranges, list.len(), span, None, Some(to)) {
        if to < lo {
            // window below the insertion point: contents shift down
            if hi <= pre_len.saturating_sub(1) {
                ops.push(ListOp::Delete { index: hi });
            }
            if let Some(room) = list.room_at(lo) {
                ops.push(ListOp::Insert {
                    index: lo,
                    room_id: room.clone(),
                });
            }
        } else {
            if hi <= pre_len.saturating_sub(1) {
                ops.push(ListOp::Delete { index: hi });
            }
            ops.push(ListOp::Insert {
                index: to,
                room_id: added.clone(),
            });
        }
    }
    ops
}

/// Ops for a room removed from `from`. `list` is post-removal. The vacated
/// slot is backfilled by the room sliding in at the window's high edge when
/// one exists; no INVALIDATE is emitted.
pub fn remove_ops(ranges: &[[usize; 2]], list: &SortedRoomList, from: usize) -> Vec<ListOp> {
    let mut ops = Vec::new();
    // ranges are judged against the pre-removal length so a window that
    // only just covered the removed room still reacts; every index from the
    // removal point onwards shifts
    let pre_len = list.len() + 1;
    let span = (from, pre_len.saturating_sub(1));
    for (lo, hi) in affected_ranges(ranges, pre_len, span, Some(from), None) {
        if from < lo {
            // window above the removal point: contents shift up
            ops.push(ListOp::Delete { index: lo });
            if let Some(room) = list.room_at(hi) {
                ops.push(ListOp::Insert {
                    index: hi,
                    room_id: room.clone(),
                });
            }
        } else {
            ops.push(ListOp::Delete { index: from });
            if let Some(room) = list.room_at(hi) {
                ops.push(ListOp::Insert {
                    index: hi,
                    room_id: room.clone(),
                });
            }
        }
    }
    ops
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// rooms `room0..room{n-1}` with room0 most recent (index 0).
    fn recency_list(n: usize) -> SortedRoomList {
        let mut list = SortedRoomList::new(vec![SortOrder::ByRecency]);
        let entries = (0..n)
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
            .collect();
        list.populate(entries);
        list
    }

    fn bump(list: &mut SortedRoomList, room: &str, ts: i64, nid: i64) -> Movement {
        list.update_key(
            &RoomId::from(room),
            RoomKey {
                bump_ts: ts,
                bump_nid: EventNid::new(nid),
                name: None,
            },
        )
    }

    /// Applies ops the way a client does: a full-length array with
    /// placeholders outside the windows.
    fn apply_ops(pre: &[Option<RoomId>], ops: &[ListOp]) -> Vec<Option<RoomId>> {
        let mut arr = pre.to_vec();
        for op in ops {
            match op {
                ListOp::Delete { index } => {
                    if *index < arr.len() {
                        arr.remove(*index);
                        arr.push(None);
                    }
                }
                ListOp::Insert { index, room_id } => {
                    if *index <= arr.len() {
                        arr.insert(*index, Some(room_id.clone()));
                        arr.pop();
                    }
                }
                ListOp::Update { index, room_id } => {
                    assert_eq!(arr[*index].as_ref(), Some(room_id), "UPDATE points at the wrong room");
                }
                other => panic!("unexpected op {other:?}"),
            }
        }
        arr
    }

    fn client_view(list: &SortedRoomList, ranges: &[[usize; 2]]) -> Vec<Option<RoomId>> {
        let mut arr = vec![None; list.len()];
        for &[lo, hi] in ranges {
            for i in lo..=hi.min(list.len().saturating_sub(1)) {
                arr[i] = list.room_at(i).cloned();
            }
        }
        arr
    }

    /// The window-consistency invariant: emitted ops carry the previous
    /// client view to the current one, for every window.
    fn assert_windows_consistent(
        pre: &[Option<RoomId>],
        ops: &[ListOp],
        post_list: &SortedRoomList,
        ranges: &[[usize; 2]],
    ) {
        let got = apply_ops(pre, ops);
        for &[lo, hi] in ranges {
            for i in lo..=hi.min(post_list.len().saturating_sub(1)) {
                assert_eq!(
                    got[i].as_ref(),
                    post_list.room_at(i),
                    "window [{lo},{hi}] index {i} diverged"
                );
            }
        }
    }

    #[test]
    fn test_populate_sorts_by_recency() {
        let list = recency_list(5);
        let ids: Vec<&str> = list.rooms().iter().map(|r| r.as_str()).collect();
        assert_eq!(ids, vec!["room0", "room1", "room2", "room3", "room4"]);
    }

    #[test]
    fn test_bump_outside_window_into_top() {
        // 20 rooms, window [0,3]; a live event bumps room7 to the front
        let mut list = recency_list(20);
        let ranges = [[0usize, 3]];
        let pre = client_view(&list, &ranges);

        let movement = bump(&mut list, "room7", 100_000, 100);
        assert_eq!(movement, Movement::Moved { from: 7, to: 0 });
        let ops = move_ops(&ranges, &list, 7, 0);
        assert_eq!(
            ops,
            vec![
                ListOp::Delete { index: 3 },
                ListOp::Insert {
                    index: 0,
                    room_id: RoomId::from("room7")
                },
            ]
        );
        assert_windows_consistent(&pre, &ops, &list, &ranges);
    }

    #[test]
    fn test_rebump_at_top_is_update_only() {
        let mut list = recency_list(20);
        let ranges = [[0usize, 3]];
        bump(&mut list, "room7", 100_000, 100);

        let movement = bump(&mut list, "room7", 200_000, 101);
        assert_eq!(movement, Movement::Stay { index: 0 });
        let ops = move_ops(&ranges, &list, 0, 0);
        assert_eq!(
            ops,
            vec![ListOp::Update {
                index: 0,
                room_id: RoomId::from("room7")
            }]
        );
    }

    #[test]
    fn test_stay_outside_windows_emits_nothing() {
        let mut list = recency_list(20);
        let ranges = [[0usize, 3]];
        // a bump that lands between the same neighbours keeps the index
        let movement = bump(&mut list, "room10", 10_500, 100);
        assert_eq!(movement, Movement::Stay { index: 10 });
        assert!(move_ops(&ranges, &list, 10, 10).is_empty());
    }

    #[test]
    fn test_window_shift_sequence() {
        // scenario: window [0,3] over rooms 19..0 by recency
        let mut list = recency_list(20);
        let ranges = [[0usize, 3]];

        bump(&mut list, "room7", 100_000, 100);
        let _ = move_ops(&ranges, &list, 7, 0);

        // a live event for room18 (now at index 18)
        let pre = client_view(&list, &ranges);
        let movement = bump(&mut list, "room18", 300_000, 102);
        assert_eq!(movement, Movement::Moved { from: 18, to: 0 });
        let ops = move_ops(&ranges, &list, 18, 0);
        assert_eq!(
            ops,
            vec![
                ListOp::Delete { index: 3 },
                ListOp::Insert {
                    index: 0,
                    room_id: RoomId::from("room18")
                },
            ]
        );
        assert_windows_consistent(&pre, &ops, &list, &ranges);
    }

    #[test]
    fn test_multiple_windows_bump() {
        // windows [0,2],[10,12],[17,19]; bump room18 to position 0
        let mut list = recency_list(20);
        let ranges = [[0usize, 2], [10, 12], [17, 19]];
        let pre = client_view(&list, &ranges);

        let movement = bump(&mut list, "room18", 100_000, 100);
        assert_eq!(movement, Movement::Moved { from: 18, to: 0 });
        let ops = move_ops(&ranges, &list, 18, 0);
        assert_eq!(
            ops,
            vec![
                ListOp::Delete { index: 18 },
                ListOp::Insert {
                    index: 17,
                    room_id: RoomId::from("room16")
                },
                ListOp::Delete { index: 2 },
                ListOp::Insert {
                    index: 0,
                    room_id: RoomId::from("room18")
                },
                ListOp::Delete { index: 12 },
                ListOp::Insert {
                    index: 10,
                    room_id: RoomId::from("room9")
                },
            ]
        );
        assert_windows_consistent(&pre, &ops, &list, &ranges);
    }

    #[test]
    fn test_downward_move() {
        // drop room1 to the bottom: everything shifts up through the window
        let mut list = recency_list(6);
        let ranges = [[0usize, 2]];
        let pre = client_view(&list, &ranges);

        let movement = bump(&mut list, "room1", 1, 0);
        assert_eq!(movement, Movement::Moved { from: 1, to: 5 });
        let ops = move_ops(&ranges, &list, 1, 5);
        assert_eq!(
            ops,
            vec![
                ListOp::Delete { index: 1 },
                ListOp::Insert {
                    index: 2,
                    room_id: RoomId::from("room3")
                },
            ]
        );
        assert_windows_consistent(&pre, &ops, &list, &ranges);
    }

    #[test]
    fn test_leave_inside_window_backfills() {
        let mut list = recency_list(6);
        let ranges = [[0usize, 2]];
        let pre = client_view(&list, &ranges);

        let movement = list.remove(&RoomId::from("room1")).unwrap();
        assert_eq!(movement, Movement::Removed { from: 1 });
        let ops = remove_ops(&ranges, &list, 1);
        assert_eq!(
            ops,
            vec![
                ListOp::Delete { index: 1 },
                ListOp::Insert {
                    index: 2,
                    room_id: RoomId::from("room3")
                },
            ]
        );
        assert_windows_consistent(&pre, &ops, &list, &ranges);
    }

    #[test]
    fn test_leave_with_no_replacement() {
        let mut list = recency_list(2);
        let ranges = [[0usize, 3]];
        list.remove(&RoomId::from("room1")).unwrap();
        let ops = remove_ops(&ranges, &list, 1);
        assert_eq!(ops, vec![ListOp::Delete { index: 1 }]);
    }

    #[test]
    fn test_join_inserts_into_window() {
        let mut list = recency_list(5);
        let ranges = [[0usize, 2]];
        let pre = client_view(&list, &ranges);

        let movement = list.update_key(
            &RoomId::from("roomNew"),
            RoomKey {
                bump_ts: 100_000,
                bump_nid: EventNid::new(100),
                name: None,
            },
        );
        assert_eq!(movement, Movement::Added { to: 0 });
        let ops = insert_ops(&ranges, &list, 0);
        assert_eq!(
            ops,
            vec![
                ListOp::Delete { index: 2 },
                ListOp::Insert {
                    index: 0,
                    room_id: RoomId::from("roomNew")
                },
            ]
        );
        assert_windows_consistent(&pre, &ops, &list, &ranges);
    }

    #[test]
    fn test_join_into_partially_filled_window() {
        let mut list = recency_list(2);
        let ranges = [[0usize, 4]];
        list.update_key(
            &RoomId::from("roomNew"),
            RoomKey {
                bump_ts: 100_000,
                bump_nid: EventNid::new(100),
                name: None,
            },
        );
        // window was not full: no DELETE needed
        let ops = insert_ops(&ranges, &list, 0);
        assert_eq!(
            ops,
            vec![ListOp::Insert {
                index: 0,
                room_id: RoomId::from("roomNew")
            }]
        );
    }

    #[test]
    fn test_sync_ops_clamp_to_list() {
        let list = recency_list(3);
        let ops = sync_ops(&[[0, 10]], &list);
        assert_eq!(
            ops,
            vec![ListOp::Sync {
                range: [0, 2],
                room_ids: vec![
                    RoomId::from("room0"),
                    RoomId::from("room1"),
                    RoomId::from("room2")
                ],
            }]
        );
        assert!(sync_ops(&[[5, 10]], &list).is_empty());
    }

    #[test]
    fn test_by_name_sort() {
        let mut list = SortedRoomList::new(vec![SortOrder::ByName]);
        list.populate(vec![
            (
                RoomId::from("!b"),
                RoomKey {
                    name: Some("Beta".into()),
                    ..Default::default()
                },
            ),
            (
                RoomId::from("!a"),
                RoomKey {
                    name: Some("Alpha".into()),
                    ..Default::default()
                },
            ),
            (RoomId::from("!z"), RoomKey::default()),
        ]);
        let ids: Vec<&str> = list.rooms().iter().map(|r| r.as_str()).collect();
        // unnamed rooms sort last
        assert_eq!(ids, vec!["!a", "!b", "!z"]);
    }

    #[test]
    fn test_op_wire_shape() {
        let op = ListOp::Insert {
            index: 0,
            room_id: RoomId::from("!r:hs"),
        };
        assert_eq!(
            serde_json::to_string(&op).unwrap(),
            r#"{"op":"INSERT","index":0,"room_id":"!r:hs"}"#
        );
        let op = ListOp::Sync {
            range: [0, 1],
            room_ids: vec![RoomId::from("!r:hs")],
        };
        assert_eq!(
            serde_json::to_string(&op).unwrap(),
            r#"{"op":"SYNC","range":[0,1],"room_ids":["!r:hs"]}"#
        );
    }
}
