#![allow(dead_code)]

//! Shared helpers for the integration suite: deterministic event builders,
//! a scripted fake upstream with long-poll semantics, and engine setup.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::value::RawValue;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use transom::connection::ListRequest;
use transom::upstream::{
    EventList, SyncV2InviteResponse, SyncV2JoinResponse, SyncV2Response, SyncV2Rooms,
    SyncV2Timeline,
};
use transom::{
    DeviceId, Engine, EngineConfig, Error, Result, RoomId, SlidingSyncRequest,
    SlidingSyncResponse, SyncV2Client, UserId,
};

// =============================================================================
// Event Builders
// =============================================================================

pub const BASE_TS: i64 = 1_700_000_000_000;

static EVENT_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn next_event_id(tag: &str) -> String {
    let n = EVENT_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("$event_{n}_{tag}")
}

pub fn raw(s: String) -> Box<RawValue> {
    RawValue::from_string(s).expect("valid event JSON")
}

pub fn message_event(sender: &str, body: &str, ts: i64) -> Box<RawValue> {
    raw(format!(
        r#"{{"event_id":"{}","type":"m.room.message","sender":"{sender}","origin_server_ts":{ts},"content":{{"msgtype":"m.text","body":"{body}"}}}}"#,
        next_event_id("msg")
    ))
}

pub fn message_event_with_txn(sender: &str, body: &str, ts: i64, txn_id: &str) -> Box<RawValue> {
    raw(format!(
        r#"{{"event_id":"{}","type":"m.room.message","sender":"{sender}","origin_server_ts":{ts},"content":{{"msgtype":"m.text","body":"{body}"}},"unsigned":{{"transaction_id":"{txn_id}"}}}}"#,
        next_event_id("msg")
    ))
}

pub fn state_event(
    kind: &str,
    state_key: &str,
    sender: &str,
    content: &str,
    ts: i64,
) -> Box<RawValue> {
    raw(format!(
        r#"{{"event_id":"{}","type":"{kind}","state_key":"{state_key}","sender":"{sender}","origin_server_ts":{ts},"content":{content}}}"#,
        next_event_id("state")
    ))
}

pub fn join_event(user: &str, ts: i64) -> Box<RawValue> {
    state_event("m.room.member", user, user, r#"{"membership":"join"}"#, ts)
}

pub fn leave_event(user: &str, ts: i64) -> Box<RawValue> {
    state_event("m.room.member", user, user, r#"{"membership":"leave"}"#, ts)
}

/// Minimal plausible room state: create + creator membership.
pub fn room_state(creator: &str, ts: i64) -> Vec<Box<RawValue>> {
    vec![
        state_event("m.room.create", "", creator, r#"{"creator":"x"}"#, ts),
        join_event(creator, ts + 1),
    ]
}

// =============================================================================
// Upstream Response Builders
// =============================================================================

pub fn join_room(
    state: Vec<Box<RawValue>>,
    timeline: Vec<Box<RawValue>>,
    prev_batch: Option<&str>,
) -> SyncV2JoinResponse {
    SyncV2JoinResponse {
        state: EventList::from_raw(state),
        timeline: SyncV2Timeline {
            events: timeline,
            prev_batch: prev_batch.map(|s| s.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn rooms_response(
    rooms: Vec<(RoomId, SyncV2JoinResponse)>,
    next_batch: &str,
) -> SyncV2Response {
    SyncV2Response {
        next_batch: next_batch.to_string(),
        rooms: SyncV2Rooms {
            join: rooms.into_iter().collect(),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn invite_response(
    room_id: RoomId,
    invite_state: Vec<Box<RawValue>>,
    next_batch: &str,
) -> SyncV2Response {
    let mut invite = BTreeMap::new();
    invite.insert(
        room_id,
        SyncV2InviteResponse {
            invite_state: EventList::from_raw(invite_state),
        },
    );
    SyncV2Response {
        next_batch: next_batch.to_string(),
        rooms: SyncV2Rooms {
            invite,
            ..Default::default()
        },
        ..Default::default()
    }
}

// =============================================================================
// Fake Upstream
// =============================================================================

/// A scripted upstream with genuine long-poll semantics: `do_sync_v2`
/// blocks while a device's queue is empty and resumes as soon as a
/// response is queued.
pub struct FakeUpstream {
    accounts: Mutex<HashMap<String, UserId>>,
    queues: Mutex<HashMap<String, VecDeque<Result<SyncV2Response>>>>,
    blocked: Mutex<HashMap<String, bool>>,
    notify: Notify,
}

impl FakeUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            accounts: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            blocked: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        })
    }

    pub fn add_account(&self, auth: &str, user: &str) {
        self.accounts
            .lock()
            .unwrap()
            .insert(auth.to_string(), UserId::from(user));
    }

    pub fn queue(&self, auth: &str, response: SyncV2Response) {
        self.queues
            .lock()
            .unwrap()
            .entry(auth.to_string())
            .or_default()
            .push_back(Ok(response));
        self.notify.notify_waiters();
    }

    /// Queues a terminal 401 for the device.
    pub fn queue_unauthorized(&self, auth: &str) {
        self.queues
            .lock()
            .unwrap()
            .entry(auth.to_string())
            .or_default()
            .push_back(Err(Error::UpstreamAuth));
        self.notify.notify_waiters();
    }

    pub fn queue_transient(&self, auth: &str, status: Option<u16>) {
        self.queues
            .lock()
            .unwrap()
            .entry(auth.to_string())
            .or_default()
            .push_back(Err(Error::UpstreamTransient {
                status,
                message: "scripted failure".to_string(),
            }));
        self.notify.notify_waiters();
    }

    fn pop(&self, auth: &str) -> Option<Result<SyncV2Response>> {
        self.queues.lock().unwrap().get_mut(auth)?.pop_front()
    }

    fn set_blocked(&self, auth: &str, blocked: bool) {
        self.blocked
            .lock()
            .unwrap()
            .insert(auth.to_string(), blocked);
    }

    fn is_drained(&self, auth: &str) -> bool {
        let queue_empty = self
            .queues
            .lock()
            .unwrap()
            .get(auth)
            .map(|q| q.is_empty())
            .unwrap_or(true);
        let parked = *self.blocked.lock().unwrap().get(auth).unwrap_or(&false);
        queue_empty && parked
    }

    /// Waits until every queued response for the device has been taken AND
    /// fully accumulated (the poller is parked on its next long-poll).
    pub async fn wait_until_synced(&self, auth: &str) {
        eventually(Duration::from_secs(5), Duration::from_millis(5), || {
            self.is_drained(auth).then_some(())
        })
        .await
    }
}

#[async_trait]
impl SyncV2Client for FakeUpstream {
    async fn do_sync_v2(&self, auth: &str, _since: Option<&str>) -> Result<SyncV2Response> {
        loop {
            let notified = self.notify.notified();
            if let Some(result) = self.pop(auth) {
                self.set_blocked(auth, false);
                return result;
            }
            self.set_blocked(auth, true);
            notified.await;
        }
    }

    async fn who_am_i(&self, auth: &str) -> Result<UserId> {
        self.accounts
            .lock()
            .unwrap()
            .get(auth)
            .cloned()
            .ok_or(Error::UpstreamAuth)
    }
}

// =============================================================================
// Engine Harness
// =============================================================================

pub struct TestProxy {
    pub engine: Engine,
    pub upstream: Arc<FakeUpstream>,
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        default_timeout: Duration::from_millis(200),
        txn_id_grace: Duration::from_millis(500),
        ..Default::default()
    }
}

pub async fn new_proxy() -> TestProxy {
    let upstream = FakeUpstream::new();
    let engine = Engine::open_in_memory(upstream.clone(), test_config())
        .await
        .expect("open engine");
    TestProxy { engine, upstream }
}

pub async fn new_proxy_at(path: &std::path::Path) -> TestProxy {
    let upstream = FakeUpstream::new();
    let engine = Engine::open(path, upstream.clone(), test_config())
        .await
        .expect("open engine");
    TestProxy { engine, upstream }
}

impl TestProxy {
    /// Registers the device and blocks until its first poll is accumulated.
    pub async fn connect(&self, auth: &str, device: &str) -> UserId {
        self.engine
            .ensure_polling(auth, &DeviceId::from(device))
            .await
            .expect("ensure_polling")
    }

    pub async fn request(
        &self,
        user: &UserId,
        device: &str,
        request: SlidingSyncRequest,
    ) -> Result<SlidingSyncResponse> {
        self.engine
            .handle_request(
                user,
                &DeviceId::from(device),
                request,
                CancellationToken::new(),
            )
            .await
    }
}

// =============================================================================
// Request Builders
// =============================================================================

/// A one-list request named "a". `pos: None` makes it an initial sync.
pub fn list_request(
    pos: Option<&str>,
    ranges: Vec<[usize; 2]>,
    timeline_limit: usize,
) -> SlidingSyncRequest {
    let mut lists = BTreeMap::new();
    lists.insert(
        "a".to_string(),
        ListRequest {
            ranges: Some(ranges),
            timeline_limit: Some(timeline_limit),
            ..Default::default()
        },
    );
    SlidingSyncRequest {
        pos: pos.map(|s| s.to_string()),
        timeout_ms: Some(50),
        lists,
        ..Default::default()
    }
}

// =============================================================================
// Assertions
// =============================================================================

/// Event ids of a payload's timeline, in order.
pub fn timeline_event_ids(response: &SlidingSyncResponse, room: &RoomId) -> Vec<String> {
    let payload = response
        .rooms
        .get(room)
        .unwrap_or_else(|| panic!("no payload for {room}"));
    payload.timeline.iter().map(|r| event_id_of(r)).collect()
}

pub fn event_id_of(raw: &RawValue) -> String {
    serde_json::from_str::<serde_json::Value>(raw.get()).expect("valid event")["event_id"]
        .as_str()
        .expect("event_id")
        .to_string()
}

/// Polls `f` until it yields, failing after `timeout`.
pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(interval).await;
    }
}
