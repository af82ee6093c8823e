//! # Async Engine
//!
//! The public surface of the proxy core. Wraps the synchronous storage
//! layer with dedicated threads and async channels:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Tokio Runtime                           │
//! │   pollers ──► EngineSink ──► write channel                   │
//! │   client requests ──► ConnEntry lock ──► read channel        │
//! │   caches & conn wakeups ◄── post-commit dispatch             │
//! └──────────────────┬───────────────────────────┬───────────────┘
//!                    ▼                           ▼
//!        ┌───────────────────────┐   ┌───────────────────────┐
//!        │   Writer Thread       │   │   Reader Threads      │
//!        │   (Accumulator, R/W   │   │   (read-only conns)   │
//!        │    connection)        │   │                       │
//!        └───────────────────────┘   └───────────────────────┘
//! ```
//!
//! SQLite connections are `!Sync`, so each lives on exactly one thread; the
//! async side talks to them through request/response channels. In-memory
//! databases have a single connection, so reads route through the writer
//! thread instead of a pool.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, available_parallelism};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::accumulator::{AccumulateOutcome, Accumulator};
use crate::connection::{
    ConnState, PosKind, RoomPayload, RoomPlan, SlidingSyncRequest, SlidingSyncResponse,
    TimelinePlan,
};
use crate::error::{Error, Result};
use crate::global_cache::GlobalCache;
use crate::jsonedit;
use crate::lists::RoomKey;
use crate::notify::{Notification, NotifierHub};
use crate::poller::{PollerConfig, PollerMap, SleepFn, SyncDataSink};
use crate::reader;
use crate::schema::Database;
use crate::storage::Storage;
use crate::txn_cache::TxnIdCache;
use crate::types::{DeviceId, EventNid, RoomId, UserId};
use crate::upstream::{SyncV2Client, SyncV2Response};
use crate::user_cache::UserCache;

// =============================================================================
// Configuration
// =============================================================================

/// Size of the write request channel.
const WRITE_CHANNEL_SIZE: usize = 1024;

/// Reader pool bounds.
const MIN_READ_THREADS: usize = 1;
const MAX_READ_THREADS: usize = 8;

#[derive(Clone)]
pub struct EngineConfig {
    /// Broadcast capacity of the notification hub.
    pub notify_capacity: usize,
    /// Long-poll budget when the client doesn't send `timeout_ms`.
    pub default_timeout: Duration,
    /// Idle connections are dropped after this long without a request.
    pub conn_idle_timeout: Duration,
    /// How long a response to the sending user may be held back waiting for
    /// the transaction id to arrive down their own poller.
    pub txn_id_grace: Duration,
    /// Transaction-id cache sizing.
    pub txn_cache_capacity: usize,
    pub txn_cache_ttl: Duration,
    /// Poller backoff policy.
    pub poller: PollerConfig,
    /// Injected sleep for poller backoff (tests substitute it).
    pub poller_sleep: Option<SleepFn>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            notify_capacity: crate::notify::DEFAULT_NOTIFY_CAPACITY,
            default_timeout: Duration::from_secs(10),
            conn_idle_timeout: Duration::from_secs(30 * 60),
            txn_id_grace: Duration::from_millis(300),
            txn_cache_capacity: crate::txn_cache::DEFAULT_TXN_CAPACITY,
            txn_cache_ttl: crate::txn_cache::DEFAULT_TXN_TTL,
            poller: PollerConfig::default(),
            poller_sleep: None,
        }
    }
}

// =============================================================================
// Thread Plumbing
// =============================================================================

type ReadJob = Box<dyn FnOnce(&Connection) + Send>;

enum WriteRequest {
    Accumulate {
        device_id: DeviceId,
        user_id: UserId,
        response: Box<SyncV2Response>,
        respond: oneshot::Sender<Result<AccumulateOutcome>>,
    },
    RegisterDevice {
        device_id: DeviceId,
        user_id: UserId,
        respond: oneshot::Sender<Result<Option<String>>>,
    },
    EvictDevice {
        device_id: DeviceId,
        respond: oneshot::Sender<Result<()>>,
    },
    AckToDevice {
        device_id: DeviceId,
        up_to: i64,
        respond: oneshot::Sender<Result<()>>,
    },
    /// Read routed through the writer (in-memory databases only).
    Read(ReadJob),
    Shutdown,
}

enum ReadRoute {
    Pool(std::sync::mpsc::Sender<ReadJob>),
    Writer,
}

// =============================================================================
// Connection Registry
// =============================================================================

type ConnKey = (UserId, DeviceId, String);

struct ConnEntry {
    state: ConnState,
    rx: mpsc::UnboundedReceiver<Notification>,
    listener_id: u64,
    user_cache: Arc<UserCache>,
    /// Events sent by this connection's user, seen without a transaction
    /// id; the response is briefly held back until the id shows up.
    awaiting_txn: Vec<String>,
    expired: bool,
}

impl Drop for ConnEntry {
    fn drop(&mut self) {
        self.user_cache.deregister_listener(self.listener_id);
    }
}

struct ConnHandle {
    entry: Arc<AsyncMutex<ConnEntry>>,
    last_access: Instant,
}

// =============================================================================
// Engine
// =============================================================================

/// The sliding-sync proxy core: owns the store threads, the caches, the
/// pollers and every connection session.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
    pollers: Arc<PollerMap>,
}

struct EngineInner {
    config: EngineConfig,
    write_tx: mpsc::Sender<WriteRequest>,
    read_route: ReadRoute,
    hub: NotifierHub,
    global: GlobalCache,
    users: RwLock<HashMap<UserId, Arc<UserCache>>>,
    txn_cache: TxnIdCache,
    conns: Mutex<HashMap<ConnKey, ConnHandle>>,
    devices: Mutex<HashMap<DeviceId, UserId>>,
    evicted: Mutex<HashSet<DeviceId>>,
    shutdown: CancellationToken,
}

impl Engine {
    /// Opens a file-backed engine with a reader pool.
    pub async fn open(
        path: impl AsRef<Path>,
        client: Arc<dyn SyncV2Client>,
        config: EngineConfig,
    ) -> Result<Engine> {
        let path = path.as_ref().to_path_buf();
        let db = Database::open(&path)?;
        let storage = Storage::new(db.into_connection());

        let readers = available_parallelism()
            .map(|n| n.get() / 2)
            .unwrap_or(2)
            .clamp(MIN_READ_THREADS, MAX_READ_THREADS);
        let (read_tx, read_rx) = std::sync::mpsc::channel::<ReadJob>();
        let read_rx = Arc::new(Mutex::new(read_rx));
        for i in 0..readers {
            let conn = reader::open_read_only(&path)?;
            let rx = read_rx.clone();
            thread::Builder::new()
                .name(format!("transom-read-{i}"))
                .spawn(move || reader_loop(conn, rx))
                .map_err(|e| Error::Schema(format!("spawn reader thread: {e}")))?;
        }

        Self::build(storage, ReadRoute::Pool(read_tx), client, config).await
    }

    /// Opens an in-memory engine (tests, the load generator). Reads route
    /// through the writer thread.
    pub async fn open_in_memory(
        client: Arc<dyn SyncV2Client>,
        config: EngineConfig,
    ) -> Result<Engine> {
        let db = Database::open_in_memory()?;
        let storage = Storage::new(db.into_connection());
        Self::build(storage, ReadRoute::Writer, client, config).await
    }

    async fn build(
        storage: Storage,
        read_route: ReadRoute,
        client: Arc<dyn SyncV2Client>,
        config: EngineConfig,
    ) -> Result<Engine> {
        let (write_tx, write_rx) = mpsc::channel::<WriteRequest>(WRITE_CHANNEL_SIZE);
        let accumulator = Accumulator::new(storage);
        thread::Builder::new()
            .name("transom-writer".to_string())
            .spawn(move || writer_loop(accumulator, write_rx))
            .map_err(|e| Error::Schema(format!("spawn writer thread: {e}")))?;

        let inner = Arc::new(EngineInner {
            txn_cache: TxnIdCache::new(config.txn_cache_capacity, config.txn_cache_ttl),
            hub: NotifierHub::new(config.notify_capacity),
            global: GlobalCache::new(),
            users: RwLock::new(HashMap::new()),
            conns: Mutex::new(HashMap::new()),
            devices: Mutex::new(HashMap::new()),
            evicted: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
            write_tx,
            read_route,
            config,
        });

        let engine_sink = Arc::new(EngineSink {
            inner: Arc::downgrade(&inner),
        });
        let mut pollers = PollerMap::new(client, engine_sink).with_config(inner.config.poller);
        if let Some(sleep) = inner.config.poller_sleep.clone() {
            pollers = pollers.with_sleep(sleep);
        }

        let engine = Engine {
            inner,
            pollers: Arc::new(pollers),
        };
        engine.warm_caches().await?;
        Ok(engine)
    }

    /// Rebuilds the global cache from the store so a restarted proxy serves
    /// identical windows.
    async fn warm_caches(&self) -> Result<()> {
        let rooms = self.with_reader(reader::all_room_ids).await?;
        for room_id in rooms {
            let r = room_id.clone();
            let (state, latest, bump) = self
                .with_reader(move |conn| {
                    Ok((
                        reader::current_state(conn, &r)?,
                        reader::latest_timeline_event(conn, &r)?,
                        reader::latest_bump(conn, &r)?,
                    ))
                })
                .await?;
            self.inner.global.load_room(room_id, &state, latest, bump);
        }
        let devices = self.with_reader(reader::all_devices).await?;
        {
            let mut map = self.inner.devices.lock().expect("device map lock poisoned");
            for (device, user, _) in devices {
                map.insert(device, user);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Polling
    // =========================================================================

    /// Ensures a poller is running for the device, blocking until its first
    /// poll has been durably accumulated (so an immediately following
    /// request sees data). Performs the who-am-I probe on first contact.
    pub async fn ensure_polling(&self, auth_header: &str, device_id: &DeviceId) -> Result<UserId> {
        if let Some(user) = self.device_user(device_id) {
            if self.pollers.is_polling(device_id) {
                return Ok(user);
            }
        }

        let user_id = self
            .pollers
            .client()
            .who_am_i(auth_header)
            .await?;

        let (respond, rx) = oneshot::channel();
        self.inner
            .write_tx
            .send(WriteRequest::RegisterDevice {
                device_id: device_id.clone(),
                user_id: user_id.clone(),
                respond,
            })
            .await
            .map_err(|_| Error::Closed)?;
        let since = rx.await.map_err(|_| Error::Closed)??;

        self.inner
            .devices
            .lock()
            .expect("device map lock poisoned")
            .insert(device_id.clone(), user_id.clone());
        self.inner
            .evicted
            .lock()
            .expect("evicted set lock poisoned")
            .remove(device_id);
        // a re-registered device starts clean: connections that saw the old
        // session expire must not poison the new one
        self.inner
            .conns
            .lock()
            .expect("conn map lock poisoned")
            .retain(|(_, device, _), _| device != device_id);
        self.user_cache(&user_id);

        let (ready_tx, ready_rx) = oneshot::channel();
        let spawned = self.pollers.ensure_polling(
            auth_header,
            device_id,
            &user_id,
            since,
            move || {
                let _ = ready_tx.send(());
            },
        );
        if spawned {
            // a dropped sender means the poller died (401) before its first
            // successful poll
            if ready_rx.await.is_err() {
                return Err(Error::SessionExpired {
                    device_id: device_id.to_string(),
                });
            }
            info!(device = %device_id, user = %user_id, "poller started");
        }
        Ok(user_id)
    }

    /// Whether the device has an active poller.
    pub fn is_polling(&self, device_id: &DeviceId) -> bool {
        self.pollers.is_polling(device_id)
    }

    fn device_user(&self, device_id: &DeviceId) -> Option<UserId> {
        self.inner
            .devices
            .lock()
            .expect("device map lock poisoned")
            .get(device_id)
            .cloned()
    }

    // =========================================================================
    // Client Requests
    // =========================================================================

    /// Serves one sliding-sync request for an authenticated device.
    ///
    /// `cancel` is tied to the client's socket: when it fires mid-wait, the
    /// request aborts but the session survives for the idle timeout.
    pub async fn handle_request(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        request: SlidingSyncRequest,
        cancel: CancellationToken,
    ) -> Result<SlidingSyncResponse> {
        if self
            .inner
            .evicted
            .lock()
            .expect("evicted set lock poisoned")
            .contains(device_id)
        {
            return Err(Error::SessionExpired {
                device_id: device_id.to_string(),
            });
        }

        self.sweep_idle_conns();
        let entry = self.conn_entry(user_id, device_id, request.conn_id.as_deref());
        // per-connection serialization: a second request on the same pos
        // queues here and then classifies as a retry
        let mut conn = entry.lock().await;
        if conn.expired {
            return Err(Error::SessionExpired {
                device_id: device_id.to_string(),
            });
        }

        self.drain_notifications(&mut conn);

        let pos_kind = conn.state.classify_pos(request.pos.as_deref());
        if pos_kind == PosKind::Retry {
            if let Some(cached) = conn.state.cached_response() {
                debug!(user = %user_id, "serving cached response for retried pos");
                return Ok(cached);
            }
        }

        let sticky = conn.state.apply_sticky(&request);

        match pos_kind {
            PosKind::Initial | PosKind::Retry => {
                let rooms = self.room_keys_for_user(user_id);
                conn.state.rebuild(&rooms);
            }
            PosKind::Current => {
                let rooms = self.room_keys_for_user(user_id);
                for name in &sticky.new_lists {
                    conn.state.resync_list(name, &rooms);
                }
                for name in &sticky.resorted_lists {
                    conn.state.resync_list(name, &rooms);
                }
                for (name, spans) in &sticky.widened_ranges {
                    conn.state.sync_spans(name, spans);
                }
            }
        }

        // incremental with nothing to say: long-poll for a notification.
        // Widened limits, changed filters and fresh subscriptions already
        // owe the client data, so they answer immediately.
        let owes_data = conn.state.has_deltas()
            || !conn.state.plan_widened_rooms().is_empty()
            || !conn.state.plan_state_changed(&sticky.state_changed_lists).is_empty()
            || !sticky.subscribed_rooms.is_empty();
        if pos_kind == PosKind::Current && !owes_data {
            self.wait_for_deltas(&mut conn, &request, &cancel).await?;
            if conn.expired {
                return Err(Error::SessionExpired {
                    device_id: device_id.to_string(),
                });
            }
        }

        let mut plans = conn.state.plan_rooms();
        let mut planned: HashSet<RoomId> = plans.iter().map(|p| p.room_id.clone()).collect();
        for plan in conn.state.plan_widened_rooms() {
            if planned.insert(plan.room_id.clone()) {
                plans.push(plan);
            }
        }
        for plan in conn.state.plan_state_changed(&sticky.state_changed_lists) {
            if planned.insert(plan.room_id.clone()) {
                plans.push(plan);
            }
        }

        let mut rooms = BTreeMap::new();
        for plan in plans {
            match self.build_room_payload(&mut conn, user_id, &plan).await {
                Ok(payload) => {
                    rooms.insert(plan.room_id.clone(), payload);
                }
                Err(e) => {
                    // a room the caches know but the store doesn't: drop it
                    // from the response and let the next notification heal it
                    warn!(room = %plan.room_id, error = %e, "dropping room from response");
                }
            }
        }

        // whatever was served without its txn id is not worth holding
        // future responses for
        conn.awaiting_txn.clear();
        Ok(conn.state.finish_response(rooms))
    }

    /// Long-poll: wait until the session has deltas, the timeout lapses,
    /// the client disconnects, or shutdown begins. Responses owed to a user
    /// whose own event still lacks its transaction id are briefly held.
    async fn wait_for_deltas(
        &self,
        conn: &mut ConnEntry,
        request: &SlidingSyncRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let timeout = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.inner.config.default_timeout);
        let deadline = Instant::now() + timeout;
        let grace = self.inner.config.txn_id_grace;

        loop {
            self.resolve_awaited_txns(conn);
            if conn.expired {
                return Ok(());
            }
            if conn.state.has_deltas() && conn.awaiting_txn.is_empty() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            // when only the txn id is missing, wait on the shorter grace
            let until = if conn.state.has_deltas() {
                (now + grace).min(deadline)
            } else {
                deadline
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Closed),
                _ = self.inner.shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(until)) => {
                    if conn.state.has_deltas() {
                        // grace expired: answer without the txn id
                        conn.awaiting_txn.clear();
                        return Ok(());
                    }
                    return Ok(());
                }
                n = conn.rx.recv() => {
                    let Some(n) = n else { return Ok(()) };
                    self.apply_to_conn(conn, n);
                }
            }
        }
    }

    /// Pulls everything queued on the connection's listener channel.
    fn drain_notifications(&self, conn: &mut ConnEntry) {
        while let Ok(n) = conn.rx.try_recv() {
            self.apply_to_conn(conn, n);
        }
        self.resolve_awaited_txns(conn);
    }

    fn apply_to_conn(&self, conn: &mut ConnEntry, notification: Notification) {
        match &notification {
            Notification::DeviceEvicted { device_id, .. } => {
                if device_id == conn.state.device_id() {
                    conn.expired = true;
                }
                return;
            }
            Notification::NewEvent { event, .. } => {
                if event.sender == *conn.state.user_id()
                    && event.transaction_id.is_none()
                    && self
                        .inner
                        .txn_cache
                        .lookup(&event.event_id, conn.state.user_id())
                        .is_none()
                {
                    conn.awaiting_txn.push(event.event_id.clone());
                }
            }
            _ => {}
        }
        let key = notification
            .room_id()
            .and_then(|room| self.inner.global.handle(room))
            .map(|h| RoomKey {
                bump_ts: h.bump_ts,
                bump_nid: h.bump_nid,
                name: h.name,
            });
        conn.state.process_notification(&notification, key);
    }

    fn resolve_awaited_txns(&self, conn: &mut ConnEntry) {
        let user = conn.state.user_id().clone();
        let cache = &self.inner.txn_cache;
        conn.awaiting_txn
            .retain(|event_id| cache.lookup(event_id, &user).is_none());
    }

    // =========================================================================
    // Payload Construction
    // =========================================================================

    async fn build_room_payload(
        &self,
        conn: &mut ConnEntry,
        user_id: &UserId,
        plan: &RoomPlan,
    ) -> Result<RoomPayload> {
        let room_id = plan.room_id.clone();
        let timeline_plan = plan.timeline.clone();
        let filters = plan.required_state.clone();

        let (timeline, state, invite_state) = {
            let room = room_id.clone();
            let user = user_id.clone();
            self.with_reader(move |conn| {
                let timeline = match &timeline_plan {
                    TimelinePlan::Initial { limit } => reader::timeline_tail(conn, &room, *limit)?,
                    TimelinePlan::NewOnly { after, limit } => {
                        if *limit == 0 {
                            Vec::new()
                        } else {
                            let mut events = reader::timeline_range(
                                conn,
                                &room,
                                *after,
                                EventNid::new(i64::MAX),
                            )?;
                            if events.len() > *limit {
                                events.drain(..events.len() - *limit);
                            }
                            events
                        }
                    }
                    TimelinePlan::Widen { before, extra } => {
                        if *before == EventNid::NONE {
                            Vec::new()
                        } else {
                            reader::timeline_before(conn, &room, *before, *extra)?
                        }
                    }
                };
                let state = reader::current_state(conn, &room)?;
                let invites = reader::invites_for_user(conn, &user)?;
                let invite_state = invites
                    .into_iter()
                    .find(|(r, _)| *r == room)
                    .map(|(_, json)| json);
                Ok((timeline, state, invite_state))
            })
            .await?
        };

        let meta = self.inner.global.room(&room_id);
        let user_data = conn.user_cache.room_data(&room_id);

        // prev_batch belongs to the oldest event this response reveals
        let prev_batch = match timeline.first() {
            Some((oldest, _)) => {
                let room = room_id.clone();
                let oldest = *oldest;
                self.with_reader(move |conn| reader::prev_batch_for(conn, &room, oldest))
                    .await?
            }
            None => None,
        };

        let mut raw_timeline = Vec::with_capacity(timeline.len());
        for (_, event) in &timeline {
            raw_timeline.push(raw_value(self.adjust_txn_id(event, user_id)));
        }

        // state trickling: send only slots the client hasn't seen at this nid
        let mut sent_slots = Vec::new();
        let mut raw_state = Vec::new();
        for (nid, event) in &state {
            let Some(state_key) = &event.state_key else {
                continue;
            };
            if !state_matches(&filters, &event.kind, state_key) {
                continue;
            }
            let slot = (event.kind.clone(), state_key.clone());
            if plan.sent_state.get(&slot) == Some(nid) {
                continue;
            }
            sent_slots.push((slot, *nid));
            raw_state.push(raw_value(event.raw.clone()));
        }

        let invite_state = invite_state.and_then(|json| {
            serde_json::from_str::<Vec<String>>(&json)
                .ok()
                .map(|events| events.into_iter().map(raw_value).collect())
        });

        let payload = RoomPayload {
            name: meta.as_ref().and_then(|m| m.name.clone()),
            initial: plan.initial,
            timeline: raw_timeline,
            required_state: raw_state,
            prev_batch,
            num_live: if plan.initial { 0 } else { plan.num_live },
            notification_count: user_data.notification_count,
            highlight_count: user_data.highlight_count,
            invite_state,
        };

        let nids: Vec<EventNid> = timeline.iter().map(|(nid, _)| *nid).collect();
        conn.state
            .record_sent(&room_id, &nids, &sent_slots, plan.effective_limit);
        Ok(payload)
    }

    /// Adjusts `unsigned.transaction_id` for the receiving user: the sender
    /// sees it (from the blob or the cache), everyone else never does.
    fn adjust_txn_id(&self, event: &crate::types::Event, user_id: &UserId) -> String {
        if event.sender == *user_id {
            if event.transaction_id.is_some() {
                return event.raw.clone();
            }
            if let Some(txn_id) = self.inner.txn_cache.lookup(&event.event_id, user_id) {
                return jsonedit::set_transaction_id(&event.raw, &txn_id).into_owned();
            }
            return event.raw.clone();
        }
        jsonedit::strip_transaction_id(&event.raw).into_owned()
    }

    // =========================================================================
    // Caches & Connections
    // =========================================================================

    fn user_cache(&self, user_id: &UserId) -> Arc<UserCache> {
        {
            let users = self.inner.users.read().expect("user map lock poisoned");
            if let Some(cache) = users.get(user_id) {
                return cache.clone();
            }
        }
        let mut users = self.inner.users.write().expect("user map lock poisoned");
        users
            .entry(user_id.clone())
            .or_insert_with(|| {
                let cache = Arc::new(UserCache::new(user_id.clone()));
                cache.seed_joined(
                    self.inner
                        .global
                        .rooms_for_user(user_id)
                        .into_iter()
                        .map(|h| h.room_id),
                );
                cache
            })
            .clone()
    }

    fn room_keys_for_user(&self, user_id: &UserId) -> Vec<(RoomId, RoomKey)> {
        self.inner
            .global
            .rooms_for_user(user_id)
            .into_iter()
            .map(|h| {
                (
                    h.room_id,
                    RoomKey {
                        bump_ts: h.bump_ts,
                        bump_nid: h.bump_nid,
                        name: h.name,
                    },
                )
            })
            .collect()
    }

    fn conn_entry(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        conn_id: Option<&str>,
    ) -> Arc<AsyncMutex<ConnEntry>> {
        let key: ConnKey = (
            user_id.clone(),
            device_id.clone(),
            conn_id.unwrap_or("").to_string(),
        );
        let mut conns = self.inner.conns.lock().expect("conn map lock poisoned");
        if let Some(handle) = conns.get_mut(&key) {
            handle.last_access = Instant::now();
            return handle.entry.clone();
        }

        let user_cache = self.user_cache(user_id);
        let (tx, rx) = mpsc::unbounded_channel();
        let listener_id = user_cache.register_listener(tx);
        let entry = Arc::new(AsyncMutex::new(ConnEntry {
            state: ConnState::new(user_id.clone(), device_id.clone()),
            rx,
            listener_id,
            user_cache,
            awaiting_txn: Vec::new(),
            expired: false,
        }));
        conns.insert(
            key,
            ConnHandle {
                entry: entry.clone(),
                last_access: Instant::now(),
            },
        );
        entry
    }

    fn sweep_idle_conns(&self) {
        let idle = self.inner.config.conn_idle_timeout;
        let mut conns = self.inner.conns.lock().expect("conn map lock poisoned");
        conns.retain(|_, handle| handle.last_access.elapsed() < idle);
    }

    /// Connections currently tracked (for tests and introspection).
    pub fn conn_count(&self) -> usize {
        self.inner
            .conns
            .lock()
            .expect("conn map lock poisoned")
            .len()
    }

    // =========================================================================
    // Device Streams
    // =========================================================================

    /// To-device messages queued for a device in `(from, to]`.
    pub async fn to_device_messages(
        &self,
        device_id: &DeviceId,
        from_excl: i64,
        to_incl: i64,
    ) -> Result<Vec<String>> {
        let device = device_id.clone();
        self.with_reader(move |conn| reader::to_device_messages(conn, &device, from_excl, to_incl))
            .await
    }

    /// Highest queued to-device position for a device.
    pub async fn latest_to_device_position(&self, device_id: &DeviceId) -> Result<i64> {
        let device = device_id.clone();
        self.with_reader(move |conn| reader::latest_to_device_position(conn, &device))
            .await
    }

    /// Deletes acknowledged to-device messages up to and including `up_to`.
    pub async fn ack_to_device(&self, device_id: &DeviceId, up_to: i64) -> Result<()> {
        let (respond, rx) = oneshot::channel();
        self.inner
            .write_tx
            .send(WriteRequest::AckToDevice {
                device_id: device_id.clone(),
                up_to,
                respond,
            })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Users typing in a room when the stream advanced past `from`.
    pub async fn typing(
        &self,
        room_id: &RoomId,
        from_excl: i64,
        to_incl: i64,
    ) -> Result<Vec<UserId>> {
        let room = room_id.clone();
        self.with_reader(move |conn| reader::typing(conn, &room, from_excl, to_incl))
            .await
    }

    // =========================================================================
    // Read Plumbing
    // =========================================================================

    async fn with_reader<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: ReadJob = Box::new(move |conn| {
            let _ = tx.send(f(conn));
        });
        match &self.inner.read_route {
            ReadRoute::Pool(sender) => sender.send(job).map_err(|_| Error::Closed)?,
            ReadRoute::Writer => self
                .inner
                .write_tx
                .send(WriteRequest::Read(job))
                .await
                .map_err(|_| Error::Closed)?,
        }
        rx.await.map_err(|_| Error::Closed)?
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stops pollers after their current iteration, releases waiting
    /// connections, and shuts the store threads down.
    pub async fn shutdown(&self) {
        self.pollers.shutdown();
        self.inner.shutdown.cancel();
        let _ = self.inner.write_tx.send(WriteRequest::Shutdown).await;
    }
}

impl EngineInner {
    /// Applies one notification to the global cache, then forwards it to
    /// the user caches it concerns.
    fn dispatch(&self, notification: Notification) {
        match &notification {
            Notification::RoomSeeded { room_id, state } => {
                let affected = self.global.seed_room(room_id, state);
                let users = self.users.read().expect("user map lock poisoned");
                for user in affected {
                    if let Some(cache) = users.get(&user) {
                        cache.on_notification(&notification);
                    }
                }
            }
            Notification::NewEvent {
                room_id,
                nid,
                event,
                bumps,
            } => {
                let affected = self.global.apply_event(room_id, *nid, event, *bumps);
                let users = self.users.read().expect("user map lock poisoned");
                for user in affected {
                    if let Some(cache) = users.get(&user) {
                        cache.on_notification(&notification);
                    }
                }
            }
            Notification::UnreadCounts { user_id, .. }
            | Notification::Invite { user_id, .. }
            | Notification::InviteGone { user_id, .. }
            | Notification::TransactionId { user_id, .. }
            | Notification::DeviceEvicted { user_id, .. } => {
                let users = self.users.read().expect("user map lock poisoned");
                if let Some(cache) = users.get(user_id) {
                    cache.on_notification(&notification);
                }
            }
        }
    }
}

// =============================================================================
// Poller Sink
// =============================================================================

/// Bridges pollers into the engine without keeping it alive: pollers using
/// a dead engine just stop.
struct EngineSink {
    inner: std::sync::Weak<EngineInner>,
}

#[async_trait]
impl SyncDataSink for EngineSink {
    async fn accumulate(&self, device_id: &DeviceId, response: SyncV2Response) -> Result<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Err(Error::Closed);
        };
        let Some(user_id) = inner
            .devices
            .lock()
            .expect("device map lock poisoned")
            .get(device_id)
            .cloned()
        else {
            return Err(Error::BadRequest(format!(
                "accumulate for unregistered device {device_id}"
            )));
        };

        let (respond, rx) = oneshot::channel();
        inner
            .write_tx
            .send(WriteRequest::Accumulate {
                device_id: device_id.clone(),
                user_id,
                response: Box::new(response),
                respond,
            })
            .await
            .map_err(|_| Error::Closed)?;
        let outcome = rx.await.map_err(|_| Error::Closed)??;

        // cache txn ids before publishing so a connection waking on the
        // event finds them in one lookup
        for (_, event_id, sender, txn_id) in &outcome.txn_ids {
            inner.txn_cache.store(event_id, sender, txn_id);
        }
        // dispatch synchronously: when accumulate() returns, the caches
        // already reflect this response, so a request racing the poller
        // can't see a stale membership snapshot
        for notification in outcome.notifications {
            inner.hub.publish(notification.clone());
            inner.dispatch(notification);
        }
        for (room_id, event_id, sender, _) in outcome.txn_ids {
            let n = Notification::TransactionId {
                room_id,
                event_id,
                user_id: sender,
            };
            inner.hub.publish(n.clone());
            inner.dispatch(n);
        }
        Ok(())
    }

    async fn on_expired(&self, device_id: &DeviceId) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let user_id = inner
            .devices
            .lock()
            .expect("device map lock poisoned")
            .get(device_id)
            .cloned();
        inner
            .evicted
            .lock()
            .expect("evicted set lock poisoned")
            .insert(device_id.clone());

        let (respond, rx) = oneshot::channel();
        if inner
            .write_tx
            .send(WriteRequest::EvictDevice {
                device_id: device_id.clone(),
                respond,
            })
            .await
            .is_ok()
        {
            if let Ok(Err(e)) = rx.await {
                error!(device = %device_id, error = %e, "failed to delete evicted device");
            }
        }
        if let Some(user_id) = user_id {
            let n = Notification::DeviceEvicted {
                device_id: device_id.clone(),
                user_id,
            };
            inner.hub.publish(n.clone());
            inner.dispatch(n);
        }
    }
}

// =============================================================================
// Store Threads
// =============================================================================

fn writer_loop(mut accumulator: Accumulator, mut rx: mpsc::Receiver<WriteRequest>) {
    while let Some(request) = rx.blocking_recv() {
        match request {
            WriteRequest::Accumulate {
                device_id,
                user_id,
                response,
                respond,
            } => {
                let result = accumulator.process(&device_id, &user_id, &response);
                let _ = respond.send(result);
            }
            WriteRequest::RegisterDevice {
                device_id,
                user_id,
                respond,
            } => {
                let result = accumulator
                    .register_device(&device_id, &user_id)
                    .and_then(|_| accumulator.device_since(&device_id));
                let _ = respond.send(result);
            }
            WriteRequest::EvictDevice { device_id, respond } => {
                let _ = respond.send(accumulator.evict_device(&device_id));
            }
            WriteRequest::AckToDevice {
                device_id,
                up_to,
                respond,
            } => {
                let result = (|| {
                    let tx = accumulator.storage_mut().transaction()?;
                    tx.delete_to_device_messages_up_to(&device_id, up_to)?;
                    tx.commit()
                })();
                let _ = respond.send(result);
            }
            WriteRequest::Read(job) => {
                job(accumulator.storage().connection());
            }
            WriteRequest::Shutdown => break,
        }
    }
    debug!("writer thread exiting");
}

fn reader_loop(conn: Connection, rx: Arc<Mutex<std::sync::mpsc::Receiver<ReadJob>>>) {
    loop {
        let job = {
            let rx = rx.lock().expect("reader queue lock poisoned");
            rx.recv()
        };
        match job {
            Ok(job) => job(&conn),
            Err(_) => break,
        }
    }
    debug!("reader thread exiting");
}

// =============================================================================
// Helpers
// =============================================================================

fn raw_value(json: String) -> Box<serde_json::value::RawValue> {
    serde_json::value::RawValue::from_string(json).unwrap_or_else(|_| {
        serde_json::value::RawValue::from_string("null".to_string())
            .expect("null is valid JSON")
    })
}

/// Whether a `(type, state_key)` filter list matches a state slot. A
/// `state_key` of `*` matches every key of that type.
fn state_matches(filters: &[(String, String)], kind: &str, state_key: &str) -> bool {
    filters
        .iter()
        .any(|(t, k)| t == kind && (k == "*" || k == state_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_matches_wildcard() {
        let filters = vec![
            ("m.room.name".to_string(), "".to_string()),
            ("m.room.member".to_string(), "*".to_string()),
        ];
        assert!(state_matches(&filters, "m.room.name", ""));
        assert!(state_matches(&filters, "m.room.member", "@anyone:hs"));
        assert!(!state_matches(&filters, "m.room.topic", ""));
        assert!(!state_matches(&filters, "m.room.name", "other"));
    }
}
