//! # Upstream Poller
//!
//! One long-lived task per device, driving the upstream sync long-poll:
//!
//! 1. call sync with the stored since token;
//! 2. on 200, hand the response to the sink (which must commit durably
//!    before returning), and only then advance since;
//! 3. on 401, terminate permanently: the device's session is gone;
//! 4. on anything else, sleep on an exponential ladder (2s, 4s, 8s, ...)
//!    shared by every error class, reset by success, capped by policy.
//!
//! The sleep function is injected so tests can observe the ladder without
//! waiting; the upstream client is injected so tests can script responses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::types::{DeviceId, UserId};
use crate::upstream::{SyncV2Client, SyncV2Response};

// =============================================================================
// Sink Trait
// =============================================================================

/// Where a poller delivers what it fetched. Implemented by the engine;
/// mocked in tests.
#[async_trait]
pub trait SyncDataSink: Send + Sync {
    /// Durably accumulates one response. Must not return `Ok` before the
    /// data (and the new since token) is committed.
    async fn accumulate(&self, device_id: &DeviceId, response: SyncV2Response) -> Result<()>;

    /// The device's upstream session died (401). Called exactly once, after
    /// which the poller is gone.
    async fn on_expired(&self, device_id: &DeviceId);
}

// =============================================================================
// Configuration
// =============================================================================

/// Injected sleep, so the backoff ladder is observable in tests.
pub type SleepFn = Arc<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>;

/// Default sleep: `tokio::time::sleep`.
pub fn tokio_sleep() -> SleepFn {
    Arc::new(|d| Box::pin(tokio::time::sleep(d)))
}

#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    /// First-failure backoff; doubles per consecutive failure.
    pub backoff_base: Duration,
    /// Ladder cap.
    pub backoff_cap: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(512),
        }
    }
}

impl PollerConfig {
    /// Delay before retry number `failures` (1-based): base × 2^(n−1).
    fn backoff(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(20);
        let delay = self
            .backoff_base
            .saturating_mul(1u32.checked_shl(shift).unwrap_or(u32::MAX));
        delay.min(self.backoff_cap)
    }
}

// =============================================================================
// Poller
// =============================================================================

/// The per-device poll loop.
pub struct Poller {
    auth_header: String,
    device_id: DeviceId,
    client: Arc<dyn SyncV2Client>,
    sink: Arc<dyn SyncDataSink>,
    sleep: SleepFn,
    config: PollerConfig,
    cancel: CancellationToken,
}

impl Poller {
    pub fn new(
        auth_header: impl Into<String>,
        device_id: DeviceId,
        client: Arc<dyn SyncV2Client>,
        sink: Arc<dyn SyncDataSink>,
    ) -> Self {
        Self {
            auth_header: auth_header.into(),
            device_id,
            client,
            sink,
            sleep: tokio_sleep(),
            config: PollerConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sleep(mut self, sleep: SleepFn) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn with_config(mut self, config: PollerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs the loop until a 401 or cancellation. `on_first_success` fires
    /// exactly once, after the first response is durably accumulated.
    pub async fn poll(self, since: Option<String>, on_first_success: impl FnOnce() + Send) {
        let mut since = since;
        let mut failures: u32 = 0;
        let mut first_success = Some(on_first_success);

        loop {
            if self.cancel.is_cancelled() {
                info!(device = %self.device_id, "poller stopped by shutdown");
                return;
            }

            let result = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(device = %self.device_id, "poller cancelled mid-poll");
                    return;
                }
                r = self.client.do_sync_v2(&self.auth_header, since.as_deref()) => r,
            };

            match result {
                Ok(response) => {
                    let next_batch = response.next_batch.clone();
                    // not cancellable: a response in flight is committed or
                    // dropped whole, never half-applied
                    match self.sink.accumulate(&self.device_id, response).await {
                        Ok(()) => {
                            failures = 0;
                            since = Some(next_batch);
                            if let Some(cb) = first_success.take() {
                                cb();
                            }
                        }
                        Err(e) => {
                            // since stays put: this response replays next poll
                            failures += 1;
                            error!(
                                device = %self.device_id,
                                error = %e,
                                "failed to accumulate sync response; retrying without advancing since"
                            );
                            self.backoff(failures).await;
                        }
                    }
                }
                Err(Error::UpstreamAuth) => {
                    warn!(device = %self.device_id, "upstream returned 401; poller terminating");
                    self.sink.on_expired(&self.device_id).await;
                    return;
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        device = %self.device_id,
                        error = %e,
                        failures,
                        "upstream sync failed; backing off"
                    );
                    self.backoff(failures).await;
                }
            }
        }
    }

    async fn backoff(&self, failures: u32) {
        let delay = self.config.backoff(failures);
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = (self.sleep)(delay) => {}
        }
    }
}

// =============================================================================
// Poller Map
// =============================================================================

/// Guarantees at most one poller per device and fans shutdown out to all of
/// them.
pub struct PollerMap {
    client: Arc<dyn SyncV2Client>,
    sink: Arc<dyn SyncDataSink>,
    sleep: SleepFn,
    config: PollerConfig,
    shutdown: CancellationToken,
    active: Arc<Mutex<HashMap<DeviceId, UserId>>>,
}

impl PollerMap {
    pub fn new(client: Arc<dyn SyncV2Client>, sink: Arc<dyn SyncDataSink>) -> Self {
        Self {
            client,
            sink,
            sleep: tokio_sleep(),
            config: PollerConfig::default(),
            shutdown: CancellationToken::new(),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_sleep(mut self, sleep: SleepFn) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn with_config(mut self, config: PollerConfig) -> Self {
        self.config = config;
        self
    }

    /// The upstream client pollers are spawned with.
    pub fn client(&self) -> Arc<dyn SyncV2Client> {
        self.client.clone()
    }

    /// Whether a poller is currently running for the device.
    pub fn is_polling(&self, device_id: &DeviceId) -> bool {
        self.active
            .lock()
            .expect("poller map lock poisoned")
            .contains_key(device_id)
    }

    /// Spawns a poller for the device unless one is already running.
    /// Returns whether a new poller was started.
    pub fn ensure_polling(
        &self,
        auth_header: &str,
        device_id: &DeviceId,
        user_id: &UserId,
        since: Option<String>,
        on_first_success: impl FnOnce() + Send + 'static,
    ) -> bool {
        {
            let mut active = self.active.lock().expect("poller map lock poisoned");
            if active.contains_key(device_id) {
                return false;
            }
            active.insert(device_id.clone(), user_id.clone());
        }

        let poller = Poller::new(
            auth_header,
            device_id.clone(),
            self.client.clone(),
            self.sink.clone(),
        )
        .with_sleep(self.sleep.clone())
        .with_config(self.config)
        .with_cancel(self.shutdown.child_token());

        let active = self.active.clone();
        let device = device_id.clone();
        tokio::spawn(async move {
            poller.poll(since, on_first_success).await;
            active
                .lock()
                .expect("poller map lock poisoned")
                .remove(&device);
        });
        true
    }

    /// Asks every poller to stop after its current iteration.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::upstream::{EventList, SyncV2JoinResponse, SyncV2Rooms};
    use crate::types::RoomId;
    use serde_json::value::RawValue;

    type RespondFn = Box<dyn Fn(&str, Option<&str>) -> Result<SyncV2Response> + Send + Sync>;

    struct ScriptedClient {
        respond: RespondFn,
    }

    #[async_trait]
    impl SyncV2Client for ScriptedClient {
        async fn do_sync_v2(&self, auth: &str, since: Option<&str>) -> Result<SyncV2Response> {
            (self.respond)(auth, since)
        }
        async fn who_am_i(&self, _auth: &str) -> Result<UserId> {
            Ok(UserId::from("@alice:localhost"))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        states: Mutex<HashMap<RoomId, usize>>,
        timelines: Mutex<HashMap<RoomId, usize>>,
        sinces: Mutex<HashMap<DeviceId, String>>,
        expired: Mutex<Vec<DeviceId>>,
    }

    #[async_trait]
    impl SyncDataSink for RecordingSink {
        async fn accumulate(&self, device_id: &DeviceId, response: SyncV2Response) -> Result<()> {
            for (room_id, join) in &response.rooms.join {
                *self
                    .states
                    .lock()
                    .unwrap()
                    .entry(room_id.clone())
                    .or_default() += join.state.events.len();
                *self
                    .timelines
                    .lock()
                    .unwrap()
                    .entry(room_id.clone())
                    .or_default() += join.timeline.events.len();
            }
            self.sinces
                .lock()
                .unwrap()
                .insert(device_id.clone(), response.next_batch.clone());
            Ok(())
        }

        async fn on_expired(&self, device_id: &DeviceId) {
            self.expired.lock().unwrap().push(device_id.clone());
        }
    }

    fn noop_sleep() -> SleepFn {
        Arc::new(|_| Box::pin(async {}))
    }

    fn raw_event(n: usize) -> Box<RawValue> {
        RawValue::from_string(format!(
            r#"{{"event_id":"$e{n}","type":"m.room.message","sender":"@a:hs","origin_server_ts":{n},"content":{{}}}}"#
        ))
        .unwrap()
    }

    fn join_with(state: Vec<Box<RawValue>>, timeline: Vec<Box<RawValue>>) -> SyncV2JoinResponse {
        SyncV2JoinResponse {
            state: EventList::from_raw(state),
            timeline: crate::upstream::SyncV2Timeline {
                events: timeline,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Poll from nothing: accumulate initial state, persist since, then
    /// terminate on 401. The first-success callback fires exactly once.
    #[tokio::test]
    async fn test_poll_from_nothing() {
        let room = RoomId::from("!foo:bar");
        let room2 = room.clone();
        let client = Arc::new(ScriptedClient {
            respond: Box::new(move |_auth, since| {
                if since.is_none() {
                    let mut rooms = SyncV2Rooms::default();
                    rooms.join.insert(
                        room2.clone(),
                        join_with(vec![raw_event(1), raw_event(2), raw_event(3)], vec![]),
                    );
                    Ok(SyncV2Response {
                        next_batch: "next".to_string(),
                        rooms,
                        ..Default::default()
                    })
                } else {
                    Err(Error::UpstreamAuth)
                }
            }),
        });
        let sink = Arc::new(RecordingSink::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();

        let device = DeviceId::from("FOOBAR");
        let poller = Poller::new("Bearer hello", device.clone(), client, sink.clone())
            .with_sleep(noop_sleep());
        poller
            .poll(None, move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(sink.states.lock().unwrap().get(&room), Some(&3));
        assert_eq!(
            sink.sinces.lock().unwrap().get(&device).map(String::as_str),
            Some("next")
        );
        assert_eq!(sink.expired.lock().unwrap().as_slice(), &[device]);
    }

    /// Poll from an existing since: timeline chunks of 4, 3, 2, 1 events
    /// accumulate to 10, and the final since sticks.
    #[tokio::test]
    async fn test_poll_from_existing() {
        let room = RoomId::from("!foo:bar");
        let room2 = room.clone();
        let counter = Arc::new(AtomicUsize::new(0));
        let sizes = [4usize, 3, 2, 1];
        let client = Arc::new(ScriptedClient {
            respond: Box::new(move |_auth, since| {
                assert!(since.is_some(), "must poll with the stored since");
                let i: usize = since.unwrap().parse().expect("numeric since");
                if i >= sizes.len() {
                    return Err(Error::UpstreamAuth);
                }
                let base = counter.fetch_add(sizes[i], Ordering::SeqCst);
                let mut rooms = SyncV2Rooms::default();
                rooms.join.insert(
                    room2.clone(),
                    join_with(vec![], (0..sizes[i]).map(|k| raw_event(100 + base + k)).collect()),
                );
                Ok(SyncV2Response {
                    next_batch: format!("{}", i + 1),
                    rooms,
                    ..Default::default()
                })
            }),
        });
        let sink = Arc::new(RecordingSink::default());
        let device = DeviceId::from("FOOBAR");
        let poller = Poller::new("Bearer hello", device.clone(), client, sink.clone())
            .with_sleep(noop_sleep());
        poller.poll(Some("0".to_string()), || {}).await;

        assert_eq!(sink.timelines.lock().unwrap().get(&room), Some(&10));
        assert_eq!(
            sink.sinces.lock().unwrap().get(&device).map(String::as_str),
            Some("4")
        );
    }

    /// Backoff ladder: network, 500, 502, 404 back off 2, 4, 8, 16 seconds;
    /// the following 401 terminates.
    #[tokio::test]
    async fn test_backoff_ladder() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts2 = attempts.clone();
        let client = Arc::new(ScriptedClient {
            respond: Box::new(move |_auth, _since| {
                let i = attempts2.fetch_add(1, Ordering::SeqCst);
                match i {
                    0 => Err(Error::UpstreamTransient {
                        status: None,
                        message: "network error".into(),
                    }),
                    1 => Err(Error::UpstreamTransient {
                        status: Some(500),
                        message: "internal server error".into(),
                    }),
                    2 => Err(Error::UpstreamTransient {
                        status: Some(502),
                        message: "bad gateway".into(),
                    }),
                    3 => Err(Error::UpstreamTransient {
                        status: Some(404),
                        message: "not found".into(),
                    }),
                    _ => Err(Error::UpstreamAuth),
                }
            }),
        });
        let slept: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(Vec::new()));
        let slept2 = slept.clone();
        let sleep: SleepFn = Arc::new(move |d| {
            slept2.lock().unwrap().push(d);
            Box::pin(async {})
        });
        let sink = Arc::new(RecordingSink::default());
        let poller = Poller::new("Bearer hello", DeviceId::from("FOOBAR"), client, sink.clone())
            .with_sleep(sleep);
        poller.poll(Some("s".to_string()), || {}).await;

        assert_eq!(
            slept.lock().unwrap().as_slice(),
            &[
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
            ]
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
        assert_eq!(sink.expired.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_backoff_cap() {
        let config = PollerConfig {
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(512),
        };
        assert_eq!(config.backoff(1), Duration::from_secs(2));
        assert_eq!(config.backoff(9), Duration::from_secs(512));
        assert_eq!(config.backoff(30), Duration::from_secs(512));
    }

    #[tokio::test]
    async fn test_poller_map_dedupes() {
        let client = Arc::new(ScriptedClient {
            respond: Box::new(|_a, _s| Err(Error::UpstreamAuth)),
        });
        let sink = Arc::new(RecordingSink::default());
        let map = PollerMap::new(client, sink).with_sleep(noop_sleep());
        let device = DeviceId::from("D");
        let user = UserId::from("@a:hs");
        // second ensure while the first may still be registered is a no-op
        let first = map.ensure_polling("auth", &device, &user, None, || {});
        let second = map.ensure_polling("auth", &device, &user, None, || {});
        assert!(first);
        assert!(!(first && second));
    }
}
