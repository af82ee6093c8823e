//! Transom Load Generator
//!
//! A standalone binary for exercising the proxy core under load: a
//! synthetic upstream feeds one poller a burst of rooms and live events
//! while concurrent client connections run sliding-sync windows over them.
//! Run with: `cargo run --release --bin loadgen -- [OPTIONS]`

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::value::RawValue;
use tokio_util::sync::CancellationToken;

use transom::connection::ListRequest;
use transom::upstream::{SyncV2JoinResponse, SyncV2Response, SyncV2Rooms, SyncV2Timeline};
use transom::{
    DeviceId, Engine, EngineConfig, Error, Result, RoomId, SlidingSyncRequest, SyncV2Client, UserId,
};

struct Config {
    /// Number of rooms in the synthetic account.
    num_rooms: usize,
    /// Live events injected after the initial sync.
    num_events: usize,
    /// Concurrent client connections.
    concurrency: usize,
    /// Window size per connection.
    window: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_rooms: 100,
            num_events: 1000,
            concurrency: 10,
            window: 10,
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--rooms" | "-r" => {
                i += 1;
                config.num_rooms = args[i].parse().expect("Invalid --rooms value");
            }
            "--events" | "-e" => {
                i += 1;
                config.num_events = args[i].parse().expect("Invalid --events value");
            }
            "--concurrency" | "-c" => {
                i += 1;
                config.concurrency = args[i].parse().expect("Invalid --concurrency value");
            }
            "--window" | "-w" => {
                i += 1;
                config.window = args[i].parse().expect("Invalid --window value");
            }
            "--help" | "-h" => {
                println!(
                    r#"Transom Load Generator

Usage: loadgen [OPTIONS]

Options:
  -r, --rooms <N>       Rooms in the synthetic account (default: 100)
  -e, --events <N>      Live events to inject (default: 1000)
  -c, --concurrency <N> Concurrent client connections (default: 10)
  -w, --window <N>      Window size per connection (default: 10)
  -h, --help            Show this help
"#
                );
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {arg}");
                std::process::exit(1);
            }
        }
    }

    config
}

const BASE_TS: i64 = 1_700_000_000_000;

fn raw(s: String) -> Box<RawValue> {
    RawValue::from_string(s).expect("valid JSON")
}

fn message(seq: u64, room: usize) -> Box<RawValue> {
    raw(format!(
        r#"{{"event_id":"$gen{seq}","type":"m.room.message","sender":"@gen:load","origin_server_ts":{},"content":{{"body":"event {seq}"}}}}"#,
        BASE_TS + seq as i64 * 7 + room as i64
    ))
}

fn member(room: usize) -> Box<RawValue> {
    raw(format!(
        r#"{{"event_id":"$join{room}","type":"m.room.member","state_key":"@gen:load","sender":"@gen:load","origin_server_ts":{BASE_TS},"content":{{"membership":"join"}}}}"#
    ))
}

fn room_id(room: usize) -> RoomId {
    RoomId::new(format!("!load{room:05}:synthetic"))
}

/// Synthetic upstream: one big initial response, then live events in a
/// deterministic pseudo-random room order, then pending forever.
struct SyntheticUpstream {
    config_rooms: usize,
    remaining: AtomicU64,
    seq: AtomicU64,
    injected: Arc<AtomicU64>,
}

#[async_trait]
impl SyncV2Client for SyntheticUpstream {
    async fn do_sync_v2(&self, _auth: &str, since: Option<&str>) -> Result<SyncV2Response> {
        if since.is_none() {
            let mut join = BTreeMap::new();
            for r in 0..self.config_rooms {
                let seq = self.seq.fetch_add(1, Ordering::SeqCst);
                join.insert(
                    room_id(r),
                    SyncV2JoinResponse {
                        state: transom::upstream::EventList::from_raw(vec![member(r)]),
                        timeline: SyncV2Timeline {
                            events: vec![message(seq, r)],
                            prev_batch: Some(format!("pb{r}")),
                            ..Default::default()
                        },
                        ..Default::default()
                    },
                );
            }
            return Ok(SyncV2Response {
                next_batch: "live".to_string(),
                rooms: SyncV2Rooms {
                    join,
                    ..Default::default()
                },
                ..Default::default()
            });
        }

        if self.remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_err()
        {
            // workload exhausted: behave like a quiet upstream
            futures::future::pending::<()>().await;
            unreachable!();
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        // multiplicative congruential step keeps the room order unpredictable
        // without a rand dependency
        let room = (seq.wrapping_mul(48271) % self.config_rooms as u64) as usize;
        let mut join = BTreeMap::new();
        join.insert(
            room_id(room),
            SyncV2JoinResponse {
                timeline: SyncV2Timeline {
                    events: vec![message(seq, room)],
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        self.injected.fetch_add(1, Ordering::SeqCst);
        Ok(SyncV2Response {
            next_batch: format!("live{seq}"),
            rooms: SyncV2Rooms {
                join,
                ..Default::default()
            },
            ..Default::default()
        })
    }

    async fn who_am_i(&self, _auth: &str) -> Result<UserId> {
        Ok(UserId::from("@gen:load"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let config = parse_args();
    println!(
        "loadgen: {} rooms, {} live events, {} connections, window {}",
        config.num_rooms, config.num_events, config.concurrency, config.window
    );

    let injected = Arc::new(AtomicU64::new(0));
    let upstream = Arc::new(SyntheticUpstream {
        config_rooms: config.num_rooms,
        remaining: AtomicU64::new(config.num_events as u64),
        seq: AtomicU64::new(0),
        injected: injected.clone(),
    });

    let engine = Engine::open_in_memory(upstream, EngineConfig::default()).await?;
    let device = DeviceId::from("LOADGEN");

    let start = Instant::now();
    let user = engine.ensure_polling("Bearer loadgen", &device).await?;
    println!("initial sync accumulated in {:?}", start.elapsed());

    let responses = Arc::new(AtomicU64::new(0));
    let ops_seen = Arc::new(AtomicU64::new(0));
    let errors: Arc<Mutex<Vec<Error>>> = Arc::new(Mutex::new(Vec::new()));

    let live_start = Instant::now();
    let mut handles = Vec::new();
    for c in 0..config.concurrency {
        let engine = engine.clone();
        let user = user.clone();
        let device = device.clone();
        let responses = responses.clone();
        let ops_seen = ops_seen.clone();
        let errors = errors.clone();
        let injected = injected.clone();
        let target = config.num_events as u64;
        let window = config.window;

        handles.push(tokio::spawn(async move {
            let mut pos: Option<String> = None;
            loop {
                let mut lists = BTreeMap::new();
                lists.insert(
                    "all".to_string(),
                    ListRequest {
                        ranges: Some(vec![[0, window.saturating_sub(1)]]),
                        timeline_limit: Some(3),
                        required_state: Some(vec![(
                            "m.room.member".to_string(),
                            "*".to_string(),
                        )]),
                        ..Default::default()
                    },
                );
                let request = SlidingSyncRequest {
                    pos: pos.clone(),
                    conn_id: Some(format!("conn{c}")),
                    timeout_ms: Some(200),
                    lists,
                    ..Default::default()
                };
                match engine
                    .handle_request(&user, &device, request, CancellationToken::new())
                    .await
                {
                    Ok(response) => {
                        responses.fetch_add(1, Ordering::SeqCst);
                        for list in response.lists.values() {
                            ops_seen.fetch_add(list.ops.len() as u64, Ordering::SeqCst);
                        }
                        pos = Some(response.pos);
                    }
                    Err(e) => {
                        errors.lock().expect("error log lock").push(e);
                        break;
                    }
                }
                if injected.load(Ordering::SeqCst) >= target {
                    break;
                }
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    let elapsed = live_start.elapsed();
    let total_responses = responses.load(Ordering::SeqCst);
    let total_ops = ops_seen.load(Ordering::SeqCst);
    let total_injected = injected.load(Ordering::SeqCst);
    let failure_count = errors.lock().expect("error log lock").len();

    println!("---");
    println!("live events injected:  {total_injected}");
    println!("responses served:      {total_responses}");
    println!("list ops emitted:      {total_ops}");
    println!("request errors:        {failure_count}");
    println!(
        "elapsed: {:?} ({:.0} responses/sec)",
        elapsed,
        total_responses as f64 / elapsed.as_secs_f64().max(0.001)
    );

    engine.shutdown().await;
    Ok(())
}
