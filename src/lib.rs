//! # Transom: Sliding-Sync Proxy Core
//!
//! Transom bridges a legacy long-polling chat sync API and windowed
//! ("sliding sync") clients. Upstream, every device has a sync stream that
//! returns partial deltas for the user's entire joined-room set. Downstream,
//! clients ask for "rooms 0..9 by recency, with the last N events and this
//! subset of state" and expect minimal DELETE/INSERT/UPDATE operations when
//! the ordering changes.
//!
//! ## Architecture Overview
//!
//! ```text
//! Upstream ──► Poller (per device) ──► Accumulator ──► SQLite
//!                                          │ (post-commit, nid order)
//!                                          ▼
//!                                    Global Cache
//!                                          │ (membership filter)
//!                                          ▼
//!                                     User Caches
//!                                          │ (listener wake)
//!                                          ▼
//!                               Connection Sessions ──► Client response
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Deduplicated log**: an `event_id` is assigned exactly one nid; a
//!    room's timeline is strictly nid-ordered with no duplicates.
//! 2. **State/timeline separation**: events delivered only in upstream
//!    `state` blocks never surface as timeline entries, whatever the
//!    client's `timeline_limit`.
//! 3. **Durable resume**: a device's since token is persisted only after
//!    the response it came from is fully accumulated.
//! 4. **Monotone pos**: each connection's `pos` strictly increases; an old
//!    pos replays the cached response, an unknown pos restarts the session.
//! 5. **Window consistency**: the emitted op sequence transforms the
//!    client's previous window view into exactly the current one.
//!
//! ## Module Organization
//!
//! - [`error`]: crate-wide error enum
//! - [`types`]: identifier newtypes, nids, the parsed [`types::Event`]
//! - [`jsonedit`]: byte-preserving `unsigned.transaction_id` edits
//! - [`upstream`]: the sync-v2 client trait and response types
//! - [`schema`]: SQLite DDL and initialisation
//! - [`storage`] / [`device`]: write-side store operations
//! - [`reader`]: read-side queries for serving and cache warmup
//! - [`accumulator`]: transactional fold of upstream responses
//! - [`poller`]: per-device poll loop with backoff
//! - [`notify`]: post-commit notification types and hub
//! - [`global_cache`] / [`user_cache`]: in-memory room and user indexes
//! - [`txn_cache`]: transaction-id visibility cache
//! - [`lists`]: sorted room lists and delta-op generation
//! - [`connection`]: per-connection session state
//! - [`api`]: the async [`Engine`] tying it all together

pub mod accumulator;
pub mod api;
pub mod connection;
pub mod device;
pub mod error;
pub mod global_cache;
pub mod jsonedit;
pub mod lists;
pub mod notify;
pub mod poller;
pub mod reader;
pub mod schema;
pub mod storage;
pub mod txn_cache;
pub mod types;
pub mod upstream;
pub mod user_cache;

pub use api::{Engine, EngineConfig};
pub use connection::{SlidingSyncRequest, SlidingSyncResponse};
pub use error::{Error, Result};
pub use lists::{ListOp, SortOrder};
pub use poller::{Poller, PollerConfig, PollerMap, SyncDataSink};
pub use schema::Database;
pub use types::{DeviceId, Event, EventNid, RoomId, UserId};
pub use upstream::{SyncV2Client, SyncV2Response};
