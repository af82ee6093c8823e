//! # Transaction-ID Cache
//!
//! Short-lived map resolving "this event originated from this user's client
//! with this txn_id", so the id is echoed to exactly the sending user.
//!
//! An event can arrive down another user's poller first (without the
//! `unsigned` block) and only later down the sender's poller (with it); the
//! store keeps whichever raw blob arrived first, so this cache is the only
//! place the association survives. Entries expire by TTL, sized to bridge
//! the gap between those two arrivals, and the map is capped by LRU.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::types::UserId;

/// Default entry lifetime.
pub const DEFAULT_TXN_TTL: Duration = Duration::from_secs(300);

/// Default entry cap.
pub const DEFAULT_TXN_CAPACITY: usize = 10_000;

type Clock = Box<dyn Fn() -> Instant + Send + Sync>;

struct Entry {
    txn_id: String,
    stored_at: Instant,
}

/// The cache. All operations are short critical sections on one mutex.
pub struct TxnIdCache {
    inner: Mutex<LruCache<(String, UserId), Entry>>,
    ttl: Duration,
    now: Clock,
}

impl TxnIdCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self::with_clock(capacity, ttl, Box::new(Instant::now))
    }

    /// Injectable clock so tests can drive TTL expiry deterministically.
    pub fn with_clock(capacity: usize, ttl: Duration, now: Clock) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
            now,
        }
    }

    /// Records that `user_id`'s client originated `event_id` with `txn_id`.
    pub fn store(&self, event_id: &str, user_id: &UserId, txn_id: &str) {
        let mut inner = self.inner.lock().expect("txn cache lock poisoned");
        inner.put(
            (event_id.to_string(), user_id.clone()),
            Entry {
                txn_id: txn_id.to_string(),
                stored_at: (self.now)(),
            },
        );
    }

    /// The txn_id for `(event_id, user_id)`, if present and fresh.
    pub fn lookup(&self, event_id: &str, user_id: &UserId) -> Option<String> {
        let mut inner = self.inner.lock().expect("txn cache lock poisoned");
        let key = (event_id.to_string(), user_id.clone());
        match inner.get(&key) {
            Some(entry) if (self.now)().duration_since(entry.stored_at) <= self.ttl => {
                Some(entry.txn_id.clone())
            }
            Some(_) => {
                inner.pop(&key);
                None
            }
            None => None,
        }
    }
}

impl Default for TxnIdCache {
    fn default() -> Self {
        Self::new(DEFAULT_TXN_CAPACITY, DEFAULT_TXN_TTL)
    }
}

// =============================================================================
// Tests
// =============================================================================
