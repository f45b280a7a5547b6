//! Key-value store for coordination state.
//!
//! Rate-limit buckets, rotation cursors and cached responses all live behind
//! [`KvStore`]. Counter updates go through [`Counters`], which applies the
//! configured [`CounterPolicy`] so callers never pick between read-then-write
//! and atomic increments themselves.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

pub use crate::config::CounterPolicy;
use crate::error::AppError;

pub use self::memory::MemoryKvStore;
pub use self::sqlite::SqliteKvStore;

/// Current wall-clock time as unix seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ---------------------------------------------------------------------------
// KvStore trait
// ---------------------------------------------------------------------------

/// Opaque string key-value store with optional per-entry expiry.
///
/// Expired entries are invisible to every read even before
/// [`purge_expired`](KvStore::purge_expired) removes them.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, AppError>;

    /// Insert or overwrite. A `ttl` of `None` never expires; otherwise the
    /// expiry is reset to now + ttl.
    fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), AppError>;

    /// Add `delta` to an integer value in a single operation and return the
    /// new value. Missing or expired keys start at 0 and get `ttl`; existing
    /// keys keep their original expiry.
    fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64, AppError>;

    fn delete(&self, key: &str) -> Result<bool, AppError>;

    /// Delete every key starting with `prefix`, returning how many went.
    fn delete_prefix(&self, prefix: &str) -> Result<usize, AppError>;

    /// Physically remove expired entries.
    fn purge_expired(&self) -> Result<usize, AppError>;
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Integer counters on top of a [`KvStore`], honouring a [`CounterPolicy`].
#[derive(Clone)]
pub struct Counters {
    store: Arc<dyn KvStore>,
    policy: CounterPolicy,
}

impl Counters {
    pub fn new(store: Arc<dyn KvStore>, policy: CounterPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> CounterPolicy {
        self.policy
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Current value, 0 when absent or not an integer.
    pub fn get(&self, key: &str) -> Result<i64, AppError> {
        Ok(self
            .store
            .get(key)?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0))
    }

    /// Increase by one and return the new value.
    ///
    /// Under [`CounterPolicy::ReadThenWrite`] this is a `get` followed by a
    /// `put`; two concurrent callers can read the same value and both write
    /// value + 1.
    pub fn bump(&self, key: &str, ttl: Option<Duration>) -> Result<i64, AppError> {
        match self.policy {
            CounterPolicy::ReadThenWrite => {
                let next = self.get(key)? + 1;
                self.store.put(key, &next.to_string(), ttl)?;
                Ok(next)
            }
            CounterPolicy::Atomic => self.store.increment(key, 1, ttl),
        }
    }

    /// Atomic add regardless of policy. Used to roll back a bump.
    pub fn add(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64, AppError> {
        self.store.increment(key, delta, ttl)
    }
}

// ---------------------------------------------------------------------------
// Expiry sweeper
// ---------------------------------------------------------------------------

/// Spawn a background task that purges expired entries every `every`.
pub fn spawn_purge_task(store: Arc<dyn KvStore>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every.max(Duration::from_secs(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match store.purge_expired() {
                Ok(n) if n > 0 => tracing::debug!(purged = n, "Purged expired store entries"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Store purge failed"),
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
