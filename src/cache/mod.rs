pub mod key;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use crate::config::CacheConfig;
use crate::error::AppError;
use crate::providers::ProviderInput;
use crate::store::{KvStore, unix_now};

pub use self::types::{CacheStats, CacheStatsSnapshot, CachedResponse};

// ---------------------------------------------------------------------------
// ResponseCache -- public facade
// ---------------------------------------------------------------------------

/// Exact-match response cache keyed by model and normalized input.
///
/// Entries expire after the configured TTL. Audio inputs are never cached.
pub struct ResponseCache {
    store: Arc<dyn KvStore>,
    enabled: bool,
    ttl: Duration,
    stats: CacheStats,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn KvStore>, config: &CacheConfig) -> Self {
        Self {
            store,
            enabled: config.enabled,
            ttl: Duration::from_secs(config.ttl_secs),
            stats: CacheStats::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Look up a live entry for `(model, input)`.
    pub fn get(&self, model: &str, input: &ProviderInput) -> Result<Option<CachedResponse>, AppError> {
        if !self.enabled {
            return Ok(None);
        }
        let Some(key) = key::cache_key(model, input) else {
            return Ok(None);
        };
        let Some(raw) = self.store.get(&key)? else {
            self.stats.record_miss();
            return Ok(None);
        };
        match serde_json::from_str::<CachedResponse>(&raw) {
            Ok(entry) => {
                self.stats.record_hit();
                tracing::debug!(model, request_id = %entry.request_id, "Cache hit");
                Ok(Some(entry))
            }
            Err(e) => {
                // Unreadable entries are dropped and treated as misses.
                tracing::warn!(error = %e, "Discarding malformed cache entry");
                self.store.delete(&key)?;
                self.stats.record_miss();
                Ok(None)
            }
        }
    }

    /// Store a successful completion. Returns false when nothing was written.
    pub fn put(
        &self,
        model: &str,
        input: &ProviderInput,
        content: &str,
        request_id: &str,
    ) -> Result<bool, AppError> {
        if !self.enabled {
            return Ok(false);
        }
        let Some(key) = key::cache_key(model, input) else {
            return Ok(false);
        };
        let entry = CachedResponse {
            content: content.to_string(),
            request_id: request_id.to_string(),
            model: model.to_string(),
            created_at: unix_now(),
        };
        self.store
            .put(&key, &serde_json::to_string(&entry)?, Some(self.ttl))?;
        self.stats.record_write();
        Ok(true)
    }

    /// Remove every cached entry, returning how many were dropped.
    pub fn flush(&self) -> Result<usize, AppError> {
        let n = self.store.delete_prefix(key::CACHE_PREFIX)?;
        tracing::info!(entries = n, "Response cache flushed");
        Ok(n)
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
