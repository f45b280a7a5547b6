use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::KvStore;
use crate::error::AppError;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Process-local [`KvStore`]. Nothing is shared between gateway instances.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let now = Instant::now();
        Ok(self
            .lock()
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), AppError> {
        let expires_at = ttl.map(|t| Instant::now() + t);
        self.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64, AppError> {
        let now = Instant::now();
        let mut entries = self.lock();
        let (current, expires_at) = match entries.get(key).filter(|e| e.is_live(now)) {
            Some(e) => (e.value.parse::<i64>().unwrap_or(0), e.expires_at),
            None => (0, ttl.map(|t| now + t)),
        };
        let next = current + delta;
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    fn delete(&self, key: &str) -> Result<bool, AppError> {
        Ok(self.lock().remove(key).is_some())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize, AppError> {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok(before - entries.len())
    }

    fn purge_expired(&self) -> Result<usize, AppError> {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        Ok(before - entries.len())
    }
}
