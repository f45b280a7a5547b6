use std::time::Duration;

use rusqlite::{OptionalExtension, params};

use super::{KvStore, unix_now};
use crate::db::Database;
use crate::error::AppError;

/// [`KvStore`] backed by the `kv` table of the main database.
///
/// Expiry has one-second resolution; an entry is live while
/// `expires_at > now`.
#[derive(Clone)]
pub struct SqliteKvStore {
    db: Database,
}

impl SqliteKvStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn expiry(ttl: Option<Duration>, now: i64) -> Option<i64> {
    ttl.map(|t| now.saturating_add(i64::try_from(t.as_secs()).unwrap_or(i64::MAX)))
}

impl KvStore for SqliteKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let now = unix_now();
        let value = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now],
                |row| row.get(0),
            )
            .optional()
        })?;
        Ok(value)
    }

    fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), AppError> {
        let now = unix_now();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                params![key, value, expiry(ttl, now)],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64, AppError> {
        let now = unix_now();
        // Both statements run under the connection lock, so no other caller
        // can interleave between them.
        let value = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM kv WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
                params![key, now],
            )?;
            conn.query_row(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, CAST(?2 AS TEXT), ?3) \
                 ON CONFLICT(key) DO UPDATE SET value = CAST(CAST(value AS INTEGER) + ?2 AS TEXT) \
                 RETURNING CAST(value AS INTEGER)",
                params![key, delta, expiry(ttl, now)],
                |row| row.get::<_, i64>(0),
            )
        })?;
        Ok(value)
    }

    fn delete(&self, key: &str) -> Result<bool, AppError> {
        let n = self
            .db
            .with_conn(|conn| conn.execute("DELETE FROM kv WHERE key = ?1", params![key]))?;
        Ok(n > 0)
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize, AppError> {
        // substr comparison avoids LIKE wildcard escaping.
        let n = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM kv WHERE substr(key, 1, length(?1)) = ?1",
                params![prefix],
            )
        })?;
        Ok(n)
    }

    fn purge_expired(&self) -> Result<usize, AppError> {
        let now = unix_now();
        let n = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )
        })?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteKvStore {
        SqliteKvStore::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn test_put_get_overwrite() {
        let s = store();
        s.put("a", "1", None).unwrap();
        s.put("a", "2", Some(Duration::from_secs(60))).unwrap();
        assert_eq!(s.get("a").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn test_expired_entries_are_invisible() {
        let s = store();
        s.put("gone", "x", Some(Duration::ZERO)).unwrap();
        assert!(s.get("gone").unwrap().is_none());
        assert_eq!(s.purge_expired().unwrap(), 1);
    }

    #[test]
    fn test_increment_creates_and_adds() {
        let s = store();
        assert_eq!(s.increment("n", 1, Some(Duration::from_secs(120))).unwrap(), 1);
        assert_eq!(s.increment("n", 5, None).unwrap(), 6);
        assert_eq!(s.increment("n", -2, None).unwrap(), 4);
        assert_eq!(s.get("n").unwrap().as_deref(), Some("4"));
    }

    #[test]
    fn test_increment_resets_expired_counter() {
        let s = store();
        s.put("n", "10", Some(Duration::ZERO)).unwrap();
        assert_eq!(s.increment("n", 1, None).unwrap(), 1);
    }

    #[test]
    fn test_delete_prefix_is_literal() {
        let s = store();
        s.put("cache:1", "a", None).unwrap();
        s.put("cache:2", "b", None).unwrap();
        s.put("cache_x", "c", None).unwrap();
        assert_eq!(s.delete_prefix("cache:").unwrap(), 2);
        assert!(s.get("cache_x").unwrap().is_some());
        assert!(s.delete("cache_x").unwrap());
    }
}
