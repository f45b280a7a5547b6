//! Key Rotation Service
//!
//! Owns the pool of upstream credentials per provider and hands out the next
//! one to use. Two strategies are supported:
//!
//! - **Round-robin**: a cursor per (scope, provider) stored in the key-value
//!   store indexes into the provider's active keys in insertion order.
//! - **Least-used**: among active keys whose model patterns match, pick the
//!   smallest usage counter, ties going to the earliest last use (never-used
//!   keys first).
//!
//! Every selection bumps the chosen key's usage counter by one and stamps
//! `last_used`. Under [`CounterPolicy::ReadThenWrite`] the new count is
//! computed from the snapshot that was read, so concurrent selections can
//! pick the same key and lose an increment.

use std::str::FromStr;

use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{CounterPolicy, RotationStrategy, SeedKey};
use crate::db::Database;
use crate::error::AppError;
use crate::providers::pattern::{matches_any, parse_patterns};
use crate::providers::{Provider, ProviderError};
use crate::store::{Counters, unix_now};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How a credential is presented upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    /// `Authorization: Bearer` (or a provider-specific key header).
    #[default]
    Bearer,
    /// Query-string parameter.
    Query,
}

impl CredentialKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bearer => "bearer",
            Self::Query => "query",
        }
    }
}

impl FromStr for CredentialKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bearer" => Ok(Self::Bearer),
            "query" => Ok(Self::Query),
            other => Err(format!("Unknown credential kind: {other}")),
        }
    }
}

/// A provider credential as stored in the pool.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
    pub id: String,
    pub provider: String,
    #[serde(skip)]
    pub credential: String,
    pub kind: CredentialKind,
    pub models: Vec<String>,
    pub active: bool,
    pub usage_count: i64,
    pub last_used: Option<i64>,
    pub created_at: i64,
}

/// The credential handed to an adapter.
#[derive(Debug, Clone)]
pub struct Credential {
    pub key_id: String,
    pub value: String,
    pub kind: CredentialKind,
}

/// Input for [`KeyRotation::add_key`].
#[derive(Debug, Clone, Deserialize)]
pub struct NewKey {
    pub provider: String,
    pub credential: String,
    #[serde(default)]
    pub kind: CredentialKind,
    pub models: Vec<String>,
}

/// Whose cursor a round-robin selection advances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationScope {
    Global,
    Project(String),
}

impl RotationScope {
    pub fn label(&self) -> &str {
        match self {
            Self::Global => "global",
            Self::Project(id) => id,
        }
    }

    fn cursor_key(&self, provider: Provider) -> String {
        format!("rotation:{}:{}", self.label(), provider.id())
    }
}

/// Per-provider pool snapshot for `/keys/status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPoolStatus {
    pub provider: String,
    pub strategy: String,
    pub scope: String,
    pub cursor: i64,
    pub key_count: usize,
    pub active_keys: usize,
}

// ---------------------------------------------------------------------------
// Pure selection
// ---------------------------------------------------------------------------

/// Least-used choice over a snapshot of keys.
///
/// Inactive keys and keys whose patterns reject `model` are skipped. With no
/// model every active key is eligible.
pub fn select_least_used<'a>(
    keys: &'a [ApiKeyRecord],
    model: Option<&str>,
) -> Option<&'a ApiKeyRecord> {
    keys.iter()
        .filter(|k| k.active)
        .filter(|k| model.is_none_or(|m| matches_any(&k.models, m)))
        // None < Some(_), so never-used keys win ties.
        .min_by_key(|k| (k.usage_count, k.last_used))
}

// ---------------------------------------------------------------------------
// KeyRotation
// ---------------------------------------------------------------------------

pub struct KeyRotation {
    db: Database,
    counters: Counters,
    strategy: RotationStrategy,
}

impl KeyRotation {
    pub fn new(db: Database, counters: Counters, strategy: RotationStrategy) -> Self {
        Self {
            db,
            counters,
            strategy,
        }
    }

    pub fn strategy(&self) -> RotationStrategy {
        self.strategy
    }

    /// Select the next credential for `provider`.
    ///
    /// Fails with [`ProviderError::NoKeyAvailable`] (as an
    /// [`AppError::Provider`]) when no active key is eligible.
    pub fn next_key(
        &self,
        provider: Provider,
        scope: &RotationScope,
        model: Option<&str>,
    ) -> Result<Credential, AppError> {
        let keys = self.active_keys(provider)?;
        let chosen = match self.strategy {
            RotationStrategy::RoundRobin => {
                if keys.is_empty() {
                    return Err(ProviderError::NoKeyAvailable(provider.id().to_string()).into());
                }
                // Read-then-increment the cursor; the pre-increment value indexes.
                let next = self.counters.bump(&scope.cursor_key(provider), None)?;
                let cursor = usize::try_from(next - 1).unwrap_or(0);
                keys[cursor % keys.len()].clone()
            }
            RotationStrategy::LeastUsed => select_least_used(&keys, model)
                .cloned()
                .ok_or_else(|| ProviderError::NoKeyAvailable(provider.id().to_string()))?,
        };

        self.mark_used(&chosen)?;
        debug!(
            provider = %provider,
            key_id = %chosen.id,
            scope = scope.label(),
            strategy = %self.strategy,
            "Selected provider key"
        );

        Ok(Credential {
            key_id: chosen.id,
            value: chosen.credential,
            kind: chosen.kind,
        })
    }

    /// Record one use of `key`.
    fn mark_used(&self, key: &ApiKeyRecord) -> Result<(), AppError> {
        let now = unix_now();
        self.db.with_conn(|conn| match self.counters.policy() {
            CounterPolicy::ReadThenWrite => conn.execute(
                "UPDATE provider_keys SET usage_count = ?1, last_used = ?2 WHERE id = ?3",
                params![key.usage_count + 1, now, key.id],
            ),
            CounterPolicy::Atomic => conn.execute(
                "UPDATE provider_keys SET usage_count = usage_count + 1, last_used = ?1 WHERE id = ?2",
                params![now, key.id],
            ),
        })?;
        Ok(())
    }

    /// Active keys for a provider in insertion order.
    pub fn active_keys(&self, provider: Provider) -> Result<Vec<ApiKeyRecord>, AppError> {
        self.query_keys(
            "SELECT id, provider, credential, kind, models, active, usage_count, last_used, created_at \
             FROM provider_keys WHERE provider = ?1 AND active = 1 ORDER BY rowid",
            provider.id(),
        )
    }

    /// All keys (active and deactivated) for a provider.
    pub fn all_keys(&self, provider: Provider) -> Result<Vec<ApiKeyRecord>, AppError> {
        self.query_keys(
            "SELECT id, provider, credential, kind, models, active, usage_count, last_used, created_at \
             FROM provider_keys WHERE provider = ?1 ORDER BY rowid",
            provider.id(),
        )
    }

    fn query_keys(&self, sql: &str, provider: &str) -> Result<Vec<ApiKeyRecord>, AppError> {
        let keys = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params![provider], row_to_key)?;
            rows.collect::<Result<Vec<_>, _>>()
        })?;
        Ok(keys)
    }

    pub fn get_key(&self, id: &str) -> Result<Option<ApiKeyRecord>, AppError> {
        let key = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, provider, credential, kind, models, active, usage_count, last_used, created_at \
                 FROM provider_keys WHERE id = ?1",
                params![id],
                row_to_key,
            )
            .optional()
        })?;
        Ok(key)
    }

    /// Add a credential to the pool.
    pub fn add_key(&self, new_key: &NewKey) -> Result<ApiKeyRecord, AppError> {
        let provider: Provider = new_key.provider.parse().map_err(AppError::BadRequest)?;
        if new_key.credential.trim().is_empty() {
            return Err(AppError::BadRequest("Credential must not be empty".to_string()));
        }
        parse_patterns(&new_key.models).map_err(|e| AppError::BadRequest(e.to_string()))?;

        let id = format!("key_{}", Uuid::new_v4().simple());
        self.insert_key(&id, provider, new_key, false)?;
        info!(key_id = %id, provider = %provider, "Provider key added");
        self.get_key(&id)?
            .ok_or_else(|| AppError::Internal("Inserted key not found".to_string()))
    }

    fn insert_key(
        &self,
        id: &str,
        provider: Provider,
        key: &NewKey,
        ignore_existing: bool,
    ) -> Result<usize, AppError> {
        let models = serde_json::to_string(&key.models)?;
        let sql = if ignore_existing {
            "INSERT OR IGNORE INTO provider_keys (id, provider, credential, kind, models, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
        } else {
            "INSERT INTO provider_keys (id, provider, credential, kind, models, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
        };
        let n = self.db.with_conn(|conn| {
            conn.execute(
                sql,
                params![
                    id,
                    provider.id(),
                    key.credential,
                    key.kind.as_str(),
                    models,
                    unix_now()
                ],
            )
        })?;
        Ok(n)
    }

    /// Deactivate a key. Keys are never deleted. Returns false if unknown.
    pub fn deactivate_key(&self, id: &str) -> Result<bool, AppError> {
        let n = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE provider_keys SET active = 0 WHERE id = ?1",
                params![id],
            )
        })?;
        if n > 0 {
            info!(key_id = %id, "Provider key deactivated");
        }
        Ok(n > 0)
    }

    /// Import configured keys. Ids derive from (provider, credential), so
    /// re-running is a no-op for keys already present. Returns the number of
    /// keys inserted.
    pub fn seed(&self, keys: &[SeedKey]) -> Result<usize, AppError> {
        let mut inserted = 0;
        for seed in keys {
            let new_key = NewKey {
                provider: seed.provider.clone(),
                credential: seed.credential.clone(),
                kind: seed.kind,
                models: seed.models.clone(),
            };
            let provider: Provider = new_key.provider.parse().map_err(AppError::BadRequest)?;
            parse_patterns(&new_key.models).map_err(|e| AppError::BadRequest(e.to_string()))?;
            inserted += self.insert_key(&seed_id(provider, &new_key.credential), provider, &new_key, true)?;
        }
        if inserted > 0 {
            info!(count = inserted, "Seeded provider keys from configuration");
        }
        Ok(inserted)
    }

    /// Pool status per provider in the given scope.
    pub fn status(&self, scope: &RotationScope) -> Result<Vec<KeyPoolStatus>, AppError> {
        Provider::ALL
            .iter()
            .map(|&provider| {
                let keys = self.all_keys(provider)?;
                Ok(KeyPoolStatus {
                    provider: provider.id().to_string(),
                    strategy: self.strategy.to_string(),
                    scope: scope.label().to_string(),
                    cursor: self.counters.get(&scope.cursor_key(provider))?,
                    key_count: keys.len(),
                    active_keys: keys.iter().filter(|k| k.active).count(),
                })
            })
            .collect()
    }
}

fn seed_id(provider: Provider, credential: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.id().as_bytes());
    hasher.update(b":");
    hasher.update(credential.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("key_{}", &digest[..16])
}

fn row_to_key(row: &Row<'_>) -> rusqlite::Result<ApiKeyRecord> {
    let kind: String = row.get(3)?;
    let models: String = row.get(4)?;
    Ok(ApiKeyRecord {
        id: row.get(0)?,
        provider: row.get(1)?,
        credential: row.get(2)?,
        kind: kind.parse().unwrap_or_default(),
        models: serde_json::from_str(&models).unwrap_or_default(),
        active: row.get(5)?,
        usage_count: row.get(6)?,
        last_used: row.get(7)?,
        created_at: row.get(8)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
