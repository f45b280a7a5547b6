//! Usage ledger: one row per dispatched request.
//!
//! Rows are created `PENDING` at admission and finalized exactly once. A
//! finalize against a row that is already terminal changes nothing.

use std::fmt;
use std::str::FromStr;

use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;

use crate::db::Database;
use crate::error::AppError;
use crate::providers::{Completion, Provider, Usage};
use crate::store::unix_now;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Success,
    Error,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "SUCCESS" => Ok(Self::Success),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown request status: {other}")),
        }
    }
}

/// A ledger row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub id: String,
    pub project_id: String,
    pub status: RequestStatus,
    pub provider: String,
    pub model: String,
    pub cost: f64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub latency_ms: u64,
    pub request_body: String,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

impl RequestRecord {
    /// Completion text from the stored response body, if the request succeeded.
    pub fn content(&self) -> Option<String> {
        let body = self.response_body.as_deref()?;
        serde_json::from_str::<Completion>(body)
            .ok()
            .map(|c| c.content)
    }
}

/// Terminal state written by [`Ledger::finalize`].
#[derive(Debug, Clone)]
pub struct Outcome {
    pub status: RequestStatus,
    pub provider: Option<Provider>,
    pub cost: f64,
    pub usage: Usage,
    pub latency_ms: u64,
    pub response_body: Option<String>,
    pub error: Option<String>,
}

impl Outcome {
    pub fn success(
        provider: Provider,
        completion: &Completion,
        cost: f64,
        latency_ms: u64,
    ) -> Result<Self, AppError> {
        Ok(Self {
            status: RequestStatus::Success,
            provider: Some(provider),
            cost,
            usage: completion.usage,
            latency_ms,
            response_body: Some(serde_json::to_string(completion)?),
            error: None,
        })
    }

    /// A failed request is never charged.
    pub fn failure(provider: Option<Provider>, message: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            status: RequestStatus::Error,
            provider,
            cost: 0.0,
            usage: Usage::default(),
            latency_ms,
            response_body: None,
            error: Some(message.into()),
        }
    }
}

/// Per-project totals for the admin usage report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectUsage {
    pub project_id: String,
    pub requests: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub pending: u64,
    pub total_cost: f64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

const RECORD_COLUMNS: &str = "id, project_id, status, provider, model, cost, prompt_tokens, \
     completion_tokens, latency_ms, request_body, response_body, error, created_at, completed_at";

#[derive(Clone)]
pub struct Ledger {
    db: Database,
}

impl Ledger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a `PENDING` row.
    pub fn create_pending(
        &self,
        id: &str,
        project_id: &str,
        model: &str,
        request_body: &str,
    ) -> Result<(), AppError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO requests (id, project_id, status, model, request_body, created_at) \
                 VALUES (?1, ?2, 'PENDING', ?3, ?4, ?5)",
                params![id, project_id, model, request_body, unix_now()],
            )
        })?;
        Ok(())
    }

    /// Move a `PENDING` row to its terminal state. Returns false when the row
    /// was missing or already terminal, in which case nothing was written.
    pub fn finalize(&self, id: &str, outcome: &Outcome) -> Result<bool, AppError> {
        let provider = outcome.provider.map(|p| p.id()).unwrap_or_default();
        let n = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE requests SET status = ?1, provider = ?2, cost = ?3, prompt_tokens = ?4, \
                 completion_tokens = ?5, latency_ms = ?6, response_body = ?7, error = ?8, \
                 completed_at = ?9 \
                 WHERE id = ?10 AND status = 'PENDING'",
                params![
                    outcome.status.as_str(),
                    provider,
                    outcome.cost,
                    outcome.usage.prompt_tokens,
                    outcome.usage.completion_tokens,
                    outcome.latency_ms,
                    outcome.response_body,
                    outcome.error,
                    unix_now(),
                    id
                ],
            )
        })?;
        if n == 0 {
            tracing::warn!(request_id = id, "Finalize skipped: record missing or already terminal");
        }
        Ok(n > 0)
    }

    pub fn get(&self, id: &str) -> Result<Option<RequestRecord>, AppError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM requests WHERE id = ?1");
        let record = self
            .db
            .with_conn(|conn| conn.query_row(&sql, params![id], row_to_record).optional())?;
        Ok(record)
    }

    /// Look up a row owned by `project_id`. Rows of other projects are
    /// indistinguishable from missing ones.
    pub fn get_for_project(
        &self,
        project_id: &str,
        id: &str,
    ) -> Result<Option<RequestRecord>, AppError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM requests WHERE id = ?1 AND project_id = ?2");
        let record = self.db.with_conn(|conn| {
            conn.query_row(&sql, params![id, project_id], row_to_record)
                .optional()
        })?;
        Ok(record)
    }

    /// Totals per project, ordered by project id.
    pub fn usage_summary(&self) -> Result<Vec<ProjectUsage>, AppError> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT project_id, COUNT(*), \
                 SUM(CASE WHEN status = 'SUCCESS' THEN 1 ELSE 0 END), \
                 SUM(CASE WHEN status = 'ERROR' THEN 1 ELSE 0 END), \
                 SUM(CASE WHEN status = 'PENDING' THEN 1 ELSE 0 END), \
                 COALESCE(SUM(cost), 0.0), COALESCE(SUM(prompt_tokens), 0), \
                 COALESCE(SUM(completion_tokens), 0) \
                 FROM requests GROUP BY project_id ORDER BY project_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(ProjectUsage {
                    project_id: row.get(0)?,
                    requests: row.get(1)?,
                    succeeded: row.get(2)?,
                    failed: row.get(3)?,
                    pending: row.get(4)?,
                    total_cost: row.get(5)?,
                    prompt_tokens: row.get(6)?,
                    completion_tokens: row.get(7)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()
        })?;
        Ok(rows)
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<RequestRecord> {
    let status: String = row.get(2)?;
    let status = status.parse::<RequestStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(RequestRecord {
        id: row.get(0)?,
        project_id: row.get(1)?,
        status,
        provider: row.get(3)?,
        model: row.get(4)?,
        cost: row.get(5)?,
        prompt_tokens: row.get(6)?,
        completion_tokens: row.get(7)?,
        latency_ms: row.get(8)?,
        request_body: row.get(9)?,
        response_body: row.get(10)?,
        error: row.get(11)?,
        created_at: row.get(12)?,
        completed_at: row.get(13)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
