use rusqlite::params;

use crate::auth::projects::Project;
use crate::budget::{BudgetCheck, BudgetLevel};
use crate::config::BudgetConfig;
use crate::db::Database;
use crate::error::AppError;

/// Compares project usage against the monthly allowance and applies charges.
///
/// Usage only ever grows through [`record_usage`](Self::record_usage);
/// [`correct_usage`](Self::correct_usage) is the single administrative way
/// to set it to an arbitrary value.
pub struct BudgetGuard {
    db: Database,
    enabled: bool,
    warning_fraction: f64,
    emergency_fraction: f64,
}

impl BudgetGuard {
    pub fn new(db: Database, config: &BudgetConfig) -> Self {
        Self {
            db,
            enabled: config.enabled,
            warning_fraction: f64::from(config.warning_threshold_percent) / 100.0,
            emergency_fraction: f64::from(config.emergency_threshold_percent) / 100.0,
        }
    }

    /// Read-only check against a project snapshot.
    pub fn check(&self, project: &Project) -> BudgetCheck {
        if !self.enabled {
            return BudgetCheck {
                within_budget: true,
                usage_fraction: 0.0,
                level: BudgetLevel::Ok,
            };
        }
        let check = evaluate(
            project.current_usage,
            project.monthly_budget,
            self.warning_fraction,
            self.emergency_fraction,
        );
        match check.level {
            BudgetLevel::Warning | BudgetLevel::Emergency => tracing::warn!(
                project_id = %project.id,
                level = ?check.level,
                usage = project.current_usage,
                budget = project.monthly_budget,
                "Project budget threshold crossed"
            ),
            BudgetLevel::Exceeded => tracing::warn!(
                project_id = %project.id,
                usage = project.current_usage,
                budget = project.monthly_budget,
                "Project budget exceeded"
            ),
            BudgetLevel::Ok => {}
        }
        check
    }

    /// Add `cost` to the project's usage as a single additive update.
    pub fn record_usage(&self, project_id: &str, cost: f64) -> Result<(), AppError> {
        if !cost.is_finite() || cost < 0.0 {
            return Err(AppError::BadRequest(format!("Invalid usage charge: {cost}")));
        }
        if cost == 0.0 {
            return Ok(());
        }
        let n = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE projects SET current_usage = current_usage + ?1 WHERE id = ?2",
                params![cost, project_id],
            )
        })?;
        if n == 0 {
            return Err(AppError::NotFound(format!("Project not found: {project_id}")));
        }
        tracing::debug!(project_id, cost, "Recorded project usage");
        Ok(())
    }

    /// Administrative override of a project's accumulated usage.
    pub fn correct_usage(&self, project_id: &str, usage: f64) -> Result<(), AppError> {
        if !usage.is_finite() || usage < 0.0 {
            return Err(AppError::BadRequest(
                "currentUsage must be a non-negative number".to_string(),
            ));
        }
        let n = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE projects SET current_usage = ?1 WHERE id = ?2",
                params![usage, project_id],
            )
        })?;
        if n == 0 {
            return Err(AppError::NotFound(format!("Project not found: {project_id}")));
        }
        tracing::info!(project_id, usage, "Project usage corrected");
        Ok(())
    }
}

/// Classify `usage` against `budget`. Exceeded is `usage >= budget`, so a zero
/// budget admits nothing.
pub fn evaluate(usage: f64, budget: f64, warning: f64, emergency: f64) -> BudgetCheck {
    let usage_fraction = if budget > 0.0 {
        usage / budget
    } else if usage > 0.0 {
        f64::INFINITY
    } else {
        1.0
    };

    let level = if usage >= budget {
        BudgetLevel::Exceeded
    } else if usage_fraction >= emergency {
        BudgetLevel::Emergency
    } else if usage_fraction >= warning {
        BudgetLevel::Warning
    } else {
        BudgetLevel::Ok
    };

    BudgetCheck {
        within_budget: level != BudgetLevel::Exceeded,
        usage_fraction,
        level,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
