//! Project registry: provisioning, token lookup and deactivation.

use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::keys::{generate_project_token, hash_token};
use crate::config::Config;
use crate::db::Database;
use crate::error::AppError;
use crate::limits::RateLimits;
use crate::providers::pattern::{matches_any, parse_patterns};
use crate::store::unix_now;

/// A gateway tenant.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(skip)]
    pub token_hash: String,
    pub monthly_budget: f64,
    pub current_usage: f64,
    pub allowed_models: Vec<String>,
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub requests_per_day: u32,
    pub active: bool,
    pub created_at: i64,
}

impl Project {
    pub fn allows_model(&self, model: &str) -> bool {
        matches_any(&self.allowed_models, model)
    }

    pub fn rate_limits(&self) -> RateLimits {
        RateLimits {
            per_minute: self.requests_per_minute,
            per_hour: self.requests_per_hour,
            per_day: self.requests_per_day,
        }
    }
}

/// Provisioning request. Unset fields take the configured defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProject {
    pub name: String,
    pub monthly_budget: Option<f64>,
    pub allowed_models: Option<Vec<String>>,
    pub requests_per_minute: Option<u32>,
    pub requests_per_hour: Option<u32>,
    pub requests_per_day: Option<u32>,
}

/// Defaults applied by [`ProjectRegistry::create`].
#[derive(Debug, Clone)]
pub struct ProjectDefaults {
    pub monthly_budget: f64,
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub requests_per_day: u32,
}

impl ProjectDefaults {
    pub fn from_config(config: &Config) -> Self {
        Self {
            monthly_budget: config.budget.default_monthly_budget,
            requests_per_minute: config.limits.requests_per_minute,
            requests_per_hour: config.limits.requests_per_hour,
            requests_per_day: config.limits.requests_per_day,
        }
    }
}

impl Default for ProjectDefaults {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Clone)]
pub struct ProjectRegistry {
    db: Database,
    defaults: ProjectDefaults,
}

const PROJECT_COLUMNS: &str = "id, name, token_hash, monthly_budget, current_usage, allowed_models, \
     rpm_limit, rph_limit, rpd_limit, active, created_at";

impl ProjectRegistry {
    pub fn new(db: Database, defaults: ProjectDefaults) -> Self {
        Self { db, defaults }
    }

    /// Provision a project with a freshly generated token. The plaintext token
    /// is returned here and nowhere else.
    pub fn create(&self, new: &NewProject) -> Result<(Project, String), AppError> {
        let token = generate_project_token();
        let project = self.create_with_token(new, &token)?;
        Ok((project, token))
    }

    /// Provision a project for a caller-chosen token.
    pub fn create_with_token(&self, new: &NewProject, token: &str) -> Result<Project, AppError> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(AppError::BadRequest("Project name is required".to_string()));
        }
        if token.trim().is_empty() {
            return Err(AppError::BadRequest("Project token must not be empty".to_string()));
        }

        let allowed_models = new
            .allowed_models
            .clone()
            .unwrap_or_else(|| vec!["*".to_string()]);
        parse_patterns(&allowed_models).map_err(|e| AppError::BadRequest(e.to_string()))?;

        let monthly_budget = new.monthly_budget.unwrap_or(self.defaults.monthly_budget);
        if !monthly_budget.is_finite() || monthly_budget < 0.0 {
            return Err(AppError::BadRequest(
                "monthlyBudget must be a non-negative number".to_string(),
            ));
        }

        let rpm = new
            .requests_per_minute
            .unwrap_or(self.defaults.requests_per_minute);
        if rpm == 0 {
            return Err(AppError::BadRequest(
                "requestsPerMinute must be at least 1".to_string(),
            ));
        }
        let rph = new.requests_per_hour.unwrap_or(self.defaults.requests_per_hour);
        let rpd = new.requests_per_day.unwrap_or(self.defaults.requests_per_day);

        let id = format!("proj_{}", Uuid::new_v4().simple());
        let models_json = serde_json::to_string(&allowed_models)?;
        let created_at = unix_now();

        self.db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO projects (id, name, token_hash, monthly_budget, current_usage, \
                     allowed_models, rpm_limit, rph_limit, rpd_limit, active, created_at) \
                     VALUES (?1, ?2, ?3, ?4, 0.0, ?5, ?6, ?7, ?8, 1, ?9)",
                    params![
                        id,
                        name,
                        hash_token(token),
                        monthly_budget,
                        models_json,
                        rpm,
                        rph,
                        rpd,
                        created_at
                    ],
                )
            })
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    AppError::BadRequest("Token already in use".to_string())
                }
                other => other.into(),
            })?;

        tracing::info!(project_id = %id, name, "Project created");
        self.get(&id)?
            .ok_or_else(|| AppError::Internal("Inserted project not found".to_string()))
    }

    pub fn get(&self, id: &str) -> Result<Option<Project>, AppError> {
        let sql = format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1");
        let project = self
            .db
            .with_conn(|conn| conn.query_row(&sql, params![id], row_to_project).optional())?;
        Ok(project)
    }

    /// Look up a project by the hash of a presented token.
    pub fn find_by_token(&self, token: &str) -> Result<Option<Project>, AppError> {
        let sql = format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE token_hash = ?1");
        let hash = hash_token(token);
        let project = self
            .db
            .with_conn(|conn| conn.query_row(&sql, params![hash], row_to_project).optional())?;
        Ok(project)
    }

    /// Resolve a token to an active project or fail with `Unauthorized`.
    pub fn authenticate(&self, token: &str) -> Result<Project, AppError> {
        match self.find_by_token(token)? {
            Some(project) if project.active => Ok(project),
            Some(_) => Err(AppError::Unauthorized("Project is deactivated".to_string())),
            None => Err(AppError::Unauthorized("Invalid project token".to_string())),
        }
    }

    pub fn list(&self) -> Result<Vec<Project>, AppError> {
        let sql = format!("SELECT {PROJECT_COLUMNS} FROM projects ORDER BY created_at, id");
        let projects = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], row_to_project)?;
            rows.collect::<Result<Vec<_>, _>>()
        })?;
        Ok(projects)
    }

    /// Deactivate a project. Projects are never deleted.
    pub fn deactivate(&self, id: &str) -> Result<(), AppError> {
        let n = self.db.with_conn(|conn| {
            conn.execute("UPDATE projects SET active = 0 WHERE id = ?1", params![id])
        })?;
        if n == 0 {
            return Err(AppError::NotFound(format!("Project not found: {id}")));
        }
        tracing::info!(project_id = %id, "Project deactivated");
        Ok(())
    }
}

fn row_to_project(row: &Row<'_>) -> rusqlite::Result<Project> {
    let models: String = row.get(5)?;
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        token_hash: row.get(2)?,
        monthly_budget: row.get(3)?,
        current_usage: row.get(4)?,
        allowed_models: serde_json::from_str(&models).unwrap_or_default(),
        requests_per_minute: row.get(6)?,
        requests_per_hour: row.get(7)?,
        requests_per_day: row.get(8)?,
        active: row.get(9)?,
        created_at: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ProjectRegistry {
        ProjectRegistry::new(Database::open_in_memory().unwrap(), ProjectDefaults::default())
    }

    fn named(name: &str) -> NewProject {
        NewProject {
            name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_applies_defaults() {
        let reg = registry();
        let (project, token) = reg.create(&named("alpha")).unwrap();
        assert!(token.starts_with("sk-tg-"));
        assert_eq!(project.allowed_models, vec!["*"]);
        assert_eq!(project.requests_per_minute, 60);
        assert_eq!(project.requests_per_hour, 0);
        assert_eq!(project.current_usage, 0.0);
        assert!(project.active);
        assert_eq!(project.token_hash, hash_token(&token));
    }

    #[test]
    fn test_authenticate_by_token() {
        let reg = registry();
        let created = reg.create_with_token(&named("beta"), "abc").unwrap();
        let found = reg.authenticate("abc").unwrap();
        assert_eq!(found.id, created.id);
        assert!(matches!(reg.authenticate("abd"), Err(AppError::Unauthorized(_))));
    }

    #[test]
    fn test_raw_token_is_not_stored() {
        let reg = registry();
        reg.create_with_token(&named("gamma"), "super-secret-token").unwrap();
        let stored: String = reg
            .db
            .with_conn(|conn| conn.query_row("SELECT token_hash FROM projects", [], |r| r.get(0)))
            .unwrap();
        assert_ne!(stored, "super-secret-token");
        assert_eq!(stored, hash_token("super-secret-token"));
    }

    #[test]
    fn test_deactivated_project_cannot_authenticate() {
        let reg = registry();
        let p = reg.create_with_token(&named("delta"), "tok").unwrap();
        reg.deactivate(&p.id).unwrap();
        assert!(matches!(reg.authenticate("tok"), Err(AppError::Unauthorized(_))));
        // Still listed.
        assert_eq!(reg.list().unwrap().len(), 1);
        assert!(matches!(reg.deactivate("proj_missing"), Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_duplicate_token_rejected() {
        let reg = registry();
        reg.create_with_token(&named("one"), "same").unwrap();
        assert!(matches!(
            reg.create_with_token(&named("two"), "same"),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn test_validation() {
        let reg = registry();
        assert!(reg.create(&named("  ")).is_err());
        let bad_models = NewProject {
            allowed_models: Some(vec!["gpt*4".into()]),
            ..named("x")
        };
        assert!(reg.create(&bad_models).is_err());
        let negative = NewProject {
            monthly_budget: Some(-1.0),
            ..named("x")
        };
        assert!(reg.create(&negative).is_err());
        let zero_rpm = NewProject {
            requests_per_minute: Some(0),
            ..named("x")
        };
        assert!(reg.create(&zero_rpm).is_err());
    }

    #[test]
    fn test_allows_model() {
        let reg = registry();
        let p = reg
            .create(&NewProject {
                allowed_models: Some(vec!["gemini-*".into(), "gpt-4o".into()]),
                ..named("scoped")
            })
            .unwrap()
            .0;
        assert!(p.allows_model("gemini-2.5-flash"));
        assert!(p.allows_model("gpt-4o"));
        assert!(!p.allows_model("gpt-4o-mini"));
    }
}
