use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::auth::projects::{NewProject, Project};
use crate::cache::CacheStatsSnapshot;
use crate::error::AppError;
use crate::ledger::ProjectUsage;
use crate::providers::rotation::{ApiKeyRecord, NewKey};

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedProjectResponse {
    pub project: Project,
    /// The plaintext project token. Shown exactly once.
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrectUsageRequest {
    pub current_usage: f64,
}

#[derive(Debug, Serialize)]
pub struct DeactivatedResponse {
    pub deactivated: bool,
}

#[derive(Debug, Serialize)]
pub struct FlushedResponse {
    pub flushed: usize,
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    body.map(|Json(inner)| inner)
        .map_err(|e| AppError::BadRequest(e.body_text()))
}

// ---------------------------------------------------------------------------
// Projects
// ---------------------------------------------------------------------------

/// POST /admin/projects
pub async fn create_project(
    State(state): State<AppState>,
    body: Result<Json<NewProject>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatedProjectResponse>), AppError> {
    let new_project = json_body(body)?;
    let (project, token) = state.projects.create(&new_project)?;
    Ok((
        StatusCode::CREATED,
        Json(CreatedProjectResponse { project, token }),
    ))
}

/// GET /admin/projects
pub async fn list_projects(State(state): State<AppState>) -> Result<Json<Vec<Project>>, AppError> {
    Ok(Json(state.projects.list()?))
}

/// POST /admin/projects/{id}/deactivate
pub async fn deactivate_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeactivatedResponse>, AppError> {
    state.projects.deactivate(&id)?;
    Ok(Json(DeactivatedResponse { deactivated: true }))
}

/// PUT /admin/projects/{id}/usage
///
/// Administrative correction of accumulated usage.
pub async fn correct_usage(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<CorrectUsageRequest>, JsonRejection>,
) -> Result<Json<Project>, AppError> {
    let request = json_body(body)?;
    state.budget.correct_usage(&id, request.current_usage)?;
    let project = state
        .projects
        .get(&id)?
        .ok_or_else(|| AppError::NotFound(format!("Project not found: {id}")))?;
    Ok(Json(project))
}

// ---------------------------------------------------------------------------
// Provider keys
// ---------------------------------------------------------------------------

/// POST /admin/keys
pub async fn add_key(
    State(state): State<AppState>,
    body: Result<Json<NewKey>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiKeyRecord>), AppError> {
    let new_key = json_body(body)?;
    let record = state.rotation.add_key(&new_key)?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// DELETE /admin/keys/{id}
///
/// Keys are deactivated, never deleted.
pub async fn deactivate_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeactivatedResponse>, AppError> {
    if !state.rotation.deactivate_key(&id)? {
        return Err(AppError::NotFound(format!("Key not found: {id}")));
    }
    Ok(Json(DeactivatedResponse { deactivated: true }))
}

// ---------------------------------------------------------------------------
// Usage & cache
// ---------------------------------------------------------------------------

/// GET /admin/usage
pub async fn usage_summary(
    State(state): State<AppState>,
) -> Result<Json<Vec<ProjectUsage>>, AppError> {
    Ok(Json(state.ledger.usage_summary()?))
}

/// GET /admin/cache/stats
pub async fn cache_stats(State(state): State<AppState>) -> Json<CacheStatsSnapshot> {
    Json(state.cache.stats())
}

/// DELETE /admin/cache
pub async fn flush_cache(State(state): State<AppState>) -> Result<Json<FlushedResponse>, AppError> {
    let flushed = state.cache.flush()?;
    Ok(Json(FlushedResponse { flushed }))
}
