pub mod admin;
pub mod ask;
pub mod health;
pub mod keys;
pub mod status;
pub mod upload;

use axum::Router;
use axum::http::HeaderValue;
use axum::middleware;
use axum::response::Response;
use axum::routing::{delete, get, post, put};

use crate::AppState;
use crate::auth::middleware::{require_admin, require_bearer};

/// Header carrying the budget threshold notice on admitted requests.
pub const BUDGET_WARNING_HEADER: &str = "x-budget-warning";

/// Build the full API router with all endpoint groups.
///
/// Route layout:
/// ```text
/// /health                          GET    (no auth)
/// /ask                             POST   (project token)
/// /upload                          POST   (project token)
/// /status/{id}                     GET    (project token)
/// /result/{id}                     GET    (project token)
/// /keys/status                     GET    (project token)
/// /admin/projects                  POST   (admin)
/// /admin/projects                  GET    (admin)
/// /admin/projects/{id}/deactivate  POST   (admin)
/// /admin/projects/{id}/usage       PUT    (admin)
/// /admin/keys                      POST   (admin)
/// /admin/keys/{id}                 DELETE (admin)
/// /admin/usage                     GET    (admin)
/// /admin/cache/stats               GET    (admin)
/// /admin/cache                     DELETE (admin)
/// ```
pub fn build_api_router(state: &AppState) -> Router<AppState> {
    let project_routes = Router::new()
        .route("/ask", post(ask::ask))
        .route("/upload", post(upload::upload))
        .route("/status/{id}", get(status::get_status))
        .route("/result/{id}", get(status::get_result))
        .route("/keys/status", get(keys::key_status))
        .layer(middleware::from_fn(require_bearer));

    let admin_routes = Router::new()
        .route("/projects", post(admin::create_project))
        .route("/projects", get(admin::list_projects))
        .route("/projects/{id}/deactivate", post(admin::deactivate_project))
        .route("/projects/{id}/usage", put(admin::correct_usage))
        .route("/keys", post(admin::add_key))
        .route("/keys/{id}", delete(admin::deactivate_key))
        .route("/usage", get(admin::usage_summary))
        .route("/cache/stats", get(admin::cache_stats))
        .route("/cache", delete(admin::flush_cache))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/health", get(health::health_check))
        .merge(project_routes)
        .nest("/admin", admin_routes)
}

/// Attach `X-Budget-Warning` when a warning applies.
pub(crate) fn with_budget_warning(mut response: Response, warning: Option<&str>) -> Response {
    if let Some(value) = warning.and_then(|w| HeaderValue::from_str(w).ok()) {
        response.headers_mut().insert(BUDGET_WARNING_HEADER, value);
    }
    response
}
