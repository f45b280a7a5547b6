use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::AppState;
use crate::auth::BearerToken;
use crate::auth::keys::hash_token;
use crate::error::AppError;

/// Axum middleware that extracts the Bearer token from the Authorization
/// header and injects it into request extensions as [`BearerToken`].
///
/// Only presence and shape are checked here; the admission layer resolves the
/// token to a project.
pub async fn require_bearer(mut request: Request, next: Next) -> Result<Response, AppError> {
    let token = extract_bearer_token(&request)?;
    request.extensions_mut().insert(BearerToken(token));
    Ok(next.run(request).await)
}

/// Axum middleware guarding the `/admin` routes with the configured admin
/// token. The admin API is disabled when no token is configured.
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let expected = state
        .admin_token_hash
        .as_deref()
        .ok_or_else(|| AppError::Forbidden("Admin API is disabled".to_string()))?;

    let token = extract_bearer_token(&request)?;
    if hash_token(&token) != expected {
        tracing::warn!("Rejected admin request with invalid token");
        return Err(AppError::Unauthorized("Invalid admin token".to_string()));
    }

    Ok(next.run(request).await)
}

/// Extract the Bearer token from the Authorization header.
fn extract_bearer_token(request: &Request) -> Result<String, AppError> {
    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .ok_or_else(|| AppError::Unauthorized("Missing Authorization header".to_string()))?;

    let value = header
        .to_str()
        .map_err(|_| AppError::Unauthorized("Invalid Authorization header encoding".to_string()))?;

    let token = value
        .strip_prefix("Bearer ")
        .ok_or_else(|| {
            AppError::Unauthorized("Authorization header must use Bearer scheme".to_string())
        })?
        .trim();

    if token.is_empty() {
        return Err(AppError::Unauthorized("Empty Bearer token".to_string()));
    }

    Ok(token.to_string())
}
