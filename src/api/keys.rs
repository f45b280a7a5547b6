use axum::Extension;
use axum::Json;
use axum::extract::State;

use crate::AppState;
use crate::auth::BearerToken;
use crate::error::AppError;
use crate::providers::rotation::KeyPoolStatus;

/// GET /keys/status
///
/// Rotation cursor and key counts per provider, in the caller's scope.
pub async fn key_status(
    State(state): State<AppState>,
    Extension(token): Extension<BearerToken>,
) -> Result<Json<Vec<KeyPoolStatus>>, AppError> {
    Ok(Json(state.admission.key_status(token.as_str())?))
}
