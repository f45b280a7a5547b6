use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
}

/// GET /health
///
/// Liveness only. No authentication required.
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}
