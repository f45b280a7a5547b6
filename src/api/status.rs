use axum::Extension;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Serialize;

use crate::AppState;
use crate::admission::StatusView;
use crate::auth::BearerToken;
use crate::error::AppError;
use crate::ledger::{RequestRecord, RequestStatus};

/// Response body for `/result/{id}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultView {
    pub request_id: String,
    pub status: RequestStatus,
    pub provider: String,
    pub model: String,
    pub cost: f64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub latency_ms: u64,
    pub content: Option<String>,
    pub error: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

impl From<RequestRecord> for ResultView {
    fn from(record: RequestRecord) -> Self {
        Self {
            content: record.content(),
            request_id: record.id,
            status: record.status,
            provider: record.provider,
            model: record.model,
            cost: record.cost,
            prompt_tokens: record.prompt_tokens,
            completion_tokens: record.completion_tokens,
            latency_ms: record.latency_ms,
            error: record.error,
            created_at: record.created_at,
            completed_at: record.completed_at,
        }
    }
}

/// GET /status/{request_id}
pub async fn get_status(
    State(state): State<AppState>,
    Extension(token): Extension<BearerToken>,
    Path(request_id): Path<String>,
) -> Result<Json<StatusView>, AppError> {
    Ok(Json(state.admission.get_status(token.as_str(), &request_id)?))
}

/// GET /result/{request_id}
///
/// 200 once terminal, 202 while still pending.
pub async fn get_result(
    State(state): State<AppState>,
    Extension(token): Extension<BearerToken>,
    Path(request_id): Path<String>,
) -> Result<(StatusCode, Json<ResultView>), AppError> {
    let record = state.admission.get_result(token.as_str(), &request_id)?;
    let code = if record.status.is_terminal() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((code, Json(record.into())))
}
