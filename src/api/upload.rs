use axum::Extension;
use axum::extract::State;
use axum::extract::multipart::{Multipart, MultipartRejection};
use axum::response::Response;

use crate::AppState;
use crate::api::ask::submitted_response;
use crate::auth::BearerToken;
use crate::error::AppError;

/// POST /upload
///
/// Multipart form with a `file` part and an optional `model` part. The clip is
/// transcribed synchronously.
pub async fn upload(
    State(state): State<AppState>,
    Extension(token): Extension<BearerToken>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, AppError> {
    let mut multipart = multipart.map_err(|e| AppError::BadRequest(e.body_text()))?;

    let mut file: Option<(Vec<u8>, String)> = None;
    let mut model: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.body_text()))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("file") => {
                let format = audio_format(field.file_name(), field.content_type());
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(e.body_text()))?;
                file = Some((bytes.to_vec(), format));
            }
            Some("model") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(e.body_text()))?;
                model = Some(text);
            }
            _ => {}
        }
    }

    let (bytes, format) =
        file.ok_or_else(|| AppError::BadRequest("file part is required".to_string()))?;
    let submitted = state
        .admission
        .submit_audio(token.as_str(), model.as_deref(), bytes, &format)
        .await?;
    Ok(submitted_response(submitted))
}

/// Format from the file extension, then the content type, defaulting to mp3.
fn audio_format(file_name: Option<&str>, content_type: Option<&str>) -> String {
    if let Some(ext) = file_name
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
    {
        return ext;
    }
    match content_type.and_then(|ct| ct.strip_prefix("audio/")) {
        Some("mpeg") => "mp3".to_string(),
        Some("x-wav") | Some("wave") => "wav".to_string(),
        Some(sub) if !sub.is_empty() => sub.to_string(),
        _ => "mp3".to_string(),
    }
}
