use axum::Extension;
use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::admission::{SubmitOutcome, Submitted};
use crate::api::with_budget_warning;
use crate::auth::BearerToken;
use crate::error::AppError;
use crate::providers::{ChatMessage, ProviderInput};

const DEFAULT_AUDIO_FORMAT: &str = "mp3";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub messages: Option<Vec<ChatMessage>>,
    /// Base64-encoded audio clip.
    #[serde(default)]
    pub audio: Option<String>,
    #[serde(default)]
    pub audio_format: Option<String>,
    /// Accepted for compatibility; responses are never streamed.
    #[serde(default)]
    pub stream: bool,
}

impl AskRequest {
    /// Audio wins over messages, messages over a bare prompt.
    pub fn into_input(self) -> Result<(String, ProviderInput), AppError> {
        let input = if let Some(audio) = self.audio {
            let bytes = BASE64
                .decode(audio.trim())
                .map_err(|e| AppError::BadRequest(format!("audio is not valid base64: {e}")))?;
            ProviderInput::Audio {
                bytes,
                format: self
                    .audio_format
                    .unwrap_or_else(|| DEFAULT_AUDIO_FORMAT.to_string()),
            }
        } else if let Some(messages) = self.messages.filter(|m| !m.is_empty()) {
            ProviderInput::Chat { messages }
        } else if let Some(prompt) = self.input {
            ProviderInput::Text { prompt }
        } else {
            return Err(AppError::BadRequest(
                "input, messages or audio is required".to_string(),
            ));
        };
        Ok((self.model, input))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub request_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResponseBody {
    pub request_id: String,
    pub content: String,
    pub cached: bool,
    pub model: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedResponse {
    pub content: String,
    pub request_id: String,
}

/// POST /ask
pub async fn ask(
    State(state): State<AppState>,
    Extension(token): Extension<BearerToken>,
    body: Result<Json<AskRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = body.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let (model, input) = request.into_input()?;

    let submitted = state
        .admission
        .submit(token.as_str(), &model, input)
        .await?;
    Ok(submitted_response(submitted))
}

/// Map an admission result onto its HTTP response.
pub(crate) fn submitted_response(submitted: Submitted) -> Response {
    let response = match submitted.outcome {
        SubmitOutcome::Accepted { request_id } => {
            (StatusCode::ACCEPTED, Json(AcceptedResponse { request_id })).into_response()
        }
        SubmitOutcome::Cached {
            request_id,
            content,
            model,
        } => Json(CachedResponseBody {
            request_id,
            content,
            cached: true,
            model,
        })
        .into_response(),
        SubmitOutcome::Completed {
            request_id,
            content,
        } => Json(CompletedResponse {
            content,
            request_id,
        })
        .into_response(),
    };
    with_budget_warning(response, submitted.budget_warning.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> AskRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_prompt_input() {
        let (model, input) = parse(r#"{"model":"gemini-2.5-flash","input":"hello","stream":true}"#)
            .into_input()
            .unwrap();
        assert_eq!(model, "gemini-2.5-flash");
        assert!(matches!(input, ProviderInput::Text { ref prompt } if prompt == "hello"));
    }

    #[test]
    fn test_messages_win_over_input() {
        let (_, input) = parse(
            r#"{"model":"gpt-4o","input":"ignored","messages":[{"role":"user","content":"hi"}]}"#,
        )
        .into_input()
        .unwrap();
        assert!(matches!(input, ProviderInput::Chat { ref messages } if messages.len() == 1));
    }

    #[test]
    fn test_audio_is_decoded() {
        let (_, input) = parse(r#"{"model":"","audio":"AAEC","audioFormat":"wav"}"#)
            .into_input()
            .unwrap();
        match input {
            ProviderInput::Audio { bytes, format } => {
                assert_eq!(bytes, vec![0, 1, 2]);
                assert_eq!(format, "wav");
            }
            other => panic!("unexpected input {other:?}"),
        }
    }

    #[test]
    fn test_bad_base64_and_missing_input() {
        assert!(matches!(
            parse(r#"{"model":"m","audio":"***"}"#).into_input(),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            parse(r#"{"model":"m"}"#).into_input(),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn test_accepted_is_202() {
        let response = submitted_response(Submitted {
            outcome: SubmitOutcome::Accepted {
                request_id: "req_1".into(),
            },
            budget_warning: Some("warning: 85% of monthly budget used".into()),
        });
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(response.headers().contains_key("x-budget-warning"));
    }
}
