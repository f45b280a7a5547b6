//! OpenAI-compatible audio transcription adapter (Groq by default).

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use super::rotation::{Credential, CredentialKind};
use super::{
    Completion, Provider, ProviderAdapter, ProviderError, ProviderInput, Usage,
    error_from_response, estimate_tokens, http_client,
};

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

pub struct TranscriptionAdapter {
    client: Client,
    base_url: String,
}

impl TranscriptionAdapter {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

/// MIME type for an audio format name or file extension.
pub fn mime_for_format(format: &str) -> &'static str {
    match format.trim_start_matches('.').to_ascii_lowercase().as_str() {
        "mp3" | "mpeg" | "mpga" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" | "oga" | "opus" => "audio/ogg",
        "webm" => "audio/webm",
        "flac" => "audio/flac",
        "m4a" | "mp4" => "audio/mp4",
        _ => "application/octet-stream",
    }
}

impl ProviderAdapter for TranscriptionAdapter {
    fn provider(&self) -> Provider {
        Provider::Groq
    }

    fn invoke<'a>(
        &'a self,
        credential: &'a Credential,
        model: &'a str,
        input: &'a ProviderInput,
    ) -> BoxFuture<'a, Result<Completion, ProviderError>> {
        Box::pin(async move {
            let ProviderInput::Audio { bytes, format } = input else {
                return Err(ProviderError::Other(
                    "Transcription requires an audio payload".to_string(),
                ));
            };

            let file = Part::bytes(bytes.clone())
                .file_name(format!("audio.{format}"))
                .mime_str(mime_for_format(format))?;
            let form = Form::new()
                .part("file", file)
                .text("model", model.to_string())
                .text("response_format", "json");

            let url = format!("{}/v1/audio/transcriptions", self.base_url);
            let mut req = self.client.post(&url).multipart(form);
            req = match credential.kind {
                CredentialKind::Bearer => req.bearer_auth(&credential.value),
                CredentialKind::Query => req.query(&[("api-key", credential.value.as_str())]),
            };

            let resp = req.send().await?;
            if !resp.status().is_success() {
                return Err(error_from_response(resp).await);
            }

            let parsed: TranscriptionResponse = resp.json().await.map_err(|e| {
                ProviderError::Decode(format!("Failed to parse transcription response: {e}"))
            })?;

            let usage = Usage {
                prompt_tokens: 0,
                completion_tokens: estimate_tokens(&parsed.text),
            };
            Ok(Completion {
                content: parsed.text,
                usage,
                estimated: true,
            })
        })
    }
}
