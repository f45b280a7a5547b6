//! Gemini `generateContent` adapter.

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::rotation::{Credential, CredentialKind};
use super::{
    Completion, Provider, ProviderAdapter, ProviderError, ProviderInput, Usage, error_from_response,
    estimate_tokens, http_client,
};

const API_KEY_HEADER: &str = "x-goog-api-key";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u64>,
    candidates_token_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct GeminiAdapter {
    client: Client,
    base_url: String,
}

impl GeminiAdapter {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn build_request(input: &ProviderInput) -> GenerateRequest {
        let mut system = Vec::new();
        let mut contents = Vec::new();
        for msg in input.messages() {
            let part = Part {
                text: Some(msg.content),
            };
            match msg.role.as_str() {
                "system" => system.push(part),
                "assistant" | "model" => contents.push(Content {
                    role: Some("model".to_string()),
                    parts: vec![part],
                }),
                _ => contents.push(Content {
                    role: Some("user".to_string()),
                    parts: vec![part],
                }),
            }
        }
        GenerateRequest {
            contents,
            system_instruction: (!system.is_empty()).then_some(Content {
                role: None,
                parts: system,
            }),
        }
    }

    fn parse_response(
        response: GenerateResponse,
        input: &ProviderInput,
    ) -> Result<Completion, ProviderError> {
        let text: String = response
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .ok_or_else(|| {
                let reason = response
                    .prompt_feedback
                    .and_then(|f| f.block_reason)
                    .unwrap_or_else(|| "no candidates".to_string());
                ProviderError::Decode(format!("Gemini returned no content: {reason}"))
            })?;

        let reported = response.usage_metadata.and_then(|u| {
            Some(Usage {
                prompt_tokens: u.prompt_token_count?,
                completion_tokens: u.candidates_token_count.unwrap_or(0),
            })
        });
        let (usage, estimated) = match reported {
            Some(usage) => (usage, false),
            None => (
                Usage {
                    prompt_tokens: estimate_tokens(&input.prompt_text()),
                    completion_tokens: estimate_tokens(&text),
                },
                true,
            ),
        };

        Ok(Completion {
            content: text,
            usage,
            estimated,
        })
    }
}

impl ProviderAdapter for GeminiAdapter {
    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    fn invoke<'a>(
        &'a self,
        credential: &'a Credential,
        model: &'a str,
        input: &'a ProviderInput,
    ) -> BoxFuture<'a, Result<Completion, ProviderError>> {
        Box::pin(async move {
            let url = format!("{}/v1beta/models/{model}:generateContent", self.base_url);
            let mut req = self.client.post(&url).json(&Self::build_request(input));
            req = match credential.kind {
                CredentialKind::Query => req.query(&[("key", credential.value.as_str())]),
                CredentialKind::Bearer => req.header(API_KEY_HEADER, &credential.value),
            };

            let resp = req.send().await?;
            if !resp.status().is_success() {
                return Err(error_from_response(resp).await);
            }

            let body: GenerateResponse = resp
                .json()
                .await
                .map_err(|e| ProviderError::Decode(format!("Failed to parse Gemini response: {e}")))?;
            Self::parse_response(body, input)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
