//! OpenAI-compatible chat completions adapter.

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::rotation::{Credential, CredentialKind};
use super::{
    ChatMessage, Completion, Provider, ProviderAdapter, ProviderError, ProviderInput, Usage,
    error_from_response, estimate_tokens, http_client,
};

/// Namespace accepted on model ids and removed before the upstream call.
const MODEL_NAMESPACE: &str = "openai/";

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<OaiUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OaiUsage {
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

pub struct OpenAiAdapter {
    client: Client,
    base_url: String,
}

impl OpenAiAdapter {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Model id as sent upstream.
    pub fn upstream_model(model: &str) -> &str {
        model.strip_prefix(MODEL_NAMESPACE).unwrap_or(model)
    }
}

impl ProviderAdapter for OpenAiAdapter {
    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    fn invoke<'a>(
        &'a self,
        credential: &'a Credential,
        model: &'a str,
        input: &'a ProviderInput,
    ) -> BoxFuture<'a, Result<Completion, ProviderError>> {
        Box::pin(async move {
            let url = format!("{}/v1/chat/completions", self.base_url);
            let body = ChatCompletionRequest {
                model: Self::upstream_model(model),
                messages: input.messages(),
            };

            let mut req = self.client.post(&url).json(&body);
            req = match credential.kind {
                CredentialKind::Bearer => req.bearer_auth(&credential.value),
                CredentialKind::Query => req.query(&[("api-key", credential.value.as_str())]),
            };

            let resp = req.send().await?;
            if !resp.status().is_success() {
                return Err(error_from_response(resp).await);
            }

            let parsed: ChatCompletionResponse = resp.json().await.map_err(|e| {
                ProviderError::Decode(format!("Failed to parse chat completion response: {e}"))
            })?;

            let content = parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message)
                .and_then(|m| m.content)
                .ok_or_else(|| ProviderError::Decode("Response contained no choices".to_string()))?;

            let (usage, estimated) = match parsed.usage {
                Some(u) => (
                    Usage {
                        prompt_tokens: u.prompt_tokens,
                        completion_tokens: u.completion_tokens,
                    },
                    false,
                ),
                None => (
                    Usage {
                        prompt_tokens: estimate_tokens(&input.prompt_text()),
                        completion_tokens: estimate_tokens(&content),
                    },
                    true,
                ),
            };

            Ok(Completion {
                content,
                usage,
                estimated,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credential() -> Credential {
        Credential {
            key_id: "key_oai".into(),
            value: "sk-test".into(),
            kind: CredentialKind::Bearer,
        }
    }

    #[test]
    fn test_upstream_model_strips_namespace() {
        assert_eq!(OpenAiAdapter::upstream_model("openai/gpt-4o"), "gpt-4o");
        assert_eq!(OpenAiAdapter::upstream_model("gpt-4o"), "gpt-4o");
    }

    #[tokio::test]
    async fn test_chat_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({
                "model": "gpt-4o-mini",
                "messages": [{"role": "user", "content": "ping"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "chatcmpl-1",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "pong"}}],
                "usage": {"prompt_tokens": 9, "completion_tokens": 1, "total_tokens": 10}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = OpenAiAdapter::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let input = ProviderInput::Text {
            prompt: "ping".into(),
        };
        let out = adapter
            .invoke(&credential(), "openai/gpt-4o-mini", &input)
            .await
            .unwrap();

        assert_eq!(out.content, "pong");
        assert_eq!(out.usage.prompt_tokens, 9);
        assert!(!out.estimated);
    }

    #[tokio::test]
    async fn test_missing_usage_is_estimated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "a b"}}]
            })))
            .mount(&server)
            .await;

        let adapter = OpenAiAdapter::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let input = ProviderInput::Text {
            prompt: "x y z".into(),
        };
        let out = adapter.invoke(&credential(), "gpt-4o", &input).await.unwrap();
        assert!(out.estimated);
        assert_eq!(out.usage.prompt_tokens, 3);
        assert_eq!(out.usage.completion_tokens, 2);
    }

    #[tokio::test]
    async fn test_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(500).set_body_string(r#"{"error":{"message":"boom"}}"#),
            )
            .mount(&server)
            .await;

        let adapter = OpenAiAdapter::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let input = ProviderInput::Text {
            prompt: "hi".into(),
        };
        let err = adapter.invoke(&credential(), "gpt-4o", &input).await.unwrap_err();
        assert!(matches!(err, ProviderError::Api { status: 500, ref message } if message.contains("boom")));
    }
}
