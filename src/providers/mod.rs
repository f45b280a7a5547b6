//! Upstream providers.
//!
//! The provider set is fixed: Gemini and an OpenAI-compatible API for text
//! completion, and an OpenAI-compatible transcription endpoint (Groq) for
//! audio. Each has a [`ProviderAdapter`]; routing, key rotation, pricing and
//! retry live in the sub-modules.

pub mod audio;
pub mod cost;
pub mod gemini;
pub mod openai;
pub mod pattern;
pub mod pricing;
pub mod retry;
pub mod rotation;
pub mod router;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use self::rotation::Credential;

// Re-exports for convenience.
pub use self::cost::CostCalculator;
pub use self::retry::RetryPolicy;
pub use self::rotation::KeyRotation;
pub use self::router::ProviderRouter;

// ---------------------------------------------------------------------------
// ProviderError
// ---------------------------------------------------------------------------

/// Errors that can occur while talking to an upstream provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid provider response: {0}")]
    Decode(String),

    #[error("No active key available for {0}")]
    NoKeyAvailable(String),

    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Provider identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gemini,
    OpenAi,
    Groq,
}

/// The two upstream capabilities the gateway brokers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFamily {
    TextCompletion,
    AudioTranscription,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Gemini, Provider::OpenAi, Provider::Groq];

    pub fn id(self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::OpenAi => "openai",
            Self::Groq => "groq",
        }
    }

    pub fn family(self) -> ProviderFamily {
        match self {
            Self::Gemini | Self::OpenAi => ProviderFamily::TextCompletion,
            Self::Groq => ProviderFamily::AudioTranscription,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Provider {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gemini" | "google" => Ok(Self::Gemini),
            "openai" => Ok(Self::OpenAi),
            "groq" => Ok(Self::Groq),
            _ => Err(format!("Unknown provider: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Normalized input / output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Provider-neutral request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderInput {
    Text {
        prompt: String,
    },
    Chat {
        messages: Vec<ChatMessage>,
    },
    Audio {
        /// Raw audio bytes; never serialized into the ledger.
        #[serde(skip)]
        bytes: Vec<u8>,
        format: String,
    },
}

impl ProviderInput {
    pub fn has_audio(&self) -> bool {
        matches!(self, Self::Audio { .. })
    }

    /// Plain text of the prompt, used for token estimation.
    pub fn prompt_text(&self) -> String {
        match self {
            Self::Text { prompt } => prompt.clone(),
            Self::Chat { messages } => messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
            Self::Audio { .. } => String::new(),
        }
    }

    /// Chat messages for chat-style APIs; a bare prompt becomes one user turn.
    pub fn messages(&self) -> Vec<ChatMessage> {
        match self {
            Self::Text { prompt } => vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.clone(),
            }],
            Self::Chat { messages } => messages.clone(),
            Self::Audio { .. } => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Normalized provider result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub content: String,
    pub usage: Usage,
    /// True when token counts were estimated locally.
    #[serde(default)]
    pub estimated: bool,
}

/// Whitespace word count, the fallback when a provider reports no usage.
pub fn estimate_tokens(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

// ---------------------------------------------------------------------------
// ProviderAdapter trait
// ---------------------------------------------------------------------------

/// One upstream HTTP call per invocation, no retries.
///
/// Returns boxed futures so adapters can be held as `Arc<dyn ProviderAdapter>`.
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    fn invoke<'a>(
        &'a self,
        credential: &'a Credential,
        model: &'a str,
        input: &'a ProviderInput,
    ) -> BoxFuture<'a, Result<Completion, ProviderError>>;
}

/// Adapter lookup by provider.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&provider).cloned()
    }

    /// The three real HTTP adapters, configured from `config.providers`.
    pub fn from_config(config: &crate::config::ProvidersConfig) -> Result<Self, ProviderError> {
        let mut set = Self::new();
        set.register(Arc::new(gemini::GeminiAdapter::new(
            &config.gemini.base_url,
            Duration::from_secs(config.gemini.timeout_secs),
        )?));
        set.register(Arc::new(openai::OpenAiAdapter::new(
            &config.openai.base_url,
            Duration::from_secs(config.openai.timeout_secs),
        )?));
        set.register(Arc::new(audio::TranscriptionAdapter::new(
            &config.audio.base_url,
            Duration::from_secs(config.audio.timeout_secs),
        )?));
        Ok(set)
    }
}

/// Build a shared reqwest client with the given request timeout.
pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, ProviderError> {
    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("tollgate/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

/// Map a non-2xx response to [`ProviderError::Api`] carrying the upstream body.
pub(crate) async fn error_from_response(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let message = response
        .text()
        .await
        .unwrap_or_else(|e| format!("<unreadable body: {e}>"));
    ProviderError::Api { status, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_ids_round_trip() {
        for p in Provider::ALL {
            assert_eq!(p.id().parse::<Provider>().unwrap(), p);
        }
        assert!("claude".parse::<Provider>().is_err());
    }

    #[test]
    fn test_provider_family() {
        assert_eq!(Provider::Gemini.family(), ProviderFamily::TextCompletion);
        assert_eq!(Provider::OpenAi.family(), ProviderFamily::TextCompletion);
        assert_eq!(Provider::Groq.family(), ProviderFamily::AudioTranscription);
    }

    #[test]
    fn test_provider_error_display() {
        let err = ProviderError::NoKeyAvailable("groq".into());
        assert_eq!(err.to_string(), "No active key available for groq");
        let err = ProviderError::Api {
            status: 503,
            message: "overloaded".into(),
        };
        assert_eq!(err.to_string(), "API error (503): overloaded");
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("  hello   brave\nnew world "), 4);
    }

    #[test]
    fn test_input_messages_and_prompt_text() {
        let text = ProviderInput::Text {
            prompt: "hi there".into(),
        };
        assert_eq!(text.messages().len(), 1);
        assert_eq!(text.messages()[0].role, "user");
        assert!(!text.has_audio());

        let chat = ProviderInput::Chat {
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: "be brief".into(),
                },
                ChatMessage {
                    role: "user".into(),
                    content: "hello".into(),
                },
            ],
        };
        assert_eq!(chat.prompt_text(), "be brief\nhello");
    }

    #[test]
    fn test_audio_input_serializes_without_bytes() {
        let input = ProviderInput::Audio {
            bytes: vec![1, 2, 3],
            format: "mp3".into(),
        };
        assert!(input.has_audio());
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json["kind"], "audio");
        assert_eq!(json["format"], "mp3");
        assert!(json.get("bytes").is_none());
    }
}
