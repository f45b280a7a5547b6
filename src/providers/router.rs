//! Provider Router
//!
//! Maps a requested model (and whether the request carries audio) to a
//! [`Provider`] using an ordered rule table. The first matching rule wins; the
//! audio rule is always first.

use tracing::debug;

use crate::config::RoutingConfig;
use crate::providers::Provider;
use crate::providers::pattern::{ModelPattern, PatternError, parse_patterns};

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum RoutePredicate {
    /// The request carries an audio payload.
    HasAudio,
    /// The model matches one of the patterns.
    ModelMatches(Vec<ModelPattern>),
}

impl RoutePredicate {
    fn accepts(&self, model: &str, has_audio: bool) -> bool {
        match self {
            Self::HasAudio => has_audio,
            Self::ModelMatches(patterns) => patterns.iter().any(|p| p.matches(model)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteRule {
    pub predicate: RoutePredicate,
    pub provider: Provider,
}

// ---------------------------------------------------------------------------
// ProviderRouter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ProviderRouter {
    rules: Vec<RouteRule>,
    fallback: Provider,
}

impl ProviderRouter {
    /// Build a router from explicit rules and a fallback provider.
    pub fn new(rules: Vec<RouteRule>, fallback: Provider) -> Self {
        Self { rules, fallback }
    }

    /// Audio → Groq, then the Gemini patterns, then the OpenAI patterns,
    /// falling back to Gemini.
    pub fn from_config(config: &RoutingConfig) -> Result<Self, PatternError> {
        let rules = vec![
            RouteRule {
                predicate: RoutePredicate::HasAudio,
                provider: Provider::Groq,
            },
            RouteRule {
                predicate: RoutePredicate::ModelMatches(parse_patterns(&config.gemini_patterns)?),
                provider: Provider::Gemini,
            },
            RouteRule {
                predicate: RoutePredicate::ModelMatches(parse_patterns(&config.openai_patterns)?),
                provider: Provider::OpenAi,
            },
        ];
        Ok(Self::new(rules, Provider::Gemini))
    }

    pub fn route(&self, model: &str, has_audio: bool) -> Provider {
        let provider = self
            .rules
            .iter()
            .find(|rule| rule.predicate.accepts(model, has_audio))
            .map_or(self.fallback, |rule| rule.provider);
        debug!(model, has_audio, provider = %provider, "Routed request");
        provider
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }
}

impl Default for ProviderRouter {
    fn default() -> Self {
        // Default patterns are statically valid.
        Self::from_config(&RoutingConfig::default())
            .unwrap_or_else(|_| Self::new(Vec::new(), Provider::Gemini))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_wins_over_model() {
        let router = ProviderRouter::default();
        assert_eq!(router.route("gemini-2.5-flash", true), Provider::Groq);
        assert_eq!(router.route("gpt-4o", true), Provider::Groq);
    }

    #[test]
    fn test_gemini_patterns() {
        let router = ProviderRouter::default();
        assert_eq!(router.route("gemini-2.5-flash", false), Provider::Gemini);
        assert_eq!(router.route("gemini-2.5-pro", false), Provider::Gemini);
    }

    #[test]
    fn test_openai_patterns() {
        let router = ProviderRouter::default();
        assert_eq!(router.route("gpt-4o", false), Provider::OpenAi);
        assert_eq!(router.route("whisper-1", false), Provider::OpenAi);
        assert_eq!(router.route("openai/o3-mini", false), Provider::OpenAi);
    }

    #[test]
    fn test_unknown_model_falls_back_to_gemini() {
        let router = ProviderRouter::default();
        assert_eq!(router.route("llama-3-70b", false), Provider::Gemini);
        assert_eq!(router.route("", false), Provider::Gemini);
    }

    #[test]
    fn test_first_match_wins() {
        // Overlapping patterns: the earlier (Gemini) rule takes it.
        let config = RoutingConfig {
            gemini_patterns: vec!["gpt-4o".into()],
            openai_patterns: vec!["gpt-*".into()],
        };
        let router = ProviderRouter::from_config(&config).unwrap();
        assert_eq!(router.route("gpt-4o", false), Provider::Gemini);
        assert_eq!(router.route("gpt-4o-mini", false), Provider::OpenAi);
        assert_eq!(router.rules().len(), 3);
    }

    #[test]
    fn test_invalid_config_pattern_is_rejected() {
        let config = RoutingConfig {
            gemini_patterns: vec!["gem*ini".into()],
            openai_patterns: vec!["gpt-*".into()],
        };
        assert!(ProviderRouter::from_config(&config).is_err());
    }
}
