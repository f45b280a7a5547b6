//! Cost calculation.
//!
//! Text requests are priced per 1M tokens from the [`PricingDatabase`], with a
//! flat per-token rate for models that have no entry. Audio is priced per
//! minute.

use tracing::debug;

use super::Usage;
use super::pricing::{ModelPricing, PricingDatabase};
use crate::config::PricingConfig;

/// Assumed clip length for every transcription. Real clip duration is not
/// measured.
pub const AUDIO_ESTIMATE_SECS: f64 = 60.0;

// MARK: - Cost Calculator

#[derive(Debug, Clone)]
pub struct CostCalculator {
    pricing_db: PricingDatabase,
    fallback_per_token: f64,
    audio_per_minute: f64,
}

impl CostCalculator {
    pub fn new(pricing_db: PricingDatabase, fallback_per_token: f64, audio_per_minute: f64) -> Self {
        Self {
            pricing_db,
            fallback_per_token,
            audio_per_minute,
        }
    }

    pub fn from_config(pricing: &PricingConfig, audio_per_minute: f64) -> Self {
        Self::new(
            PricingDatabase::with_overrides(&pricing.models),
            pricing.fallback_per_token,
            audio_per_minute,
        )
    }

    /// Cost in USD of a text completion.
    pub fn text_cost(&self, model: &str, usage: &Usage) -> f64 {
        let cost = match self.pricing_db.get(model) {
            Some(pricing) => Self::cost_with_pricing(pricing, usage),
            None => {
                let tokens = usage.prompt_tokens + usage.completion_tokens;
                tokens as f64 * self.fallback_per_token
            }
        };
        debug!(
            model = %model,
            input_tokens = usage.prompt_tokens,
            output_tokens = usage.completion_tokens,
            priced = self.pricing_db.has_pricing(model),
            cost_usd = %format!("${cost:.6}"),
            "Calculated request cost"
        );
        cost
    }

    /// Cost in USD of one transcription, using [`AUDIO_ESTIMATE_SECS`].
    pub fn audio_cost(&self) -> f64 {
        self.audio_per_minute * AUDIO_ESTIMATE_SECS / 60.0
    }

    fn cost_with_pricing(pricing: &ModelPricing, usage: &Usage) -> f64 {
        let input = (usage.prompt_tokens as f64 / 1_000_000.0) * pricing.input_cost_per_million;
        let output =
            (usage.completion_tokens as f64 / 1_000_000.0) * pricing.output_cost_per_million;
        input + output
    }

    pub fn get_pricing(&self, model: &str) -> Option<&ModelPricing> {
        self.pricing_db.get(model)
    }
}

impl Default for CostCalculator {
    fn default() -> Self {
        Self::from_config(&PricingConfig::default(), 0.006)
    }
}

// MARK: - Tests


// MARK: - Property-Based Tests

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn usage_strategy() -> impl Strategy<Value = Usage> {
        (0u64..5_000_000, 0u64..5_000_000).prop_map(|(p, c)| Usage {
            prompt_tokens: p,
            completion_tokens: c,
        })
    }

    proptest! {
        #[test]
        fn cost_is_never_negative(usage in usage_strategy(), model in "[a-z0-9.-]{1,20}") {
            let calc = CostCalculator::default();
            prop_assert!(calc.text_cost(&model, &usage) >= 0.0);
            prop_assert!(calc.text_cost("gemini-2.5-pro", &usage) >= 0.0);
        }

        #[test]
        fn cost_is_monotonic_in_output_tokens(usage in usage_strategy(), extra in 1u64..100_000) {
            let calc = CostCalculator::default();
            let more = Usage { completion_tokens: usage.completion_tokens + extra, ..usage };
            for model in ["gemini-2.5-flash", "gpt-4o", "unpriced-model"] {
                prop_assert!(calc.text_cost(model, &more) >= calc.text_cost(model, &usage));
            }
        }
    }
}
