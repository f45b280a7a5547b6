//! Model pricing database.
//!
//! Prices are in USD per 1M tokens (input/output). Configured entries are
//! layered over the built-in table.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// MARK: - Types

/// Pricing information for a specific model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Model identifier (e.g., "gemini-2.5-flash").
    pub model: String,
    /// Provider identifier (e.g., "gemini", "openai").
    pub provider: String,
    /// Cost per 1M input tokens in USD.
    pub input_cost_per_million: f64,
    /// Cost per 1M output tokens in USD.
    pub output_cost_per_million: f64,
}

impl ModelPricing {
    fn new(model: &str, provider: &str, input: f64, output: f64) -> Self {
        Self {
            model: model.to_string(),
            provider: provider.to_string(),
            input_cost_per_million: input,
            output_cost_per_million: output,
        }
    }
}

/// Model name -> pricing.
#[derive(Debug, Clone)]
pub struct PricingDatabase {
    pricing: HashMap<String, ModelPricing>,
}

// MARK: - Implementation

impl PricingDatabase {
    /// Built-in prices.
    pub fn new() -> Self {
        let builtin = [
            // Gemini (https://ai.google.dev/pricing)
            ModelPricing::new("gemini-2.5-flash", "gemini", 0.30, 2.50),
            ModelPricing::new("gemini-2.5-flash-lite", "gemini", 0.10, 0.40),
            ModelPricing::new("gemini-2.5-pro", "gemini", 1.25, 10.00),
            ModelPricing::new("gemini-2.0-flash", "gemini", 0.10, 0.40),
            // OpenAI
            ModelPricing::new("gpt-4o", "openai", 2.50, 10.00),
            ModelPricing::new("gpt-4o-mini", "openai", 0.15, 0.60),
            ModelPricing::new("gpt-4.1", "openai", 2.00, 8.00),
            ModelPricing::new("gpt-4.1-mini", "openai", 0.40, 1.60),
            ModelPricing::new("o3-mini", "openai", 1.10, 4.40),
        ];
        Self {
            pricing: builtin
                .into_iter()
                .map(|p| (p.model.clone(), p))
                .collect(),
        }
    }

    /// Built-in prices plus `overrides`, which replace entries of the same model.
    pub fn with_overrides(overrides: &[ModelPricing]) -> Self {
        let mut db = Self::new();
        for entry in overrides {
            db.pricing.insert(entry.model.clone(), entry.clone());
        }
        db
    }

    /// Pricing for a model. A leading `openai/` namespace is ignored.
    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        self.pricing
            .get(model)
            .or_else(|| model.strip_prefix("openai/").and_then(|m| self.pricing.get(m)))
    }

    pub fn has_pricing(&self, model: &str) -> bool {
        self.get(model).is_some()
    }

    pub fn len(&self) -> usize {
        self.pricing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pricing.is_empty()
    }
}

impl Default for PricingDatabase {
    fn default() -> Self {
        Self::new()
    }
}

// MARK: - Tests
