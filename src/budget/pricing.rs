//! Token estimation and per-class pricing.

use serde::{Deserialize, Serialize};

use super::routing::WorkerClass;

/// Rough characters-per-token ratio for English prose.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token count of `text`. Never returns zero.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() / CHARS_PER_TOKEN).max(1) as u64
}

/// Price of a model class, in cents per 1,000 tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingInfo {
    pub cents_per_1k_tokens: f64,
}

impl PricingInfo {
    pub fn new(cents_per_1k_tokens: f64) -> Self {
        Self {
            cents_per_1k_tokens,
        }
    }

    /// Cost of `tokens`, rounded up to the next whole cent.
    pub fn cost_for_tokens(&self, tokens: u64) -> u64 {
        if tokens == 0 || self.cents_per_1k_tokens <= 0.0 {
            return 0;
        }
        (tokens as f64 / 1000.0 * self.cents_per_1k_tokens).ceil() as u64
    }

    pub fn calculate_cost_cents(&self, prompt_tokens: u64, completion_tokens: u64) -> u64 {
        self.cost_for_tokens(prompt_tokens.saturating_add(completion_tokens))
    }
}

/// Pricing for every worker class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPricing {
    pub local: PricingInfo,
    pub frontier: PricingInfo,
}

impl ModelPricing {
    pub fn for_class(&self, class: WorkerClass) -> PricingInfo {
        match class {
            WorkerClass::Local => self.local,
            WorkerClass::Frontier => self.frontier,
        }
    }
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self {
            // $0.015 per 1k tokens, the simulated rate for a local model.
            local: PricingInfo::new(1.5),
            frontier: PricingInfo::new(6.0),
        }
    }
}
