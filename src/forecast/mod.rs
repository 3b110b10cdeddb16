//! Cost forecasting.
//!
//! The gatekeeper never prices work itself; it asks a [`Forecaster`].
//! [`TokenForecaster`] is the built-in one: it sizes the prompt in tokens
//! and prices the expected prompt + completion at the routed class's rate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::budget::{estimate_tokens, ModelPricing, WorkerClass};
use crate::task::Task;

/// Predicted cost of a task.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub cost_cents: u64,
    /// How much the forecaster trusts its own number, in `[0, 1]`.
    pub confidence: f64,
}

impl Estimate {
    pub fn new(cost_cents: u64, confidence: f64) -> Self {
        Self {
            cost_cents,
            confidence,
        }
    }

    /// Reject estimates a well-behaved forecaster could not have produced.
    pub fn validate(self) -> Result<Self, ForecastError> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(ForecastError::Malformed(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForecastError {
    #[error("forecaster unavailable: {0}")]
    Unavailable(String),

    #[error("malformed forecast: {0}")]
    Malformed(String),
}

/// External collaborator that predicts what a task will cost.
#[async_trait]
pub trait Forecaster: Send + Sync {
    async fn estimate(&self, task: &Task, class: WorkerClass) -> Result<Estimate, ForecastError>;
}

/// Heuristic forecaster based on prompt length.
#[derive(Debug, Clone)]
pub struct TokenForecaster {
    pricing: ModelPricing,
    /// Expected completion tokens per prompt token.
    completion_ratio: f64,
}

impl TokenForecaster {
    pub fn new(pricing: ModelPricing) -> Self {
        Self {
            pricing,
            completion_ratio: 1.5,
        }
    }

    pub fn with_completion_ratio(mut self, ratio: f64) -> Self {
        self.completion_ratio = ratio.max(0.0);
        self
    }
}

#[async_trait]
impl Forecaster for TokenForecaster {
    async fn estimate(&self, task: &Task, class: WorkerClass) -> Result<Estimate, ForecastError> {
        let prompt_tokens = estimate_tokens(task.payload());
        let completion_tokens = (prompt_tokens as f64 * self.completion_ratio).ceil() as u64;
        let cost_cents = self
            .pricing
            .for_class(class)
            .calculate_cost_cents(prompt_tokens, completion_tokens);

        // Completion length is the guess; harder tasks wander further from it.
        let confidence = (0.9 - task.complexity().score() * 0.5).clamp(0.1, 0.9);

        Ok(Estimate::new(cost_cents, confidence))
    }
}
