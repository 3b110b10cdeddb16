//! Running totals a worker keeps for its own session.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Tokens and spend a worker has consumed since it was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub calls: u64,
    pub total_tokens: u64,
    pub total_cost_cents: u64,
}

/// Lock-free counters behind [`SessionSummary`].
#[derive(Debug, Default)]
pub struct SessionTally {
    calls: AtomicU64,
    tokens: AtomicU64,
    cost_cents: AtomicU64,
}

impl SessionTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tokens: u64, cost_cents: u64) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.tokens.fetch_add(tokens, Ordering::Relaxed);
        self.cost_cents.fetch_add(cost_cents, Ordering::Relaxed);
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            calls: self.calls.load(Ordering::Relaxed),
            total_tokens: self.tokens.load(Ordering::Relaxed),
            total_cost_cents: self.cost_cents.load(Ordering::Relaxed),
        }
    }
}
