//! Worker routing policy.
//!
//! Routing is a pure function of remaining budget and task complexity so
//! every decision can be replayed and audited.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::task::Complexity;

/// Class of worker a task is sent to. Determines which price is forecast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerClass {
    /// Local / low-cost model.
    Local,
    /// Frontier / high-cost model.
    Frontier,
}

impl WorkerClass {
    /// The other class, used when a pool has no worker for the routed one.
    pub fn fallback(&self) -> Self {
        match self {
            Self::Local => Self::Frontier,
            Self::Frontier => Self::Local,
        }
    }
}

impl fmt::Display for WorkerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Frontier => f.write_str("frontier"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingPolicy {
    /// Minimum complexity score that justifies a frontier worker.
    pub frontier_complexity: f64,
    /// Below this remaining budget everything runs locally.
    pub frontier_min_remaining_cents: u64,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            frontier_complexity: 0.6,
            frontier_min_remaining_cents: 500,
        }
    }
}

impl RoutingPolicy {
    pub fn route(&self, remaining_cents: u64, complexity: Complexity) -> WorkerClass {
        if complexity.score() >= self.frontier_complexity
            && remaining_cents >= self.frontier_min_remaining_cents
        {
            WorkerClass::Frontier
        } else {
            WorkerClass::Local
        }
    }
}
