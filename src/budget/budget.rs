//! Budget periods.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when constructing a budget period.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BudgetError {
    #[error("budget period ends ({end}) before it starts ({start})")]
    InvalidPeriod {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// Spending limit for a single accounting period.
///
/// # Invariants
/// - `period_start < period_end`
/// - `limit_cents` is non-negative by construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    limit_cents: u64,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
}

impl Budget {
    pub fn new(
        limit_cents: u64,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Self, BudgetError> {
        if period_end <= period_start {
            return Err(BudgetError::InvalidPeriod {
                start: period_start,
                end: period_end,
            });
        }
        Ok(Self {
            limit_cents,
            period_start,
            period_end,
        })
    }

    /// A period of `length` starting at `start`.
    pub fn for_period(
        limit_cents: u64,
        start: DateTime<Utc>,
        length: Duration,
    ) -> Result<Self, BudgetError> {
        Self::new(limit_cents, start, start + length)
    }

    pub fn limit_cents(&self) -> u64 {
        self.limit_cents
    }

    pub fn period_start(&self) -> DateTime<Utc> {
        self.period_start
    }

    pub fn period_end(&self) -> DateTime<Utc> {
        self.period_end
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.period_start && at < self.period_end
    }

    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        now >= self.period_end
    }

    /// The period that immediately follows this one, with the same length.
    pub fn next_period(&self, limit_cents: u64) -> Self {
        let length = self.period_end - self.period_start;
        Self {
            limit_cents,
            period_start: self.period_end,
            period_end: self.period_end + length,
        }
    }
}

/// Immutable record of a finished period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedPeriod {
    pub budget: Budget,
    pub carried_in_cents: u64,
    pub committed_cents: u64,
    /// Remaining figure at close, after subtracting reservations still in flight.
    pub closing_remaining_cents: u64,
    pub closed_at: DateTime<Utc>,
}
