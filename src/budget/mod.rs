//! Budget module - the financial ledger and everything priced against it.
//!
//! # Key Concepts
//! - Budget: a spending limit for one accounting period
//! - Ledger: append-only record of reserved, committed and rolled-back spend
//! - Pricing: token estimation and per-class cost rates
//! - Routing: picks a worker class from remaining budget and task complexity

mod budget;
mod ledger;
mod pricing;
mod routing;

pub use budget::{Budget, BudgetError, ClosedPeriod};
pub use ledger::{EntryKind, FiscalSummary, Ledger, LedgerEntry, LedgerError, Resolution};
pub use pricing::{estimate_tokens, ModelPricing, PricingInfo, CHARS_PER_TOKEN};
pub use routing::{RoutingPolicy, WorkerClass};
