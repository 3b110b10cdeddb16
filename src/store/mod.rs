//! Durable storage for the ledger and breaker.
//!
//! The gatekeeper writes through a [`LedgerStore`] inside its critical
//! section, so the store only ever sees a single writer.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::breaker::BreakerSnapshot;
use crate::budget::{Budget, ClosedPeriod, LedgerEntry, Resolution};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("ledger store is corrupt: {0}")]
    Corrupt(String),

    #[error("ledger store unavailable: {0}")]
    Unavailable(String),
}

/// Everything needed to rebuild the gatekeeper after a restart.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredLedger {
    pub budget: Budget,
    pub carried_in_cents: u64,
    pub entries: Vec<LedgerEntry>,
    pub breaker: Option<BreakerSnapshot>,
}

/// Persistence seam for ledger entries, periods and breaker counters.
pub trait LedgerStore: Send {
    /// Load the open period, or `None` for a fresh store.
    fn load(&mut self) -> Result<Option<StoredLedger>, StoreError>;

    /// Archive `closed` (if any) and start a new period seeded with `carried`.
    fn open_period(
        &mut self,
        closed: Option<&ClosedPeriod>,
        budget: &Budget,
        carried_in_cents: u64,
        carried: &[LedgerEntry],
    ) -> Result<(), StoreError>;

    /// Append a new entry to the open period together with the breaker
    /// snapshot it produced, atomically.
    fn append(&mut self, entry: &LedgerEntry, breaker: &BreakerSnapshot) -> Result<(), StoreError>;

    /// Stamp the reservation, append its closing entry and save the breaker
    /// snapshot, atomically.
    fn settle(&mut self, resolution: &Resolution, breaker: &BreakerSnapshot) -> Result<(), StoreError>;

    /// Save the breaker alone, for transitions with no ledger entry.
    fn save_breaker(&mut self, snapshot: &BreakerSnapshot) -> Result<(), StoreError>;

    /// Archived periods, oldest first.
    fn closed_periods(&mut self) -> Result<Vec<ClosedPeriod>, StoreError>;
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {:?}: {}", raw, e)))
}
