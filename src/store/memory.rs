//! In-process store. Clones share state, which lets tests simulate a
//! restart by handing the same store to a second gatekeeper.

use std::sync::{Arc, Mutex, MutexGuard};

use super::{LedgerStore, StoreError, StoredLedger};
use crate::breaker::BreakerSnapshot;
use crate::budget::{Budget, ClosedPeriod, LedgerEntry, Resolution};

#[derive(Debug, Default)]
struct Inner {
    open: Option<(Budget, u64)>,
    entries: Vec<LedgerEntry>,
    breaker: Option<BreakerSnapshot>,
    closed: Vec<ClosedPeriod>,
    fail_writes: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, as a broken disk would.
    pub fn set_fail_writes(&self, fail: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_writes = fail;
        }
    }

    /// Persisted breaker snapshot, if any.
    pub fn breaker(&self) -> Option<BreakerSnapshot> {
        self.inner.lock().ok().and_then(|inner| inner.breaker.clone())
    }

    /// Entries of the open period, as persisted.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.inner
            .lock()
            .map(|inner| inner.entries.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn writable(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        let inner = self.lock()?;
        if inner.fail_writes {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(inner)
    }
}

impl LedgerStore for MemoryStore {
    fn load(&mut self) -> Result<Option<StoredLedger>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.open.as_ref().map(|(budget, carried)| StoredLedger {
            budget: budget.clone(),
            carried_in_cents: *carried,
            entries: inner.entries.clone(),
            breaker: inner.breaker.clone(),
        }))
    }

    fn open_period(
        &mut self,
        closed: Option<&ClosedPeriod>,
        budget: &Budget,
        carried_in_cents: u64,
        carried: &[LedgerEntry],
    ) -> Result<(), StoreError> {
        let mut inner = self.writable()?;
        if let Some(closed) = closed {
            inner.closed.push(closed.clone());
        }
        inner.open = Some((budget.clone(), carried_in_cents));
        inner.entries = carried.to_vec();
        Ok(())
    }

    fn append(&mut self, entry: &LedgerEntry, breaker: &BreakerSnapshot) -> Result<(), StoreError> {
        let mut inner = self.writable()?;
        inner.entries.push(entry.clone());
        inner.breaker = Some(breaker.clone());
        Ok(())
    }

    fn settle(&mut self, resolution: &Resolution, breaker: &BreakerSnapshot) -> Result<(), StoreError> {
        let mut inner = self.writable()?;
        let reserved = inner
            .entries
            .iter_mut()
            .find(|e| e.id == resolution.reserved.id)
            .ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "reservation {} missing from store",
                    resolution.reserved.id
                ))
            })?;
        reserved.resolved_at = resolution.reserved.resolved_at;
        inner.entries.push(resolution.closing.clone());
        inner.breaker = Some(breaker.clone());
        Ok(())
    }

    fn save_breaker(&mut self, snapshot: &BreakerSnapshot) -> Result<(), StoreError> {
        let mut inner = self.writable()?;
        inner.breaker = Some(snapshot.clone());
        Ok(())
    }

    fn closed_periods(&mut self) -> Result<Vec<ClosedPeriod>, StoreError> {
        Ok(self.lock()?.closed.clone())
    }
}
