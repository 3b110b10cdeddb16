//! Append-only spend ledger for one budget period.
//!
//! Entries are never edited except to stamp `resolved_at` on a reservation
//! once its commit or rollback is appended. Every derived figure (committed,
//! reserved, remaining) can be rebuilt by replaying the entries.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::budget::{Budget, ClosedPeriod};
use crate::task::TaskId;

/// Kind of ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Reserved,
    Committed,
    RolledBack,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reserved" => Some(Self::Reserved),
            "committed" => Some(Self::Committed),
            "rolled_back" => Some(Self::RolledBack),
            _ => None,
        }
    }
}

/// A single line in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: u64,
    pub task_id: TaskId,
    pub kind: EntryKind,
    /// Reserved: the estimate. Committed: the actual cost.
    /// RolledBack: the amount released (contributes nothing to spend).
    pub amount_cents: u64,
    pub created_at: DateTime<Utc>,
    /// Set on a Reserved entry when its commit or rollback is recorded.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Reserved entry moved in from the previous period, which funds it.
    #[serde(default)]
    pub carried: bool,
}

/// Ledger protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("insufficient funds: requested {requested_cents} cents, {remaining_cents} cents remaining")]
    InsufficientFunds {
        requested_cents: u64,
        remaining_cents: u64,
    },

    #[error("no active reservation for task {0}")]
    UnknownReservation(TaskId),

    #[error("task {0} already holds a reservation in this period")]
    DuplicateReservation(TaskId),

    #[error("ledger replay is inconsistent: {0}")]
    Inconsistent(String),
}

/// Result of closing a reservation: the stamped reservation and the new entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub reserved: LedgerEntry,
    pub closing: LedgerEntry,
}

/// Aggregate figures for dashboards (UCST and friends are derived downstream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiscalSummary {
    pub limit_cents: u64,
    pub carried_in_cents: u64,
    pub committed_cents: u64,
    pub reserved_cents: u64,
    pub remaining_cents: u64,
    pub committed_tasks: u64,
    pub rolled_back_tasks: u64,
    pub overrun_cents: u64,
}

/// The spend ledger for the active budget period.
///
/// # Invariants
/// - each task id is reserved at most once per period
/// - every Committed / RolledBack entry follows exactly one Reserved entry
///   for the same task
/// - `reserve` never lets `committed + reserved` exceed the available funds
/// - without carried-in credit, `remaining <= limit`: releasing a carried
///   reservation never frees funds in this period
#[derive(Debug, Clone)]
pub struct Ledger {
    budget: Budget,
    carried_in_cents: u64,
    /// Old-period money backing carried reservations: their full amount
    /// while in flight, the part actually spent once committed.
    carried_funding_cents: u64,
    entries: Vec<LedgerEntry>,
    /// Task id -> index of its unresolved Reserved entry.
    active: HashMap<TaskId, usize>,
    seen: HashSet<TaskId>,
    committed_cents: u64,
    reserved_cents: u64,
    overrun_cents: u64,
    committed_tasks: u64,
    rolled_back_tasks: u64,
    reserve_attempts: u64,
}

impl Ledger {
    /// Empty ledger. `carried_in_cents` is credit brought forward from the
    /// previous period on top of the budget limit.
    pub fn new(budget: Budget, carried_in_cents: u64) -> Self {
        Self {
            budget,
            carried_in_cents,
            carried_funding_cents: 0,
            entries: Vec::new(),
            active: HashMap::new(),
            seen: HashSet::new(),
            committed_cents: 0,
            reserved_cents: 0,
            overrun_cents: 0,
            committed_tasks: 0,
            rolled_back_tasks: 0,
            reserve_attempts: 0,
        }
    }

    /// Rebuild a ledger from persisted entries, checking every invariant.
    pub fn replay(
        budget: Budget,
        carried_in_cents: u64,
        mut entries: Vec<LedgerEntry>,
    ) -> Result<Self, LedgerError> {
        entries.sort_by_key(|e| e.id);
        let mut ledger = Self::new(budget, carried_in_cents);

        for entry in entries {
            if let Some(last) = ledger.entries.last() {
                if entry.id <= last.id {
                    return Err(LedgerError::Inconsistent(format!(
                        "duplicate entry id {}",
                        entry.id
                    )));
                }
            }

            match entry.kind {
                EntryKind::Reserved => {
                    if !ledger.seen.insert(entry.task_id) {
                        return Err(LedgerError::Inconsistent(format!(
                            "task {} reserved twice",
                            entry.task_id
                        )));
                    }
                    ledger.reserved_cents = ledger.reserved_cents.saturating_add(entry.amount_cents);
                    if entry.carried {
                        ledger.carried_funding_cents += entry.amount_cents;
                    }
                    ledger.active.insert(entry.task_id, ledger.entries.len());
                }
                EntryKind::Committed | EntryKind::RolledBack => {
                    let idx = ledger.active.remove(&entry.task_id).ok_or_else(|| {
                        LedgerError::Inconsistent(format!(
                            "entry {} closes task {} without a reservation",
                            entry.id, entry.task_id
                        ))
                    })?;
                    let reserved = &ledger.entries[idx];
                    if reserved.resolved_at.is_none() {
                        return Err(LedgerError::Inconsistent(format!(
                            "reservation {} closed by entry {} but never stamped",
                            reserved.id, entry.id
                        )));
                    }
                    let reserved_amount = reserved.amount_cents;
                    let carried = reserved.carried;
                    ledger.reserved_cents -= reserved_amount;
                    if entry.kind == EntryKind::Committed {
                        ledger.apply_commit(reserved_amount, entry.amount_cents);
                        ledger.retire_carried(carried, reserved_amount, Some(entry.amount_cents));
                    } else {
                        ledger.rolled_back_tasks += 1;
                        ledger.retire_carried(carried, reserved_amount, None);
                    }
                }
            }
            ledger.entries.push(entry);
        }

        if let Some(stamped) = ledger
            .active
            .values()
            .map(|&idx| &ledger.entries[idx])
            .find(|e| e.resolved_at.is_some())
        {
            return Err(LedgerError::Inconsistent(format!(
                "reservation {} is stamped resolved but has no closing entry",
                stamped.id
            )));
        }

        Ok(ledger)
    }

    /// Hold `amount_cents` for `task_id` if it fits in the remaining budget.
    ///
    /// Fails without touching any state other than the attempt counter.
    pub fn reserve(
        &mut self,
        task_id: TaskId,
        amount_cents: u64,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry, LedgerError> {
        self.reserve_attempts += 1;

        if self.seen.contains(&task_id) {
            return Err(LedgerError::DuplicateReservation(task_id));
        }
        let remaining = self.remaining_cents();
        if amount_cents > remaining {
            return Err(LedgerError::InsufficientFunds {
                requested_cents: amount_cents,
                remaining_cents: remaining,
            });
        }

        let entry = LedgerEntry {
            id: self.next_id(),
            task_id,
            kind: EntryKind::Reserved,
            amount_cents,
            created_at: now,
            resolved_at: None,
            carried: false,
        };
        self.seen.insert(task_id);
        self.active.insert(task_id, self.entries.len());
        self.reserved_cents += amount_cents;
        self.entries.push(entry.clone());
        Ok(entry)
    }

    /// Replace the reservation for `task_id` with its actual cost.
    ///
    /// Over- and under-runs are both recorded as-is.
    pub fn commit(
        &mut self,
        task_id: TaskId,
        actual_cents: u64,
        now: DateTime<Utc>,
    ) -> Result<Resolution, LedgerError> {
        let reserved = self.resolve(task_id, now)?;
        self.apply_commit(reserved.amount_cents, actual_cents);
        self.retire_carried(reserved.carried, reserved.amount_cents, Some(actual_cents));
        let closing = self.push_closing(task_id, EntryKind::Committed, actual_cents, now);
        Ok(Resolution { reserved, closing })
    }

    /// Release the reservation for `task_id`.
    pub fn rollback(
        &mut self,
        task_id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<Resolution, LedgerError> {
        let reserved = self.resolve(task_id, now)?;
        self.rolled_back_tasks += 1;
        self.retire_carried(reserved.carried, reserved.amount_cents, None);
        let closing =
            self.push_closing(task_id, EntryKind::RolledBack, reserved.amount_cents, now);
        Ok(Resolution { reserved, closing })
    }

    /// Close this period and open `next`.
    ///
    /// Reservations still in flight move into the new ledger and stay funded
    /// by this period: rolling one back frees nothing in the new period, and
    /// only an overrun beyond its reservation is charged there. With
    /// `rollover`, the closing remaining figure is added to the new period
    /// as carried-in credit.
    pub fn roll_into(&self, next: Budget, rollover: bool, now: DateTime<Utc>) -> (ClosedPeriod, Ledger) {
        let closing_remaining = self.remaining_cents();
        let closed = ClosedPeriod {
            budget: self.budget.clone(),
            carried_in_cents: self.carried_in_cents,
            committed_cents: self.committed_cents,
            closing_remaining_cents: closing_remaining,
            closed_at: now,
        };

        let carried_credit = if rollover { closing_remaining } else { 0 };
        let mut ledger = Ledger::new(next, carried_credit);
        for entry in self.active_reservations() {
            let moved = LedgerEntry {
                id: ledger.next_id(),
                carried: true,
                ..entry.clone()
            };
            ledger.seen.insert(moved.task_id);
            ledger.active.insert(moved.task_id, ledger.entries.len());
            ledger.reserved_cents += moved.amount_cents;
            ledger.carried_funding_cents += moved.amount_cents;
            ledger.entries.push(moved);
        }
        (closed, ledger)
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    pub fn carried_in_cents(&self) -> u64 {
        self.carried_in_cents
    }

    /// Budget limit plus carried-in credit, plus whatever the previous
    /// period still funds for carried reservations.
    pub fn available_cents(&self) -> u64 {
        self.budget
            .limit_cents()
            .saturating_add(self.carried_in_cents)
            .saturating_add(self.carried_funding_cents)
    }

    /// Old-period funding still backing carried reservations.
    pub fn carried_funding_cents(&self) -> u64 {
        self.carried_funding_cents
    }

    pub fn committed_cents(&self) -> u64 {
        self.committed_cents
    }

    pub fn reserved_cents(&self) -> u64 {
        self.reserved_cents
    }

    /// `available - committed - reserved`, floored at zero (overruns can
    /// push committed spend past the limit).
    pub fn remaining_cents(&self) -> u64 {
        self.available_cents()
            .saturating_sub(self.committed_cents.saturating_add(self.reserved_cents))
    }

    /// Funds left if every pending reservation were released.
    pub fn uncommitted_cents(&self) -> u64 {
        self.available_cents().saturating_sub(self.committed_cents)
    }

    pub fn reservation(&self, task_id: &TaskId) -> Option<&LedgerEntry> {
        self.active.get(task_id).map(|&idx| &self.entries[idx])
    }

    pub fn active_reservations(&self) -> impl Iterator<Item = &LedgerEntry> {
        let mut idx: Vec<usize> = self.active.values().copied().collect();
        idx.sort_unstable();
        idx.into_iter().map(move |i| &self.entries[i])
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// How many times `reserve` has been called on this ledger.
    pub fn reserve_attempts(&self) -> u64 {
        self.reserve_attempts
    }

    pub fn summary(&self) -> FiscalSummary {
        FiscalSummary {
            limit_cents: self.budget.limit_cents(),
            carried_in_cents: self.carried_in_cents,
            committed_cents: self.committed_cents,
            reserved_cents: self.reserved_cents,
            remaining_cents: self.remaining_cents(),
            committed_tasks: self.committed_tasks,
            rolled_back_tasks: self.rolled_back_tasks,
            overrun_cents: self.overrun_cents,
        }
    }

    fn next_id(&self) -> u64 {
        self.entries.last().map(|e| e.id + 1).unwrap_or(1)
    }

    fn resolve(&mut self, task_id: TaskId, now: DateTime<Utc>) -> Result<LedgerEntry, LedgerError> {
        let idx = self
            .active
            .remove(&task_id)
            .ok_or(LedgerError::UnknownReservation(task_id))?;
        let entry = &mut self.entries[idx];
        entry.resolved_at = Some(now);
        self.reserved_cents -= entry.amount_cents;
        Ok(entry.clone())
    }

    fn apply_commit(&mut self, reserved_cents: u64, actual_cents: u64) {
        self.committed_cents = self.committed_cents.saturating_add(actual_cents);
        self.overrun_cents = self
            .overrun_cents
            .saturating_add(actual_cents.saturating_sub(reserved_cents));
        self.committed_tasks += 1;
    }

    /// A carried reservation closed: rollback retires all of its funding,
    /// commit keeps only the part that was actually spent.
    fn retire_carried(&mut self, carried: bool, reserved_cents: u64, actual_cents: Option<u64>) {
        if !carried {
            return;
        }
        let kept = actual_cents.map_or(0, |actual| actual.min(reserved_cents));
        self.carried_funding_cents = self
            .carried_funding_cents
            .saturating_sub(reserved_cents - kept);
    }

    fn push_closing(
        &mut self,
        task_id: TaskId,
        kind: EntryKind,
        amount_cents: u64,
        now: DateTime<Utc>,
    ) -> LedgerEntry {
        let entry = LedgerEntry {
            id: self.next_id(),
            task_id,
            kind,
            amount_cents,
            created_at: now,
            resolved_at: None,
            carried: false,
        };
        self.entries.push(entry.clone());
        entry
    }
}
