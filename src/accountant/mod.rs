//! The gatekeeper: ledger + breaker behind one serialization domain.
//!
//! Every reservation, commit and rollback runs inside a single mutex that
//! also guards the breaker counters and the store handle. Nothing awaits
//! inside it. Telemetry is collected under the lock and emitted after it
//! is released.
//!
//! A failed store write halts admission: the in-memory ledger may no longer
//! match what is on disk. [`Accountant::resume`] reloads from the store once
//! an operator has fixed it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::breaker::{
    BreakerConfig, BreakerCounters, BreakerState, CircuitBreaker, ReserveOutcome, Signal,
    Transition,
};
use crate::budget::{Budget, ClosedPeriod, FiscalSummary, Ledger, LedgerEntry, LedgerError, WorkerClass};
use crate::forecast::{Estimate, ForecastError, Forecaster};
use crate::store::{LedgerStore, StoreError};
use crate::task::{Task, TaskId};
use crate::telemetry::{EventKind, TelemetryEvent, TelemetrySink};

/// Proof that funds are held for a task. Workers receive it with the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub task_id: TaskId,
    /// Id of the Reserved ledger entry.
    pub entry_id: u64,
    pub amount_cents: u64,
    pub approved_at: DateTime<Utc>,
    /// Admitted as a half-open trial.
    pub trial: bool,
}

/// Why a reservation is being released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackReason {
    WorkerFailure,
    Timeout,
    Cancelled,
    /// Actual spend landed outside the forecast tolerance.
    CostMismatch,
    /// Reservation outlived the dispatch timeout with nobody tracking it.
    Stale,
}

impl RollbackReason {
    /// Only a forecast miss says anything about budget pressure.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(self, Self::CostMismatch)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkerFailure => "worker_failure",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::CostMismatch => "cost_mismatch",
            Self::Stale => "stale",
        }
    }
}

impl fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountantConfig {
    pub breaker: BreakerConfig,
    /// A commit counts as a breaker success when
    /// `actual <= reserved * (1 + cost_tolerance)`.
    pub cost_tolerance: f64,
    /// Reservations older than this are rolled back on recovery.
    pub stale_after: Duration,
}

impl Default for AccountantConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            cost_tolerance: 0.25,
            stale_after: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatekeeperError {
    #[error("circuit open: admission blocked")]
    CircuitOpen,

    #[error("insufficient funds: requested {requested_cents} cents, {remaining_cents} cents remaining")]
    InsufficientFunds {
        requested_cents: u64,
        remaining_cents: u64,
    },

    #[error("forecast unavailable: {0}")]
    ForecastUnavailable(#[from] ForecastError),

    #[error("no active reservation for task {0}")]
    UnknownReservation(TaskId),

    #[error("task {0} already holds a reservation in this period")]
    DuplicateReservation(TaskId),

    #[error("ledger storage failure: {0}")]
    Storage(#[from] StoreError),

    #[error("gatekeeper halted: {0}")]
    Halted(String),
}

impl From<LedgerError> for GatekeeperError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds {
                requested_cents,
                remaining_cents,
            } => Self::InsufficientFunds {
                requested_cents,
                remaining_cents,
            },
            LedgerError::UnknownReservation(id) => Self::UnknownReservation(id),
            LedgerError::DuplicateReservation(id) => Self::DuplicateReservation(id),
            LedgerError::Inconsistent(msg) => Self::Storage(StoreError::Corrupt(msg)),
        }
    }
}

/// Result of a commit or rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub task_id: TaskId,
    pub reserved_cents: u64,
    /// `None` for rollbacks.
    pub actual_cents: Option<u64>,
    pub signal: Signal,
    pub remaining_cents: u64,
}

struct Gate {
    ledger: Ledger,
    breaker: CircuitBreaker,
    store: Box<dyn LedgerStore>,
    /// Task id -> epoch of the half-open round that admitted it.
    trials: HashMap<TaskId, u64>,
    halted: Option<String>,
}

impl Gate {
    /// Run a store write; any failure halts admission.
    fn write<T>(
        &mut self,
        op: impl FnOnce(&mut dyn LedgerStore) -> Result<T, StoreError>,
    ) -> Result<T, GatekeeperError> {
        match op(&mut *self.store) {
            Ok(v) => Ok(v),
            Err(e) => {
                tracing::error!(error = %e, "Ledger store write failed; halting admission");
                self.halted = Some(e.to_string());
                Err(GatekeeperError::Storage(e))
            }
        }
    }

    fn save_breaker(&mut self, now: DateTime<Utc>) -> Result<(), GatekeeperError> {
        let snapshot = self.breaker.snapshot(now);
        self.write(|s| s.save_breaker(&snapshot))
    }

    fn event(
        &self,
        kind: EventKind,
        task_id: Option<TaskId>,
        amount_cents: Option<u64>,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) -> TelemetryEvent {
        TelemetryEvent {
            timestamp: now,
            task_id,
            kind,
            amount_cents,
            breaker_state: self.breaker.state(),
            remaining_cents: self.ledger.remaining_cents(),
            detail,
        }
    }

    fn note_transition(
        &self,
        transition: Option<Transition>,
        now: DateTime<Utc>,
        events: &mut Vec<TelemetryEvent>,
    ) {
        if let Some(t) = transition {
            tracing::info!(from = %t.from, to = %t.to, reason = t.reason, "Circuit breaker transition");
            events.push(self.event(
                EventKind::BreakerTransition,
                None,
                None,
                Some(format!("{} -> {}: {}", t.from, t.to, t.reason)),
                now,
            ));
        }
    }

    fn rollback(
        &mut self,
        task_id: TaskId,
        reason: RollbackReason,
        now: DateTime<Utc>,
        events: &mut Vec<TelemetryEvent>,
    ) -> Result<Settlement, GatekeeperError> {
        let resolution = self.ledger.rollback(task_id, now).map_err(|e| {
            tracing::error!(task_id = %task_id, reason = %reason, error = %e, "Rollback rejected");
            GatekeeperError::from(e)
        })?;

        let signal = if reason.counts_against_breaker() {
            Signal::Failure
        } else {
            Signal::Neutral
        };
        let trial = self.trials.remove(&task_id);
        let transition = self.breaker.record_settlement(trial, signal, Instant::now());
        let snapshot = self.breaker.snapshot(now);
        self.write(|s| s.settle(&resolution, &snapshot))?;

        let reserved_cents = resolution.reserved.amount_cents;
        tracing::info!(
            task_id = %task_id,
            released_cents = reserved_cents,
            reason = %reason,
            remaining_cents = self.ledger.remaining_cents(),
            "Reservation rolled back"
        );
        events.push(self.event(
            EventKind::RolledBack,
            Some(task_id),
            Some(reserved_cents),
            Some(reason.to_string()),
            now,
        ));
        self.note_transition(transition, now, events);

        Ok(Settlement {
            task_id,
            reserved_cents,
            actual_cents: None,
            signal,
            remaining_cents: self.ledger.remaining_cents(),
        })
    }

    fn expire_stale(
        &mut self,
        max_age: Duration,
        now: DateTime<Utc>,
        events: &mut Vec<TelemetryEvent>,
    ) -> Result<Vec<TaskId>, GatekeeperError> {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return Ok(Vec::new());
        };
        let stale: Vec<TaskId> = self
            .ledger
            .active_reservations()
            .filter(|e| now.signed_duration_since(e.created_at) > max_age)
            .map(|e| e.task_id)
            .collect();

        for task_id in &stale {
            tracing::warn!(task_id = %task_id, "Expiring stale reservation");
            self.rollback(*task_id, RollbackReason::Stale, now, events)?;
        }
        Ok(stale)
    }
}

/// Load the open period from `store`, creating one from `fresh` if the
/// store is empty.
fn load_state(
    store: &mut dyn LedgerStore,
    fresh: Option<&Budget>,
    config: &AccountantConfig,
) -> Result<(Ledger, CircuitBreaker), GatekeeperError> {
    let now = Instant::now();
    match store.load()? {
        Some(stored) => {
            let ledger = Ledger::replay(stored.budget, stored.carried_in_cents, stored.entries)?;
            let breaker = match &stored.breaker {
                Some(snapshot) => CircuitBreaker::restore(config.breaker, snapshot, now),
                None => CircuitBreaker::new(config.breaker, now),
            };
            Ok((ledger, breaker))
        }
        None => {
            let budget = fresh.ok_or_else(|| {
                GatekeeperError::Storage(StoreError::Corrupt("store has no open period".to_string()))
            })?;
            store.open_period(None, budget, 0, &[])?;
            Ok((
                Ledger::new(budget.clone(), 0),
                CircuitBreaker::new(config.breaker, now),
            ))
        }
    }
}

pub struct Accountant {
    config: AccountantConfig,
    gate: Mutex<Gate>,
    forecaster: Arc<dyn Forecaster>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl Accountant {
    /// Open the gatekeeper over `store`.
    ///
    /// An existing open period is replayed (its budget wins over `budget`),
    /// the breaker snapshot is restored and reservations older than
    /// `stale_after` are rolled back. A store that fails replay is fatal.
    pub fn open(
        config: AccountantConfig,
        budget: Budget,
        mut store: Box<dyn LedgerStore>,
        forecaster: Arc<dyn Forecaster>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Result<Self, GatekeeperError> {
        let (ledger, breaker) = load_state(store.as_mut(), Some(&budget), &config)?;
        tracing::info!(
            limit_cents = ledger.budget().limit_cents(),
            carried_in_cents = ledger.carried_in_cents(),
            remaining_cents = ledger.remaining_cents(),
            active_reservations = ledger.active_reservations().count(),
            breaker_state = %breaker.state(),
            "Gatekeeper opened"
        );

        let accountant = Self {
            config,
            gate: Mutex::new(Gate {
                ledger,
                breaker,
                store,
                trials: HashMap::new(),
                halted: None,
            }),
            forecaster,
            telemetry,
        };
        accountant.expire_stale(accountant.config.stale_after)?;
        Ok(accountant)
    }

    pub fn config(&self) -> &AccountantConfig {
        &self.config
    }

    /// Ask the forecaster what `task` will cost on `class`.
    ///
    /// Runs outside the critical section and touches no shared state.
    pub async fn forecast(&self, task: &Task, class: WorkerClass) -> Result<Estimate, GatekeeperError> {
        let estimate = self
            .forecaster
            .estimate(task, class)
            .await
            .and_then(Estimate::validate)
            .map_err(|e| {
                tracing::warn!(task_id = %task.id(), error = %e, "Forecast failed");
                e
            })?;
        tracing::debug!(
            task_id = %task.id(),
            class = %class,
            cost_cents = estimate.cost_cents,
            confidence = estimate.confidence,
            "Forecast ready"
        );
        Ok(estimate)
    }

    /// Reserve funds for `task`.
    ///
    /// The breaker is consulted first; an open breaker refuses without
    /// touching the ledger.
    pub fn approve(&self, task: &Task, estimate: &Estimate) -> Result<Approval, GatekeeperError> {
        let estimate = estimate.validate()?;
        let task_id = task.id();

        self.with_gate(true, |gate, events| {
            let now = Utc::now();
            let instant = Instant::now();

            let (admission, transition) = gate.breaker.admit(instant);
            gate.note_transition(transition, now, events);
            if admission.is_denied() {
                if transition.is_some() {
                    gate.save_breaker(now)?;
                }
                tracing::warn!(task_id = %task_id, state = %gate.breaker.state(), "Admission refused by circuit breaker");
                events.push(gate.event(
                    EventKind::Rejected,
                    Some(task_id),
                    Some(estimate.cost_cents),
                    Some("circuit_open".to_string()),
                    now,
                ));
                return Err(GatekeeperError::CircuitOpen);
            }

            match gate.ledger.reserve(task_id, estimate.cost_cents, now) {
                Ok(entry) => {
                    // A failed write halts; resume discards both in-memory changes.
                    let transition =
                        gate.breaker.record_reserve(admission, ReserveOutcome::Reserved, instant);
                    let snapshot = gate.breaker.snapshot(now);
                    gate.write(|s| s.append(&entry, &snapshot))?;
                    if let Some(epoch) = admission.trial_epoch() {
                        gate.trials.insert(task_id, epoch);
                    }

                    tracing::info!(
                        task_id = %task_id,
                        amount_cents = entry.amount_cents,
                        trial = admission.trial_epoch().is_some(),
                        remaining_cents = gate.ledger.remaining_cents(),
                        "Task approved"
                    );
                    events.push(gate.event(
                        EventKind::Approved,
                        Some(task_id),
                        Some(entry.amount_cents),
                        None,
                        now,
                    ));
                    gate.note_transition(transition, now, events);

                    Ok(Approval {
                        task_id,
                        entry_id: entry.id,
                        amount_cents: entry.amount_cents,
                        approved_at: now,
                        trial: admission.trial_epoch().is_some(),
                    })
                }
                Err(LedgerError::InsufficientFunds {
                    requested_cents,
                    remaining_cents,
                }) => {
                    let overt = requested_cents > gate.ledger.uncommitted_cents();
                    let transition = gate.breaker.record_reserve(
                        admission,
                        ReserveOutcome::Rejected { overt },
                        instant,
                    );
                    gate.save_breaker(now)?;

                    tracing::warn!(
                        task_id = %task_id,
                        requested_cents,
                        remaining_cents,
                        overt,
                        "Task rejected: insufficient funds"
                    );
                    events.push(gate.event(
                        EventKind::Rejected,
                        Some(task_id),
                        Some(requested_cents),
                        Some("insufficient_funds".to_string()),
                        now,
                    ));
                    gate.note_transition(transition, now, events);

                    Err(GatekeeperError::InsufficientFunds {
                        requested_cents,
                        remaining_cents,
                    })
                }
                Err(other) => {
                    gate.breaker.record_reserve(admission, ReserveOutcome::Aborted, instant);
                    tracing::error!(task_id = %task_id, error = %other, "Reservation refused");
                    Err(other.into())
                }
            }
        })
    }

    /// Finalize a reservation with what the work actually cost.
    pub fn commit(&self, task_id: TaskId, actual_cents: u64) -> Result<Settlement, GatekeeperError> {
        let tolerance = self.config.cost_tolerance;
        self.with_gate(true, |gate, events| {
            let now = Utc::now();
            let resolution = gate.ledger.commit(task_id, actual_cents, now).map_err(|e| {
                tracing::error!(task_id = %task_id, error = %e, "Commit rejected");
                GatekeeperError::from(e)
            })?;

            let reserved_cents = resolution.reserved.amount_cents;
            let signal = if within_tolerance(reserved_cents, actual_cents, tolerance) {
                Signal::Success
            } else {
                Signal::Failure
            };
            let trial = gate.trials.remove(&task_id);
            let transition = gate.breaker.record_settlement(trial, signal, Instant::now());
            let snapshot = gate.breaker.snapshot(now);
            gate.write(|s| s.settle(&resolution, &snapshot))?;

            if signal == Signal::Failure {
                tracing::warn!(
                    task_id = %task_id,
                    reserved_cents,
                    actual_cents,
                    "Actual cost outside forecast tolerance"
                );
            }
            tracing::info!(
                task_id = %task_id,
                reserved_cents,
                actual_cents,
                remaining_cents = gate.ledger.remaining_cents(),
                "Task committed"
            );
            events.push(gate.event(
                EventKind::Committed,
                Some(task_id),
                Some(actual_cents),
                (signal == Signal::Failure).then(|| format!("reserved {} cents", reserved_cents)),
                now,
            ));
            gate.note_transition(transition, now, events);

            Ok(Settlement {
                task_id,
                reserved_cents,
                actual_cents: Some(actual_cents),
                signal,
                remaining_cents: gate.ledger.remaining_cents(),
            })
        })
    }

    /// Release a reservation.
    pub fn rollback(&self, task_id: TaskId, reason: RollbackReason) -> Result<Settlement, GatekeeperError> {
        self.with_gate(true, |gate, events| {
            gate.rollback(task_id, reason, Utc::now(), events)
        })
    }

    /// Whether `actual_cents` is close enough to `reserved_cents` to count
    /// as an accurate forecast.
    pub fn is_within_tolerance(&self, reserved_cents: u64, actual_cents: u64) -> bool {
        within_tolerance(reserved_cents, actual_cents, self.config.cost_tolerance)
    }

    /// Roll back every reservation older than `max_age`.
    pub fn expire_stale(&self, max_age: Duration) -> Result<Vec<TaskId>, GatekeeperError> {
        self.with_gate(true, |gate, events| {
            gate.expire_stale(max_age, Utc::now(), events)
        })
    }

    /// Close the current period and start `budget`.
    pub fn open_period(&self, budget: Budget, rollover: bool) -> Result<ClosedPeriod, GatekeeperError> {
        self.with_gate(true, |gate, events| {
            let now = Utc::now();
            let (closed, next) = gate.ledger.roll_into(budget, rollover, now);
            let carried: Vec<LedgerEntry> = next.entries().to_vec();
            let carried_in = next.carried_in_cents();
            gate.write(|s| s.open_period(Some(&closed), next.budget(), carried_in, &carried))?;
            gate.ledger = next;

            tracing::info!(
                limit_cents = gate.ledger.budget().limit_cents(),
                carried_in_cents = carried_in,
                carried_reservations = carried.len(),
                closing_remaining_cents = closed.closing_remaining_cents,
                "Budget period opened"
            );
            events.push(gate.event(
                EventKind::PeriodOpened,
                None,
                Some(gate.ledger.budget().limit_cents()),
                Some(format!("rollover={}", rollover)),
                now,
            ));
            Ok(closed)
        })
    }

    /// Reload from the store and clear the halted state.
    pub fn resume(&self) -> Result<(), GatekeeperError> {
        let stale_after = self.config.stale_after;
        self.with_gate(false, |gate, events| {
            let (ledger, breaker) = load_state(gate.store.as_mut(), None, &self.config)?;
            gate.ledger = ledger;
            gate.breaker = breaker;
            gate.trials.clear();
            gate.halted = None;
            tracing::info!(remaining_cents = gate.ledger.remaining_cents(), "Gatekeeper resumed");
            gate.expire_stale(stale_after, Utc::now(), events)?;
            Ok(())
        })
    }

    /// Operator reset: an open breaker goes straight to half-open.
    pub fn reset_breaker(&self) -> Result<BreakerState, GatekeeperError> {
        self.with_gate(true, |gate, events| {
            let now = Utc::now();
            let transition = gate.breaker.reset();
            if transition.is_some() {
                gate.save_breaker(now)?;
            }
            gate.note_transition(transition, now, events);
            Ok(gate.breaker.state())
        })
    }

    pub fn remaining_cents(&self) -> Result<u64, GatekeeperError> {
        Ok(self.lock()?.ledger.remaining_cents())
    }

    /// Current breaker state, after applying any elapsed cooldown.
    ///
    /// A cooldown transition is persisted unless the gatekeeper is halted.
    pub fn breaker_state(&self) -> Result<BreakerState, GatekeeperError> {
        self.with_gate(false, |gate, events| {
            let now = Utc::now();
            let transition = gate.breaker.poll(Instant::now());
            gate.note_transition(transition, now, events);
            if transition.is_some() && gate.halted.is_none() {
                gate.save_breaker(now)?;
            }
            Ok(gate.breaker.state())
        })
    }

    pub fn breaker_counters(&self) -> Result<BreakerCounters, GatekeeperError> {
        Ok(self.lock()?.breaker.counters())
    }

    pub fn summary(&self) -> Result<FiscalSummary, GatekeeperError> {
        Ok(self.lock()?.ledger.summary())
    }

    pub fn active_reservations(&self) -> Result<Vec<LedgerEntry>, GatekeeperError> {
        Ok(self.lock()?.ledger.active_reservations().cloned().collect())
    }

    /// Number of times the ledger was asked to reserve in this period.
    pub fn reserve_attempts(&self) -> Result<u64, GatekeeperError> {
        Ok(self.lock()?.ledger.reserve_attempts())
    }

    pub fn closed_periods(&self) -> Result<Vec<ClosedPeriod>, GatekeeperError> {
        Ok(self.lock()?.store.closed_periods()?)
    }

    pub fn is_halted(&self) -> bool {
        self.lock().map(|g| g.halted.is_some()).unwrap_or(true)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Gate>, GatekeeperError> {
        self.gate
            .lock()
            .map_err(|_| GatekeeperError::Halted("gatekeeper state lock poisoned".to_string()))
    }

    /// Run `op` inside the critical section, then emit what it produced.
    fn with_gate<T>(
        &self,
        refuse_when_halted: bool,
        op: impl FnOnce(&mut Gate, &mut Vec<TelemetryEvent>) -> Result<T, GatekeeperError>,
    ) -> Result<T, GatekeeperError> {
        let mut events = Vec::new();
        let result = {
            let mut gate = self.lock()?;
            let halted = if refuse_when_halted {
                gate.halted.clone()
            } else {
                None
            };
            match halted {
                Some(reason) => Err(GatekeeperError::Halted(reason)),
                None => op(&mut *gate, &mut events),
            }
        };
        for event in events {
            self.telemetry.emit(event);
        }
        result
    }
}

impl fmt::Debug for Accountant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accountant")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn within_tolerance(reserved_cents: u64, actual_cents: u64, tolerance: f64) -> bool {
    actual_cents as f64 <= reserved_cents as f64 * (1.0 + tolerance.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::RollingWindow;
    use crate::store::MemoryStore;
    use crate::telemetry::BroadcastTelemetry;
    use async_trait::async_trait;

    struct FixedForecaster(Result<Estimate, ForecastError>);

    #[async_trait]
    impl Forecaster for FixedForecaster {
        async fn estimate(&self, _task: &Task, _class: WorkerClass) -> Result<Estimate, ForecastError> {
            self.0.clone()
        }
    }

    fn breaker_config() -> BreakerConfig {
        BreakerConfig {
            rejection_ratio: 0.9,
            min_samples: 100,
            consecutive_failures: 3,
            cooldown_ms: 60_000,
            trial_admissions: 2,
            window: RollingWindow::Attempts(20),
            trip_on_overt_overrun: true,
        }
    }

    fn budget(limit: u64) -> Budget {
        Budget::for_period(limit, Utc::now(), chrono::Duration::days(30)).unwrap()
    }

    fn accountant_with(limit: u64, store: MemoryStore) -> (Accountant, BroadcastTelemetry) {
        let telemetry = BroadcastTelemetry::new(64);
        let accountant = Accountant::open(
            AccountantConfig {
                breaker: breaker_config(),
                ..AccountantConfig::default()
            },
            budget(limit),
            Box::new(store),
            Arc::new(FixedForecaster(Ok(Estimate::new(10, 0.8)))),
            Arc::new(telemetry.clone()),
        )
        .unwrap();
        (accountant, telemetry)
    }

    fn accountant(limit: u64) -> Accountant {
        accountant_with(limit, MemoryStore::new()).0
    }

    fn approve(a: &Accountant, cents: u64) -> Result<Approval, GatekeeperError> {
        a.approve(&Task::new("agent", "work"), &Estimate::new(cents, 0.9))
    }

    #[test]
    fn test_approve_commit_rollback() {
        let a = accountant(100);
        let first = approve(&a, 60).unwrap();
        assert_eq!(a.remaining_cents().unwrap(), 40);
        assert!(!first.trial);

        let err = approve(&a, 50).unwrap_err();
        assert!(matches!(
            err,
            GatekeeperError::InsufficientFunds {
                requested_cents: 50,
                remaining_cents: 40
            }
        ));

        let settled = a.commit(first.task_id, 55).unwrap();
        assert_eq!(settled.signal, Signal::Success);
        assert_eq!(settled.remaining_cents, 45);

        let second = approve(&a, 40).unwrap();
        let settled = a.rollback(second.task_id, RollbackReason::WorkerFailure).unwrap();
        assert_eq!(settled.signal, Signal::Neutral);
        assert_eq!(a.remaining_cents().unwrap(), 45);

        assert!(matches!(
            a.rollback(second.task_id, RollbackReason::WorkerFailure),
            Err(GatekeeperError::UnknownReservation(_))
        ));
        assert_eq!(a.remaining_cents().unwrap(), 45);
    }

    #[test]
    fn test_open_breaker_skips_ledger() {
        let a = accountant(100);
        approve(&a, 90).unwrap();
        for _ in 0..3 {
            assert!(matches!(
                approve(&a, 20),
                Err(GatekeeperError::InsufficientFunds { .. })
            ));
        }
        assert_eq!(a.breaker_state().unwrap(), BreakerState::Open);

        let attempts = a.reserve_attempts().unwrap();
        assert!(matches!(approve(&a, 1), Err(GatekeeperError::CircuitOpen)));
        assert_eq!(a.reserve_attempts().unwrap(), attempts);
    }

    #[test]
    fn test_overt_overrun_trips() {
        let a = accountant(100);
        assert!(approve(&a, 500).is_err());
        assert_eq!(a.breaker_state().unwrap(), BreakerState::Open);
    }

    #[test]
    fn test_cost_mismatch_counts_against_breaker() {
        let a = accountant(1_000);
        let approval = approve(&a, 10).unwrap();
        let settled = a.commit(approval.task_id, 50).unwrap();
        assert_eq!(settled.signal, Signal::Failure);
        assert!(a.is_within_tolerance(100, 125));
        assert!(!a.is_within_tolerance(100, 126));

        let approval = approve(&a, 10).unwrap();
        let settled = a.rollback(approval.task_id, RollbackReason::CostMismatch).unwrap();
        assert_eq!(settled.signal, Signal::Failure);
    }

    #[test]
    fn test_half_open_trials_close_breaker() {
        let a = accountant(1_000);
        assert!(approve(&a, 5_000).is_err());
        assert_eq!(a.reset_breaker().unwrap(), BreakerState::HalfOpen);

        let t1 = approve(&a, 10).unwrap();
        let t2 = approve(&a, 10).unwrap();
        assert!(t1.trial && t2.trial);
        assert!(matches!(approve(&a, 10), Err(GatekeeperError::CircuitOpen)));

        a.commit(t1.task_id, 10).unwrap();
        assert_eq!(a.breaker_state().unwrap(), BreakerState::HalfOpen);
        a.commit(t2.task_id, 11).unwrap();
        assert_eq!(a.breaker_state().unwrap(), BreakerState::Closed);
    }

    #[test]
    fn test_store_failure_halts_until_resume() {
        let store = MemoryStore::new();
        let (a, _) = accountant_with(100, store.clone());
        let kept = approve(&a, 30).unwrap();

        store.set_fail_writes(true);
        assert!(matches!(approve(&a, 10), Err(GatekeeperError::Storage(_))));
        assert!(a.is_halted());
        assert!(matches!(approve(&a, 10), Err(GatekeeperError::Halted(_))));

        store.set_fail_writes(false);
        a.resume().unwrap();
        assert!(!a.is_halted());
        // The unpersisted reservation is gone; the persisted one survives.
        assert_eq!(a.remaining_cents().unwrap(), 70);
        a.commit(kept.task_id, 30).unwrap();
    }

    #[test]
    fn test_reopen_replays_and_expires_stale() {
        let store = MemoryStore::new();
        let (a, _) = accountant_with(100, store.clone());
        let committed = approve(&a, 20).unwrap();
        a.commit(committed.task_id, 25).unwrap();
        approve(&a, 30).unwrap();
        let before = a.summary().unwrap();
        drop(a);

        let (reopened, _) = accountant_with(100, store.clone());
        assert_eq!(reopened.summary().unwrap(), before);

        let expired = reopened.expire_stale(Duration::ZERO).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(reopened.remaining_cents().unwrap(), 75);
    }

    #[test]
    fn test_open_period_carries_reservations() {
        let a = accountant(100);
        let held = approve(&a, 40).unwrap();
        let done = approve(&a, 10).unwrap();
        a.commit(done.task_id, 10).unwrap();

        let closed = a.open_period(budget(200), true).unwrap();
        assert_eq!(closed.closing_remaining_cents, 50);
        assert_eq!(a.closed_periods().unwrap().len(), 1);
        // 200 + 50 rolled over; 40 still held.
        assert_eq!(a.remaining_cents().unwrap(), 250);

        a.commit(held.task_id, 40).unwrap();
        assert_eq!(a.remaining_cents().unwrap(), 250);
    }

    #[test]
    fn test_carried_rollback_does_not_fund_new_period() {
        let store = MemoryStore::new();
        let (a, _) = accountant_with(100, store.clone());
        let held = approve(&a, 40).unwrap();

        a.open_period(budget(100), false).unwrap();
        assert_eq!(a.remaining_cents().unwrap(), 100);
        a.rollback(held.task_id, RollbackReason::WorkerFailure).unwrap();
        assert_eq!(a.remaining_cents().unwrap(), 100);
        assert!(matches!(
            approve(&a, 140),
            Err(GatekeeperError::InsufficientFunds {
                requested_cents: 140,
                remaining_cents: 100
            })
        ));
        drop(a);

        let (reopened, _) = accountant_with(100, store);
        assert_eq!(reopened.remaining_cents().unwrap(), 100);
    }

    #[test]
    fn test_failed_append_persists_neither_entry_nor_breaker() {
        let store = MemoryStore::new();
        let (a, _) = accountant_with(100, store.clone());
        let kept = approve(&a, 10).unwrap();
        let saved = store.breaker().unwrap();

        store.set_fail_writes(true);
        assert!(matches!(approve(&a, 20), Err(GatekeeperError::Storage(_))));
        assert_eq!(store.entries().len(), 1);
        assert_eq!(store.breaker(), Some(saved));

        store.set_fail_writes(false);
        a.resume().unwrap();
        let active = a.active_reservations().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].task_id, kept.task_id);
        assert_eq!(a.remaining_cents().unwrap(), 90);
    }

    #[test]
    fn test_cooldown_transition_is_persisted() {
        let store = MemoryStore::new();
        let a = Accountant::open(
            AccountantConfig {
                breaker: BreakerConfig {
                    cooldown_ms: 20,
                    ..breaker_config()
                },
                ..AccountantConfig::default()
            },
            budget(100),
            Box::new(store.clone()),
            Arc::new(FixedForecaster(Ok(Estimate::new(10, 0.8)))),
            Arc::new(crate::telemetry::NullTelemetry),
        )
        .unwrap();
        assert!(approve(&a, 500).is_err());
        assert_eq!(store.breaker().unwrap().state, BreakerState::Open);

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(a.breaker_state().unwrap(), BreakerState::HalfOpen);
        assert_eq!(store.breaker().unwrap().state, BreakerState::HalfOpen);
    }

    #[tokio::test]
    async fn test_forecast_failures_are_unavailable() {
        let a = Accountant::open(
            AccountantConfig::default(),
            budget(100),
            Box::new(MemoryStore::new()),
            Arc::new(FixedForecaster(Err(ForecastError::Unavailable(
                "timeout".to_string(),
            )))),
            Arc::new(crate::telemetry::NullTelemetry),
        )
        .unwrap();
        let task = Task::new("agent", "work");
        let err = a.forecast(&task, WorkerClass::Local).await.unwrap_err();
        assert!(matches!(err, GatekeeperError::ForecastUnavailable(_)));
        assert_eq!(a.reserve_attempts().unwrap(), 0);

        assert!(matches!(
            a.approve(&task, &Estimate::new(5, 2.0)),
            Err(GatekeeperError::ForecastUnavailable(ForecastError::Malformed(_)))
        ));
        assert_eq!(a.reserve_attempts().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_telemetry_emitted() {
        let (a, telemetry) = accountant_with(100, MemoryStore::new());
        let mut rx = telemetry.subscribe();
        let approval = approve(&a, 10).unwrap();
        a.commit(approval.task_id, 10).unwrap();

        let approved = rx.recv().await.unwrap();
        assert_eq!(approved.kind, EventKind::Approved);
        assert_eq!(approved.remaining_cents, 90);
        let committed = rx.recv().await.unwrap();
        assert_eq!(committed.kind, EventKind::Committed);
        assert_eq!(committed.amount_cents, Some(10));
    }
}
