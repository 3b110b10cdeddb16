//! Circuit breaker for task admission.
//!
//! The breaker never looks at individual tasks or agents. It watches the
//! aggregate stream of admission outcomes and trips when rejection pressure
//! looks like a runaway loop of self-triggered requests.
//!
//! # States
//! - **Closed**: everything is admitted; outcomes feed the rolling window
//! - **Open**: everything is refused without touching the ledger
//! - **HalfOpen**: up to `K` concurrent trial admissions test recovery
//!
//! All methods take the current instant explicitly so transitions are
//! deterministic under test.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
            Self::HalfOpen => f.write_str("half_open"),
        }
    }
}

/// Window over which the rejection ratio is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollingWindow {
    /// The last `W` admission attempts.
    Attempts(usize),
    /// Attempts seen in the last `T` seconds.
    Seconds(u64),
}

/// Breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// `R`: trip when rejections / attempts in the window exceeds this.
    pub rejection_ratio: f64,
    /// Minimum attempts in the window before the ratio is trusted.
    pub min_samples: usize,
    /// `N`: trip after this many consecutive reserve failures.
    pub consecutive_failures: u32,
    /// `C`: quiet time in Open before probing again.
    pub cooldown_ms: u64,
    /// `K`: successful trials needed to close, and concurrent trial slots.
    pub trial_admissions: u32,
    pub window: RollingWindow,
    /// Trip immediately when one forecast exceeds everything not yet committed.
    pub trip_on_overt_overrun: bool,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            rejection_ratio: 0.5,
            min_samples: 10,
            consecutive_failures: 5,
            cooldown_ms: 30_000,
            trial_admissions: 3,
            window: RollingWindow::Attempts(20),
            trip_on_overt_overrun: true,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.rejection_ratio) {
            return Err(format!(
                "rejection_ratio must be within [0, 1], got {}",
                self.rejection_ratio
            ));
        }
        if self.consecutive_failures == 0 {
            return Err("consecutive_failures must be at least 1".to_string());
        }
        if self.trial_admissions == 0 {
            return Err("trial_admissions must be at least 1".to_string());
        }
        match self.window {
            RollingWindow::Attempts(0) => Err("window of 0 attempts".to_string()),
            RollingWindow::Seconds(0) => Err("window of 0 seconds".to_string()),
            _ => Ok(()),
        }
    }
}

/// Decision returned by [`CircuitBreaker::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed breaker; outcome feeds the rolling window.
    Normal,
    /// Half-open trial. `epoch` identifies the trial round.
    Trial { epoch: u64 },
    /// Refused without consulting the ledger.
    Denied,
}

impl Admission {
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied)
    }

    pub fn trial_epoch(&self) -> Option<u64> {
        match self {
            Self::Trial { epoch } => Some(*epoch),
            _ => None,
        }
    }
}

/// What happened when an admitted request tried to reserve funds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved,
    /// `overt` is set when the forecast alone exceeds every uncommitted cent.
    Rejected { overt: bool },
    /// The attempt ended for a reason unrelated to budget pressure.
    Aborted,
}

/// How a settled reservation should count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Success,
    Failure,
    Neutral,
}

/// A state change, reported so callers can log and emit telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: BreakerState,
    pub to: BreakerState,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerCounters {
    pub admitted: u64,
    pub rejected: u64,
    pub short_circuited: u64,
    pub trips: u64,
}

/// Persistable view of the breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub trial_successes: u32,
    pub epoch: u64,
    /// Rolling window contents, oldest first (`true` = rejection).
    pub recent_rejections: Vec<bool>,
    pub counters: BreakerCounters,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    rejected: bool,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    samples: VecDeque<Sample>,
    consecutive_failures: u32,
    trials_in_flight: u32,
    trial_successes: u32,
    epoch: u64,
    /// While Open: when the cooldown clock last restarted.
    quiet_since: Instant,
    counters: BreakerCounters,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, now: Instant) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            samples: VecDeque::new(),
            consecutive_failures: 0,
            trials_in_flight: 0,
            trial_successes: 0,
            epoch: 0,
            quiet_since: now,
            counters: BreakerCounters::default(),
        }
    }

    /// Rebuild from a snapshot. Window samples are re-stamped at `now`;
    /// an open breaker restarts its cooldown; in-flight trials are forgotten.
    pub fn restore(config: BreakerConfig, snapshot: &BreakerSnapshot, now: Instant) -> Self {
        let mut breaker = Self::new(config, now);
        breaker.state = snapshot.state;
        breaker.consecutive_failures = snapshot.consecutive_failures;
        breaker.trial_successes = snapshot.trial_successes;
        breaker.epoch = snapshot.epoch;
        breaker.counters = snapshot.counters;
        for &rejected in &snapshot.recent_rejections {
            breaker.push_sample(rejected, now);
        }
        breaker
    }

    pub fn snapshot(&self, saved_at: DateTime<Utc>) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            trial_successes: self.trial_successes,
            epoch: self.epoch,
            recent_rejections: self.samples.iter().map(|s| s.rejected).collect(),
            counters: self.counters,
            saved_at,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn counters(&self) -> BreakerCounters {
        self.counters
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn trials_in_flight(&self) -> u32 {
        self.trials_in_flight
    }

    /// Rejections / attempts over the current window (0 when empty).
    pub fn rejection_ratio(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let rejected = self.samples.iter().filter(|s| s.rejected).count();
        rejected as f64 / self.samples.len() as f64
    }

    /// Advance time-based transitions (Open -> HalfOpen after a quiet cooldown).
    pub fn poll(&mut self, now: Instant) -> Option<Transition> {
        if self.state == BreakerState::Open
            && now.saturating_duration_since(self.quiet_since) >= self.config.cooldown()
        {
            return Some(self.half_open("cooldown elapsed"));
        }
        None
    }

    /// Ask for admission. Attempts refused while Open restart the cooldown.
    pub fn admit(&mut self, now: Instant) -> (Admission, Option<Transition>) {
        let transition = self.poll(now);
        let admission = match self.state {
            BreakerState::Closed => Admission::Normal,
            BreakerState::Open => {
                self.quiet_since = now;
                self.counters.short_circuited += 1;
                Admission::Denied
            }
            BreakerState::HalfOpen => {
                if self.trials_in_flight < self.config.trial_admissions {
                    self.trials_in_flight += 1;
                    Admission::Trial { epoch: self.epoch }
                } else {
                    self.counters.short_circuited += 1;
                    Admission::Denied
                }
            }
        };
        (admission, transition)
    }

    /// Feed the result of a reservation attempt that was admitted.
    pub fn record_reserve(
        &mut self,
        admission: Admission,
        outcome: ReserveOutcome,
        now: Instant,
    ) -> Option<Transition> {
        match outcome {
            ReserveOutcome::Reserved => self.counters.admitted += 1,
            ReserveOutcome::Rejected { .. } => self.counters.rejected += 1,
            ReserveOutcome::Aborted => {}
        }

        match admission {
            Admission::Denied => None,
            Admission::Trial { epoch } => {
                if !self.is_current_trial(epoch) {
                    return None;
                }
                match outcome {
                    ReserveOutcome::Reserved => None,
                    ReserveOutcome::Rejected { .. } => Some(self.trip(now, "trial admission rejected")),
                    ReserveOutcome::Aborted => {
                        self.trials_in_flight = self.trials_in_flight.saturating_sub(1);
                        None
                    }
                }
            }
            Admission::Normal => {
                if self.state != BreakerState::Closed {
                    return None;
                }
                match outcome {
                    ReserveOutcome::Reserved => {
                        self.consecutive_failures = 0;
                        self.push_sample(false, now);
                        None
                    }
                    ReserveOutcome::Rejected { overt } => {
                        self.consecutive_failures += 1;
                        self.push_sample(true, now);
                        if overt && self.config.trip_on_overt_overrun {
                            return Some(
                                self.trip(now, "forecast exceeds entire remaining budget"),
                            );
                        }
                        self.evaluate(now)
                    }
                    ReserveOutcome::Aborted => None,
                }
            }
        }
    }

    /// Feed the settlement (commit or rollback) of a reservation.
    ///
    /// `trial` is the epoch of the admission that created the reservation,
    /// if it was a half-open trial.
    pub fn record_settlement(
        &mut self,
        trial: Option<u64>,
        signal: Signal,
        now: Instant,
    ) -> Option<Transition> {
        if let Some(epoch) = trial {
            if self.is_current_trial(epoch) {
                self.trials_in_flight = self.trials_in_flight.saturating_sub(1);
                return match signal {
                    Signal::Success => {
                        self.trial_successes += 1;
                        if self.trial_successes >= self.config.trial_admissions {
                            Some(self.close("trial admissions succeeded"))
                        } else {
                            None
                        }
                    }
                    Signal::Failure => Some(self.trip(now, "trial cost outside tolerance")),
                    Signal::Neutral => None,
                };
            }
        }

        if self.state == BreakerState::Closed && signal == Signal::Failure {
            self.consecutive_failures += 1;
            self.push_sample(true, now);
            return self.evaluate(now);
        }
        None
    }

    /// Operator reset: an open breaker moves straight to HalfOpen.
    pub fn reset(&mut self) -> Option<Transition> {
        if self.state == BreakerState::Open {
            return Some(self.half_open("manual reset"));
        }
        None
    }

    fn is_current_trial(&self, epoch: u64) -> bool {
        self.state == BreakerState::HalfOpen && epoch == self.epoch
    }

    fn evaluate(&mut self, now: Instant) -> Option<Transition> {
        if self.consecutive_failures >= self.config.consecutive_failures {
            return Some(self.trip(now, "consecutive reserve failures"));
        }
        if self.samples.len() >= self.config.min_samples.max(1)
            && self.rejection_ratio() > self.config.rejection_ratio
        {
            return Some(self.trip(now, "rejection ratio exceeded"));
        }
        None
    }

    fn push_sample(&mut self, rejected: bool, now: Instant) {
        self.samples.push_back(Sample { at: now, rejected });
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        match self.config.window {
            RollingWindow::Attempts(w) => {
                while self.samples.len() > w {
                    self.samples.pop_front();
                }
            }
            RollingWindow::Seconds(t) => {
                let span = Duration::from_secs(t);
                while self
                    .samples
                    .front()
                    .is_some_and(|s| now.saturating_duration_since(s.at) > span)
                {
                    self.samples.pop_front();
                }
            }
        }
    }

    fn trip(&mut self, now: Instant, reason: &'static str) -> Transition {
        let from = self.state;
        self.state = BreakerState::Open;
        self.quiet_since = now;
        self.trials_in_flight = 0;
        self.trial_successes = 0;
        self.counters.trips += 1;
        Transition {
            from,
            to: BreakerState::Open,
            reason,
        }
    }

    fn half_open(&mut self, reason: &'static str) -> Transition {
        self.state = BreakerState::HalfOpen;
        self.epoch += 1;
        self.trials_in_flight = 0;
        self.trial_successes = 0;
        Transition {
            from: BreakerState::Open,
            to: BreakerState::HalfOpen,
            reason,
        }
    }

    fn close(&mut self, reason: &'static str) -> Transition {
        let from = self.state;
        self.state = BreakerState::Closed;
        self.samples.clear();
        self.consecutive_failures = 0;
        self.trials_in_flight = 0;
        self.trial_successes = 0;
        Transition {
            from,
            to: BreakerState::Closed,
            reason,
        }
    }
}
