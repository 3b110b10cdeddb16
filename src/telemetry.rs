//! Telemetry events emitted by the gatekeeper.
//!
//! Sinks are fire-and-forget: `emit` must return immediately and never
//! fail, since it is called on the approval path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::breaker::BreakerState;
use crate::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Approved,
    Rejected,
    Committed,
    RolledBack,
    BreakerTransition,
    PeriodOpened,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub timestamp: DateTime<Utc>,
    pub task_id: Option<TaskId>,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_cents: Option<u64>,
    pub breaker_state: BreakerState,
    pub remaining_cents: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

/// Drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {
    fn emit(&self, _event: TelemetryEvent) {}
}

/// Writes events to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn emit(&self, event: TelemetryEvent) {
        tracing::debug!(
            kind = ?event.kind,
            task_id = ?event.task_id,
            amount_cents = ?event.amount_cents,
            breaker_state = %event.breaker_state,
            remaining_cents = event.remaining_cents,
            detail = ?event.detail,
            "ledger event"
        );
    }
}

/// Fans events out to any number of dashboard subscribers.
///
/// Slow subscribers lag and lose events; the sender never waits.
#[derive(Debug, Clone)]
pub struct BroadcastTelemetry {
    tx: broadcast::Sender<TelemetryEvent>,
}

impl BroadcastTelemetry {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.tx.subscribe()
    }
}

impl TelemetrySink for BroadcastTelemetry {
    fn emit(&self, event: TelemetryEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}
