//! Supervisor: drives each task through forecast, approval and dispatch.
//!
//! ```text
//! Submitted -> Forecasted -> Reserved -> Dispatched -> Completed
//!     |            |                         |
//!     +------------+--> Rejected             +--> RolledBack
//! ```
//!
//! Workers only ever see a task after the gatekeeper approved it. Every
//! dispatched task ends in exactly one commit or rollback: the worker's
//! result, its failure, the dispatch timeout or a cancellation, whichever
//! comes first.
//!
//! A task only reaches Completed or RolledBack once the gatekeeper has
//! recorded its commit or rollback. If the gatekeeper refuses (halted, store
//! down), the task stays where it is with a [`PendingSettlement`] until
//! [`Supervisor::retry_settlements`] gets it through.
//!
//! Lock order is the task table first, then the gatekeeper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::accountant::{Accountant, Approval, GatekeeperError, RollbackReason};
use crate::agents::{ExecutionError, WorkOutcome, WorkerPool, WorkerRef};
use crate::budget::{RoutingPolicy, WorkerClass};
use crate::forecast::Estimate;
use crate::task::{Task, TaskId, TaskState};

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    /// How long a dispatched task may run before it is rolled back.
    pub dispatch_timeout: Duration,
    pub routing: RoutingPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout: Duration::from_secs(120),
            routing: RoutingPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("task {0} was already submitted")]
    DuplicateTask(TaskId),

    #[error("task {0} was cancelled before approval")]
    Cancelled(TaskId),

    #[error("no worker registered for {0} tasks")]
    NoWorker(WorkerClass),

    #[error("task {0} has no completed output to hand off")]
    NothingToHandOff(TaskId),

    #[error("task {task_id} rejected: {source}")]
    Rejected {
        task_id: TaskId,
        #[source]
        source: GatekeeperError,
    },

    #[error(transparent)]
    Gatekeeper(#[from] GatekeeperError),
}

/// What the gatekeeper must record to close a task's reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SettlementAction {
    Commit { actual_cents: u64 },
    Rollback { reason: RollbackReason },
}

impl SettlementAction {
    /// State the task reaches once the gatekeeper records this.
    fn target(&self) -> TaskState {
        match self {
            Self::Commit { .. } => TaskState::Completed,
            Self::Rollback { .. } => TaskState::RolledBack,
        }
    }
}

impl std::fmt::Display for SettlementAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Commit { actual_cents } => write!(f, "commit of {} cents", actual_cents),
            Self::Rollback { reason } => write!(f, "rollback ({})", reason),
        }
    }
}

/// A settlement the gatekeeper refused; the reservation is still held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSettlement {
    pub action: SettlementAction,
    pub error: String,
}

/// Everything the supervisor knows about one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: Task,
    pub state: TaskState,
    pub worker_class: Option<WorkerClass>,
    pub estimate: Option<Estimate>,
    pub approval: Option<Approval>,
    pub actual_cost_cents: Option<u64>,
    pub output: Option<String>,
    pub failure: Option<String>,
    pub pending_settlement: Option<PendingSettlement>,
    pub updated_at: DateTime<Utc>,
}

struct Slot {
    record: TaskRecord,
    state_tx: watch::Sender<TaskState>,
    cancel: CancellationToken,
}

impl Slot {
    fn new(task: Task) -> Self {
        let (state_tx, _) = watch::channel(TaskState::Submitted);
        Self {
            record: TaskRecord {
                task,
                state: TaskState::Submitted,
                worker_class: None,
                estimate: None,
                approval: None,
                actual_cost_cents: None,
                output: None,
                failure: None,
                pending_settlement: None,
                updated_at: Utc::now(),
            },
            state_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Move to `next` if the state machine allows it.
    fn advance(&mut self, next: TaskState) -> bool {
        let current = self.record.state;
        if !current.can_transition_to(next) {
            tracing::warn!(
                task_id = %self.record.task.id(),
                from = %current,
                to = %next,
                "Ignoring illegal task transition"
            );
            return false;
        }
        self.record.state = next;
        self.record.updated_at = Utc::now();
        self.state_tx.send_replace(next);
        tracing::debug!(task_id = %self.record.task.id(), from = %current, to = %next, "Task transition");
        true
    }

    fn reject(&mut self, reason: impl Into<String>) {
        self.record.failure = Some(reason.into());
        self.advance(TaskState::Rejected);
    }

    /// Apply the gatekeeper's answer to `action`. Returns true once the
    /// task is terminal.
    fn conclude(&mut self, action: SettlementAction, result: Result<(), GatekeeperError>) -> bool {
        let task_id = self.record.task.id();
        match result {
            Ok(()) => {
                self.record.pending_settlement = None;
                self.advance(action.target())
            }
            // Someone else (stale expiry) already released the funds.
            Err(GatekeeperError::UnknownReservation(_)) => {
                tracing::warn!(task_id = %task_id, action = %action, "Reservation already released");
                self.record.pending_settlement = None;
                if matches!(action, SettlementAction::Commit { .. }) {
                    self.record.failure =
                        Some(format!("{} not recorded: reservation already released", action));
                }
                self.advance(TaskState::RolledBack)
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, action = %action, error = %e, "Settlement deferred");
                self.record.pending_settlement = Some(PendingSettlement {
                    action,
                    error: e.to_string(),
                });
                self.record.updated_at = Utc::now();
                false
            }
        }
    }
}

enum DispatchResult {
    Finished(WorkOutcome),
    Failed(ExecutionError),
    TimedOut,
    Cancelled,
}

struct Inner {
    accountant: Arc<Accountant>,
    workers: WorkerPool,
    config: SupervisorConfig,
    tasks: RwLock<HashMap<TaskId, Slot>>,
}

/// Cheap to clone; clones share the same task table.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(accountant: Arc<Accountant>, workers: WorkerPool, config: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                accountant,
                workers,
                config,
                tasks: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn accountant(&self) -> &Arc<Accountant> {
        &self.inner.accountant
    }

    /// Submit a task. Returns once it is dispatched (or rejected); use
    /// [`Supervisor::wait`] for the outcome.
    pub async fn submit(&self, task: Task) -> Result<TaskId, SupervisorError> {
        self.submit_to(task, None).await
    }

    /// Submit a follow-up task whose payload is the output of the
    /// completed task `from`, run by `to` whatever routing would pick.
    /// The follow-up is forecast and reserved like any other task.
    pub async fn hand_off(
        &self,
        from: TaskId,
        requester_id: impl Into<String>,
        to: WorkerRef,
    ) -> Result<TaskId, SupervisorError> {
        let output = {
            let tasks = self.inner.tasks.read().await;
            let record = &tasks.get(&from).ok_or(SupervisorError::UnknownTask(from))?.record;
            match (record.state, &record.output) {
                (TaskState::Completed, Some(output)) => output.clone(),
                _ => return Err(SupervisorError::NothingToHandOff(from)),
            }
        };
        tracing::info!(from = %from, worker = to.description(), "Handing off task output");
        self.submit_to(Task::new(requester_id, output), Some(to)).await
    }

    async fn submit_to(&self, task: Task, pinned: Option<WorkerRef>) -> Result<TaskId, SupervisorError> {
        let task_id = task.id();
        {
            let mut tasks = self.inner.tasks.write().await;
            if tasks.contains_key(&task_id) {
                return Err(SupervisorError::DuplicateTask(task_id));
            }
            tasks.insert(task_id, Slot::new(task.clone()));
        }

        let accountant = &self.inner.accountant;
        let remaining = match accountant.remaining_cents() {
            Ok(remaining) => remaining,
            Err(e) => return Err(self.reject(task_id, e).await),
        };
        let class = match &pinned {
            Some(worker) => worker.class(),
            None => self.inner.config.routing.route(remaining, task.complexity()),
        };
        tracing::info!(task_id = %task_id, class = %class, complexity = task.complexity().score(), "Task routed");

        let forecast = accountant.forecast(&task, class).await;

        let mut tasks = self.inner.tasks.write().await;
        let slot = tasks
            .get_mut(&task_id)
            .ok_or(SupervisorError::UnknownTask(task_id))?;
        if slot.record.state != TaskState::Submitted {
            return Err(SupervisorError::Cancelled(task_id));
        }
        slot.record.worker_class = Some(class);

        let estimate = match forecast {
            Ok(estimate) => estimate,
            Err(e) => {
                slot.reject(e.to_string());
                return Err(SupervisorError::Rejected { task_id, source: e });
            }
        };
        slot.record.estimate = Some(estimate);
        slot.advance(TaskState::Forecasted);

        // Approval happens under the task table lock so a concurrent cancel
        // sees either Forecasted (no funds held) or Dispatched (rolls back).
        let approval = match accountant.approve(&task, &estimate) {
            Ok(approval) => approval,
            Err(e) => {
                slot.reject(e.to_string());
                return Err(SupervisorError::Rejected { task_id, source: e });
            }
        };
        slot.record.approval = Some(approval.clone());
        slot.advance(TaskState::Reserved);

        let Some(worker) = pinned.or_else(|| self.inner.workers.resolve(class)) else {
            slot.record.failure = Some(format!("no worker for {}", class));
            let action = SettlementAction::Rollback {
                reason: RollbackReason::WorkerFailure,
            };
            let result = self.record_settlement(task_id, action);
            slot.conclude(action, result);
            return Err(SupervisorError::NoWorker(class));
        };

        slot.advance(TaskState::Dispatched);
        let cancel = slot.cancel.clone();
        drop(tasks);

        tracing::info!(
            task_id = %task_id,
            worker = worker.description(),
            amount_cents = approval.amount_cents,
            "Task dispatched"
        );
        let this = self.clone();
        tokio::spawn(async move {
            this.dispatch(task, approval, worker, cancel).await;
        });

        Ok(task_id)
    }

    async fn dispatch(
        &self,
        task: Task,
        approval: Approval,
        worker: WorkerRef,
        cancel: CancellationToken,
    ) {
        let timeout = self.inner.config.dispatch_timeout;
        let result = tokio::select! {
            _ = cancel.cancelled() => DispatchResult::Cancelled,
            res = tokio::time::timeout(timeout, worker.execute(&task, &approval)) => match res {
                Ok(Ok(outcome)) => DispatchResult::Finished(outcome),
                Ok(Err(e)) => DispatchResult::Failed(e),
                Err(_) => DispatchResult::TimedOut,
            },
        };
        self.settle(&approval, result).await;
    }

    async fn settle(&self, approval: &Approval, result: DispatchResult) {
        let task_id = approval.task_id;
        let accountant = &self.inner.accountant;

        let (action, actual_cost_cents, output, failure) = match result {
            DispatchResult::Finished(outcome) => (
                SettlementAction::Commit {
                    actual_cents: outcome.actual_cost_cents,
                },
                Some(outcome.actual_cost_cents),
                Some(outcome.output),
                None,
            ),
            DispatchResult::Failed(err) => {
                let reason = match err.actual_cost_cents {
                    Some(spent) if !accountant.is_within_tolerance(approval.amount_cents, spent) => {
                        RollbackReason::CostMismatch
                    }
                    _ => RollbackReason::WorkerFailure,
                };
                tracing::warn!(task_id = %task_id, error = %err, reason = %reason, "Worker failed");
                (
                    SettlementAction::Rollback { reason },
                    err.actual_cost_cents,
                    None,
                    Some(err.message),
                )
            }
            DispatchResult::TimedOut => {
                tracing::warn!(
                    task_id = %task_id,
                    timeout_ms = self.inner.config.dispatch_timeout.as_millis() as u64,
                    "Worker timed out"
                );
                (
                    SettlementAction::Rollback {
                        reason: RollbackReason::Timeout,
                    },
                    None,
                    None,
                    Some("dispatch timed out".to_string()),
                )
            }
            DispatchResult::Cancelled => {
                tracing::info!(task_id = %task_id, "Dispatched task cancelled");
                (
                    SettlementAction::Rollback {
                        reason: RollbackReason::Cancelled,
                    },
                    None,
                    None,
                    Some("cancelled".to_string()),
                )
            }
        };

        let mut tasks = self.inner.tasks.write().await;
        let result = self.record_settlement(task_id, action);
        if let Some(slot) = tasks.get_mut(&task_id) {
            slot.record.actual_cost_cents = actual_cost_cents;
            slot.record.output = output;
            slot.record.failure = failure;
            slot.conclude(action, result);
        }
    }

    fn record_settlement(&self, task_id: TaskId, action: SettlementAction) -> Result<(), GatekeeperError> {
        let accountant = &self.inner.accountant;
        match action {
            SettlementAction::Commit { actual_cents } => accountant.commit(task_id, actual_cents),
            SettlementAction::Rollback { reason } => accountant.rollback(task_id, reason),
        }
        .map(|_| ())
    }

    /// Re-issue every settlement the gatekeeper refused earlier, typically
    /// after [`Accountant::resume`]. Returns the tasks that are now terminal.
    pub async fn retry_settlements(&self) -> Vec<TaskId> {
        let mut tasks = self.inner.tasks.write().await;
        let mut settled = Vec::new();
        for (task_id, slot) in tasks.iter_mut() {
            let Some(pending) = slot.record.pending_settlement.clone() else {
                continue;
            };
            let result = self.record_settlement(*task_id, pending.action);
            if slot.conclude(pending.action, result) {
                tracing::info!(task_id = %task_id, action = %pending.action, "Deferred settlement recorded");
                settled.push(*task_id);
            }
        }
        settled
    }

    async fn reject(&self, task_id: TaskId, source: GatekeeperError) -> SupervisorError {
        if let Some(slot) = self.inner.tasks.write().await.get_mut(&task_id) {
            slot.reject(source.to_string());
        }
        SupervisorError::Rejected { task_id, source }
    }

    /// Cancel a task. Before approval it is simply rejected; after
    /// approval its reservation is rolled back by the dispatcher.
    pub async fn cancel(&self, task_id: TaskId) -> Result<TaskState, SupervisorError> {
        let mut tasks = self.inner.tasks.write().await;
        let slot = tasks
            .get_mut(&task_id)
            .ok_or(SupervisorError::UnknownTask(task_id))?;

        match slot.record.state {
            TaskState::Submitted | TaskState::Forecasted => {
                slot.reject("cancelled");
                slot.cancel.cancel();
            }
            state if state.holds_reservation() => slot.cancel.cancel(),
            _ => {}
        }
        Ok(slot.record.state)
    }

    /// Wait until the task reaches a terminal state.
    pub async fn wait(&self, task_id: TaskId) -> Result<TaskRecord, SupervisorError> {
        let mut rx = {
            let tasks = self.inner.tasks.read().await;
            tasks
                .get(&task_id)
                .ok_or(SupervisorError::UnknownTask(task_id))?
                .state_tx
                .subscribe()
        };
        rx.wait_for(|state| state.is_terminal())
            .await
            .map_err(|_| SupervisorError::UnknownTask(task_id))?;
        drop(rx);

        self.snapshot(task_id)
            .await
            .ok_or(SupervisorError::UnknownTask(task_id))
    }

    pub async fn snapshot(&self, task_id: TaskId) -> Option<TaskRecord> {
        self.inner
            .tasks
            .read()
            .await
            .get(&task_id)
            .map(|slot| slot.record.clone())
    }

    /// All tracked tasks, oldest first.
    pub async fn tasks(&self) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self
            .inner
            .tasks
            .read()
            .await
            .values()
            .map(|slot| slot.record.clone())
            .collect();
        records.sort_by_key(|r| r.task.created_at());
        records
    }

    /// Drop terminal tasks from the table and hand them back for archiving.
    pub async fn prune_terminal(&self) -> Vec<TaskRecord> {
        let mut tasks = self.inner.tasks.write().await;
        let done: Vec<TaskId> = tasks
            .iter()
            .filter(|(_, slot)| slot.record.state.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        done.into_iter()
            .filter_map(|id| tasks.remove(&id))
            .map(|slot| slot.record)
            .collect()
    }

    /// Roll back reservations the gatekeeper holds for tasks this
    /// supervisor is not running, once they outlive the dispatch timeout.
    pub async fn reap_orphans(&self) -> Result<Vec<TaskId>, SupervisorError> {
        let tasks = self.inner.tasks.read().await;
        let accountant = &self.inner.accountant;
        let cutoff = chrono::Duration::from_std(self.inner.config.dispatch_timeout)
            .map(|timeout| Utc::now() - timeout)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let orphans: Vec<TaskId> = accountant
            .active_reservations()?
            .into_iter()
            .filter(|entry| !tasks.contains_key(&entry.task_id) && entry.created_at < cutoff)
            .map(|entry| entry.task_id)
            .collect();

        for task_id in &orphans {
            tracing::warn!(task_id = %task_id, "Rolling back orphaned reservation");
            accountant.rollback(*task_id, RollbackReason::Stale)?;
        }
        Ok(orphans)
    }

    /// Start the background reconciliation task: every `every`, retry
    /// deferred settlements and reap orphaned reservations. Stops when
    /// `cancel_token` fires.
    pub fn start_reconciliation(&self, every: Duration, cancel_token: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::debug!(interval_ms = every.as_millis() as u64, "Reconciliation loop started");

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        tracing::debug!("Reconciliation loop shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        this.reconcile().await;
                    }
                }
            }
        })
    }

    async fn reconcile(&self) {
        if self.inner.accountant.is_halted() {
            return;
        }
        let settled = self.retry_settlements().await;
        if !settled.is_empty() {
            tracing::info!(count = settled.len(), "Deferred settlements recorded");
        }
        if let Err(e) = self.reap_orphans().await {
            tracing::warn!(error = %e, "Orphan reaping failed");
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.inner.config)
            .field("workers", &self.inner.workers)
            .finish_non_exhaustive()
    }
}
