//! Scripted worker for demos and tests.

use std::time::Duration;

use async_trait::async_trait;

use super::session::{SessionSummary, SessionTally};
use super::{ExecutionError, WorkOutcome, Worker};
use crate::accountant::Approval;
use crate::budget::WorkerClass;
use crate::task::Task;

#[derive(Debug)]
pub struct SimulatedWorker {
    class: WorkerClass,
    /// Actual cost as a multiple of the approved amount.
    cost_ratio: f64,
    delay: Duration,
    failure: Option<String>,
    session: SessionTally,
}

impl SimulatedWorker {
    pub fn new(class: WorkerClass) -> Self {
        Self {
            class,
            cost_ratio: 1.0,
            delay: Duration::ZERO,
            failure: None,
            session: SessionTally::new(),
        }
    }

    pub fn with_cost_ratio(mut self, ratio: f64) -> Self {
        self.cost_ratio = ratio.max(0.0);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail every task after spending the scripted cost.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }
}

#[async_trait]
impl Worker for SimulatedWorker {
    fn class(&self) -> WorkerClass {
        self.class
    }

    fn description(&self) -> &str {
        "Simulated worker"
    }

    fn session(&self) -> SessionSummary {
        self.session.summary()
    }

    async fn execute(&self, task: &Task, approval: &Approval) -> Result<WorkOutcome, ExecutionError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let actual_cost_cents = (approval.amount_cents as f64 * self.cost_ratio).ceil() as u64;
        self.session.record(0, actual_cost_cents);
        if let Some(message) = &self.failure {
            return Err(ExecutionError::new(message.clone()).with_cost(actual_cost_cents));
        }

        Ok(WorkOutcome {
            actual_cost_cents,
            output: format!("simulated result for task {}", task.id()),
            model_used: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn approval(task: &Task, amount_cents: u64) -> Approval {
        Approval {
            task_id: task.id(),
            entry_id: 1,
            amount_cents,
            approved_at: Utc::now(),
            trial: false,
        }
    }

    #[tokio::test]
    async fn test_cost_ratio() {
        let task = Task::new("agent", "list instances");
        let w = SimulatedWorker::new(WorkerClass::Local).with_cost_ratio(1.5);
        let out = w.execute(&task, &approval(&task, 10)).await.unwrap();
        assert_eq!(out.actual_cost_cents, 15);
    }

    #[tokio::test]
    async fn test_failing_reports_partial_cost() {
        let task = Task::new("agent", "list instances");
        let w = SimulatedWorker::new(WorkerClass::Frontier)
            .with_cost_ratio(0.5)
            .failing("cloud API throttled");
        let err = w.execute(&task, &approval(&task, 10)).await.unwrap_err();
        assert_eq!(err.message, "cloud API throttled");
        assert_eq!(err.actual_cost_cents, Some(5));
    }

    #[tokio::test]
    async fn test_session_counts_failed_spend() {
        let w = SimulatedWorker::new(WorkerClass::Local).failing("quota exceeded");
        let task = Task::new("agent", "resize disk");
        w.execute(&task, &approval(&task, 4)).await.unwrap_err();
        w.execute(&task, &approval(&task, 6)).await.unwrap_err();

        let summary = w.session();
        assert_eq!(summary.calls, 2);
        assert_eq!(summary.total_cost_cents, 10);
        assert_eq!(summary.total_tokens, 0);
    }
}
