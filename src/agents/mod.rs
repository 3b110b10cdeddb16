//! Workers - the only place external side effects happen.
//!
//! # Worker Types
//! - **ResearcherWorker**: answers a task payload through an LLM
//! - **WriterWorker**: turns research notes into an executive summary
//! - **SimulatedWorker**: scripted cost, delay and failure for demos and tests
//!
//! # Design Principles
//! - A worker is only ever handed a task together with its [`Approval`]
//! - Actual cost is reported on success and, when known, on failure
//! - Each worker keeps its own [`SessionSummary`] of what it consumed

mod completion;
mod researcher;
mod session;
mod simulated;
mod writer;

use std::collections::HashMap;
use std::sync::Arc;

pub use researcher::ResearcherWorker;
pub use session::{SessionSummary, SessionTally};
pub use simulated::SimulatedWorker;
pub use writer::WriterWorker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::accountant::Approval;
use crate::budget::WorkerClass;
use crate::task::Task;

/// Reference to a worker (thread-safe shared pointer).
pub type WorkerRef = Arc<dyn Worker>;

/// What a worker reports after finishing a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOutcome {
    pub actual_cost_cents: u64,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
}

/// Worker-reported failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
    /// Spend already incurred before the failure, if the worker knows it.
    pub actual_cost_cents: Option<u64>,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            actual_cost_cents: None,
        }
    }

    pub fn with_cost(mut self, cost_cents: u64) -> Self {
        self.actual_cost_cents = Some(cost_cents);
        self
    }
}

/// Base trait for all workers.
///
/// # Invariants
/// - `execute()` is only called after the gatekeeper approved the task
/// - `execute()` never panics; all errors are returned as `Err`
#[async_trait]
pub trait Worker: Send + Sync {
    /// Cost class this worker belongs to.
    fn class(&self) -> WorkerClass;

    /// Execute an approved task.
    ///
    /// # Postconditions
    /// - On success: `actual_cost_cents` is what the work really cost
    async fn execute(&self, task: &Task, approval: &Approval) -> Result<WorkOutcome, ExecutionError>;

    /// Get a human-readable description of this worker.
    fn description(&self) -> &str {
        "Generic worker"
    }

    /// Calls, tokens and spend this worker has reported so far.
    fn session(&self) -> SessionSummary;
}

/// Workers indexed by class.
#[derive(Clone, Default)]
pub struct WorkerPool {
    workers: HashMap<WorkerClass, WorkerRef>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `worker` under its own class, replacing any previous one.
    pub fn register(&mut self, worker: WorkerRef) -> &mut Self {
        self.workers.insert(worker.class(), worker);
        self
    }

    pub fn get(&self, class: WorkerClass) -> Option<WorkerRef> {
        self.workers.get(&class).cloned()
    }

    /// Worker for `class`, falling back to the other class if none is registered.
    pub fn resolve(&self, class: WorkerClass) -> Option<WorkerRef> {
        self.get(class).or_else(|| self.get(class.fallback()))
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("classes", &self.workers.keys().collect::<Vec<_>>())
            .finish()
    }
}
