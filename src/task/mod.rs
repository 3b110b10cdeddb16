//! Task module - the unit of work that agents ask the gatekeeper to fund.
//!
//! # Key Concepts
//! - Task: an immutable request (who asked, what to run, how urgent)
//! - TaskState: the handoff state machine the supervisor drives a task through
//! - Complexity: a normalized difficulty score used for worker routing

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::budget::estimate_tokens;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a fresh random task id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Scheduling priority attached by the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Normalized task difficulty in `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Complexity(f64);

impl Complexity {
    /// Clamp an arbitrary score into the valid range. NaN becomes 0.5.
    pub fn new(score: f64) -> Self {
        if score.is_nan() {
            return Self(0.5);
        }
        Self(score.clamp(0.0, 1.0))
    }

    /// Derive a score from the payload text.
    ///
    /// Long prompts and prompts that read like multi-step plans score higher.
    pub fn estimate(payload: &str) -> Self {
        let tokens = estimate_tokens(payload) as f64;
        let size_score = (tokens / 2000.0).min(1.0) * 0.7;

        let lower = payload.to_lowercase();
        let multi_step = payload.contains("1.")
            || payload.contains("\n- ")
            || lower.contains(" then ");
        let step_score = if multi_step { 0.3 } else { 0.0 };

        Self::new(size_score + step_score)
    }

    pub fn score(&self) -> f64 {
        self.0
    }
}

/// A request to run agent work that may cost money.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    requester_id: String,
    payload: String,
    priority: Priority,
    complexity: Option<Complexity>,
    created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(requester_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            requester_id: requester_id.into(),
            payload: payload.into(),
            priority: Priority::default(),
            complexity: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Pin the complexity instead of estimating it from the payload.
    pub fn with_complexity(mut self, score: f64) -> Self {
        self.complexity = Some(Complexity::new(score));
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn requester_id(&self) -> &str {
        &self.requester_id
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Explicit complexity if one was given, otherwise the payload heuristic.
    pub fn complexity(&self) -> Complexity {
        self.complexity
            .unwrap_or_else(|| Complexity::estimate(&self.payload))
    }
}

/// Lifecycle of a task inside the supervisor.
///
/// ```text
/// Submitted -> Forecasted -> Reserved -> Dispatched -> Completed
///     |            |            |            |
///     +------------+--> Rejected +--> RolledBack <--+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Submitted,
    Forecasted,
    Reserved,
    Dispatched,
    Completed,
    RolledBack,
    Rejected,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack | Self::Rejected)
    }

    /// Whether the supervisor may move a task from `self` to `next`.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Submitted, Forecasted)
                | (Submitted, Rejected)
                | (Forecasted, Reserved)
                | (Forecasted, Rejected)
                | (Reserved, Dispatched)
                | (Reserved, RolledBack)
                | (Dispatched, Completed)
                | (Dispatched, RolledBack)
        )
    }

    /// True while the gatekeeper holds funds for the task.
    pub fn holds_reservation(&self) -> bool {
        matches!(self, Self::Reserved | Self::Dispatched)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Submitted => "submitted",
            Self::Forecasted => "forecasted",
            Self::Reserved => "reserved",
            Self::Dispatched => "dispatched",
            Self::Completed => "completed",
            Self::RolledBack => "rolled_back",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_exits() {
        let all = [
            TaskState::Submitted,
            TaskState::Forecasted,
            TaskState::Reserved,
            TaskState::Dispatched,
            TaskState::Completed,
            TaskState::RolledBack,
            TaskState::Rejected,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_happy_path_is_allowed() {
        assert!(TaskState::Submitted.can_transition_to(TaskState::Forecasted));
        assert!(TaskState::Forecasted.can_transition_to(TaskState::Reserved));
        assert!(TaskState::Reserved.can_transition_to(TaskState::Dispatched));
        assert!(TaskState::Dispatched.can_transition_to(TaskState::Completed));
    }

    #[test]
    fn test_no_skipping_the_gate() {
        // Dispatch is only reachable through a reservation.
        assert!(!TaskState::Submitted.can_transition_to(TaskState::Dispatched));
        assert!(!TaskState::Forecasted.can_transition_to(TaskState::Dispatched));
        // Funded tasks cannot silently become rejections.
        assert!(!TaskState::Reserved.can_transition_to(TaskState::Rejected));
        assert!(!TaskState::Dispatched.can_transition_to(TaskState::Rejected));
    }

    #[test]
    fn test_complexity_estimate() {
        let simple = Complexity::estimate("What is S3?");
        assert!(simple.score() < 0.1);

        let plan = Complexity::estimate("1. list the buckets\n- read each policy then summarize");
        assert!(plan.score() >= 0.3);

        let long = Complexity::estimate(&"x".repeat(20_000));
        assert!(long.score() >= 0.7);
        assert!(long.score() <= 1.0);
    }

    #[test]
    fn test_complexity_clamps() {
        assert_eq!(Complexity::new(7.0).score(), 1.0);
        assert_eq!(Complexity::new(-1.0).score(), 0.0);
        assert_eq!(Complexity::new(f64::NAN).score(), 0.5);
    }

    #[test]
    fn test_explicit_complexity_wins() {
        let task = Task::new("agent-1", "What is S3?").with_complexity(0.9);
        assert_eq!(task.complexity().score(), 0.9);
    }
}
