//! # Budget Squad
//!
//! A budget gatekeeper for autonomous agents. No agent action runs unless
//! its forecasted cost fits in the remaining budget, and runaway loops of
//! self-triggered requests are cut off by a circuit breaker.
//!
//! ## Architecture
//! - [`budget`]: budget periods, the append-only ledger, pricing and routing
//! - [`breaker`]: Closed / Open / HalfOpen admission control
//! - [`accountant`]: approve / commit / rollback behind one critical section
//! - [`supervisor`]: per-task handoff state machine with timeouts
//! - [`store`]: durable ledger storage and restart replay
//! - [`agents`]: workers that execute approved tasks
//!
//! ## Flow
//! ```text
//! Supervisor -> forecast -> Accountant::approve -> Worker -> commit / rollback
//! ```

pub mod accountant;
pub mod agents;
pub mod breaker;
pub mod budget;
pub mod config;
pub mod forecast;
pub mod llm;
pub mod store;
pub mod supervisor;
pub mod task;
pub mod telemetry;

pub use accountant::{Accountant, AccountantConfig, Approval, GatekeeperError, RollbackReason};
pub use config::Config;
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorError, TaskRecord};
pub use task::{Task, TaskId, TaskState};
