//! budget-squad: run a simulated batch of agent tasks through the gatekeeper.
//!
//! Config comes from the YAML file named by `GATEKEEPER_CONFIG` (optional)
//! plus `GATEKEEPER_*` overrides. Logging follows `RUST_LOG`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use budget_squad::agents::{SimulatedWorker, WorkerPool, WorkerRef};
use budget_squad::budget::WorkerClass;
use budget_squad::forecast::TokenForecaster;
use budget_squad::store::{LedgerStore, MemoryStore, SqliteStore};
use budget_squad::telemetry::TracingTelemetry;
use budget_squad::{Accountant, Config, Supervisor, Task, TaskState};

const DEMO_TASKS: &[(&str, &str)] = &[
    ("cost-analyst", "Summarize last week's EC2 spend by team."),
    (
        "cost-analyst",
        "1. List every S3 bucket without lifecycle rules\n- estimate monthly savings\n- then draft the policy change",
    ),
    ("auditor", "Which IAM roles have not been used in 90 days?"),
    ("auditor", "Check the staging VPC for open security groups, then report findings."),
    ("researcher", "Compare reserved instance pricing for m7g.large across three regions."),
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::var("GATEKEEPER_CONFIG").ok().map(PathBuf::from);
    let config = Config::load(config_path.as_deref()).context("failed to load configuration")?;

    let store: Box<dyn LedgerStore> = match &config.db_path {
        Some(path) => Box::new(
            SqliteStore::open(path)
                .with_context(|| format!("failed to open ledger at {}", path.display()))?,
        ),
        None => Box::new(MemoryStore::new()),
    };

    let accountant = Accountant::open(
        config.accountant(),
        config.budget_starting(Utc::now())?,
        store,
        Arc::new(TokenForecaster::new(config.pricing)),
        Arc::new(TracingTelemetry),
    )
    .context("failed to open gatekeeper")?;
    let accountant = Arc::new(accountant);

    let local: WorkerRef = Arc::new(
        SimulatedWorker::new(WorkerClass::Local)
            .with_cost_ratio(0.9)
            .with_delay(Duration::from_millis(50)),
    );
    let frontier: WorkerRef = Arc::new(
        SimulatedWorker::new(WorkerClass::Frontier)
            .with_cost_ratio(1.1)
            .with_delay(Duration::from_millis(150)),
    );
    // Writes up research notes; only reached through hand_off.
    let writer: WorkerRef = Arc::new(SimulatedWorker::new(WorkerClass::Frontier).with_cost_ratio(0.8));

    let mut workers = WorkerPool::new();
    workers.register(Arc::clone(&local)).register(Arc::clone(&frontier));

    let supervisor = Supervisor::new(Arc::clone(&accountant), workers, config.supervisor());
    let shutdown = CancellationToken::new();
    let reconciliation = supervisor.start_reconciliation(config.reconcile_interval(), shutdown.clone());

    let submissions = DEMO_TASKS.iter().map(|(requester, payload)| {
        let supervisor = supervisor.clone();
        let task = Task::new(*requester, *payload);
        async move {
            let id = task.id();
            match supervisor.submit(task).await {
                Ok(id) => supervisor.wait(id).await.map(|r| r.state),
                Err(e) => {
                    tracing::warn!(task_id = %id, error = %e, "Task not dispatched");
                    Ok(TaskState::Rejected)
                }
            }
        }
    });
    let outcomes = futures::future::join_all(submissions).await;

    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(TaskState::Completed)))
        .count();
    tracing::info!(submitted = outcomes.len(), completed, "Batch finished");

    let research = supervisor
        .tasks()
        .await
        .into_iter()
        .find(|r| r.state == TaskState::Completed && r.task.requester_id() == "researcher");
    if let Some(research) = research {
        match supervisor.hand_off(research.task.id(), "writer", Arc::clone(&writer)).await {
            Ok(id) => {
                let record = supervisor.wait(id).await?;
                tracing::info!(task_id = %id, state = %record.state, "Write-up finished");
            }
            Err(e) => tracing::warn!(error = %e, "Write-up not dispatched"),
        }
    }

    for worker in [&local, &frontier, &writer] {
        let session = worker.session();
        tracing::info!(
            worker = worker.description(),
            calls = session.calls,
            tokens = session.total_tokens,
            cost_cents = session.total_cost_cents,
            "Worker session"
        );
    }

    shutdown.cancel();
    reconciliation.await?;

    let summary = accountant.summary()?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
