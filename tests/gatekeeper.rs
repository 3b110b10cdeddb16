//! End-to-end gatekeeper scenarios through the public API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_test::{assert_err, assert_ok};

use budget_squad::agents::{SimulatedWorker, WorkerPool};
use budget_squad::breaker::{BreakerConfig, BreakerState, RollingWindow};
use budget_squad::budget::{Budget, EntryKind, RoutingPolicy, WorkerClass};
use budget_squad::forecast::{Estimate, ForecastError, Forecaster};
use budget_squad::store::{LedgerStore, MemoryStore, SqliteStore};
use budget_squad::telemetry::{BroadcastTelemetry, EventKind, NullTelemetry};
use budget_squad::{
    Accountant, AccountantConfig, GatekeeperError, RollbackReason, Supervisor, SupervisorConfig,
    Task, TaskState,
};

struct FixedForecaster(u64);

#[async_trait]
impl Forecaster for FixedForecaster {
    async fn estimate(&self, _task: &Task, _class: WorkerClass) -> Result<Estimate, ForecastError> {
        Ok(Estimate::new(self.0, 0.9))
    }
}

fn budget(limit: u64) -> Budget {
    Budget::for_period(limit, Utc::now(), chrono::Duration::days(30)).unwrap()
}

fn config(consecutive_failures: u32) -> AccountantConfig {
    AccountantConfig {
        breaker: BreakerConfig {
            rejection_ratio: 0.9,
            min_samples: 1_000,
            consecutive_failures,
            cooldown_ms: 60_000,
            trial_admissions: 2,
            window: RollingWindow::Attempts(50),
            trip_on_overt_overrun: true,
        },
        cost_tolerance: 0.25,
        stale_after: Duration::from_secs(60),
    }
}

fn open(limit: u64, store: Box<dyn LedgerStore>) -> Accountant {
    Accountant::open(
        config(100),
        budget(limit),
        store,
        Arc::new(FixedForecaster(10)),
        Arc::new(NullTelemetry),
    )
    .unwrap()
}

fn estimate(cents: u64) -> Estimate {
    Estimate::new(cents, 0.9)
}

#[test]
fn reserve_commit_scenario() {
    let a = open(100, Box::new(MemoryStore::new()));
    let t1 = Task::new("agent", "first");
    let t2 = Task::new("agent", "second");

    assert_ok!(a.approve(&t1, &estimate(60)));
    assert_eq!(a.remaining_cents().unwrap(), 40);

    let err = assert_err!(a.approve(&t2, &estimate(50)));
    assert!(matches!(err, GatekeeperError::InsufficientFunds { .. }));
    assert_eq!(a.remaining_cents().unwrap(), 40);

    assert_ok!(a.commit(t1.id(), 55));
    assert_eq!(a.remaining_cents().unwrap(), 45);

    // A refused reservation leaves nothing behind, so t2 can try again.
    assert_ok!(a.approve(&t2, &estimate(40)));
    assert_eq!(a.remaining_cents().unwrap(), 5);
}

#[test]
fn double_rollback_is_unknown_reservation() {
    let a = open(100, Box::new(MemoryStore::new()));
    let task = Task::new("agent", "x");
    assert_ok!(a.approve(&task, &estimate(70)));
    assert_ok!(a.rollback(task.id(), RollbackReason::WorkerFailure));
    assert_eq!(a.remaining_cents().unwrap(), 100);

    let err = assert_err!(a.rollback(task.id(), RollbackReason::WorkerFailure));
    assert!(matches!(err, GatekeeperError::UnknownReservation(id) if id == task.id()));
    assert_eq!(a.remaining_cents().unwrap(), 100);
}

#[test]
fn concurrent_reserves_never_overspend() {
    let a = Arc::new(open(1_000, Box::new(MemoryStore::new())));
    let handles: Vec<_> = (0..16)
        .map(|_| {
            let a = Arc::clone(&a);
            std::thread::spawn(move || {
                let mut approved = 0u64;
                for _ in 0..25 {
                    let task = Task::new("agent", "check quota");
                    if let Ok(approval) = a.approve(&task, &estimate(7)) {
                        approved += approval.amount_cents;
                        let summary = a.summary().unwrap();
                        assert!(summary.committed_cents + summary.reserved_cents <= 1_000);
                    }
                }
                approved
            })
        })
        .collect();

    let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    let summary = a.summary().unwrap();
    assert_eq!(total, summary.reserved_cents);
    assert!(summary.reserved_cents <= 1_000);
    // 142 * 7 = 994; the 143rd reservation would overspend.
    assert_eq!(summary.reserved_cents, 994);
}

#[test]
fn breaker_opens_after_three_failures_and_skips_ledger() {
    let telemetry = BroadcastTelemetry::new(64);
    let mut rx = telemetry.subscribe();
    let a = Accountant::open(
        config(3),
        budget(100),
        Box::new(MemoryStore::new()),
        Arc::new(FixedForecaster(10)),
        Arc::new(telemetry.clone()),
    )
    .unwrap();

    assert_ok!(a.approve(&Task::new("agent", "big"), &estimate(90)));
    for _ in 0..3 {
        let err = assert_err!(a.approve(&Task::new("agent", "loop"), &estimate(20)));
        assert!(matches!(err, GatekeeperError::InsufficientFunds { .. }));
    }
    assert_eq!(a.breaker_state().unwrap(), BreakerState::Open);

    let attempts = a.reserve_attempts().unwrap();
    let err = assert_err!(a.approve(&Task::new("agent", "loop"), &estimate(1)));
    assert!(matches!(err, GatekeeperError::CircuitOpen));
    assert_eq!(a.reserve_attempts().unwrap(), attempts);

    let mut saw_transition = false;
    while let Ok(event) = rx.try_recv() {
        if event.kind == EventKind::BreakerTransition {
            assert_eq!(event.breaker_state, BreakerState::Open);
            saw_transition = true;
        }
    }
    assert!(saw_transition);
}

#[tokio::test]
async fn timed_out_dispatch_rolls_back() {
    let a = Arc::new(open(100, Box::new(MemoryStore::new())));
    let mut workers = WorkerPool::new();
    workers.register(Arc::new(
        SimulatedWorker::new(WorkerClass::Local).with_delay(Duration::from_secs(30)),
    ));
    let supervisor = Supervisor::new(
        Arc::clone(&a),
        workers,
        SupervisorConfig {
            dispatch_timeout: Duration::from_millis(100),
            routing: RoutingPolicy::default(),
        },
    );

    let id = supervisor.submit(Task::new("agent", "hangs")).await.unwrap();
    assert_eq!(a.remaining_cents().unwrap(), 90);

    let record = tokio::time::timeout(Duration::from_secs(5), supervisor.wait(id))
        .await
        .expect("rollback within the dispatch timeout")
        .unwrap();
    assert_eq!(record.state, TaskState::RolledBack);
    assert_eq!(a.remaining_cents().unwrap(), 100);
    assert!(a.active_reservations().unwrap().is_empty());
}

#[test]
fn restart_replays_sqlite_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");

    let (before, held) = {
        let a = open(1_000, Box::new(SqliteStore::open(&path).unwrap()));
        let done = Task::new("agent", "done");
        let failed = Task::new("agent", "failed");
        let held = Task::new("agent", "in flight");

        a.approve(&done, &estimate(100)).unwrap();
        a.commit(done.id(), 120).unwrap();
        a.approve(&failed, &estimate(50)).unwrap();
        a.rollback(failed.id(), RollbackReason::WorkerFailure).unwrap();
        a.approve(&held, &estimate(200)).unwrap();
        (a.summary().unwrap(), held)
    };
    assert_eq!(before.remaining_cents, 680);

    let reopened = open(1_000, Box::new(SqliteStore::open(&path).unwrap()));
    assert_eq!(reopened.summary().unwrap(), before);
    assert_eq!(reopened.active_reservations().unwrap()[0].task_id, held.id());

    // The in-flight reservation is stale once its owner is gone.
    let expired = reopened.expire_stale(Duration::ZERO).unwrap();
    assert_eq!(expired, vec![held.id()]);
    assert_eq!(reopened.remaining_cents().unwrap(), 880);

    let mut store = SqliteStore::open(&path).unwrap();
    let stored = store.load().unwrap().unwrap();
    let last = stored.entries.last().unwrap();
    assert_eq!(last.kind, EntryKind::RolledBack);
    assert_eq!(last.task_id, held.id());
}

#[test]
fn stale_reservations_roll_back_on_open() {
    let store = MemoryStore::new();
    let a = Accountant::open(
        AccountantConfig {
            stale_after: Duration::from_millis(1),
            ..config(100)
        },
        budget(100),
        Box::new(store.clone()),
        Arc::new(FixedForecaster(10)),
        Arc::new(NullTelemetry),
    )
    .unwrap();
    a.approve(&Task::new("agent", "orphan"), &estimate(40)).unwrap();
    drop(a);
    std::thread::sleep(Duration::from_millis(10));

    let reopened = Accountant::open(
        AccountantConfig {
            stale_after: Duration::from_millis(1),
            ..config(100)
        },
        budget(100),
        Box::new(store),
        Arc::new(FixedForecaster(10)),
        Arc::new(NullTelemetry),
    )
    .unwrap();
    assert_eq!(reopened.remaining_cents().unwrap(), 100);
    assert_eq!(reopened.summary().unwrap().rolled_back_tasks, 1);
}
