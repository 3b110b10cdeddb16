//! SQLite-backed ledger store.
//!
//! Tables:
//! - `periods`: one row per budget period; the open one has `closed_at IS NULL`
//! - `ledger_entries`: append-only entries keyed by `(period_id, id)`
//! - `breaker_state`: a single JSON snapshot row

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{parse_timestamp, LedgerStore, StoreError, StoredLedger};
use crate::breaker::BreakerSnapshot;
use crate::budget::{Budget, ClosedPeriod, EntryKind, LedgerEntry, Resolution};
use crate::task::TaskId;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS periods (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    limit_cents INTEGER NOT NULL,
    carried_in_cents INTEGER NOT NULL,
    period_start TEXT NOT NULL,
    period_end TEXT NOT NULL,
    closed_at TEXT,
    committed_cents INTEGER,
    closing_remaining_cents INTEGER
);
CREATE TABLE IF NOT EXISTS ledger_entries (
    period_id INTEGER NOT NULL REFERENCES periods(id),
    id INTEGER NOT NULL,
    task_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    amount_cents INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    resolved_at TEXT,
    carried INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (period_id, id)
);
CREATE INDEX IF NOT EXISTS idx_ledger_entries_task
    ON ledger_entries(period_id, task_id);
CREATE TABLE IF NOT EXISTS breaker_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    snapshot TEXT NOT NULL
);
";

type EntryRow = (i64, String, String, i64, String, Option<String>, bool);

pub struct SqliteStore {
    conn: Connection,
    period_id: Option<i64>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;",
        )?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            period_id: None,
        })
    }

    fn current_period(&mut self) -> Result<Option<(i64, Budget, u64)>, StoreError> {
        let row: Option<(i64, i64, i64, String, String)> = self
            .conn
            .query_row(
                "SELECT id, limit_cents, carried_in_cents, period_start, period_end
                 FROM periods WHERE closed_at IS NULL ORDER BY id DESC LIMIT 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
            )
            .optional()?;

        let Some((id, limit, carried, start, end)) = row else {
            return Ok(None);
        };
        let budget = Budget::new(
            from_db(limit, "limit_cents")?,
            parse_timestamp(&start)?,
            parse_timestamp(&end)?,
        )
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.period_id = Some(id);
        Ok(Some((id, budget, from_db(carried, "carried_in_cents")?)))
    }

    fn open_period_id(&mut self) -> Result<i64, StoreError> {
        if let Some(id) = self.period_id {
            return Ok(id);
        }
        self.current_period()?
            .map(|(id, _, _)| id)
            .ok_or_else(|| StoreError::Corrupt("no open budget period".to_string()))
    }

    fn load_entries(&self, period_id: i64) -> Result<Vec<LedgerEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, task_id, kind, amount_cents, created_at, resolved_at, carried
             FROM ledger_entries WHERE period_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![period_id], |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                ))
            })?
            .collect::<Result<Vec<EntryRow>, _>>()?;

        rows.into_iter().map(entry_from_row).collect()
    }

    fn load_breaker(&self) -> Result<Option<BreakerSnapshot>, StoreError> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT snapshot FROM breaker_state WHERE id = 1", [], |r| {
                r.get(0)
            })
            .optional()?;
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }
}

impl LedgerStore for SqliteStore {
    fn load(&mut self) -> Result<Option<StoredLedger>, StoreError> {
        let Some((id, budget, carried_in_cents)) = self.current_period()? else {
            return Ok(None);
        };
        Ok(Some(StoredLedger {
            budget,
            carried_in_cents,
            entries: self.load_entries(id)?,
            breaker: self.load_breaker()?,
        }))
    }

    fn open_period(
        &mut self,
        closed: Option<&ClosedPeriod>,
        budget: &Budget,
        carried_in_cents: u64,
        carried: &[LedgerEntry],
    ) -> Result<(), StoreError> {
        let previous = match closed {
            Some(_) => Some(self.open_period_id()?),
            None => None,
        };

        let tx = self.conn.transaction()?;
        if let (Some(prev), Some(closed)) = (previous, closed) {
            tx.execute(
                "UPDATE periods SET closed_at = ?1, committed_cents = ?2,
                 closing_remaining_cents = ?3 WHERE id = ?4",
                params![
                    closed.closed_at.to_rfc3339(),
                    to_db(closed.committed_cents)?,
                    to_db(closed.closing_remaining_cents)?,
                    prev
                ],
            )?;
        }
        tx.execute(
            "INSERT INTO periods (limit_cents, carried_in_cents, period_start, period_end)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                to_db(budget.limit_cents())?,
                to_db(carried_in_cents)?,
                budget.period_start().to_rfc3339(),
                budget.period_end().to_rfc3339()
            ],
        )?;
        let id = tx.last_insert_rowid();
        for entry in carried {
            insert_entry(&tx, id, entry)?;
        }
        tx.commit()?;

        self.period_id = Some(id);
        Ok(())
    }

    fn append(&mut self, entry: &LedgerEntry, breaker: &BreakerSnapshot) -> Result<(), StoreError> {
        let period_id = self.open_period_id()?;
        let tx = self.conn.transaction()?;
        insert_entry(&tx, period_id, entry)?;
        upsert_breaker(&tx, breaker)?;
        tx.commit()?;
        Ok(())
    }

    fn settle(&mut self, resolution: &Resolution, breaker: &BreakerSnapshot) -> Result<(), StoreError> {
        let period_id = self.open_period_id()?;
        let tx = self.conn.transaction()?;
        let updated = tx.execute(
            "UPDATE ledger_entries SET resolved_at = ?1
             WHERE period_id = ?2 AND id = ?3 AND resolved_at IS NULL",
            params![
                resolution.reserved.resolved_at.map(|t| t.to_rfc3339()),
                period_id,
                to_db(resolution.reserved.id)?
            ],
        )?;
        if updated != 1 {
            return Err(StoreError::Corrupt(format!(
                "reservation {} is missing or already resolved",
                resolution.reserved.id
            )));
        }
        insert_entry(&tx, period_id, &resolution.closing)?;
        upsert_breaker(&tx, breaker)?;
        tx.commit()?;
        Ok(())
    }

    fn save_breaker(&mut self, snapshot: &BreakerSnapshot) -> Result<(), StoreError> {
        upsert_breaker(&self.conn, snapshot)
    }

    fn closed_periods(&mut self) -> Result<Vec<ClosedPeriod>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT limit_cents, carried_in_cents, period_start, period_end, closed_at,
                    committed_cents, closing_remaining_cents
             FROM periods WHERE closed_at IS NOT NULL ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, Option<i64>>(5)?,
                    r.get::<_, Option<i64>>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(limit, carried, start, end, closed_at, committed, remaining)| -> Result<ClosedPeriod, StoreError> {
                let budget = Budget::new(
                    from_db(limit, "limit_cents")?,
                    parse_timestamp(&start)?,
                    parse_timestamp(&end)?,
                )
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                Ok(ClosedPeriod {
                    budget,
                    carried_in_cents: from_db(carried, "carried_in_cents")?,
                    committed_cents: from_db(committed.unwrap_or(0), "committed_cents")?,
                    closing_remaining_cents: from_db(
                        remaining.unwrap_or(0),
                        "closing_remaining_cents",
                    )?,
                    closed_at: parse_timestamp(&closed_at)?,
                })
            })
            .collect()
    }
}

fn insert_entry(conn: &Connection, period_id: i64, entry: &LedgerEntry) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO ledger_entries
         (period_id, id, task_id, kind, amount_cents, created_at, resolved_at, carried)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            period_id,
            to_db(entry.id)?,
            entry.task_id.to_string(),
            entry.kind.as_str(),
            to_db(entry.amount_cents)?,
            entry.created_at.to_rfc3339(),
            entry.resolved_at.map(|t: DateTime<Utc>| t.to_rfc3339()),
            entry.carried,
        ],
    )?;
    Ok(())
}

fn upsert_breaker(conn: &Connection, snapshot: &BreakerSnapshot) -> Result<(), StoreError> {
    let json = serde_json::to_string(snapshot)?;
    conn.execute(
        "INSERT INTO breaker_state (id, snapshot) VALUES (1, ?1)
         ON CONFLICT(id) DO UPDATE SET snapshot = excluded.snapshot",
        params![json],
    )?;
    Ok(())
}

fn entry_from_row(row: EntryRow) -> Result<LedgerEntry, StoreError> {
    let (id, task_id, kind, amount, created_at, resolved_at, carried) = row;
    Ok(LedgerEntry {
        id: from_db(id, "id")?,
        task_id: task_id
            .parse::<TaskId>()
            .map_err(|e| StoreError::Corrupt(format!("bad task id {:?}: {}", task_id, e)))?,
        kind: EntryKind::parse(&kind)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown entry kind {:?}", kind)))?,
        amount_cents: from_db(amount, "amount_cents")?,
        created_at: parse_timestamp(&created_at)?,
        resolved_at: resolved_at.as_deref().map(parse_timestamp).transpose()?,
        carried,
    })
}

fn to_db(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{} overflows i64", value)))
}

fn from_db(value: i64, column: &str) -> Result<u64, StoreError> {
    u64::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("negative {} ({})", column, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitBreaker};
    use crate::budget::Ledger;
    use chrono::Duration;
    use std::time::Instant;
    use tempfile::tempdir;

    fn budget() -> Budget {
        Budget::for_period(1_000, Utc::now(), Duration::days(30)).unwrap()
    }

    fn breaker() -> BreakerSnapshot {
        CircuitBreaker::new(BreakerConfig::default(), Instant::now()).snapshot(Utc::now())
    }

    #[test]
    fn test_fresh_store_is_empty() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        assert!(store.load().unwrap().is_none());
        assert!(store.closed_periods().unwrap().is_empty());
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let budget = budget();
        let mut ledger = Ledger::new(budget.clone(), 0);
        let (a, b) = (TaskId::new(), TaskId::new());

        {
            let mut store = SqliteStore::open(&path).unwrap();
            store.open_period(None, &budget, 0, &[]).unwrap();
            let snapshot = breaker();
            store.append(&ledger.reserve(a, 100, Utc::now()).unwrap(), &snapshot).unwrap();
            store.append(&ledger.reserve(b, 200, Utc::now()).unwrap(), &snapshot).unwrap();
            store.settle(&ledger.commit(a, 80, Utc::now()).unwrap(), &snapshot).unwrap();
        }

        let mut store = SqliteStore::open(&path).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.budget, budget);
        assert_eq!(loaded.entries.len(), 3);
        assert!(loaded.breaker.is_some());

        let replayed = Ledger::replay(loaded.budget, 0, loaded.entries).unwrap();
        assert_eq!(replayed.summary(), ledger.summary());
    }

    #[test]
    fn test_settle_twice_is_corrupt() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let budget = budget();
        store.open_period(None, &budget, 0, &[]).unwrap();
        let mut ledger = Ledger::new(budget, 0);
        let t = TaskId::new();
        store.append(&ledger.reserve(t, 10, Utc::now()).unwrap(), &breaker()).unwrap();
        let res = ledger.rollback(t, Utc::now()).unwrap();
        store.settle(&res, &breaker()).unwrap();
        assert!(matches!(store.settle(&res, &breaker()), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_failed_settle_keeps_breaker_snapshot() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let budget = budget();
        store.open_period(None, &budget, 0, &[]).unwrap();
        let mut ledger = Ledger::new(budget, 0);
        let t = TaskId::new();
        let first = breaker();
        store.append(&ledger.reserve(t, 10, Utc::now()).unwrap(), &first).unwrap();
        let res = ledger.rollback(t, Utc::now()).unwrap();
        store.settle(&res, &first).unwrap();

        let later = BreakerSnapshot {
            consecutive_failures: 1,
            ..first.clone()
        };
        // Already settled: neither the entry nor the snapshot is written.
        assert!(store.settle(&res, &later).is_err());
        assert_eq!(store.load().unwrap().unwrap().breaker, Some(first));
    }

    #[test]
    fn test_carried_flag_survives_reload() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let first = budget();
        store.open_period(None, &first, 0, &[]).unwrap();
        let mut ledger = Ledger::new(first.clone(), 0);
        let t = TaskId::new();
        store.append(&ledger.reserve(t, 40, Utc::now()).unwrap(), &breaker()).unwrap();

        let next = first.next_period(100);
        let (closed, rolled) = ledger.roll_into(next.clone(), false, Utc::now());
        store
            .open_period(Some(&closed), &next, rolled.carried_in_cents(), rolled.entries())
            .unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert!(loaded.entries[0].carried);
        let replayed =
            Ledger::replay(loaded.budget, loaded.carried_in_cents, loaded.entries).unwrap();
        assert_eq!(replayed.remaining_cents(), 100);
        assert_eq!(replayed.carried_funding_cents(), 40);
    }

    #[test]
    fn test_open_period_archives_previous() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let first = budget();
        store.open_period(None, &first, 0, &[]).unwrap();
        let ledger = Ledger::new(first.clone(), 0);
        let next = first.next_period(2_000);
        let (closed, rolled) = ledger.roll_into(next.clone(), true, Utc::now());
        store
            .open_period(Some(&closed), &next, rolled.carried_in_cents(), &[])
            .unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.budget, next);
        assert_eq!(loaded.carried_in_cents, 1_000);
        let archived = store.closed_periods().unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].budget, first);
        assert_eq!(archived[0].closing_remaining_cents, 1_000);
    }

    #[test]
    fn test_garbage_row_is_corrupt() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.open_period(None, &budget(), 0, &[]).unwrap();
        store
            .conn
            .execute(
                "INSERT INTO ledger_entries VALUES (1, 1, 'not-a-uuid', 'reserved', 5, 'x', NULL, 0)",
                [],
            )
            .unwrap();
        assert!(matches!(store.load(), Err(StoreError::Corrupt(_))));
    }
}
