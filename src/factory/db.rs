use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};

use super::catalog::{Catalog, default_catalog};
use super::models::*;
use crate::errors::FactoryError;

/// Default time a connection waits on a locked database before giving up.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Async-safe handle to the factory database.
///
/// Wraps `FactoryDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<FactoryDb>>,
}

impl DbHandle {
    pub fn new(db: FactoryDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&FactoryDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| FactoryError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct FactoryDb {
    conn: Connection,
}

impl FactoryDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        Self::with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {}", path.display()))?;
        conn.busy_timeout(busy_timeout)
            .context("Failed to set busy timeout")?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .context("Failed to enable WAL journal")?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "opened factory database");
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS process_steps (
                    step_id INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    station TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    estimated_seconds INTEGER NOT NULL DEFAULT 5
                );

                CREATE TABLE IF NOT EXISTS orders (
                    order_id TEXT PRIMARY KEY,
                    step_chain TEXT NOT NULL DEFAULT '',
                    amount INTEGER NOT NULL DEFAULT 1,
                    status TEXT NOT NULL DEFAULT 'active',
                    customer TEXT NOT NULL DEFAULT '',
                    note TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS piece_step_progress (
                    order_id TEXT NOT NULL,
                    piece_no INTEGER NOT NULL,
                    step_id INTEGER NOT NULL,
                    state TEXT NOT NULL DEFAULT 'pending',
                    started_at TEXT,
                    finished_at TEXT,
                    PRIMARY KEY (order_id, piece_no, step_id)
                );

                CREATE TABLE IF NOT EXISTS station_state (
                    station TEXT PRIMARY KEY,
                    current_order_id TEXT,
                    current_piece_no INTEGER,
                    current_step_id INTEGER,
                    busy_until TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
                CREATE INDEX IF NOT EXISTS idx_progress_state ON piece_step_progress(order_id, state);
                ",
            )
            .context("Failed to create tables")?;

        // Additive migrations (columns are nullable, safe to re-run).
        // Only "duplicate column" errors are ignored.
        match self
            .conn
            .execute("ALTER TABLE station_state ADD COLUMN updated_at TEXT", [])
        {
            Ok(_) => {}
            Err(e) if e.to_string().contains("duplicate column") => {}
            Err(e) => return Err(anyhow::anyhow!("Failed to add updated_at column: {}", e)),
        }

        Ok(())
    }

    /// Begin a write transaction that takes SQLite's RESERVED lock up front.
    ///
    /// Statements issued through `self` while the returned transaction is
    /// alive run inside it; dropping it without `commit` rolls back.
    pub fn begin_immediate(&self) -> Result<Transaction<'_>> {
        Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("Failed to begin immediate transaction")
    }

    /// Run arbitrary SQL, for tests that need rows no public API writes.
    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql).context("Failed to run raw SQL")
    }

    // ── Process catalog ───────────────────────────────────────────────

    pub fn list_process_steps(&self) -> Result<Vec<ProcessStep>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT step_id, name, station, description, estimated_seconds
                 FROM process_steps ORDER BY step_id",
            )
            .context("Failed to prepare list_process_steps")?;
        let rows = stmt
            .query_map([], row_to_step)
            .context("Failed to query process steps")?;
        let mut steps = Vec::new();
        for row in rows {
            steps.push(row.context("Failed to read process step row")?);
        }
        Ok(steps)
    }

    pub fn get_process_step(&self, step_id: i64) -> Result<Option<ProcessStep>> {
        self.conn
            .query_row(
                "SELECT step_id, name, station, description, estimated_seconds
                 FROM process_steps WHERE step_id = ?1",
                params![step_id],
                row_to_step,
            )
            .optional()
            .context("Failed to query process step")
    }

    pub fn upsert_process_step(&self, step: &ProcessStep) -> Result<ProcessStep> {
        if step.station.trim().is_empty() {
            return Err(FactoryError::BadRequest(format!(
                "step {} must name a station",
                step.step_id
            ))
            .into());
        }
        self.conn
            .execute(
                "INSERT INTO process_steps (step_id, name, station, description, estimated_seconds)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(step_id) DO UPDATE SET
                    name = excluded.name,
                    station = excluded.station,
                    description = excluded.description,
                    estimated_seconds = excluded.estimated_seconds",
                params![
                    step.step_id,
                    step.name,
                    step.station.trim(),
                    step.description,
                    step.estimated_seconds
                ],
            )
            .context("Failed to upsert process step")?;
        self.get_process_step(step.step_id)?
            .context("Process step not found after upsert")
    }

    pub fn delete_process_step(&self, step_id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM process_steps WHERE step_id = ?1", params![step_id])
            .context("Failed to delete process step")?;
        Ok(count > 0)
    }

    /// Insert the built-in line definition, leaving existing step ids alone.
    /// Returns the number of steps inserted.
    pub fn seed_default_catalog(&self) -> Result<usize> {
        let mut inserted = 0;
        for step in default_catalog() {
            inserted += self
                .conn
                .execute(
                    "INSERT OR IGNORE INTO process_steps (step_id, name, station, description, estimated_seconds)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        step.step_id,
                        step.name,
                        step.station,
                        step.description,
                        step.estimated_seconds
                    ],
                )
                .context("Failed to seed process step")?;
        }
        Ok(inserted)
    }

    pub fn load_catalog(&self) -> Result<Catalog> {
        Ok(Catalog::new(self.list_process_steps()?))
    }

    // ── Orders ────────────────────────────────────────────────────────

    pub fn create_order(&self, new: &NewOrder) -> Result<Order> {
        if !(1..=MAX_ORDER_AMOUNT).contains(&new.amount) {
            return Err(FactoryError::InvalidAmount { amount: new.amount }.into());
        }
        if new.step_chain.is_empty() {
            return Err(FactoryError::InvalidStepChain("chain is empty".into()).into());
        }
        for (idx, step_id) in new.step_chain.iter().enumerate() {
            if new.step_chain[..idx].contains(step_id) {
                return Err(FactoryError::InvalidStepChain(format!(
                    "step {} appears more than once",
                    step_id
                ))
                .into());
            }
            if self.get_process_step(*step_id)?.is_none() {
                return Err(FactoryError::StepNotFound { id: *step_id }.into());
            }
        }

        let order_id = match new.order_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        if self.get_order(&order_id)?.is_some() {
            return Err(FactoryError::OrderExists { id: order_id }.into());
        }

        let inserted = self.conn.execute(
            "INSERT INTO orders (order_id, step_chain, amount, status, customer, note)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                order_id,
                format_step_chain(&new.step_chain),
                new.amount,
                OrderStatus::Active.as_str(),
                new.customer,
                new.note
            ],
        );
        match inserted {
            Ok(_) => {}
            // Another writer took the id between the lookup and the insert.
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(FactoryError::OrderExists { id: order_id }.into());
            }
            Err(e) => return Err(anyhow::Error::new(e).context("Failed to insert order")),
        }
        self.get_order(&order_id)?
            .context("Order not found after insert")
    }

    pub fn get_order(&self, order_id: &str) -> Result<Option<Order>> {
        let row = self
            .conn
            .query_row(
                "SELECT order_id, step_chain, amount, status, customer, note, created_at, updated_at
                 FROM orders WHERE order_id = ?1",
                params![order_id],
                row_to_order,
            )
            .optional()
            .context("Failed to query order")?;
        Ok(row.map(OrderRow::into_order))
    }

    pub fn list_orders(&self, status: Option<OrderStatus>) -> Result<Vec<Order>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT order_id, step_chain, amount, status, customer, note, created_at, updated_at
                 FROM orders
                 WHERE ?1 IS NULL OR status = ?1
                 ORDER BY created_at, order_id",
            )
            .context("Failed to prepare list_orders")?;
        let rows = stmt
            .query_map(params![status.map(|s| s.as_str())], row_to_order)
            .context("Failed to query orders")?;
        let mut orders = Vec::new();
        for row in rows {
            orders.push(row.context("Failed to read order row")?.into_order());
        }
        Ok(orders)
    }

    pub fn set_order_status(&self, order_id: &str, status: OrderStatus) -> Result<Order> {
        let count = self
            .conn
            .execute(
                "UPDATE orders SET status = ?1, updated_at = datetime('now') WHERE order_id = ?2",
                params![status.as_str(), order_id],
            )
            .context("Failed to update order status")?;
        if count == 0 {
            return Err(FactoryError::OrderNotFound {
                id: order_id.to_string(),
            }
            .into());
        }
        self.get_order(order_id)?
            .context("Order not found after status update")
    }

    // ── Station state ─────────────────────────────────────────────────

    /// Make sure every catalog station has a row. Returns rows inserted.
    pub fn ensure_station_rows(&self, catalog: &Catalog) -> Result<usize> {
        let mut inserted = 0;
        for station in catalog.stations() {
            inserted += self
                .conn
                .execute(
                    "INSERT OR IGNORE INTO station_state (station) VALUES (?1)",
                    params![station],
                )
                .context("Failed to insert station row")?;
        }
        Ok(inserted)
    }

    pub fn list_stations(&self) -> Result<Vec<StationState>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT station, current_order_id, current_piece_no, current_step_id, busy_until, updated_at
                 FROM station_state ORDER BY station",
            )
            .context("Failed to prepare list_stations")?;
        let rows = stmt
            .query_map([], row_to_station)
            .context("Failed to query stations")?;
        let mut stations = Vec::new();
        for row in rows {
            stations.push(row.context("Failed to read station row")?);
        }
        Ok(stations)
    }

    /// Stations currently holding a job, by name.
    pub fn occupied_stations(&self) -> Result<Vec<StationState>> {
        Ok(self
            .list_stations()?
            .into_iter()
            .filter(|s| !s.is_idle())
            .collect())
    }

    /// Names of idle stations, ascending.
    pub fn idle_stations(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT station FROM station_state
                 WHERE current_order_id IS NULL AND busy_until IS NULL
                 ORDER BY station",
            )
            .context("Failed to prepare idle_stations")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query idle stations")?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row.context("Failed to read station name")?);
        }
        Ok(names)
    }

    /// Claim an idle station. Returns false when the station was not idle,
    /// so a racing writer can never stack a second job on it.
    pub fn occupy_station(&self, job: &Assignment, now: &str) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE station_state
                 SET current_order_id = ?1, current_piece_no = ?2, current_step_id = ?3,
                     busy_until = ?4, updated_at = ?5
                 WHERE station = ?6 AND current_order_id IS NULL AND busy_until IS NULL",
                params![
                    job.order_id,
                    job.piece_no,
                    job.step_id,
                    job.busy_until,
                    now,
                    job.station
                ],
            )
            .context("Failed to occupy station")?;
        Ok(count > 0)
    }

    pub fn release_station(&self, station: &str, now: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE station_state
                 SET current_order_id = NULL, current_piece_no = NULL, current_step_id = NULL,
                     busy_until = NULL, updated_at = ?1
                 WHERE station = ?2",
                params![now, station],
            )
            .context("Failed to release station")?;
        Ok(())
    }

    pub fn release_stations_for_order(&self, order_id: &str, now: &str) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE station_state
                 SET current_order_id = NULL, current_piece_no = NULL, current_step_id = NULL,
                     busy_until = NULL, updated_at = ?1
                 WHERE current_order_id = ?2",
                params![now, order_id],
            )
            .context("Failed to release stations for order")
    }

    // ── Piece progress ────────────────────────────────────────────────

    /// Materialize a pending row for every piece × chain step. Existing rows
    /// are left untouched. Returns rows inserted.
    pub fn ensure_piece_rows(&self, order_id: &str, chain: &[i64], amount: i64) -> Result<usize> {
        let amount = normalize_amount(amount);
        let existing: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM piece_step_progress
                 WHERE order_id = ?1 AND piece_no BETWEEN 1 AND ?2",
                params![order_id, amount],
                |row| row.get(0),
            )
            .context("Failed to count progress rows")?;
        if existing >= amount * chain.len() as i64 {
            return Ok(0);
        }

        let mut stmt = self
            .conn
            .prepare(
                "INSERT OR IGNORE INTO piece_step_progress (order_id, piece_no, step_id, state)
                 VALUES (?1, ?2, ?3, 'pending')",
            )
            .context("Failed to prepare ensure_piece_rows")?;
        let mut inserted = 0;
        for piece_no in 1..=amount {
            for step_id in chain {
                inserted += stmt
                    .execute(params![order_id, piece_no, step_id])
                    .context("Failed to insert progress row")?;
            }
        }
        Ok(inserted)
    }

    pub fn progress_for_order(&self, order_id: &str) -> Result<Vec<PieceStepProgress>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT order_id, piece_no, step_id, state, started_at, finished_at
                 FROM piece_step_progress WHERE order_id = ?1
                 ORDER BY piece_no, step_id",
            )
            .context("Failed to prepare progress_for_order")?;
        let rows = stmt
            .query_map(params![order_id], row_to_progress)
            .context("Failed to query progress")?;
        collect_progress(rows)
    }

    /// Every running row across all orders.
    pub fn running_rows(&self) -> Result<Vec<PieceStepProgress>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT order_id, piece_no, step_id, state, started_at, finished_at
                 FROM piece_step_progress WHERE state = 'running'
                 ORDER BY order_id, piece_no, step_id",
            )
            .context("Failed to prepare running_rows")?;
        let rows = stmt
            .query_map([], row_to_progress)
            .context("Failed to query running rows")?;
        collect_progress(rows)
    }

    /// pending -> running. `started_at` keeps its first value.
    pub fn mark_running(&self, order_id: &str, piece_no: i64, step_id: i64, now: &str) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE piece_step_progress
                 SET state = 'running', started_at = COALESCE(started_at, ?1)
                 WHERE order_id = ?2 AND piece_no = ?3 AND step_id = ?4 AND state = 'pending'",
                params![now, order_id, piece_no, step_id],
            )
            .context("Failed to mark progress running")?;
        Ok(count > 0)
    }

    /// running -> finished.
    pub fn mark_finished(&self, order_id: &str, piece_no: i64, step_id: i64, now: &str) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE piece_step_progress
                 SET state = 'finished', finished_at = ?1
                 WHERE order_id = ?2 AND piece_no = ?3 AND step_id = ?4 AND state = 'running'",
                params![now, order_id, piece_no, step_id],
            )
            .context("Failed to mark progress finished")?;
        Ok(count > 0)
    }

    /// running -> pending, for a job whose station had to be abandoned.
    pub fn requeue_running(&self, order_id: &str, piece_no: i64, step_id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE piece_step_progress SET state = 'pending'
                 WHERE order_id = ?1 AND piece_no = ?2 AND step_id = ?3 AND state = 'running'",
                params![order_id, piece_no, step_id],
            )
            .context("Failed to requeue progress row")?;
        Ok(count > 0)
    }

    pub fn count_in_state(&self, order_id: &str, step_id: i64, state: PieceState) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM piece_step_progress
                 WHERE order_id = ?1 AND step_id = ?2 AND state = ?3",
                params![order_id, step_id, state.as_str()],
                |row| row.get(0),
            )
            .context("Failed to count progress rows")
    }

    pub fn delete_progress_for_order(&self, order_id: &str) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM piece_step_progress WHERE order_id = ?1",
                params![order_id],
            )
            .context("Failed to delete progress rows")
    }

    pub fn debug_state(&self) -> Result<DebugState> {
        Ok(DebugState {
            stations: self.list_stations()?,
            running: self.running_rows()?,
        })
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

fn row_to_step(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProcessStep> {
    Ok(ProcessStep {
        step_id: row.get(0)?,
        name: row.get(1)?,
        station: row.get(2)?,
        description: row.get(3)?,
        estimated_seconds: row.get(4)?,
    })
}

fn row_to_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<OrderRow> {
    Ok(OrderRow {
        order_id: row.get(0)?,
        step_chain: row.get(1)?,
        amount: amount_from_value(row.get(2)?),
        status: row.get(3)?,
        customer: row.get(4)?,
        note: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

/// Coerce a stored `amount` to a piece count. Anything that is not a
/// positive number reads as one piece.
fn amount_from_value(value: Value) -> i64 {
    let amount = match value {
        Value::Integer(n) => n,
        Value::Real(f) if f.is_finite() => f as i64,
        Value::Text(t) => t.trim().parse::<i64>().unwrap_or(1),
        _ => 1,
    };
    normalize_amount(amount)
}

fn row_to_station(row: &rusqlite::Row<'_>) -> rusqlite::Result<StationState> {
    Ok(StationState {
        station: row.get(0)?,
        current_order_id: row.get(1)?,
        current_piece_no: row.get(2)?,
        current_step_id: row.get(3)?,
        busy_until: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

/// Reads the state column as text; unknown values surface as pending so
/// the projection degrades instead of failing.
fn row_to_progress(row: &rusqlite::Row<'_>) -> rusqlite::Result<PieceStepProgress> {
    let state_str: String = row.get(3)?;
    let state = state_str.parse::<PieceState>().unwrap_or(PieceState::Pending);
    Ok(PieceStepProgress {
        order_id: row.get(0)?,
        piece_no: row.get(1)?,
        step_id: row.get(2)?,
        state,
        started_at: row.get(4)?,
        finished_at: row.get(5)?,
    })
}

fn collect_progress<I>(rows: I) -> Result<Vec<PieceStepProgress>>
where
    I: Iterator<Item = rusqlite::Result<PieceStepProgress>>,
{
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("Failed to read progress row")?);
    }
    Ok(out)
}

// ── Tests ─────────────────────────────────────────────────────────────
