//! PostgreSQL implementation of the relay's `TaskStore` and `SequenceAllocator`.
//!
//! # Features
//!
//! - Per-task read-modify-write under `SELECT ... FOR UPDATE`
//! - Monotonic-status guard applied before every write
//! - Sequence allocation from a reserved counter row, updated transactionally
//! - Idempotent schema bootstrap via [`PgTaskStore::migrate`]
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE relay_counters (
//!     name TEXT PRIMARY KEY,
//!     value BIGINT NOT NULL
//! );
//!
//! CREATE TABLE relay_tasks (
//!     sequence BIGINT PRIMARY KEY,
//!     kind TEXT NOT NULL,
//!
//!     -- Lifecycle
//!     status TEXT NOT NULL,
//!     status_code SMALLINT NOT NULL,
//!     terminal BOOLEAN NOT NULL,
//!     attempts INTEGER NOT NULL,
//!     in_flight BOOLEAN NOT NULL,
//!     next_attempt_at TIMESTAMPTZ,
//!
//!     -- Immutable request data
//!     payload JSONB NOT NULL,
//!     cancel_target BIGINT,
//!
//!     -- Ledger tracking
//!     transaction_handle TEXT,
//!     last_error TEXT,
//!     terminal_reason JSONB,
//!
//!     -- Timestamps
//!     created_at TIMESTAMPTZ NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL
//! );
//!
//! CREATE INDEX idx_relay_tasks_unfinished ON relay_tasks (sequence) WHERE NOT terminal;
//! CREATE INDEX idx_relay_tasks_status ON relay_tasks (status, sequence);
//! CREATE INDEX idx_relay_tasks_kind ON relay_tasks (kind, sequence);
//! CREATE INDEX idx_relay_tasks_cancel_target ON relay_tasks (cancel_target)
//!     WHERE cancel_target IS NOT NULL;
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use relay_store_postgres::PgTaskStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/relay").await?;
//! let store = Arc::new(PgTaskStore::new(pool));
//! store.migrate().await?;
//!
//! let engine = EngineBuilder::new(store, ledger).build()?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::{
    DefaultTaskPolicy, Mutator, Sequence, SequenceAllocator, StoreError, StoreResult, Task,
    TaskPayload, TaskStatus, TaskStore, TxHandle, UpdateResult,
};
use sqlx::{FromRow, PgPool};

const SEQUENCE_COUNTER: &str = "task_sequence";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS relay_counters (
        name TEXT PRIMARY KEY,
        value BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS relay_tasks (
        sequence BIGINT PRIMARY KEY,
        kind TEXT NOT NULL,
        status TEXT NOT NULL,
        status_code SMALLINT NOT NULL,
        terminal BOOLEAN NOT NULL,
        attempts INTEGER NOT NULL,
        in_flight BOOLEAN NOT NULL,
        next_attempt_at TIMESTAMPTZ,
        payload JSONB NOT NULL,
        cancel_target BIGINT,
        transaction_handle TEXT,
        last_error TEXT,
        terminal_reason JSONB,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_relay_tasks_unfinished ON relay_tasks (sequence) WHERE NOT terminal",
    "CREATE INDEX IF NOT EXISTS idx_relay_tasks_status ON relay_tasks (status, sequence)",
    "CREATE INDEX IF NOT EXISTS idx_relay_tasks_kind ON relay_tasks (kind, sequence)",
    "CREATE INDEX IF NOT EXISTS idx_relay_tasks_cancel_target ON relay_tasks (cancel_target) WHERE cancel_target IS NOT NULL",
];

const COLUMNS: &str = "sequence, kind, status, status_code, terminal, attempts, in_flight, \
    next_attempt_at, payload, cancel_target, transaction_handle, last_error, terminal_reason, \
    created_at, updated_at";

/// PostgreSQL task store.
#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
    first_sequence: i64,
}

impl PgTaskStore {
    /// Create a store whose allocator starts at sequence 1.
    pub fn new(pool: PgPool) -> Self {
        Self::with_first_sequence(pool, 1)
    }

    /// Create a store whose allocator hands out `first` on an empty counter.
    ///
    /// Only takes effect when [`Self::migrate`] creates the counter row.
    pub fn with_first_sequence(pool: PgPool, first: u64) -> Self {
        Self {
            pool,
            first_sequence: i64::try_from(first.max(1)).unwrap_or(i64::MAX),
        }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables, indexes and the sequence counter if they do not exist.
    pub async fn migrate(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }
        sqlx::query(
            r#"
            INSERT INTO relay_counters (name, value)
            VALUES ($1, $2)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(SEQUENCE_COUNTER)
        .bind(self.first_sequence - 1)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        tracing::info!("relay schema ready");
        Ok(())
    }

    async fn fetch_one_where(
        &self,
        clause: &str,
        bind: Option<BindValue<'_>>,
    ) -> StoreResult<Option<Task>> {
        let sql = format!("SELECT {COLUMNS} FROM relay_tasks {clause}");
        let query = sqlx::query_as::<_, TaskRow>(&sql);
        let query = match bind {
            Some(BindValue::Int(value)) => query.bind(value),
            Some(BindValue::Text(value)) => query.bind(value),
            None => query,
        };
        query
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .map(TaskRow::into_task)
            .transpose()
    }

    async fn fetch_all_where(
        &self,
        clause: &str,
        binds: &[BindValue<'_>],
        limit: usize,
    ) -> StoreResult<Vec<Task>> {
        let limit_slot = binds.len() + 1;
        let sql = format!(
            "SELECT {COLUMNS} FROM relay_tasks {clause} ORDER BY sequence ASC LIMIT ${limit_slot}"
        );
        let mut query = sqlx::query_as::<_, TaskRow>(&sql);
        for bind in binds {
            query = match *bind {
                BindValue::Int(value) => query.bind(value),
                BindValue::Text(value) => query.bind(value),
            };
        }
        query
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?
            .into_iter()
            .map(TaskRow::into_task)
            .collect()
    }
}

enum BindValue<'a> {
    Int(i64),
    Text(&'a str),
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn create(&self, task: Task) -> StoreResult<()> {
        let row = TaskRow::from_task(&task)?;
        let result = sqlx::query(&format!(
            "INSERT INTO relay_tasks ({COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
        ))
        .bind(row.sequence)
        .bind(&row.kind)
        .bind(&row.status)
        .bind(row.status_code)
        .bind(row.terminal)
        .bind(row.attempts)
        .bind(row.in_flight)
        .bind(row.next_attempt_at)
        .bind(&row.payload)
        .bind(row.cancel_target)
        .bind(&row.transaction_handle)
        .bind(&row.last_error)
        .bind(&row.terminal_reason)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                Err(StoreError::DuplicateSequence(task.sequence))
            }
            Err(err) => Err(backend(err)),
        }
    }

    /// Read-modify-write under a row lock.
    ///
    /// The mutator runs while `FOR UPDATE` holds the row, so concurrent
    /// updates of one task serialize and unrelated tasks do not contend.
    async fn update(&self, sequence: Sequence, mutator: Mutator<'_>) -> StoreResult<UpdateResult> {
        let key = to_db_sequence(sequence)?;
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {COLUMNS} FROM relay_tasks WHERE sequence = $1 FOR UPDATE"
        ))
        .bind(key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?
        .ok_or(StoreError::NotFound(sequence))?;
        let previous = row.into_task()?;

        let next = match mutator(&previous) {
            Some(next) if previous.admits(&next) => next,
            Some(next) => {
                tracing::warn!(
                    sequence = %sequence,
                    from = %previous.status,
                    to = %next.status,
                    "refused non-monotonic task update"
                );
                return Ok(unchanged(previous));
            }
            None => return Ok(unchanged(previous)),
        };

        let row = TaskRow::from_task(&next)?;
        sqlx::query(
            r#"
            UPDATE relay_tasks
            SET status = $1,
                status_code = $2,
                terminal = $3,
                attempts = $4,
                in_flight = $5,
                next_attempt_at = $6,
                transaction_handle = $7,
                last_error = $8,
                terminal_reason = $9,
                updated_at = $10
            WHERE sequence = $11
            "#,
        )
        .bind(&row.status)
        .bind(row.status_code)
        .bind(row.terminal)
        .bind(row.attempts)
        .bind(row.in_flight)
        .bind(row.next_attempt_at)
        .bind(&row.transaction_handle)
        .bind(&row.last_error)
        .bind(&row.terminal_reason)
        .bind(row.updated_at)
        .bind(key)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        Ok(UpdateResult {
            previous,
            current: next,
            applied: true,
        })
    }

    async fn get_by_sequence(&self, sequence: Sequence) -> StoreResult<Option<Task>> {
        let key = to_db_sequence(sequence)?;
        self.fetch_one_where("WHERE sequence = $1", Some(BindValue::Int(key)))
            .await
    }

    async fn get_latest(&self) -> StoreResult<Option<Task>> {
        self.fetch_one_where("ORDER BY sequence DESC LIMIT 1", None)
            .await
    }

    async fn get_default(&self, policy: DefaultTaskPolicy) -> StoreResult<Option<Task>> {
        match policy {
            DefaultTaskPolicy::Latest => self.get_latest().await,
            DefaultTaskPolicy::LatestOfKind(kind) => {
                self.fetch_one_where(
                    "WHERE kind = $1 ORDER BY sequence DESC LIMIT 1",
                    Some(BindValue::Text(kind.as_str())),
                )
                .await
            }
            DefaultTaskPolicy::OldestUnfinished => {
                self.fetch_one_where("WHERE NOT terminal ORDER BY sequence ASC LIMIT 1", None)
                    .await
            }
        }
    }

    async fn list_unfinished(&self, after: Sequence, limit: usize) -> StoreResult<Vec<Task>> {
        let after = to_db_cursor(after);
        self.fetch_all_where(
            "WHERE NOT terminal AND sequence > $1",
            &[BindValue::Int(after)],
            limit,
        )
        .await
    }

    async fn list_by_status(
        &self,
        status: TaskStatus,
        after: Sequence,
        limit: usize,
    ) -> StoreResult<Vec<Task>> {
        let after = to_db_cursor(after);
        self.fetch_all_where(
            "WHERE status = $1 AND sequence > $2",
            &[BindValue::Text(status.as_str()), BindValue::Int(after)],
            limit,
        )
        .await
    }

    async fn find_cancellations(&self, target: Sequence) -> StoreResult<Vec<Task>> {
        let key = to_db_sequence(target)?;
        self.fetch_all_where("WHERE cancel_target = $1", &[BindValue::Int(key)], usize::MAX)
            .await
    }
}

#[async_trait]
impl SequenceAllocator for PgTaskStore {
    /// Increments the counter row; the row lock serializes concurrent callers.
    async fn allocate(&self) -> StoreResult<Sequence> {
        let value: i64 = sqlx::query_scalar(
            r#"
            UPDATE relay_counters
            SET value = value + 1
            WHERE name = $1
            RETURNING value
            "#,
        )
        .bind(SEQUENCE_COUNTER)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .ok_or_else(|| StoreError::Backend("sequence counter missing; run migrate()".into()))?;

        from_db_sequence(value)
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn unchanged(task: Task) -> UpdateResult {
    UpdateResult {
        previous: task.clone(),
        current: task,
        applied: false,
    }
}

fn to_db_sequence(sequence: Sequence) -> StoreResult<i64> {
    i64::try_from(sequence.get())
        .map_err(|_| StoreError::Backend(format!("sequence {sequence} exceeds BIGINT range")))
}

/// Paging cursor; nothing is stored past `i64::MAX`, so larger cursors clamp.
fn to_db_cursor(after: Sequence) -> i64 {
    i64::try_from(after.get()).unwrap_or(i64::MAX)
}

fn from_db_sequence(value: i64) -> StoreResult<Sequence> {
    u64::try_from(value)
        .map(Sequence)
        .map_err(|_| StoreError::Corrupt(format!("negative sequence {value}")))
}

/// Column-level image of a task.
#[derive(Debug, Clone, PartialEq, FromRow)]
struct TaskRow {
    sequence: i64,
    kind: String,
    status: String,
    status_code: i16,
    terminal: bool,
    attempts: i32,
    in_flight: bool,
    next_attempt_at: Option<DateTime<Utc>>,
    payload: serde_json::Value,
    cancel_target: Option<i64>,
    transaction_handle: Option<String>,
    last_error: Option<String>,
    terminal_reason: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskRow {
    fn from_task(task: &Task) -> StoreResult<Self> {
        let corrupt = |err: serde_json::Error| StoreError::Corrupt(err.to_string());
        let cancel_target = match &task.payload {
            TaskPayload::CancelPayment(cancel) => Some(to_db_sequence(cancel.target)?),
            _ => None,
        };
        Ok(Self {
            sequence: to_db_sequence(task.sequence)?,
            kind: task.kind().as_str().to_string(),
            status: task.status.as_str().to_string(),
            status_code: i16::try_from(task.status.legacy_code()).unwrap_or(i16::MAX),
            terminal: task.is_terminal(),
            attempts: i32::try_from(task.attempts).unwrap_or(i32::MAX),
            in_flight: task.in_flight,
            next_attempt_at: task.next_attempt_at,
            payload: serde_json::to_value(&task.payload).map_err(corrupt)?,
            cancel_target,
            transaction_handle: task.transaction_handle.as_ref().map(|h| h.0.clone()),
            last_error: task.last_error.clone(),
            terminal_reason: task
                .terminal_reason
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(corrupt)?,
            created_at: task.created_at,
            updated_at: task.updated_at,
        })
    }

    fn into_task(self) -> StoreResult<Task> {
        let corrupt = |err: serde_json::Error| {
            StoreError::Corrupt(format!("task {}: {err}", self.sequence))
        };
        let status: TaskStatus = self
            .status
            .parse()
            .map_err(|err| StoreError::Corrupt(format!("task {}: {err}", self.sequence)))?;
        let payload: TaskPayload = serde_json::from_value(self.payload).map_err(corrupt)?;
        let terminal_reason = self
            .terminal_reason
            .map(serde_json::from_value)
            .transpose()
            .map_err(corrupt)?;
        let attempts = u32::try_from(self.attempts)
            .map_err(|_| StoreError::Corrupt(format!("task {}: negative attempts", self.sequence)))?;

        Ok(Task {
            sequence: from_db_sequence(self.sequence)?,
            status,
            payload,
            transaction_handle: self.transaction_handle.map(TxHandle),
            attempts,
            in_flight: self.in_flight,
            last_error: self.last_error,
            next_attempt_at: self.next_attempt_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            terminal_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{CancelPayment, FailureCode, NewPayment, TaskKind, Terminal, TerminalReason};

    fn payment() -> Task {
        Task::opened(
            Sequence(7),
            TaskPayload::NewPayment(NewPayment {
                purchase_id: "P-7".into(),
                shop: "S1".into(),
                amount: 300,
                account: None,
            }),
            Utc::now(),
        )
    }

    #[test]
    fn test_paging_cursor_clamps_to_bigint() {
        assert_eq!(to_db_cursor(Sequence(0)), 0);
        assert_eq!(to_db_cursor(Sequence(41)), 41);
        assert_eq!(to_db_cursor(Sequence(u64::MAX)), i64::MAX);
    }

    #[test]
    fn test_row_image_restores_task() {
        let mut task = payment();
        task.status = TaskStatus::Finished(Terminal::Denied);
        task.attempts = 2;
        task.transaction_handle = Some(TxHandle("0x77".into()));
        task.terminal_reason = Some(TerminalReason {
            code: FailureCode::LedgerDenied,
            message: "insufficient balance".into(),
            attempts: 2,
        });

        let row = TaskRow::from_task(&task).unwrap();
        assert_eq!(row.kind, TaskKind::NewPayment.as_str());
        assert_eq!(row.status, "Denied");
        assert_eq!(row.status_code, 52);
        assert!(row.terminal);
        assert_eq!(row.cancel_target, None);

        assert_eq!(row.into_task().unwrap(), task);
    }

    #[test]
    fn test_cancellations_index_their_target() {
        let cancel = Task::opened(
            Sequence(8),
            TaskPayload::CancelPayment(CancelPayment {
                target: Sequence(7),
                reason: None,
            }),
            Utc::now(),
        );
        let row = TaskRow::from_task(&cancel).unwrap();
        assert_eq!(row.cancel_target, Some(7));
        assert!(!row.terminal);
    }

    #[test]
    fn test_corrupt_rows_are_reported() {
        let mut row = TaskRow::from_task(&payment()).unwrap();
        row.status = "Pending".into();
        assert!(matches!(row.into_task(), Err(StoreError::Corrupt(_))));

        let mut row = TaskRow::from_task(&payment()).unwrap();
        row.attempts = -1;
        assert!(matches!(row.into_task(), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_sequence_range_is_checked() {
        assert!(to_db_sequence(Sequence(u64::MAX)).is_err());
        assert_eq!(to_db_sequence(Sequence(42)).unwrap(), 42);
        assert!(from_db_sequence(-1).is_err());
    }
}
