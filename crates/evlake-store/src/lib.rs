//! Postgres-backed store for evlake: deduplicating event inserts and the
//! ingestion-run audit ledger.
//!
//! Deduplication is anchored in the `raw_events` primary key, never in a
//! check-then-insert sequence: every insert goes through
//! `ON CONFLICT (event_id) DO NOTHING` and is classified by its row count.
//! The ledger enforces single-writer-per-file the same way, through a
//! partial unique index on `(file_name) WHERE status = 'running'`.

use chrono::{DateTime, Duration, Utc};
use evlake_core::{Event, IngestionRun, RunCounts, RunStatus};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "evlake-store";

/// Embedded schema migrations (the two-table schema plus its indexes).
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    /// The partial unique index rejected a second `running` row for the file.
    #[error("an ingestion run is already active for `{file_name}`")]
    RunAlreadyActive { file_name: String },

    /// Terminal update matched no `running` row: the run is unknown or was
    /// already finalized.
    #[error("run {run_id} is not in `running` state")]
    RunNotRunning { run_id: Uuid },

    #[error("unexpected status value `{0}` in ingestion_runs")]
    InvalidStatus(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Connect a small pool suitable for one worker process.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Apply pending migrations. Safe to run on every start.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    MIGRATOR.run(pool).await?;
    info!("schema migrations applied");
    Ok(())
}

/// Per-row classification of a deduplicating insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// Aggregate result of one committed chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub inserted: u64,
    pub deduped: u64,
}

const INSERT_EVENT_SQL: &str = r#"
INSERT INTO raw_events (
  event_id, event_time, ingestion_time, event_name, user_id, session_id,
  product_id, price, device, payload
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8::float8::numeric(12,2), $9, $10)
ON CONFLICT (event_id) DO NOTHING
"#;

async fn execute_insert(
    conn: &mut PgConnection,
    event: &Event,
    ingestion_time: DateTime<Utc>,
) -> Result<InsertOutcome> {
    let result = sqlx::query(INSERT_EVENT_SQL)
        .bind(event.event_id)
        .bind(event.event_time)
        .bind(ingestion_time)
        .bind(&event.event_name)
        .bind(event.user_id)
        .bind(event.session_id)
        .bind(event.product_id)
        .bind(event.price)
        .bind(event.device.as_deref())
        .bind(&event.payload)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 1 {
        Ok(InsertOutcome::Inserted)
    } else {
        Ok(InsertOutcome::Duplicate)
    }
}

/// Write half of the deduplicating loader: conditional inserts into
/// `raw_events`.
#[derive(Debug, Clone)]
pub struct EventStore {
    pool: PgPool,
}

impl EventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert one event, classifying it as new or duplicate.
    pub async fn insert_event(
        &self,
        event: &Event,
        ingestion_time: DateTime<Utc>,
    ) -> Result<InsertOutcome> {
        let mut conn = self.pool.acquire().await?;
        execute_insert(&mut conn, event, ingestion_time).await
    }

    /// Insert a chunk of events in one transaction.
    ///
    /// Classification stays exact per row: a chunk mixing new and duplicate
    /// events commits the new ones and counts the duplicates. Any error
    /// other than an `event_id` conflict rolls the chunk back and is
    /// surfaced to the caller.
    pub async fn insert_chunk(&self, rows: &[(Event, DateTime<Utc>)]) -> Result<ChunkOutcome> {
        let mut outcome = ChunkOutcome::default();
        if rows.is_empty() {
            return Ok(outcome);
        }

        let mut tx = self.pool.begin().await?;
        for (event, ingestion_time) in rows {
            match execute_insert(&mut tx, event, *ingestion_time).await? {
                InsertOutcome::Inserted => outcome.inserted += 1,
                InsertOutcome::Duplicate => outcome.deduped += 1,
            }
        }
        tx.commit().await?;

        debug!(
            inserted = outcome.inserted,
            deduped = outcome.deduped,
            "committed insert chunk"
        );
        Ok(outcome)
    }
}

/// An open run as seen by its owning worker.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub run_id: Uuid,
    pub file_name: String,
    pub started_at: DateTime<Utc>,
}

const OPEN_RUN_SQL: &str = r#"
INSERT INTO ingestion_runs (run_id, file_name, started_at, status)
VALUES ($1, $2, $3, 'running')
"#;

const FINALIZE_RUN_SQL: &str = r#"
UPDATE ingestion_runs
SET finished_at = now(),
    status = $1,
    rows_in_file = $2,
    rows_loaded = $3,
    rows_deduped = $4,
    error_message = $5
WHERE run_id = $6 AND status = 'running'
"#;

const LIST_RUNS_SQL: &str = r#"
SELECT run_id, file_name, started_at, finished_at,
       rows_in_file, rows_loaded, rows_deduped, status, error_message
FROM ingestion_runs
ORDER BY started_at DESC
LIMIT $1
"#;

const STALE_RUNS_SQL: &str = r#"
SELECT run_id, file_name, started_at, finished_at,
       rows_in_file, rows_loaded, rows_deduped, status, error_message
FROM ingestion_runs
WHERE status = 'running' AND started_at < $1
ORDER BY started_at
"#;

/// Audit ledger over `ingestion_runs`.
#[derive(Debug, Clone)]
pub struct RunLedger {
    pool: PgPool,
}

impl RunLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `running` audit row for one file, before any row is read.
    ///
    /// Fails with [`StoreError::RunAlreadyActive`] when another run on the
    /// same file is still `running`, which includes crashed runs awaiting
    /// reconciliation.
    pub async fn open_run(&self, file_name: &str) -> Result<RunHandle> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let result = sqlx::query(OPEN_RUN_SQL)
            .bind(run_id)
            .bind(file_name)
            .bind(started_at)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => {
                info!(%run_id, file_name, "opened ingestion run");
                Ok(RunHandle {
                    run_id,
                    file_name: file_name.to_string(),
                    started_at,
                })
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::RunAlreadyActive {
                    file_name: file_name.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Move a run to its terminal state, setting `finished_at`, the counts,
    /// and the error message in one statement.
    ///
    /// Guarded by `status = 'running'` so the transition fires at most once.
    pub async fn finalize_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        counts: RunCounts,
        error_message: Option<&str>,
    ) -> Result<()> {
        debug_assert!(status.is_terminal());

        let result = sqlx::query(FINALIZE_RUN_SQL)
            .bind(status.as_str())
            .bind(counts.rows_in_file as i64)
            .bind(counts.rows_loaded as i64)
            .bind(counts.rows_deduped as i64)
            .bind(error_message)
            .bind(run_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotRunning { run_id });
        }

        info!(
            %run_id,
            status = %status,
            rows_in_file = counts.rows_in_file,
            rows_loaded = counts.rows_loaded,
            rows_deduped = counts.rows_deduped,
            "finalized ingestion run"
        );
        Ok(())
    }

    /// Most recent runs, newest first.
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<IngestionRun>> {
        let rows = sqlx::query(LIST_RUNS_SQL)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_run).collect()
    }

    /// `running` rows whose `started_at` is older than the given age.
    /// These are crashed or wedged runs that need out-of-band reconciliation.
    pub async fn stale_running(&self, older_than: Duration) -> Result<Vec<IngestionRun>> {
        let cutoff = Utc::now() - older_than;
        let rows = sqlx::query(STALE_RUNS_SQL)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_run).collect()
    }
}

fn row_to_run(row: &PgRow) -> Result<IngestionRun> {
    let status: String = row.try_get("status")?;
    let status =
        RunStatus::parse(&status).ok_or_else(|| StoreError::InvalidStatus(status.clone()))?;

    Ok(IngestionRun {
        run_id: row.try_get("run_id")?,
        file_name: row.try_get("file_name")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        rows_in_file: row.try_get("rows_in_file")?,
        rows_loaded: row.try_get("rows_loaded")?,
        rows_deduped: row.try_get("rows_deduped")?,
        status,
        error_message: row.try_get("error_message")?,
    })
}
