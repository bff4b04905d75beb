//! SQLite database bootstrap
//!
//! Creates the connection pool and the four engine tables:
//! - sequences / sequence_steps: author-owned definitions
//! - enrollments / step_executions: engine-owned runtime state
//!
//! Enrollment rows cascade on sequence deletion, and a trigger refuses any
//! update of an enrollment already in a terminal state.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Shared handle to the engine database
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) `{data_dir}/dripway.db` and initialize the schema
    pub async fn open(data_dir: &str) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| anyhow::anyhow!("Failed to create data directory '{}': {}", data_dir, e))?;
        let db_path = Path::new(data_dir).join("dripway.db");

        tracing::info!("🗄️ Opening engine database: {}", db_path.display());

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let database = Self { pool };
        database.init_schema().await?;

        tracing::info!("✅ Engine database ready: {}", db_path.display());
        Ok(database)
    }

    /// Private in-memory database on a single pinned connection
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let database = Self { pool };
        database.init_schema().await?;
        Ok(database)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables, indexes and triggers. Safe to call repeatedly.
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sequences (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'draft',
                trigger_type TEXT NOT NULL,
                trigger_config JSON NOT NULL,
                settings JSON NOT NULL,
                stats JSON NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sequence_steps (
                id TEXT NOT NULL,
                sequence_id TEXT NOT NULL REFERENCES sequences(id) ON DELETE CASCADE,
                step_order INTEGER NOT NULL,
                name TEXT NOT NULL,
                step_type TEXT NOT NULL,
                config JSON NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                retry_limit INTEGER,
                PRIMARY KEY (sequence_id, id),
                UNIQUE (sequence_id, step_order)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS enrollments (
                id TEXT PRIMARY KEY,
                sequence_id TEXT NOT NULL REFERENCES sequences(id) ON DELETE CASCADE,
                subscriber_id TEXT NOT NULL,
                status TEXT NOT NULL,
                current_step_id TEXT,
                current_step_started_at INTEGER,
                next_scheduled_at INTEGER,
                claimed_until INTEGER,
                claim_token TEXT,
                enrolled_at INTEGER NOT NULL,
                completed_at INTEGER,
                exited_at INTEGER,
                exit_reason TEXT,
                metadata JSON NOT NULL DEFAULT '{}',
                version INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS step_executions (
                id TEXT PRIMARY KEY,
                enrollment_id TEXT NOT NULL REFERENCES enrollments(id) ON DELETE CASCADE,
                step_id TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                started_at INTEGER,
                completed_at INTEGER,
                result JSON,
                error TEXT,
                email_job_id TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // At most one non-terminal enrollment per (sequence, subscriber)
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_enrollments_open_pair
            ON enrollments(sequence_id, subscriber_id)
            WHERE status IN ('active', 'paused')
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_enrollments_due ON enrollments(status, next_scheduled_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_enrollments_claim ON enrollments(claim_token)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_executions_enrollment ON step_executions(enrollment_id, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_executions_job ON step_executions(email_job_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS trg_enrollments_terminal_immutable
            BEFORE UPDATE ON enrollments
            FOR EACH ROW WHEN OLD.status IN ('completed', 'exited')
            BEGIN
                SELECT RAISE(ABORT, 'terminal enrollment is immutable');
            END
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
