//! SQLite persistence for enrollments and step executions
//!
//! Every state-changing statement is a single conditional UPDATE/INSERT so
//! the database arbitrates races: enrollment caps and uniqueness are checked
//! inside the INSERT, claims stamp a lease token in one UPDATE, and engine
//! writes are guarded by the row version (and the lease token when present).

use crate::enrollment::types::{
    Enrollment, EnrollmentFilter, EnrollmentStatus, ExecutionStatus, ExitReason, StepExecution,
};
use crate::error::{EngineError, EngineResult};
use crate::store::{from_millis, to_millis};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{sqlite::SqlitePool, sqlite::SqliteRow, Row};
use std::collections::HashMap;
use uuid::Uuid;

/// Result of a conditional enrollment insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
    CapacityReached,
    /// The sequence was not `active` when the insert ran
    SequenceNotActive,
}

/// Result of putting a failed email back in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    Requeued,
    /// The execution is no longer waiting on that job
    AlreadySettled,
    /// The enrollment moved on; re-read and try again
    Conflict,
}

/// Execution counts for one step, grouped by status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionTally {
    pub step_id: String,
    pub status: ExecutionStatus,
    pub enrollments: u64,
}

#[derive(Debug, Clone)]
pub struct EnrollmentStorage {
    pool: SqlitePool,
}

impl EnrollmentStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert `enrollment` unless a blocking enrollment exists or the cap is reached
    ///
    /// Blocking means active/paused, plus completed when re-entry is not allowed.
    /// Sequence status, cap and uniqueness are evaluated in the same statement
    /// as the insert, so a concurrent pause cannot slip an enrollment in.
    pub async fn insert_if_allowed(
        &self,
        enrollment: &Enrollment,
        max_concurrent: Option<u32>,
        allow_reentry: bool,
    ) -> EngineResult<InsertOutcome> {
        let blocking = if allow_reentry {
            "('active', 'paused')"
        } else {
            "('active', 'paused', 'completed')"
        };
        let sql = format!(
            r#"
            INSERT INTO enrollments
                (id, sequence_id, subscriber_id, status, current_step_id, current_step_started_at,
                 next_scheduled_at, enrolled_at, metadata, version)
            SELECT ?, ?, ?, 'active', ?, ?, ?, ?, ?, 0
            WHERE EXISTS (SELECT 1 FROM sequences WHERE id = ? AND status = 'active')
            AND NOT EXISTS (
                SELECT 1 FROM enrollments
                WHERE sequence_id = ? AND subscriber_id = ? AND status IN {blocking}
            )
            AND (
                ? IS NULL OR (
                    SELECT COUNT(*) FROM enrollments
                    WHERE sequence_id = ? AND status IN ('active', 'paused')
                ) < ?
            )
            "#
        );
        let cap = max_concurrent.map(i64::from);

        let result = sqlx::query(&sql)
            .bind(enrollment.id.to_string())
            .bind(&enrollment.sequence_id)
            .bind(&enrollment.subscriber_id)
            .bind(&enrollment.current_step_id)
            .bind(enrollment.current_step_started_at.map(to_millis))
            .bind(enrollment.next_scheduled_at.map(to_millis))
            .bind(to_millis(enrollment.enrolled_at))
            .bind(serde_json::to_string(&enrollment.metadata)?)
            .bind(&enrollment.sequence_id)
            .bind(&enrollment.sequence_id)
            .bind(&enrollment.subscriber_id)
            .bind(cap)
            .bind(&enrollment.sequence_id)
            .bind(cap)
            .execute(&self.pool)
            .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => Ok(InsertOutcome::Inserted),
            Ok(_) => {
                let open: Option<(String,)> =
                    sqlx::query_as("SELECT id FROM sequences WHERE id = ? AND status = 'active'")
                        .bind(&enrollment.sequence_id)
                        .fetch_optional(&self.pool)
                        .await?;
                if open.is_none() {
                    return Ok(InsertOutcome::SequenceNotActive);
                }

                let blocked: Option<(String,)> = sqlx::query_as(&format!(
                    "SELECT id FROM enrollments WHERE sequence_id = ? AND subscriber_id = ? AND status IN {blocking} LIMIT 1"
                ))
                .bind(&enrollment.sequence_id)
                .bind(&enrollment.subscriber_id)
                .fetch_optional(&self.pool)
                .await?;

                Ok(if blocked.is_some() {
                    InsertOutcome::Duplicate
                } else {
                    InsertOutcome::CapacityReached
                })
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Ok(InsertOutcome::Duplicate),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, id: Uuid) -> EngineResult<Option<Enrollment>> {
        let row = sqlx::query("SELECT * FROM enrollments WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_enrollment).transpose()
    }

    /// Operator listing, newest first
    pub async fn list(&self, filter: &EnrollmentFilter) -> EngineResult<Vec<Enrollment>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM enrollments
            WHERE (? IS NULL OR sequence_id = ?)
              AND (? IS NULL OR status = ?)
              AND (? IS NULL OR subscriber_id = ?)
            ORDER BY enrolled_at DESC
            LIMIT ?
            "#,
        )
        .bind(&filter.sequence_id)
        .bind(&filter.sequence_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(&filter.subscriber_id)
        .bind(&filter.subscriber_id)
        .bind(i64::from(filter.limit.unwrap_or(500)))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_enrollment).collect()
    }

    /// Claim up to `batch` due enrollments for the holder of `token`
    ///
    /// Due means active with `next_scheduled_at <= now` and no live lease.
    /// The claim is one UPDATE, so concurrent sweepers never share a row.
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        token: &str,
        batch: u32,
    ) -> EngineResult<Vec<Enrollment>> {
        let now_ms = to_millis(now);

        let claimed = sqlx::query(
            r#"
            UPDATE enrollments
            SET claimed_until = ?, claim_token = ?
            WHERE id IN (
                SELECT id FROM enrollments
                WHERE status = 'active'
                  AND next_scheduled_at IS NOT NULL
                  AND next_scheduled_at <= ?
                  AND (claimed_until IS NULL OR claimed_until <= ?)
                ORDER BY next_scheduled_at ASC
                LIMIT ?
            )
            AND status = 'active'
            AND (claimed_until IS NULL OR claimed_until <= ?)
            "#,
        )
        .bind(to_millis(lease_until))
        .bind(token)
        .bind(now_ms)
        .bind(now_ms)
        .bind(i64::from(batch))
        .bind(now_ms)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if claimed == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT * FROM enrollments WHERE claim_token = ? ORDER BY next_scheduled_at ASC",
        )
        .bind(token)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_enrollment).collect()
    }

    /// Persist the engine's view of an enrollment
    ///
    /// Succeeds only if the stored row still has `enrollment.version`, is not
    /// terminal, and (when the caller holds a lease) still carries its token.
    /// Clears the lease of the caller. Returns `false` when the guard failed.
    pub async fn save_state(&self, enrollment: &Enrollment) -> EngineResult<bool> {
        self.write_state(enrollment, true).await
    }

    /// Like `save_state`, but the caller keeps its lease
    ///
    /// Used while a claimed enrollment still has external work in flight: if
    /// the holder dies, the row becomes claimable again when the lease runs out.
    pub async fn save_leased(&self, enrollment: &Enrollment) -> EngineResult<bool> {
        if enrollment.claim_token.is_none() {
            return Err(EngineError::InvalidTransition(format!(
                "enrollment {} is not claimed",
                enrollment.id
            )));
        }
        self.write_state(enrollment, false).await
    }

    async fn write_state(&self, enrollment: &Enrollment, release: bool) -> EngineResult<bool> {
        let sql = if enrollment.claim_token.is_some() && release {
            r#"
            UPDATE enrollments
            SET status = ?, current_step_id = ?, current_step_started_at = ?, next_scheduled_at = ?,
                completed_at = ?, exited_at = ?, exit_reason = ?, metadata = ?,
                version = version + 1, claimed_until = NULL, claim_token = NULL
            WHERE id = ? AND version = ? AND status IN ('active', 'paused') AND claim_token = ?
            "#
        } else if enrollment.claim_token.is_some() {
            r#"
            UPDATE enrollments
            SET status = ?, current_step_id = ?, current_step_started_at = ?, next_scheduled_at = ?,
                completed_at = ?, exited_at = ?, exit_reason = ?, metadata = ?,
                version = version + 1
            WHERE id = ? AND version = ? AND status IN ('active', 'paused') AND claim_token = ?
            "#
        } else {
            r#"
            UPDATE enrollments
            SET status = ?, current_step_id = ?, current_step_started_at = ?, next_scheduled_at = ?,
                completed_at = ?, exited_at = ?, exit_reason = ?, metadata = ?,
                version = version + 1
            WHERE id = ? AND version = ? AND status IN ('active', 'paused') AND (? IS NULL)
            "#
        };

        let result = sqlx::query(sql)
            .bind(enrollment.status.as_str())
            .bind(&enrollment.current_step_id)
            .bind(enrollment.current_step_started_at.map(to_millis))
            .bind(enrollment.next_scheduled_at.map(to_millis))
            .bind(enrollment.completed_at.map(to_millis))
            .bind(enrollment.exited_at.map(to_millis))
            .bind(enrollment.exit_reason.map(|r| r.as_str()))
            .bind(serde_json::to_string(&enrollment.metadata)?)
            .bind(enrollment.id.to_string())
            .bind(enrollment.version)
            .bind(&enrollment.claim_token)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Drop a lease without touching state (processing aborted)
    pub async fn release_claim(&self, id: Uuid, token: &str) -> EngineResult<()> {
        sqlx::query(
            "UPDATE enrollments SET claimed_until = NULL, claim_token = NULL WHERE id = ? AND claim_token = ? AND status IN ('active', 'paused')",
        )
        .bind(id.to_string())
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Pause every active enrollment of a sequence, keeping its timer
    pub async fn pause_sequence(&self, sequence_id: &str) -> EngineResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE enrollments
            SET status = 'paused', version = version + 1, claimed_until = NULL, claim_token = NULL
            WHERE sequence_id = ? AND status = 'active'
            "#,
        )
        .bind(sequence_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Reactivate paused enrollments; overdue timers become due at `now`
    pub async fn resume_sequence(&self, sequence_id: &str, now: DateTime<Utc>) -> EngineResult<u64> {
        let now_ms = to_millis(now);
        let result = sqlx::query(
            r#"
            UPDATE enrollments
            SET status = 'active',
                version = version + 1,
                next_scheduled_at = CASE
                    WHEN next_scheduled_at IS NOT NULL AND next_scheduled_at < ? THEN ?
                    ELSE next_scheduled_at
                END
            WHERE sequence_id = ? AND status = 'paused'
            "#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(sequence_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Enrollment counts per status for one sequence
    pub async fn count_by_status(&self, sequence_id: &str) -> EngineResult<HashMap<EnrollmentStatus, u64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM enrollments WHERE sequence_id = ? GROUP BY status",
        )
        .bind(sequence_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::new();
        for (status, count) in rows {
            counts.insert(EnrollmentStatus::parse(&status)?, count as u64);
        }
        Ok(counts)
    }

    pub async fn insert_execution(&self, execution: &StepExecution) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO step_executions
                (id, enrollment_id, step_id, status, attempts, started_at, completed_at,
                 result, error, email_job_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(execution.id.to_string())
        .bind(execution.enrollment_id.to_string())
        .bind(&execution.step_id)
        .bind(execution.status.as_str())
        .bind(i64::from(execution.attempts))
        .bind(execution.started_at.map(to_millis))
        .bind(execution.completed_at.map(to_millis))
        .bind(execution.result.as_ref().map(Value::to_string))
        .bind(&execution.error)
        .bind(&execution.email_job_id)
        .bind(to_millis(execution.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Write back an execution the caller owns (still pending/executing)
    ///
    /// `expected_job_id` is the job id the caller last saw on the row; the
    /// write is refused when another worker has since taken the execution over.
    pub async fn update_execution(
        &self,
        execution: &StepExecution,
        expected_job_id: Option<&str>,
    ) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET status = ?, attempts = ?, started_at = ?, completed_at = ?, result = ?, error = ?, email_job_id = ?
            WHERE id = ? AND status IN ('pending', 'executing') AND email_job_id IS ?
            "#,
        )
        .bind(execution.status.as_str())
        .bind(i64::from(execution.attempts))
        .bind(execution.started_at.map(to_millis))
        .bind(execution.completed_at.map(to_millis))
        .bind(execution.result.as_ref().map(Value::to_string))
        .bind(&execution.error)
        .bind(&execution.email_job_id)
        .bind(execution.id.to_string())
        .bind(expected_job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// The unfinished execution of `step_id`, left behind by an interrupted
    /// claim or waiting for a retry
    pub async fn open_execution(&self, enrollment_id: Uuid, step_id: &str) -> EngineResult<Option<StepExecution>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM step_executions
            WHERE enrollment_id = ? AND step_id = ? AND status IN ('pending', 'executing')
            ORDER BY created_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(enrollment_id.to_string())
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_execution).transpose()
    }

    /// Apply a job-runner outcome to the execution still waiting on `job_id`
    ///
    /// Returns `false` when the execution is no longer `executing` under that
    /// job id (duplicate or late callback), in which case nothing changed.
    pub async fn settle_job_execution(&self, execution: &StepExecution, job_id: &str) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET status = ?, attempts = ?, completed_at = ?, result = ?, error = ?, email_job_id = ?
            WHERE id = ? AND status = 'executing' AND email_job_id = ?
            "#,
        )
        .bind(execution.status.as_str())
        .bind(i64::from(execution.attempts))
        .bind(execution.completed_at.map(to_millis))
        .bind(execution.result.as_ref().map(Value::to_string))
        .bind(&execution.error)
        .bind(&execution.email_job_id)
        .bind(execution.id.to_string())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Move the execution waiting on `job_id` back to `pending` and make its
    /// enrollment due at `now`, in one transaction
    ///
    /// `enrollment` is the caller's last read; its version guards the write.
    pub async fn requeue_job_execution(
        &self,
        execution: &StepExecution,
        job_id: &str,
        enrollment: &Enrollment,
        now: DateTime<Utc>,
    ) -> EngineResult<Requeue> {
        let mut tx = self.pool.begin().await?;

        let settled = sqlx::query(
            r#"
            UPDATE step_executions
            SET status = 'pending', error = ?
            WHERE id = ? AND status = 'executing' AND email_job_id = ?
            "#,
        )
        .bind(&execution.error)
        .bind(execution.id.to_string())
        .bind(job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if settled != 1 {
            tx.rollback().await?;
            return Ok(Requeue::AlreadySettled);
        }

        let moved = sqlx::query(
            r#"
            UPDATE enrollments
            SET next_scheduled_at = ?, version = version + 1
            WHERE id = ? AND version = ? AND status IN ('active', 'paused')
            "#,
        )
        .bind(to_millis(now))
        .bind(enrollment.id.to_string())
        .bind(enrollment.version)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if moved != 1 {
            tx.rollback().await?;
            return Ok(Requeue::Conflict);
        }

        tx.commit().await?;
        Ok(Requeue::Requeued)
    }

    pub async fn find_execution_by_job(&self, job_id: &str) -> EngineResult<Option<StepExecution>> {
        let row = sqlx::query("SELECT * FROM step_executions WHERE email_job_id = ? LIMIT 1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_execution).transpose()
    }

    /// Execution history of an enrollment, oldest first
    pub async fn list_executions(&self, enrollment_id: Uuid) -> EngineResult<Vec<StepExecution>> {
        let rows = sqlx::query(
            "SELECT * FROM step_executions WHERE enrollment_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(enrollment_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_execution).collect()
    }

    /// Per-step, per-status count of distinct enrollments for a sequence
    pub async fn execution_tallies(&self, sequence_id: &str) -> EngineResult<Vec<ExecutionTally>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            r#"
            SELECT x.step_id, x.status, COUNT(DISTINCT x.enrollment_id)
            FROM step_executions x
            JOIN enrollments e ON e.id = x.enrollment_id
            WHERE e.sequence_id = ?
            GROUP BY x.step_id, x.status
            "#,
        )
        .bind(sequence_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(step_id, status, count)| {
                Ok(ExecutionTally {
                    step_id,
                    status: ExecutionStatus::parse(&status)?,
                    enrollments: count as u64,
                })
            })
            .collect()
    }

    /// Distinct enrollments that reached each step of a sequence
    pub async fn step_entries(&self, sequence_id: &str) -> EngineResult<HashMap<String, u64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT x.step_id, COUNT(DISTINCT x.enrollment_id)
            FROM step_executions x
            JOIN enrollments e ON e.id = x.enrollment_id
            WHERE e.sequence_id = ?
            GROUP BY x.step_id
            "#,
        )
        .bind(sequence_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(step_id, count)| (step_id, count as u64)).collect())
    }
}

fn parse_uuid(raw: &str) -> EngineResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| EngineError::Storage(sqlx::Error::Decode(Box::new(e))))
}

fn parse_json(raw: Option<String>) -> EngineResult<Option<Value>> {
    raw.map(|text| serde_json::from_str(&text)).transpose().map_err(Into::into)
}

fn row_to_enrollment(row: &SqliteRow) -> EngineResult<Enrollment> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let exit_reason: Option<String> = row.try_get("exit_reason")?;
    let metadata: String = row.try_get("metadata")?;
    let millis = |column: &str| -> EngineResult<Option<DateTime<Utc>>> {
        Ok(row.try_get::<Option<i64>, _>(column)?.map(from_millis))
    };

    Ok(Enrollment {
        id: parse_uuid(&id)?,
        sequence_id: row.try_get("sequence_id")?,
        subscriber_id: row.try_get("subscriber_id")?,
        status: EnrollmentStatus::parse(&status)?,
        current_step_id: row.try_get("current_step_id")?,
        current_step_started_at: millis("current_step_started_at")?,
        next_scheduled_at: millis("next_scheduled_at")?,
        enrolled_at: from_millis(row.try_get("enrolled_at")?),
        completed_at: millis("completed_at")?,
        exited_at: millis("exited_at")?,
        exit_reason: exit_reason.as_deref().map(ExitReason::parse).transpose()?,
        metadata: serde_json::from_str::<Map<String, Value>>(&metadata)?,
        version: row.try_get("version")?,
        claim_token: row.try_get("claim_token")?,
    })
}

fn row_to_execution(row: &SqliteRow) -> EngineResult<StepExecution> {
    let id: String = row.try_get("id")?;
    let enrollment_id: String = row.try_get("enrollment_id")?;
    let status: String = row.try_get("status")?;
    let attempts: i64 = row.try_get("attempts")?;
    let millis = |column: &str| -> EngineResult<Option<DateTime<Utc>>> {
        Ok(row.try_get::<Option<i64>, _>(column)?.map(from_millis))
    };

    Ok(StepExecution {
        id: parse_uuid(&id)?,
        enrollment_id: parse_uuid(&enrollment_id)?,
        step_id: row.try_get("step_id")?,
        status: ExecutionStatus::parse(&status)?,
        attempts: attempts as u32,
        started_at: millis("started_at")?,
        completed_at: millis("completed_at")?,
        result: parse_json(row.try_get("result")?)?,
        error: row.try_get("error")?,
        email_job_id: row.try_get("email_job_id")?,
        created_at: from_millis(row.try_get("created_at")?),
    })
}
