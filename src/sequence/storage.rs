//! SQLite persistence for sequence definitions
//!
//! Sequences keep their trigger, settings and stats as JSON columns; steps
//! live in `sequence_steps` with a typed JSON config. Status changes go
//! through `transition`, which only moves a row out of an allowed state.

use crate::error::{EngineError, EngineResult};
use crate::sequence::types::{
    Sequence, SequenceDefinition, SequenceStats, SequenceStatus, Step, StepConfig,
};
use crate::store::{from_millis, to_millis};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePool, sqlite::SqliteRow, Row};

/// Sequence and step storage manager
#[derive(Debug, Clone)]
pub struct SequenceStorage {
    pool: SqlitePool,
}

impl SequenceStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new sequence. Fails with `Conflict` if the id is taken.
    pub async fn create_sequence(&self, sequence: &Sequence) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO sequences
                (id, owner, name, status, trigger_type, trigger_config, settings, stats, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&sequence.id)
        .bind(&sequence.owner)
        .bind(&sequence.name)
        .bind(sequence.status.as_str())
        .bind(sequence.trigger.kind())
        .bind(serde_json::to_string(&sequence.trigger)?)
        .bind(serde_json::to_string(&sequence.settings)?)
        .bind(serde_json::to_string(&sequence.stats)?)
        .bind(to_millis(sequence.created_at))
        .bind(to_millis(sequence.updated_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::Conflict(format!("sequence '{}' already exists", sequence.id)));
        }
        Ok(())
    }

    pub async fn get_sequence(&self, id: &str) -> EngineResult<Option<Sequence>> {
        let row = sqlx::query("SELECT * FROM sequences WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_sequence).transpose()
    }

    /// All sequences, most recently updated first
    pub async fn list_sequences(&self) -> EngineResult<Vec<Sequence>> {
        let rows = sqlx::query("SELECT * FROM sequences ORDER BY updated_at DESC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_sequence).collect()
    }

    /// Steps of a sequence, sorted by order
    pub async fn list_steps(&self, sequence_id: &str) -> EngineResult<Vec<Step>> {
        let rows = sqlx::query(
            "SELECT * FROM sequence_steps WHERE sequence_id = ? ORDER BY step_order ASC",
        )
        .bind(sequence_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_step).collect()
    }

    pub async fn load_definition(&self, id: &str) -> EngineResult<Option<SequenceDefinition>> {
        let Some(sequence) = self.get_sequence(id).await? else {
            return Ok(None);
        };
        let steps = self.list_steps(id).await?;
        Ok(Some(SequenceDefinition::new(sequence, steps)))
    }

    /// Every definition that has left `draft`, used to warm the registry
    pub async fn load_runtime_definitions(&self) -> EngineResult<Vec<SequenceDefinition>> {
        let rows = sqlx::query("SELECT * FROM sequences WHERE status != 'draft'")
            .fetch_all(&self.pool)
            .await?;

        let mut definitions = Vec::with_capacity(rows.len());
        for row in &rows {
            let sequence = row_to_sequence(row)?;
            let steps = self.list_steps(&sequence.id).await?;
            definitions.push(SequenceDefinition::new(sequence, steps));
        }
        Ok(definitions)
    }

    /// Replace all steps of a sequence
    ///
    /// Steps are immutable while the sequence is active; a paused sequence
    /// may be edited but the new step list must validate immediately since
    /// existing enrollments will resume on it.
    pub async fn replace_steps(&self, sequence_id: &str, steps: Vec<Step>) -> EngineResult<()> {
        let sequence = self
            .get_sequence(sequence_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("sequence '{}'", sequence_id)))?;

        match sequence.status {
            SequenceStatus::Active | SequenceStatus::Completed => {
                return Err(EngineError::InvalidTransition(format!(
                    "steps of a {} sequence cannot be edited; pause it first",
                    sequence.status.as_str()
                )));
            }
            SequenceStatus::Paused => {
                SequenceDefinition::new(sequence.clone(), steps.clone()).validate()?;
            }
            SequenceStatus::Draft => {}
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM sequence_steps WHERE sequence_id = ?")
            .bind(sequence_id)
            .execute(&mut *tx)
            .await?;

        for step in &steps {
            sqlx::query(
                r#"
                INSERT INTO sequence_steps
                    (id, sequence_id, step_order, name, step_type, config, active, retry_limit)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&step.id)
            .bind(sequence_id)
            .bind(step.order as i64)
            .bind(&step.name)
            .bind(step.kind())
            .bind(serde_json::to_string(&step.config)?)
            .bind(step.active)
            .bind(step.retry_limit.map(i64::from))
            .execute(&mut *tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.is_unique_violation() => EngineError::invalid(
                    format!("duplicate step id or order in sequence '{}'", sequence_id),
                ),
                other => EngineError::Storage(other),
            })?;
        }

        sqlx::query("UPDATE sequences SET updated_at = ? WHERE id = ?")
            .bind(to_millis(Utc::now()))
            .bind(sequence_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!("📝 Replaced {} steps of sequence {}", steps.len(), sequence_id);
        Ok(())
    }

    /// Move a sequence to `to` if it currently sits in one of `from`
    pub async fn transition(
        &self,
        id: &str,
        from: &[SequenceStatus],
        to: SequenceStatus,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let current = self
            .get_sequence(id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("sequence '{}'", id)))?;

        if !from.contains(&current.status) {
            return Err(EngineError::InvalidTransition(format!(
                "sequence '{}' cannot move from {} to {}",
                id,
                current.status.as_str(),
                to.as_str()
            )));
        }

        let result = sqlx::query("UPDATE sequences SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(to_millis(now))
            .bind(id)
            .bind(current.status.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::Conflict(format!("sequence '{}' changed concurrently", id)));
        }

        tracing::info!("🔁 Sequence {}: {} -> {}", id, current.status.as_str(), to.as_str());
        Ok(())
    }

    /// Overwrite the denormalized stats blob
    pub async fn update_stats(&self, id: &str, stats: &SequenceStats) -> EngineResult<()> {
        sqlx::query("UPDATE sequences SET stats = ? WHERE id = ?")
            .bind(serde_json::to_string(stats)?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a sequence; steps, enrollments and executions cascade
    pub async fn delete_sequence(&self, id: &str) -> EngineResult<bool> {
        let result = sqlx::query("DELETE FROM sequences WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn row_to_sequence(row: &SqliteRow) -> EngineResult<Sequence> {
    let status: String = row.try_get("status")?;
    let trigger: String = row.try_get("trigger_config")?;
    let settings: String = row.try_get("settings")?;
    let stats: String = row.try_get("stats")?;

    Ok(Sequence {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        name: row.try_get("name")?,
        status: SequenceStatus::parse(&status)?,
        trigger: serde_json::from_str(&trigger)?,
        settings: serde_json::from_str(&settings)?,
        stats: serde_json::from_str(&stats).unwrap_or_default(),
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

fn row_to_step(row: &SqliteRow) -> EngineResult<Step> {
    let config: String = row.try_get("config")?;
    let order: i64 = row.try_get("step_order")?;
    let retry_limit: Option<i64> = row.try_get("retry_limit")?;

    Ok(Step {
        id: row.try_get("id")?,
        sequence_id: row.try_get("sequence_id")?,
        order: order as u32,
        name: row.try_get("name")?,
        config: serde_json::from_str::<StepConfig>(&config)?,
        active: row.try_get("active")?,
        retry_limit: retry_limit.map(|r| r as u32),
    })
}
