//! Statistics projection
//!
//! Sequence stats are derived data: every run recomputes them from the
//! enrollment and execution tables and overwrites the `stats` column, so the
//! projection can be dropped and rebuilt at any time.

use crate::enrollment::{EnrollmentStatus, EnrollmentStorage, ExecutionStatus, ExecutionTally};
use crate::error::{EngineError, EngineResult};
use crate::sequence::types::{SequenceStats, Step, StepFunnel};
use crate::sequence::SequenceStorage;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Pure projection of raw counts into `SequenceStats`
pub fn project_stats(
    counts: &HashMap<EnrollmentStatus, u64>,
    entries: &HashMap<String, u64>,
    tallies: &[ExecutionTally],
    steps: &[Step],
    now: DateTime<Utc>,
) -> SequenceStats {
    let count = |status: EnrollmentStatus| counts.get(&status).copied().unwrap_or(0);
    let total_entered: u64 = counts.values().sum();
    let total_completed = count(EnrollmentStatus::Completed);

    let steps = steps
        .iter()
        .map(|step| {
            let tally = |status: ExecutionStatus| {
                tallies
                    .iter()
                    .filter(|t| t.step_id == step.id && t.status == status)
                    .map(|t| t.enrollments)
                    .sum::<u64>()
            };
            StepFunnel {
                step_id: step.id.clone(),
                order: step.order,
                entered: entries.get(&step.id).copied().unwrap_or(0),
                completed: tally(ExecutionStatus::Completed),
                failed: tally(ExecutionStatus::Failed),
                skipped: tally(ExecutionStatus::Skipped),
            }
        })
        .collect();

    SequenceStats {
        total_entered,
        total_completed,
        total_exited: count(EnrollmentStatus::Exited),
        current_active: count(EnrollmentStatus::Active),
        current_paused: count(EnrollmentStatus::Paused),
        conversion_rate: if total_entered == 0 {
            0.0
        } else {
            total_completed as f64 / total_entered as f64
        },
        steps,
        computed_at: Some(now),
    }
}

pub struct StatsAggregator {
    sequences: SequenceStorage,
    enrollments: EnrollmentStorage,
}

impl StatsAggregator {
    pub fn new(sequences: SequenceStorage, enrollments: EnrollmentStorage) -> Self {
        Self { sequences, enrollments }
    }

    /// Recompute and store the stats of one sequence
    pub async fn recompute(&self, sequence_id: &str, now: DateTime<Utc>) -> EngineResult<SequenceStats> {
        let steps = self.sequences.list_steps(sequence_id).await?;
        if self.sequences.get_sequence(sequence_id).await?.is_none() {
            return Err(EngineError::not_found(format!("sequence '{}'", sequence_id)));
        }

        let counts = self.enrollments.count_by_status(sequence_id).await?;
        let entries = self.enrollments.step_entries(sequence_id).await?;
        let tallies = self.enrollments.execution_tallies(sequence_id).await?;

        let stats = project_stats(&counts, &entries, &tallies, &steps, now);
        self.sequences.update_stats(sequence_id, &stats).await?;
        Ok(stats)
    }

    /// Recompute every sequence; one failing sequence does not stop the rest
    pub async fn recompute_all(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let sequences = self.sequences.list_sequences().await?;
        let mut refreshed = 0;
        for sequence in &sequences {
            match self.recompute(&sequence.id, now).await {
                Ok(_) => refreshed += 1,
                Err(e) => tracing::error!("❌ Stats projection failed for {}: {}", sequence.id, e),
            }
        }

        tracing::info!("📊 Recomputed stats for {}/{} sequences", refreshed, sequences.len());
        Ok(refreshed)
    }
}
