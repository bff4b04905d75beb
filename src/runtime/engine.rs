//! Enrollment state machine
//!
//! The engine is the only writer of `current_step_id` and
//! `next_scheduled_at`. It moves enrollments through their sequence in three
//! situations:
//! - a scheduler sweep hands over a claimed, due enrollment (`process_due`)
//! - the job runner reports on an email (`on_job_result`)
//! - an operator or trigger acts on it (`request_enrollment`, `force_exit`,
//!   `replay_failed_step`, sequence pause/resume)
//!
//! Every write is a version-guarded `save_state`, so a lost race is detected
//! rather than overwritten. The transition rules themselves are the pure
//! functions at the bottom of this file.

use crate::enrollment::{
    Enrollment, EnrollmentOutcome, EnrollmentStatus, EnrollmentStorage, ExecutionStatus, ExitReason,
    InsertOutcome, RejectReason, Requeue, StepExecution,
};
use crate::error::{EngineError, EngineResult};
use crate::integrations::{Integrations, JobResult, JobStatus, SubscriberDirectory};
use crate::runtime::executor::{ExecutionOutcome, StepExecutor};
use crate::sequence::types::{BranchTarget, SequenceDefinition, SequenceStatus, Step, StepConfig};
use crate::sequence::{SequenceRegistry, SequenceStorage};
use crate::store::Database;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Reload-and-reapply rounds before a version conflict is reported
const MAX_WRITE_ATTEMPTS: usize = 3;

/// What a sweep did with one claimed enrollment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueOutcome {
    /// Moved to (or waiting on) a later step
    Advanced,
    /// Email handed to the job runner
    Dispatched,
    Completed,
    Exited(ExitReason),
    /// Email held back until quiet hours end
    Deferred,
    /// Sequence paused or gone; lease dropped without changes
    Released,
    /// Another worker took the lease; nothing was written
    ClaimLost,
}

/// What a job-runner callback did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackOutcome {
    Advanced,
    Completed,
    Exited,
    /// Failure with attempts left; the next sweep submits the email again
    Retried,
    /// Unknown, duplicate or late result
    Ignored,
}

enum Resolution {
    Advance(Value),
    Exit(ExitReason),
}

pub struct EnrollmentEngine {
    sequences: SequenceStorage,
    enrollments: EnrollmentStorage,
    registry: Arc<SequenceRegistry>,
    executor: StepExecutor,
    directory: Arc<dyn SubscriberDirectory>,
}

impl EnrollmentEngine {
    pub fn new(
        database: &Database,
        registry: Arc<SequenceRegistry>,
        integrations: Integrations,
        default_retry_limit: u32,
    ) -> Self {
        let enrollments = EnrollmentStorage::new(database.pool().clone());
        Self {
            sequences: SequenceStorage::new(database.pool().clone()),
            executor: StepExecutor::new(enrollments.clone(), integrations.clone(), default_retry_limit),
            directory: integrations.directory,
            enrollments,
            registry,
        }
    }

    pub fn enrollments(&self) -> &EnrollmentStorage {
        &self.enrollments
    }

    pub fn sequences(&self) -> &SequenceStorage {
        &self.sequences
    }

    pub fn registry(&self) -> &Arc<SequenceRegistry> {
        &self.registry
    }

    /// Enroll `subscriber_id` into `sequence_id` if the sequence accepts them
    ///
    /// Refusals are answers, not errors. `context` is kept under
    /// `metadata.trigger` for conditions and templates.
    pub async fn request_enrollment(
        &self,
        sequence_id: &str,
        subscriber_id: &str,
        context: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> EngineResult<EnrollmentOutcome> {
        let outcome = self.try_enroll(sequence_id, subscriber_id, context, now).await?;

        match outcome.reason {
            Some(reason) => tracing::info!(
                "🚫 {} (subscriber {})",
                EngineError::TriggerRejected {
                    sequence_id: sequence_id.to_string(),
                    reason: reason.as_str().to_string(),
                },
                subscriber_id
            ),
            None => tracing::info!("📥 Enrolled {} into sequence {}", subscriber_id, sequence_id),
        }
        Ok(outcome)
    }

    async fn try_enroll(
        &self,
        sequence_id: &str,
        subscriber_id: &str,
        context: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> EngineResult<EnrollmentOutcome> {
        let Some(definition) = self.registry.get_or_load(sequence_id).await? else {
            return Ok(EnrollmentOutcome::rejected(RejectReason::SequenceNotFound));
        };
        if definition.sequence.status != SequenceStatus::Active {
            return Ok(EnrollmentOutcome::rejected(RejectReason::SequenceNotActive));
        }
        if self.directory.is_unsubscribed(subscriber_id).await? {
            return Ok(EnrollmentOutcome::rejected(RejectReason::Unsubscribed));
        }

        let mut metadata = Map::new();
        metadata.insert("trigger".to_string(), Value::Object(context));
        let enrollment = Enrollment::new(sequence_id, subscriber_id, metadata, now);

        let settings = &definition.sequence.settings;
        let inserted = self
            .enrollments
            .insert_if_allowed(&enrollment, settings.max_concurrent_enrollments, settings.allow_reentry)
            .await?;

        Ok(match inserted {
            InsertOutcome::Inserted => EnrollmentOutcome::enrolled(enrollment.id),
            InsertOutcome::Duplicate => EnrollmentOutcome::rejected(RejectReason::AlreadyEnrolled),
            InsertOutcome::CapacityReached => EnrollmentOutcome::rejected(RejectReason::CapacityReached),
            InsertOutcome::SequenceNotActive => EnrollmentOutcome::rejected(RejectReason::SequenceNotActive),
        })
    }

    /// Advance one claimed, due enrollment by at most one executed step
    pub async fn process_due(&self, mut enrollment: Enrollment, now: DateTime<Utc>) -> EngineResult<DueOutcome> {
        let Some(token) = enrollment.claim_token.clone() else {
            return Err(EngineError::InvalidTransition(format!(
                "enrollment {} is processed without a claim",
                enrollment.id
            )));
        };

        let definition = match self.registry.get_or_load(&enrollment.sequence_id).await? {
            Some(def) if matches!(def.sequence.status, SequenceStatus::Active | SequenceStatus::Completed) => def,
            _ => {
                self.enrollments.release_claim(enrollment.id, &token).await?;
                return Ok(DueOutcome::Released);
            }
        };

        if let Some(reason) = self.cancellation(&definition, &enrollment).await? {
            exit(&mut enrollment, reason, now);
            return self.save_claimed(&enrollment, DueOutcome::Exited(reason)).await;
        }

        let current = enrollment.current_step_id.clone();
        let (entered, skipped) = match current.as_deref().map(|id| definition.step(id)) {
            None => {
                let transition = enter_from(&definition, &mut enrollment, 1, now);
                (transition.entered, transition.skipped)
            }
            Some(Some(step)) if step.active => (Some(step), Vec::new()),
            Some(Some(inactive)) => {
                let mut transition = enter_from(&definition, &mut enrollment, inactive.order + 1, now);
                transition.skipped.insert(0, inactive);
                (transition.entered, transition.skipped)
            }
            Some(None) => {
                tracing::warn!(
                    "⚠️ Enrollment {} points at removed step {:?}, completing it",
                    enrollment.id,
                    current
                );
                complete(&mut enrollment, now);
                (None, Vec::new())
            }
        };

        let Some(step) = entered else {
            let saved = self.save_claimed(&enrollment, DueOutcome::Completed).await?;
            if saved != DueOutcome::ClaimLost {
                self.record_skips(&enrollment, &skipped, now).await?;
            }
            return Ok(saved);
        };
        if !skipped.is_empty() {
            if !self.save_leased(&mut enrollment).await? {
                return Ok(DueOutcome::ClaimLost);
            }
            self.record_skips(&enrollment, &skipped, now).await?;
        }

        if enrollment.next_scheduled_at.is_some_and(|due| due > now) {
            return self.save_claimed(&enrollment, DueOutcome::Advanced).await;
        }

        if let StepConfig::Email(_) = &step.config {
            let quiet = definition.sequence.settings.quiet_hours.filter(|quiet| quiet.contains(now));
            if let Some(quiet) = quiet {
                enrollment.next_scheduled_at = Some(quiet.window_end(now));
                tracing::debug!("🌙 Deferring email step {} for enrollment {}", step.id, enrollment.id);
                return self.save_claimed(&enrollment, DueOutcome::Deferred).await;
            }
            return self.dispatch_email(&definition, enrollment, step, &token, now).await;
        }

        let outcome = self.run_step(&definition, &enrollment, step, now).await?;
        self.finish(&definition, enrollment, step, outcome, &token, now).await
    }

    /// Apply a job-runner result; duplicate and late results change nothing
    pub async fn on_job_result(&self, result: &JobResult, now: DateTime<Utc>) -> EngineResult<CallbackOutcome> {
        let Some(mut execution) = self.enrollments.find_execution_by_job(&result.job_id).await? else {
            tracing::debug!("📭 Ignoring result for unknown job {}", result.job_id);
            return Ok(CallbackOutcome::Ignored);
        };
        if execution.status != ExecutionStatus::Executing
            || execution.email_job_id.as_deref() != Some(result.job_id.as_str())
        {
            tracing::debug!("📭 Ignoring late or duplicate result for job {}", result.job_id);
            return Ok(CallbackOutcome::Ignored);
        }

        let Some(enrollment) = self.enrollments.get(execution.enrollment_id).await? else {
            return Ok(CallbackOutcome::Ignored);
        };
        let definition = self.registry.get_or_load(&enrollment.sequence_id).await?;
        let step = definition.as_deref().and_then(|def| def.step(&execution.step_id));
        let live = !enrollment.status.is_terminal();

        match result.status {
            JobStatus::Completed => {
                let payload = json!({
                    "job_id": result.job_id,
                    "provider_message_id": result.provider_message_id,
                });
                execution.status = ExecutionStatus::Completed;
                execution.completed_at = Some(now);
                execution.result = Some(payload.clone());
                execution.error = None;
                if !self.enrollments.settle_job_execution(&execution, &result.job_id).await? {
                    return Ok(CallbackOutcome::Ignored);
                }

                match (definition.as_deref(), step) {
                    (Some(def), Some(step)) if live => {
                        self.resolve(def, enrollment.id, step, Resolution::Advance(payload), now).await
                    }
                    _ => Ok(CallbackOutcome::Ignored),
                }
            }
            JobStatus::Failed => {
                let error = result.error.clone().unwrap_or_else(|| "email job failed".to_string());
                let (def, step) = match (definition.as_deref(), step) {
                    (Some(def), Some(step)) if live => (def, step),
                    _ => {
                        execution.status = ExecutionStatus::Failed;
                        execution.completed_at = Some(now);
                        execution.error = Some(error);
                        self.enrollments.settle_job_execution(&execution, &result.job_id).await?;
                        return Ok(CallbackOutcome::Ignored);
                    }
                };

                if execution.attempts < self.executor.max_attempts(def, step) {
                    execution.error = Some(error);
                    return self.requeue(&execution, &result.job_id, enrollment, step, now).await;
                }

                execution.status = ExecutionStatus::Failed;
                execution.completed_at = Some(now);
                execution.error = Some(error.clone());
                if !self.enrollments.settle_job_execution(&execution, &result.job_id).await? {
                    return Ok(CallbackOutcome::Ignored);
                }
                tracing::error!(
                    "❌ {}",
                    EngineError::StepExecutionFailed {
                        step_id: step.id.clone(),
                        error,
                    }
                );
                self.resolve(def, enrollment.id, step, Resolution::Exit(ExitReason::StepFailed), now)
                    .await
            }
        }
    }

    /// Operator force-exit with reason `manual`
    pub async fn force_exit(&self, enrollment_id: Uuid, now: DateTime<Utc>) -> EngineResult<Enrollment> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let mut enrollment = self
                .enrollments
                .get(enrollment_id)
                .await?
                .ok_or_else(|| EngineError::not_found(format!("enrollment '{}'", enrollment_id)))?;
            if enrollment.status.is_terminal() {
                return Err(EngineError::InvalidTransition(format!(
                    "enrollment {} is already {}",
                    enrollment_id,
                    enrollment.status.as_str()
                )));
            }

            enrollment.claim_token = None;
            exit(&mut enrollment, ExitReason::Manual, now);
            if self.enrollments.save_state(&enrollment).await? {
                enrollment.version += 1;
                tracing::info!("🛑 Enrollment {} exited by operator", enrollment_id);
                return Ok(enrollment);
            }
        }
        Err(EngineError::Conflict(format!("enrollment {} kept changing", enrollment_id)))
    }

    /// Start a fresh enrollment at the step that failed `enrollment_id`
    ///
    /// The failed enrollment stays terminal; the new one records it under
    /// `metadata.replay_of`. Capacity limits do not apply to replays.
    pub async fn replay_failed_step(&self, enrollment_id: Uuid, now: DateTime<Utc>) -> EngineResult<EnrollmentOutcome> {
        let original = self
            .enrollments
            .get(enrollment_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("enrollment '{}'", enrollment_id)))?;

        let failed = self
            .enrollments
            .list_executions(enrollment_id)
            .await?
            .into_iter()
            .rev()
            .find(|execution| execution.status == ExecutionStatus::Failed)
            .ok_or_else(|| {
                EngineError::InvalidTransition(format!("enrollment {} has no failed step", enrollment_id))
            })?;

        let definition = self
            .registry
            .get_or_load(&original.sequence_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("sequence '{}'", original.sequence_id)))?;
        if definition.sequence.status != SequenceStatus::Active {
            return Ok(EnrollmentOutcome::rejected(RejectReason::SequenceNotActive));
        }
        let step = definition
            .step(&failed.step_id)
            .ok_or_else(|| EngineError::not_found(format!("step '{}'", failed.step_id)))?;

        let mut metadata = original.metadata.clone();
        metadata.insert("replay_of".to_string(), Value::String(original.id.to_string()));
        let mut replay = Enrollment::new(&original.sequence_id, &original.subscriber_id, metadata, now);
        schedule(&mut replay, step, now);
        replay.next_scheduled_at = Some(now);

        let outcome = match self.enrollments.insert_if_allowed(&replay, None, true).await? {
            InsertOutcome::Inserted => EnrollmentOutcome::enrolled(replay.id),
            InsertOutcome::SequenceNotActive => EnrollmentOutcome::rejected(RejectReason::SequenceNotActive),
            _ => EnrollmentOutcome::rejected(RejectReason::AlreadyEnrolled),
        };
        if outcome.enrolled {
            tracing::info!("♻️ Replaying step {} of enrollment {} as {}", step.id, original.id, replay.id);
        }
        Ok(outcome)
    }

    /// draft -> active, after structural validation
    pub async fn activate_sequence(&self, sequence_id: &str, now: DateTime<Utc>) -> EngineResult<()> {
        let definition = self
            .sequences
            .load_definition(sequence_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("sequence '{}'", sequence_id)))?;
        definition.validate()?;

        self.sequences
            .transition(sequence_id, &[SequenceStatus::Draft], SequenceStatus::Active, now)
            .await?;
        self.registry.reload_sequence(sequence_id).await
    }

    /// active -> paused; active enrollments keep their timers
    pub async fn pause_sequence(&self, sequence_id: &str, now: DateTime<Utc>) -> EngineResult<u64> {
        self.sequences
            .transition(sequence_id, &[SequenceStatus::Active], SequenceStatus::Paused, now)
            .await?;
        let paused = self.enrollments.pause_sequence(sequence_id).await?;
        self.registry.reload_sequence(sequence_id).await?;

        tracing::info!("⏸️ Paused sequence {} ({} enrollments)", sequence_id, paused);
        Ok(paused)
    }

    /// paused -> active; overdue timers fire at `now`
    pub async fn resume_sequence(&self, sequence_id: &str, now: DateTime<Utc>) -> EngineResult<u64> {
        self.sequences
            .transition(sequence_id, &[SequenceStatus::Paused], SequenceStatus::Active, now)
            .await?;
        let resumed = self.enrollments.resume_sequence(sequence_id, now).await?;
        self.registry.reload_sequence(sequence_id).await?;

        tracing::info!("▶️ Resumed sequence {} ({} enrollments)", sequence_id, resumed);
        Ok(resumed)
    }

    /// Stop accepting triggers; existing enrollments drain
    pub async fn complete_sequence(&self, sequence_id: &str, now: DateTime<Utc>) -> EngineResult<()> {
        self.sequences
            .transition(
                sequence_id,
                &[SequenceStatus::Active, SequenceStatus::Paused],
                SequenceStatus::Completed,
                now,
            )
            .await?;
        self.enrollments.resume_sequence(sequence_id, now).await?;
        self.registry.reload_sequence(sequence_id).await
    }

    /// Replace the steps of a draft or paused sequence
    pub async fn update_steps(&self, sequence_id: &str, steps: Vec<Step>) -> EngineResult<()> {
        self.sequences.replace_steps(sequence_id, steps).await?;
        self.registry.reload_sequence(sequence_id).await
    }

    pub async fn delete_sequence(&self, sequence_id: &str) -> EngineResult<bool> {
        let deleted = self.sequences.delete_sequence(sequence_id).await?;
        self.registry.reload_sequence(sequence_id).await?;
        Ok(deleted)
    }

    /// Point the row at the email step, then submit the job
    ///
    /// The lease is kept until the enrollment is parked waiting for its
    /// result. A worker that dies in between leaves the row due and leased,
    /// so it is reclaimed after the lease and the open execution resumed.
    async fn dispatch_email(
        &self,
        definition: &SequenceDefinition,
        mut enrollment: Enrollment,
        step: &Step,
        token: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<DueOutcome> {
        if !self.save_leased(&mut enrollment).await? {
            return Ok(DueOutcome::ClaimLost);
        }

        let outcome = match self.run_step(definition, &enrollment, step, now).await {
            Ok(outcome) => outcome,
            Err(EngineError::SchedulerClaimLost(id)) => {
                tracing::warn!("⚠️ {}", EngineError::SchedulerClaimLost(id));
                return Ok(DueOutcome::ClaimLost);
            }
            Err(e) => return Err(e),
        };
        self.finish(definition, enrollment, step, outcome, token, now).await
    }

    /// Execute `step`, continuing its unfinished execution when there is one
    async fn run_step(
        &self,
        definition: &SequenceDefinition,
        enrollment: &Enrollment,
        step: &Step,
        now: DateTime<Utc>,
    ) -> EngineResult<ExecutionOutcome> {
        let run = match self.enrollments.open_execution(enrollment.id, &step.id).await? {
            Some(open) => self.executor.resume(definition, enrollment, step, open, now).await?,
            None => self.executor.execute(definition, enrollment, step, now).await?,
        };
        Ok(run.1)
    }

    /// Apply an execution outcome to the claimed enrollment and drop the lease
    async fn finish(
        &self,
        definition: &SequenceDefinition,
        mut enrollment: Enrollment,
        step: &Step,
        outcome: ExecutionOutcome,
        token: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<DueOutcome> {
        match outcome {
            ExecutionOutcome::Completed { result, metadata_patch } => {
                if let Some(patch) = metadata_patch {
                    enrollment.metadata.extend(patch);
                }
                let transition = advance(definition, &mut enrollment, step, &result, now);
                let due = match (enrollment.status, enrollment.exit_reason) {
                    (EnrollmentStatus::Completed, _) => DueOutcome::Completed,
                    (EnrollmentStatus::Exited, Some(reason)) => DueOutcome::Exited(reason),
                    _ => DueOutcome::Advanced,
                };
                let saved = self.save_claimed(&enrollment, due).await?;
                if saved != DueOutcome::ClaimLost {
                    self.record_skips(&enrollment, &transition.skipped, now).await?;
                }
                Ok(saved)
            }
            ExecutionOutcome::Dispatched { job_id } => {
                enrollment.next_scheduled_at = None;
                if !self.enrollments.save_state(&enrollment).await? {
                    // the result beat us here and already moved the enrollment on
                    tracing::debug!("📬 Job {} settled before its enrollment was parked", job_id);
                    self.enrollments.release_claim(enrollment.id, token).await?;
                }
                Ok(DueOutcome::Dispatched)
            }
            ExecutionOutcome::Failed { .. } => {
                exit(&mut enrollment, ExitReason::StepFailed, now);
                self.save_claimed(&enrollment, DueOutcome::Exited(ExitReason::StepFailed)).await
            }
        }
    }

    async fn cancellation(
        &self,
        definition: &SequenceDefinition,
        enrollment: &Enrollment,
    ) -> EngineResult<Option<ExitReason>> {
        if self.directory.is_unsubscribed(&enrollment.subscriber_id).await? {
            return Ok(Some(ExitReason::Unsubscribed));
        }
        if let Some(segment) = &definition.sequence.settings.required_segment {
            let segments = self.directory.get_subscriber_segments(&enrollment.subscriber_id).await?;
            if !segments.contains(segment) {
                return Ok(Some(ExitReason::SegmentLeft));
            }
        }
        Ok(None)
    }

    /// Write progress made under a claim without giving the claim up
    async fn save_leased(&self, enrollment: &mut Enrollment) -> EngineResult<bool> {
        if self.enrollments.save_leased(enrollment).await? {
            enrollment.version += 1;
            Ok(true)
        } else {
            tracing::warn!("⚠️ {}", EngineError::SchedulerClaimLost(enrollment.id));
            Ok(false)
        }
    }

    async fn save_claimed(&self, enrollment: &Enrollment, outcome: DueOutcome) -> EngineResult<DueOutcome> {
        if self.enrollments.save_state(enrollment).await? {
            Ok(outcome)
        } else {
            tracing::warn!("⚠️ {}", EngineError::SchedulerClaimLost(enrollment.id));
            Ok(DueOutcome::ClaimLost)
        }
    }

    async fn record_skips(&self, enrollment: &Enrollment, skipped: &[&Step], now: DateTime<Utc>) -> EngineResult<()> {
        for step in skipped {
            self.executor.record_skipped(enrollment, step, now).await?;
        }
        Ok(())
    }

    /// Put a failed email back on the timer; the next sweep resumes its execution
    async fn requeue(
        &self,
        execution: &StepExecution,
        job_id: &str,
        mut enrollment: Enrollment,
        step: &Step,
        now: DateTime<Utc>,
    ) -> EngineResult<CallbackOutcome> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            if enrollment.status.is_terminal() || enrollment.current_step_id.as_deref() != Some(step.id.as_str()) {
                return Ok(CallbackOutcome::Ignored);
            }
            match self
                .enrollments
                .requeue_job_execution(execution, job_id, &enrollment, now)
                .await?
            {
                Requeue::Requeued => {
                    tracing::info!(
                        "🔁 Email step {} of enrollment {} failed, retrying on the next sweep",
                        step.id,
                        enrollment.id
                    );
                    return Ok(CallbackOutcome::Retried);
                }
                Requeue::AlreadySettled => return Ok(CallbackOutcome::Ignored),
                Requeue::Conflict => {
                    let Some(fresh) = self.enrollments.get(enrollment.id).await? else {
                        return Ok(CallbackOutcome::Ignored);
                    };
                    enrollment = fresh;
                }
            }
        }
        Err(EngineError::Conflict(format!("enrollment {} kept changing", enrollment.id)))
    }

    /// Re-read the enrollment and apply `resolution` to it, retrying on version conflicts
    async fn resolve(
        &self,
        definition: &SequenceDefinition,
        enrollment_id: Uuid,
        step: &Step,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> EngineResult<CallbackOutcome> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let Some(mut enrollment) = self.enrollments.get(enrollment_id).await? else {
                return Ok(CallbackOutcome::Ignored);
            };
            if enrollment.status.is_terminal() || enrollment.current_step_id.as_deref() != Some(step.id.as_str()) {
                return Ok(CallbackOutcome::Ignored);
            }

            enrollment.claim_token = None;
            let transition = match &resolution {
                Resolution::Advance(result) => advance(definition, &mut enrollment, step, result, now),
                Resolution::Exit(reason) => {
                    exit(&mut enrollment, *reason, now);
                    Transition::default()
                }
            };

            if self.enrollments.save_state(&enrollment).await? {
                self.record_skips(&enrollment, &transition.skipped, now).await?;
                return Ok(match enrollment.status {
                    EnrollmentStatus::Completed => CallbackOutcome::Completed,
                    EnrollmentStatus::Exited => CallbackOutcome::Exited,
                    _ => CallbackOutcome::Advanced,
                });
            }
            tracing::debug!("🔄 Enrollment {} changed underneath, retrying", enrollment_id);
        }
        Err(EngineError::Conflict(format!("enrollment {} kept changing", enrollment_id)))
    }
}

/// Steps passed over and the step entered by one transition
#[derive(Debug, Default)]
pub struct Transition<'d> {
    pub skipped: Vec<&'d Step>,
    pub entered: Option<&'d Step>,
}

/// Point `enrollment` at `step`; wait steps fire after their duration, others now
pub fn schedule(enrollment: &mut Enrollment, step: &Step, now: DateTime<Utc>) {
    enrollment.current_step_id = Some(step.id.clone());
    enrollment.current_step_started_at = Some(now);
    enrollment.next_scheduled_at = Some(match &step.config {
        StepConfig::Wait(wait) => now + wait.duration(),
        _ => now,
    });
}

pub fn complete(enrollment: &mut Enrollment, now: DateTime<Utc>) {
    enrollment.status = EnrollmentStatus::Completed;
    enrollment.completed_at = Some(now);
    enrollment.next_scheduled_at = None;
}

pub fn exit(enrollment: &mut Enrollment, reason: ExitReason, now: DateTime<Utc>) {
    enrollment.status = EnrollmentStatus::Exited;
    enrollment.exited_at = Some(now);
    enrollment.exit_reason = Some(reason);
    enrollment.next_scheduled_at = None;
}

/// Enter the first active step at or after `order`, completing when none is left
pub fn enter_from<'d>(
    definition: &'d SequenceDefinition,
    enrollment: &mut Enrollment,
    order: u32,
    now: DateTime<Utc>,
) -> Transition<'d> {
    let mut transition = Transition::default();
    for step in definition.steps_from(order) {
        if step.active {
            schedule(enrollment, step, now);
            transition.entered = Some(step);
            return transition;
        }
        transition.skipped.push(step);
    }
    complete(enrollment, now);
    transition
}

/// Move past a completed `step`; condition results pick their branch target
pub fn advance<'d>(
    definition: &'d SequenceDefinition,
    enrollment: &mut Enrollment,
    step: &Step,
    result: &Value,
    now: DateTime<Utc>,
) -> Transition<'d> {
    let target = match &step.config {
        StepConfig::Condition(condition) => {
            if result.get("branch").and_then(Value::as_str) == Some("true") {
                condition.on_true
            } else {
                condition.on_false
            }
        }
        _ => BranchTarget::Next,
    };

    match target {
        BranchTarget::Next => enter_from(definition, enrollment, step.order + 1, now),
        BranchTarget::Goto { order } => enter_from(definition, enrollment, order, now),
        BranchTarget::Exit => {
            exit(enrollment, ExitReason::ConditionExit, now);
            Transition::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::types::{
        ConditionConfig, EmailConfig, Predicate, Sequence, SequenceSettings, SequenceStats, TriggerConfig,
        WaitConfig, WaitUnit,
    };
    use chrono::Duration;

    fn step(id: &str, order: u32, config: StepConfig) -> Step {
        Step {
            id: id.into(),
            sequence_id: "seq".into(),
            order,
            name: id.into(),
            config,
            active: true,
            retry_limit: None,
        }
    }

    fn email(id: &str, order: u32) -> Step {
        step(
            id,
            order,
            StepConfig::Email(EmailConfig {
                subject: "Hi".into(),
                template_id: "tpl".into(),
                from_name: None,
            }),
        )
    }

    fn definition(steps: Vec<Step>) -> SequenceDefinition {
        let now = Utc::now();
        SequenceDefinition::new(
            Sequence {
                id: "seq".into(),
                owner: "acme".into(),
                name: "Seq".into(),
                status: SequenceStatus::Active,
                trigger: TriggerConfig::Manual,
                settings: SequenceSettings::default(),
                stats: SequenceStats::default(),
                created_at: now,
                updated_at: now,
            },
            steps,
        )
    }

    #[test]
    fn wait_steps_schedule_after_their_duration() {
        let now = Utc::now();
        let def = definition(vec![
            email("first", 1),
            step("pause", 2, StepConfig::Wait(WaitConfig { amount: 24, unit: WaitUnit::Hours })),
        ]);
        let mut enrollment = Enrollment::new("seq", "sub", Map::new(), now);

        let transition = advance(&def, &mut enrollment, &def.steps[0], &json!({}), now);

        assert_eq!(transition.entered.map(|s| s.id.as_str()), Some("pause"));
        assert_eq!(enrollment.next_scheduled_at, Some(now + Duration::hours(24)));
        assert_eq!(enrollment.current_step_started_at, Some(now));
    }

    #[test]
    fn inactive_steps_are_passed_over_and_reported() {
        let now = Utc::now();
        let mut second = email("second", 2);
        second.active = false;
        let def = definition(vec![email("first", 1), second, email("third", 3)]);
        let mut enrollment = Enrollment::new("seq", "sub", Map::new(), now);

        let transition = advance(&def, &mut enrollment, &def.steps[0], &json!({}), now);

        assert_eq!(transition.skipped.len(), 1);
        assert_eq!(transition.skipped[0].id, "second");
        assert_eq!(enrollment.current_step_id.as_deref(), Some("third"));
    }

    #[test]
    fn condition_branches_follow_their_targets() {
        let now = Utc::now();
        let condition = step(
            "check",
            1,
            StepConfig::Condition(ConditionConfig {
                predicate: Predicate::InSegment { segment_id: "vip".into() },
                on_true: BranchTarget::Goto { order: 3 },
                on_false: BranchTarget::Exit,
            }),
        );
        let def = definition(vec![condition, email("second", 2), email("third", 3)]);

        let mut taken = Enrollment::new("seq", "sub", Map::new(), now);
        advance(&def, &mut taken, &def.steps[0], &json!({ "branch": "true" }), now);
        assert_eq!(taken.current_step_id.as_deref(), Some("third"));

        let mut left = Enrollment::new("seq", "sub", Map::new(), now);
        advance(&def, &mut left, &def.steps[0], &json!({ "branch": "false" }), now);
        assert_eq!(left.status, EnrollmentStatus::Exited);
        assert_eq!(left.exit_reason, Some(ExitReason::ConditionExit));
        assert!(left.next_scheduled_at.is_none());
    }

    #[test]
    fn running_off_the_end_completes() {
        let now = Utc::now();
        let def = definition(vec![email("only", 1)]);
        let mut enrollment = Enrollment::new("seq", "sub", Map::new(), now);

        let transition = advance(&def, &mut enrollment, &def.steps[0], &json!({}), now);

        assert!(transition.entered.is_none());
        assert_eq!(enrollment.status, EnrollmentStatus::Completed);
        assert_eq!(enrollment.completed_at, Some(now));
        assert!(enrollment.next_scheduled_at.is_none());
    }

    #[test]
    fn sequences_without_active_steps_complete_on_start() {
        let now = Utc::now();
        let mut only = email("only", 1);
        only.active = false;
        let def = definition(vec![only]);
        let mut enrollment = Enrollment::new("seq", "sub", Map::new(), now);

        let transition = enter_from(&def, &mut enrollment, 1, now);

        assert_eq!(transition.skipped.len(), 1);
        assert_eq!(enrollment.status, EnrollmentStatus::Completed);
    }
}
