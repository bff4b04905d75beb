//! Step executor
//!
//! Runs (or, for email, dispatches) a single step of an enrollment and keeps
//! the matching `StepExecution` row current. Integration failures are retried
//! in place up to the step's retry budget; any other error propagates and
//! leaves the enrollment claimable again once its lease expires.
//!
//! Every email attempt gets its own job id, written to the execution row
//! before the job runner sees it. A result can therefore be matched even when
//! it arrives before `submit_email_job` returns, and a result for a
//! superseded attempt matches nothing.

use crate::enrollment::{Enrollment, EnrollmentStorage, ExecutionStatus, StepExecution};
use crate::error::{EngineError, EngineResult};
use crate::integrations::{EmailJob, Integrations};
use crate::runtime::predicate;
use crate::sequence::types::{ActionConfig, EmailConfig, SequenceDefinition, Step, StepConfig};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashSet;

/// What happened to a step after its attempts
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Finished synchronously; `metadata_patch` is merged into the enrollment
    Completed {
        result: Value,
        metadata_patch: Option<Map<String, Value>>,
    },
    /// Email handed to the job runner, completion arrives via callback
    Dispatched { job_id: String },
    /// Retry budget exhausted
    Failed { error: String },
}

/// Result of one attempt
enum Attempt {
    Finished {
        result: Value,
        metadata_patch: Option<Map<String, Value>>,
    },
    Submitted(String),
}

/// Executes individual steps against the external ports
pub struct StepExecutor {
    storage: EnrollmentStorage,
    integrations: Integrations,
    default_retry_limit: u32,
}

impl StepExecutor {
    pub fn new(storage: EnrollmentStorage, integrations: Integrations, default_retry_limit: u32) -> Self {
        Self {
            storage,
            integrations,
            default_retry_limit,
        }
    }

    /// Attempts allowed for `step`: the first one plus its retries
    pub fn max_attempts(&self, definition: &SequenceDefinition, step: &Step) -> u32 {
        definition
            .retry_limit(step, self.default_retry_limit)
            .saturating_add(1)
    }

    /// Execute `step` for `enrollment`, recording a fresh execution row
    pub async fn execute(
        &self,
        definition: &SequenceDefinition,
        enrollment: &Enrollment,
        step: &Step,
        now: DateTime<Utc>,
    ) -> EngineResult<(StepExecution, ExecutionOutcome)> {
        tracing::debug!(
            "⚡ Executing {} step {} for enrollment {}",
            step.kind(),
            step.id,
            enrollment.id
        );

        let mut execution = StepExecution::pending(enrollment.id, &step.id, now);
        self.storage.insert_execution(&execution).await?;
        execution.started_at = Some(now);

        let outcome = self.run_attempts(definition, enrollment, step, &mut execution, now).await?;
        Ok((execution, outcome))
    }

    /// Continue an unfinished execution of `step`
    ///
    /// A `pending` row is waiting for a retry after a failed job result. An
    /// `executing` row belongs to a claim that never finished; that attempt
    /// never reported back, does not count against the retry budget and is
    /// submitted again under the same job id.
    pub async fn resume(
        &self,
        definition: &SequenceDefinition,
        enrollment: &Enrollment,
        step: &Step,
        mut execution: StepExecution,
        now: DateTime<Utc>,
    ) -> EngineResult<(StepExecution, ExecutionOutcome)> {
        if execution.status == ExecutionStatus::Executing {
            execution.attempts = execution.attempts.saturating_sub(1);
        }
        tracing::info!(
            "🔁 Resuming {} step {} for enrollment {} (attempt {})",
            step.kind(),
            step.id,
            enrollment.id,
            execution.attempts + 1
        );
        let outcome = self.run_attempts(definition, enrollment, step, &mut execution, now).await?;
        Ok((execution, outcome))
    }

    /// Pass-through record for an inactive step
    pub async fn record_skipped(&self, enrollment: &Enrollment, step: &Step, now: DateTime<Utc>) -> EngineResult<()> {
        tracing::debug!("⏭️ Skipping inactive step {} for enrollment {}", step.id, enrollment.id);
        self.storage
            .insert_execution(&StepExecution::skipped(enrollment.id, &step.id, now))
            .await
    }

    async fn run_attempts(
        &self,
        definition: &SequenceDefinition,
        enrollment: &Enrollment,
        step: &Step,
        execution: &mut StepExecution,
        now: DateTime<Utc>,
    ) -> EngineResult<ExecutionOutcome> {
        let max_attempts = self.max_attempts(definition, step);
        let mut last_error = None;

        while execution.attempts < max_attempts {
            execution.attempts += 1;
            execution.status = ExecutionStatus::Executing;
            if let StepConfig::Email(_) = &step.config {
                let previous = execution.email_job_id.replace(job_id(execution));
                self.write(enrollment, execution, previous.as_deref()).await?;
            }

            match self.attempt(enrollment, step, execution).await {
                Ok(Attempt::Finished { result, metadata_patch }) => {
                    execution.status = ExecutionStatus::Completed;
                    execution.completed_at = Some(now);
                    execution.result = Some(result.clone());
                    execution.error = None;
                    let current = execution.email_job_id.clone();
                    self.write(enrollment, execution, current.as_deref()).await?;
                    return Ok(ExecutionOutcome::Completed { result, metadata_patch });
                }
                Ok(Attempt::Submitted(job_id)) => {
                    tracing::info!("📨 Email step {} dispatched as job {}", step.id, job_id);
                    return Ok(ExecutionOutcome::Dispatched { job_id });
                }
                Err(EngineError::Integration(error)) => {
                    tracing::warn!(
                        "⚠️ Step {} attempt {}/{} failed: {}",
                        step.id,
                        execution.attempts,
                        max_attempts,
                        error
                    );
                    last_error = Some(error);
                }
                Err(e) => return Err(e),
            }
        }

        let error = last_error
            .or_else(|| execution.error.clone())
            .unwrap_or_else(|| "retry budget exhausted".to_string());
        execution.status = ExecutionStatus::Failed;
        execution.completed_at = Some(now);
        execution.error = Some(error.clone());
        let current = execution.email_job_id.clone();
        self.write(enrollment, execution, current.as_deref()).await?;

        tracing::error!(
            "❌ {}",
            EngineError::StepExecutionFailed {
                step_id: step.id.clone(),
                error: error.clone(),
            }
        );
        Ok(ExecutionOutcome::Failed { error })
    }

    /// Persist `execution`; losing it to another worker ends this run
    async fn write(
        &self,
        enrollment: &Enrollment,
        execution: &StepExecution,
        expected_job_id: Option<&str>,
    ) -> EngineResult<()> {
        if self.storage.update_execution(execution, expected_job_id).await? {
            Ok(())
        } else {
            Err(EngineError::SchedulerClaimLost(enrollment.id))
        }
    }

    async fn attempt(&self, enrollment: &Enrollment, step: &Step, execution: &StepExecution) -> EngineResult<Attempt> {
        match &step.config {
            StepConfig::Email(email) => {
                let job_id = execution.email_job_id.clone().unwrap_or_else(|| job_id(execution));
                let job = email_job(&job_id, enrollment, step, email);
                self.integrations.jobs.submit_email_job(&job).await?;
                Ok(Attempt::Submitted(job_id))
            }
            StepConfig::Wait(wait) => Ok(Attempt::Finished {
                result: json!({ "waited_seconds": wait.duration().num_seconds() }),
                metadata_patch: None,
            }),
            StepConfig::Condition(condition) => {
                let segments = if predicate::needs_segments(&condition.predicate) {
                    self.integrations
                        .directory
                        .get_subscriber_segments(&enrollment.subscriber_id)
                        .await?
                } else {
                    HashSet::new()
                };
                let metadata = Value::Object(enrollment.metadata.clone());
                let branch = predicate::evaluate(&condition.predicate, &segments, &metadata);
                Ok(Attempt::Finished {
                    result: json!({ "branch": branch.to_string() }),
                    metadata_patch: None,
                })
            }
            StepConfig::Action(ActionConfig::SetMetadata { key, value }) => {
                let mut patch = Map::new();
                patch.insert(key.clone(), value.clone());
                Ok(Attempt::Finished {
                    result: json!({ "set": key }),
                    metadata_patch: Some(patch),
                })
            }
            StepConfig::Action(action) => {
                let result = self
                    .integrations
                    .actions
                    .perform(&enrollment.subscriber_id, action, &enrollment.metadata)
                    .await?;
                Ok(Attempt::Finished { result, metadata_patch: None })
            }
        }
    }
}

/// Correlation id of the current attempt of `execution`
fn job_id(execution: &StepExecution) -> String {
    format!("{}-{}", execution.id, execution.attempts)
}

/// Job-runner payload for an email step
pub fn email_job(job_id: &str, enrollment: &Enrollment, step: &Step, email: &EmailConfig) -> EmailJob {
    EmailJob {
        job_id: job_id.to_string(),
        enrollment_id: enrollment.id,
        step_id: step.id.clone(),
        subscriber_id: enrollment.subscriber_id.clone(),
        subject: email.subject.clone(),
        template_id: email.template_id.clone(),
        from_name: email.from_name.clone(),
        variables: enrollment.metadata.clone(),
    }
}
