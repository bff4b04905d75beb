//! Enrollment and step-execution records
//!
//! Both are engine-owned rows: an `Enrollment` is one subscriber's run
//! through a sequence, a `StepExecution` is the audit record of one visit
//! of one step during that run.

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Completed,
    Exited,
    Paused,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Completed => "completed",
            EnrollmentStatus::Exited => "exited",
            EnrollmentStatus::Paused => "paused",
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "active" => Ok(EnrollmentStatus::Active),
            "completed" => Ok(EnrollmentStatus::Completed),
            "exited" => Ok(EnrollmentStatus::Exited),
            "paused" => Ok(EnrollmentStatus::Paused),
            other => Err(EngineError::InvalidTransition(format!("unknown enrollment status '{}'", other))),
        }
    }

    /// `completed` and `exited` never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, EnrollmentStatus::Completed | EnrollmentStatus::Exited)
    }
}

/// Why an enrollment left its sequence early
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Unsubscribed,
    /// Subscriber left the sequence's required segment
    SegmentLeft,
    /// Operator force-exit
    Manual,
    /// Retry budget of a step exhausted
    StepFailed,
    /// A condition step branched to `exit`
    ConditionExit,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Unsubscribed => "unsubscribed",
            ExitReason::SegmentLeft => "segment_left",
            ExitReason::Manual => "manual",
            ExitReason::StepFailed => "step_failed",
            ExitReason::ConditionExit => "condition_exit",
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "unsubscribed" => Ok(ExitReason::Unsubscribed),
            "segment_left" => Ok(ExitReason::SegmentLeft),
            "manual" => Ok(ExitReason::Manual),
            "step_failed" => Ok(ExitReason::StepFailed),
            "condition_exit" => Ok(ExitReason::ConditionExit),
            other => Err(EngineError::InvalidTransition(format!("unknown exit reason '{}'", other))),
        }
    }
}

/// One subscriber's run through one sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub sequence_id: String,
    pub subscriber_id: String,
    pub status: EnrollmentStatus,
    /// `None` while active means the run has not started its first step
    pub current_step_id: Option<String>,
    pub current_step_started_at: Option<DateTime<Utc>>,
    /// `None` means the enrollment is not waiting on a timer
    pub next_scheduled_at: Option<DateTime<Utc>>,
    pub enrolled_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
    /// Enrollment-scoped variables (A/B bucket, trigger context, ...)
    pub metadata: Map<String, Value>,
    /// Optimistic concurrency counter, bumped on every engine write
    pub version: i64,
    /// Lease token of the scheduler instance currently holding the row
    #[serde(skip)]
    pub claim_token: Option<String>,
}

impl Enrollment {
    /// Fresh, not-yet-started enrollment due at `now`
    pub fn new(sequence_id: &str, subscriber_id: &str, metadata: Map<String, Value>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence_id: sequence_id.to_string(),
            subscriber_id: subscriber_id.to_string(),
            status: EnrollmentStatus::Active,
            current_step_id: None,
            current_step_started_at: None,
            next_scheduled_at: Some(now),
            enrolled_at: now,
            completed_at: None,
            exited_at: None,
            exit_reason: None,
            metadata,
            version: 0,
            claim_token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Skipped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Executing => "executing",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Skipped => "skipped",
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "pending" => Ok(ExecutionStatus::Pending),
            "executing" => Ok(ExecutionStatus::Executing),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "skipped" => Ok(ExecutionStatus::Skipped),
            other => Err(EngineError::InvalidTransition(format!("unknown execution status '{}'", other))),
        }
    }
}

/// Audit record of one step visit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub step_id: String,
    pub status: ExecutionStatus,
    /// Attempts made so far, retries included
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Correlation id of the job-runner email job
    pub email_job_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StepExecution {
    pub fn pending(enrollment_id: Uuid, step_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            enrollment_id,
            step_id: step_id.to_string(),
            status: ExecutionStatus::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            email_job_id: None,
            created_at: now,
        }
    }

    /// Pass-through record for an inactive step
    pub fn skipped(enrollment_id: Uuid, step_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            status: ExecutionStatus::Skipped,
            started_at: Some(now),
            completed_at: Some(now),
            result: Some(serde_json::json!({ "skipped": "inactive_step" })),
            ..Self::pending(enrollment_id, step_id, now)
        }
    }
}

/// Why an enrollment request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    SequenceNotFound,
    SequenceNotActive,
    AlreadyEnrolled,
    CapacityReached,
    Unsubscribed,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::SequenceNotFound => "sequence_not_found",
            RejectReason::SequenceNotActive => "sequence_not_active",
            RejectReason::AlreadyEnrolled => "already_enrolled",
            RejectReason::CapacityReached => "capacity_reached",
            RejectReason::Unsubscribed => "unsubscribed",
        }
    }
}

/// Answer to `request_enrollment`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentOutcome {
    pub enrolled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrollment_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

impl EnrollmentOutcome {
    pub fn enrolled(id: Uuid) -> Self {
        Self { enrolled: true, enrollment_id: Some(id), reason: None }
    }

    pub fn rejected(reason: RejectReason) -> Self {
        Self { enrolled: false, enrollment_id: None, reason: Some(reason) }
    }
}

/// Operator listing filter
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnrollmentFilter {
    pub sequence_id: Option<String>,
    pub status: Option<EnrollmentStatus>,
    pub subscriber_id: Option<String>,
    pub limit: Option<u32>,
}
