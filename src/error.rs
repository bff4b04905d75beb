//! Engine error taxonomy
//!
//! Recoverable conditions (rejected triggers, lost claims) are modeled as
//! variants so callers can match on them; storage and serialization failures
//! are wrapped transparently.

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Enrollment request refused (capacity, duplicate, inactive sequence)
    #[error("Trigger rejected for sequence {sequence_id}: {reason}")]
    TriggerRejected { sequence_id: String, reason: String },

    /// A step failed after exhausting its retry budget
    #[error("Step {step_id} failed: {error}")]
    StepExecutionFailed { step_id: String, error: String },

    /// The claim lease expired and another worker took over the enrollment
    #[error("Scheduler claim lost for enrollment {0}")]
    SchedulerClaimLost(Uuid),

    /// Sequence definition rejected at activation or edit time
    #[error("Invalid sequence definition: {0}")]
    InvalidSequenceDefinition(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Optimistic concurrency check failed
    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    #[error("Integration error: {0}")]
    Integration(String),

    #[error("Database error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidSequenceDefinition(msg.into())
    }
}
