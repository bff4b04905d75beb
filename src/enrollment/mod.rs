//! Enrollment layer
//!
//! Runtime records owned by the engine: enrollments, their step executions,
//! and the SQLite storage that arbitrates concurrent access to them.

pub mod types;

pub mod storage;

pub use storage::{EnrollmentStorage, ExecutionTally, InsertOutcome, Requeue};
pub use types::{
    Enrollment, EnrollmentFilter, EnrollmentOutcome, EnrollmentStatus, ExecutionStatus, ExitReason,
    RejectReason, StepExecution,
};
