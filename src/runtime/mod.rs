//! Runtime
//!
//! - `engine`: enrollment state machine and job-result handling
//! - `executor`: single-step execution with in-place retries
//! - `scheduler`: leased sweeps plus the background job service
//! - `trigger`: event matching and the date-based scan
//! - `stats`: re-derivable statistics projection
//! - `predicate`: condition evaluation

pub mod engine;

pub mod executor;

pub mod predicate;

pub mod scheduler;

pub mod stats;

pub mod trigger;

pub use engine::{CallbackOutcome, DueOutcome, EnrollmentEngine};
pub use executor::{ExecutionOutcome, StepExecutor};
pub use scheduler::{SchedulerService, StepScheduler, SweepReport};
pub use stats::StatsAggregator;
pub use trigger::{EventKind, TriggerEvaluator, TriggerEvent, TriggerMatch};
