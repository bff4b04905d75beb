//! Dripway: drip sequence automation engine
//!
//! Enrolls subscribers into multi-step sequences (email, wait, condition,
//! action), advances them with leased scheduler sweeps, and keeps a
//! re-derivable statistics projection per sequence.

// Configuration from environment variables
pub mod config;

pub mod error;

// SQLite pool and schema
pub mod store;

// Sequence definitions, storage and the hot-reload registry
pub mod sequence;

// Enrollment and step execution records
pub mod enrollment;

// Job runner, subscriber directory and action ports with HTTP and in-memory adapters
pub mod integrations;

// Trigger evaluation, enrollment engine, executor, scheduler and stats
pub mod runtime;

// HTTP API layer
pub mod api;

pub mod server;

pub use enrollment::{Enrollment, EnrollmentStatus, ExitReason, StepExecution};
pub use error::{EngineError, EngineResult};
pub use runtime::EnrollmentEngine;
pub use sequence::{Sequence, SequenceDefinition, Step, StepConfig, TriggerConfig};
pub use server::start_server;
