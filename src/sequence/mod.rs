//! Sequence definition layer
//!
//! - Type definitions (Sequence, Step, tagged trigger/step configs)
//! - SQLite persistence with sqlx
//! - Lock-free hot-reload registry using ArcSwap

pub mod types;

pub mod storage;

pub mod registry;

pub use registry::SequenceRegistry;
pub use storage::SequenceStorage;
pub use types::{
    ActionConfig, BranchTarget, ConditionConfig, EmailConfig, Predicate, QuietHours, Sequence,
    SequenceDefinition, SequenceSettings, SequenceStats, SequenceStatus, Step, StepConfig,
    StepFunnel, TriggerConfig, WaitConfig, WaitUnit,
};
