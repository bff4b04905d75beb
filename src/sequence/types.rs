//! Core sequence type definitions
//!
//! Sequences, steps and their typed configurations. Every configuration blob
//! is a tagged variant so the executor matches on it exhaustively; the JSON
//! form is what gets persisted in the `config`, `trigger` and `settings`
//! columns.

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Lifecycle status of a sequence definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStatus {
    Draft,
    Active,
    Paused,
    Completed,
}

impl SequenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SequenceStatus::Draft => "draft",
            SequenceStatus::Active => "active",
            SequenceStatus::Paused => "paused",
            SequenceStatus::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "draft" => Ok(SequenceStatus::Draft),
            "active" => Ok(SequenceStatus::Active),
            "paused" => Ok(SequenceStatus::Paused),
            "completed" => Ok(SequenceStatus::Completed),
            other => Err(EngineError::invalid(format!("unknown sequence status '{}'", other))),
        }
    }
}

/// What enrolls a subscriber into a sequence
///
/// Stored as JSON: `{ "type": "tag_added", "tag": "vip" }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TriggerConfig {
    /// New subscription, optionally restricted to one list
    Subscription {
        #[serde(default)]
        list_id: Option<String>,
    },
    TagAdded {
        tag: String,
    },
    TagRemoved {
        tag: String,
    },
    /// Operator or API request with an explicit sequence id
    Manual,
    /// Inbound webhook with an explicit sequence id; `secret` must be echoed
    /// by the caller when set
    Webhook {
        #[serde(default)]
        secret: Option<String>,
    },
    /// Periodic scan: subscribers whose `field` date plus `offset_days` is today
    DateBased {
        field: String,
        #[serde(default)]
        offset_days: i32,
    },
}

impl TriggerConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            TriggerConfig::Subscription { .. } => "subscription",
            TriggerConfig::TagAdded { .. } => "tag_added",
            TriggerConfig::TagRemoved { .. } => "tag_removed",
            TriggerConfig::Manual => "manual",
            TriggerConfig::Webhook { .. } => "webhook",
            TriggerConfig::DateBased { .. } => "date_based",
        }
    }
}

/// Per-sequence runtime settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceSettings {
    /// Cap on simultaneously active or paused enrollments
    pub max_concurrent_enrollments: Option<u32>,
    /// Allow a subscriber to enter again once their previous run is terminal
    pub allow_reentry: bool,
    /// Retries after the first failed attempt of a step
    pub retry_limit: Option<u32>,
    /// Window (UTC hours) during which emails are held back
    pub quiet_hours: Option<QuietHours>,
    /// Subscribers leaving this segment exit the sequence
    pub required_segment: Option<String>,
}

/// Quiet window in UTC hours, `start_hour` inclusive, `end_hour` exclusive.
/// A window may wrap midnight (22 -> 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl QuietHours {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let hour = at.hour() as u8;
        if self.start_hour == self.end_hour {
            false
        } else if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }

    /// First instant at or after `at` where the window closes
    pub fn window_end(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let end = NaiveTime::from_hms_opt(self.end_hour as u32, 0, 0).unwrap_or(NaiveTime::MIN);
        let candidate = at.date_naive().and_time(end).and_utc();
        if candidate > at {
            candidate
        } else {
            candidate + Duration::days(1)
        }
    }
}

/// Denormalized reporting counters. Never a source of truth.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceStats {
    pub total_entered: u64,
    pub total_completed: u64,
    pub total_exited: u64,
    pub current_active: u64,
    pub current_paused: u64,
    pub conversion_rate: f64,
    pub steps: Vec<StepFunnel>,
    pub computed_at: Option<DateTime<Utc>>,
}

/// Funnel counters for one step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepFunnel {
    pub step_id: String,
    pub order: u32,
    pub entered: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// A sequence definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    /// Unique sequence identifier (e.g., "seq-welcome")
    pub id: String,
    /// Owning account
    pub owner: String,
    pub name: String,
    pub status: SequenceStatus,
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub settings: SequenceSettings,
    #[serde(default)]
    pub stats: SequenceStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single step of a sequence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique step identifier (e.g., "welcome-email")
    pub id: String,
    #[serde(default)]
    pub sequence_id: String,
    /// 1-based position, dense and unique within the sequence
    pub order: u32,
    pub name: String,
    pub config: StepConfig,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Overrides `SequenceSettings::retry_limit` for this step
    #[serde(default)]
    pub retry_limit: Option<u32>,
}

fn default_true() -> bool {
    true
}

impl Step {
    pub fn kind(&self) -> &'static str {
        match self.config {
            StepConfig::Email(_) => "email",
            StepConfig::Wait(_) => "wait",
            StepConfig::Condition(_) => "condition",
            StepConfig::Action(_) => "action",
        }
    }
}

/// Typed step configuration
///
/// Stored as JSON: `{ "type": "wait", "amount": 24, "unit": "hours" }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StepConfig {
    Email(EmailConfig),
    Wait(WaitConfig),
    Condition(ConditionConfig),
    Action(ActionConfig),
}

/// Email step: content reference handed to the job runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailConfig {
    pub subject: String,
    pub template_id: String,
    #[serde(default)]
    pub from_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitConfig {
    pub amount: u32,
    pub unit: WaitUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitUnit {
    Minutes,
    Hours,
    Days,
}

impl WaitConfig {
    pub fn duration(&self) -> Duration {
        let amount = i64::from(self.amount);
        match self.unit {
            WaitUnit::Minutes => Duration::minutes(amount),
            WaitUnit::Hours => Duration::hours(amount),
            WaitUnit::Days => Duration::days(amount),
        }
    }
}

/// Condition step: predicate plus an explicit target for each outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub predicate: Predicate,
    #[serde(default)]
    pub on_true: BranchTarget,
    #[serde(default)]
    pub on_false: BranchTarget,
}

/// Where an enrollment goes after a condition step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BranchTarget {
    /// Next step in order
    #[default]
    Next,
    /// Jump to the step with this order
    Goto { order: u32 },
    /// Leave the sequence
    Exit,
}

/// Predicate evaluated over subscriber segments and enrollment metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum Predicate {
    InSegment { segment_id: String },
    NotInSegment { segment_id: String },
    /// JSONPath over enrollment metadata, e.g. `$.bucket`
    MetadataEquals { path: String, value: Value },
    MetadataExists { path: String },
    All { predicates: Vec<Predicate> },
    Any { predicates: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
}

/// Synchronous side effect performed by an action step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum ActionConfig {
    AddTag { tag: String },
    RemoveTag { tag: String },
    /// Writes an enrollment-scoped variable
    SetMetadata { key: String, value: Value },
    /// POSTs the enrollment context to `url`
    Webhook { url: String },
}

/// A sequence together with its steps sorted by order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceDefinition {
    pub sequence: Sequence,
    pub steps: Vec<Step>,
}

impl SequenceDefinition {
    pub fn new(sequence: Sequence, mut steps: Vec<Step>) -> Self {
        steps.sort_by_key(|s| s.order);
        Self { sequence, steps }
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_at(&self, order: u32) -> Option<&Step> {
        self.steps.iter().find(|s| s.order == order)
    }

    /// Steps from `order` onward, in order
    pub fn steps_from(&self, order: u32) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(move |s| s.order >= order)
    }

    /// Retry budget for a step: step override, then sequence setting, then `fallback`
    pub fn retry_limit(&self, step: &Step, fallback: u32) -> u32 {
        step.retry_limit
            .or(self.sequence.settings.retry_limit)
            .unwrap_or(fallback)
    }

    /// Structural checks run before a sequence may become active
    pub fn validate(&self) -> EngineResult<()> {
        if self.sequence.id.is_empty() || self.sequence.name.is_empty() {
            return Err(EngineError::invalid("sequence id and name are required"));
        }

        let mut ids = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            let expected = index as u32 + 1;
            if step.order != expected {
                return Err(EngineError::invalid(format!(
                    "step orders must be dense and start at 1: expected {}, found {} ('{}')",
                    expected, step.order, step.id
                )));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(EngineError::invalid(format!("duplicate step id '{}'", step.id)));
            }
        }

        for step in &self.steps {
            match &step.config {
                StepConfig::Email(email) => {
                    if email.subject.trim().is_empty() || email.template_id.trim().is_empty() {
                        return Err(EngineError::invalid(format!(
                            "email step '{}' needs a subject and a template",
                            step.id
                        )));
                    }
                }
                StepConfig::Condition(condition) => {
                    for target in [condition.on_true, condition.on_false] {
                        if let BranchTarget::Goto { order } = target {
                            if self.step_at(order).is_none() {
                                return Err(EngineError::invalid(format!(
                                    "condition step '{}' branches to missing order {}",
                                    step.id, order
                                )));
                            }
                        }
                    }
                }
                StepConfig::Action(ActionConfig::Webhook { url }) if url.is_empty() => {
                    return Err(EngineError::invalid(format!(
                        "webhook action '{}' has no url",
                        step.id
                    )));
                }
                _ => {}
            }
        }

        let settings = &self.sequence.settings;
        if settings.max_concurrent_enrollments == Some(0) {
            return Err(EngineError::invalid("max_concurrent_enrollments must be positive"));
        }
        if let Some(quiet) = settings.quiet_hours {
            if quiet.start_hour > 23 || quiet.end_hour > 23 {
                return Err(EngineError::invalid("quiet hours must be within 0..=23"));
            }
        }

        Ok(())
    }
}
