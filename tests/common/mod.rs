#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use dripway::api::AppState;
use dripway::config::SchedulerConfig;
use dripway::integrations::{InMemoryActionHandler, InMemoryDirectory, InMemoryJobRunner, Integrations, JobRunner};
use dripway::runtime::StepScheduler;
use dripway::sequence::types::{
    BranchTarget, ConditionConfig, EmailConfig, Predicate, Sequence, SequenceSettings, SequenceStats,
    SequenceStatus, Step, StepConfig, TriggerConfig, WaitConfig, WaitUnit,
};
use dripway::server::build_runtime;
use dripway::store::Database;
use serde_json::Map;
use std::sync::Arc;

pub struct Harness {
    pub state: AppState,
    pub steps: Arc<StepScheduler>,
    /// Records every job that reached the runner
    pub jobs: Arc<InMemoryJobRunner>,
    pub directory: Arc<InMemoryDirectory>,
    pub actions: Arc<InMemoryActionHandler>,
}

/// Claim lease used by every harness
pub const LEASE_SECS: i64 = 60;

/// Monday 2026-03-02 12:00 UTC
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
}

pub async fn harness() -> Harness {
    let database = Database::in_memory().await.unwrap();
    harness_on(&database).await
}

pub async fn harness_on(database: &Database) -> Harness {
    harness_with(database, |jobs| -> Arc<dyn JobRunner> { jobs }).await
}

/// Harness whose engine submits through the runner built by `wrap`
///
/// `wrap` receives the recording runner, so wrappers that delegate to it keep
/// `Harness::jobs` accurate.
pub async fn harness_with<F>(database: &Database, wrap: F) -> Harness
where
    F: FnOnce(Arc<InMemoryJobRunner>) -> Arc<dyn JobRunner>,
{
    let jobs = Arc::new(InMemoryJobRunner::new());
    let directory = Arc::new(InMemoryDirectory::new());
    let actions = Arc::new(InMemoryActionHandler::new());
    let integrations = Integrations {
        jobs: wrap(jobs.clone()),
        directory: directory.clone(),
        actions: actions.clone(),
    };
    let config = SchedulerConfig {
        default_retry_limit: 0,
        lease_secs: LEASE_SECS as u64,
        ..SchedulerConfig::default()
    };
    let runtime = build_runtime(database, integrations, &config).await.unwrap();

    Harness {
        state: runtime.state,
        steps: runtime.steps,
        jobs,
        directory,
        actions,
    }
}

pub fn step(id: &str, order: u32, config: StepConfig) -> Step {
    Step {
        id: id.into(),
        sequence_id: String::new(),
        order,
        name: id.into(),
        config,
        active: true,
        retry_limit: None,
    }
}

pub fn email(id: &str, order: u32) -> Step {
    step(
        id,
        order,
        StepConfig::Email(EmailConfig {
            subject: format!("Subject of {}", id),
            template_id: format!("tpl-{}", id),
            from_name: None,
        }),
    )
}

pub fn wait_hours(id: &str, order: u32, hours: u32) -> Step {
    step(id, order, StepConfig::Wait(WaitConfig { amount: hours, unit: WaitUnit::Hours }))
}

pub fn segment_check(id: &str, order: u32, segment: &str, on_true: BranchTarget, on_false: BranchTarget) -> Step {
    step(
        id,
        order,
        StepConfig::Condition(ConditionConfig {
            predicate: Predicate::InSegment { segment_id: segment.into() },
            on_true,
            on_false,
        }),
    )
}

impl Harness {
    /// Create, fill and activate a sequence
    pub async fn active_sequence(&self, id: &str, trigger: TriggerConfig, settings: SequenceSettings, steps: Vec<Step>) {
        let sequence = Sequence {
            id: id.into(),
            owner: "acme".into(),
            name: format!("Sequence {}", id),
            status: SequenceStatus::Draft,
            trigger,
            settings,
            stats: SequenceStats::default(),
            created_at: t0(),
            updated_at: t0(),
        };
        let engine = &self.state.engine;
        engine.sequences().create_sequence(&sequence).await.unwrap();
        engine.update_steps(id, steps).await.unwrap();
        engine.activate_sequence(id, t0()).await.unwrap();
    }

    pub async fn enroll(&self, sequence_id: &str, subscriber_id: &str, at: DateTime<Utc>) -> uuid::Uuid {
        let outcome = self
            .state
            .engine
            .request_enrollment(sequence_id, subscriber_id, Map::new(), at)
            .await
            .unwrap();
        assert!(outcome.enrolled, "enrollment refused: {:?}", outcome.reason);
        outcome.enrollment_id.unwrap()
    }

    pub async fn enrollment(&self, id: uuid::Uuid) -> dripway::Enrollment {
        self.state.engine.enrollments().get(id).await.unwrap().unwrap()
    }
}
