//! End-to-end engine scenarios against SQLite with in-memory adapters

mod common;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use common::{email, harness, harness_on, harness_with, segment_check, step, t0, wait_hours, LEASE_SECS};
use dripway::enrollment::{EnrollmentFilter, EnrollmentStatus, ExecutionStatus, ExitReason, RejectReason};
use dripway::integrations::{EmailJob, InMemoryJobRunner, JobResult, JobRunner, JobStatus};
use dripway::runtime::{CallbackOutcome, DueOutcome, EventKind, StepScheduler, TriggerEvent};
use dripway::sequence::types::{
    ActionConfig, BranchTarget, QuietHours, SequenceSettings, SequenceStatus, StepConfig, TriggerConfig,
};
use dripway::store::Database;
use dripway::{EngineError, EngineResult, EnrollmentEngine};
use serde_json::{json, Map};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

fn completed(job_id: &str) -> JobResult {
    JobResult {
        job_id: job_id.to_string(),
        status: JobStatus::Completed,
        provider_message_id: Some(format!("msg-{}", job_id)),
        error: None,
    }
}

fn failed(job_id: &str) -> JobResult {
    JobResult {
        job_id: job_id.to_string(),
        status: JobStatus::Failed,
        provider_message_id: None,
        error: Some("mailbox unavailable".to_string()),
    }
}

#[tokio::test]
async fn email_wait_email_runs_to_completion() {
    let h = harness().await;
    h.active_sequence(
        "welcome",
        TriggerConfig::Manual,
        SequenceSettings::default(),
        vec![email("hello", 1), wait_hours("pause", 2, 24), email("follow-up", 3)],
    )
    .await;
    let id = h.enroll("welcome", "sub-1", t0()).await;

    let report = h.steps.sweep(t0()).await.unwrap();
    assert_eq!(report.dispatched, 1);
    let first_job = h.jobs.last_job_id().unwrap();
    let parked = h.enrollment(id).await;
    assert_eq!(parked.current_step_id.as_deref(), Some("hello"));
    assert!(parked.next_scheduled_at.is_none());
    assert!(parked.claim_token.is_none());

    let outcome = h.state.engine.on_job_result(&completed(&first_job), t0()).await.unwrap();
    assert_eq!(outcome, CallbackOutcome::Advanced);
    let waiting = h.enrollment(id).await;
    assert_eq!(waiting.current_step_id.as_deref(), Some("pause"));
    assert_eq!(waiting.next_scheduled_at, Some(t0() + Duration::hours(24)));

    let early = h.steps.sweep(t0() + Duration::hours(23)).await.unwrap();
    assert_eq!(early.claimed, 0);

    let later = t0() + Duration::hours(24);
    let report = h.steps.sweep(later).await.unwrap();
    assert_eq!(report.advanced, 1);
    let report = h.steps.sweep(later).await.unwrap();
    assert_eq!(report.dispatched, 1);

    let second_job = h.jobs.last_job_id().unwrap();
    assert_ne!(second_job, first_job);
    let outcome = h.state.engine.on_job_result(&completed(&second_job), later).await.unwrap();
    assert_eq!(outcome, CallbackOutcome::Completed);

    let done = h.enrollment(id).await;
    assert_eq!(done.status, EnrollmentStatus::Completed);
    assert_eq!(done.completed_at, Some(later));
    assert!(done.next_scheduled_at.is_none());

    let executions = h.state.engine.enrollments().list_executions(id).await.unwrap();
    let steps: Vec<&str> = executions.iter().map(|e| e.step_id.as_str()).collect();
    assert_eq!(steps, vec!["hello", "pause", "follow-up"]);
    assert!(executions.iter().all(|e| e.status == ExecutionStatus::Completed));

    let jobs = h.jobs.submitted();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].1.template_id, "tpl-hello");
    assert_eq!(jobs[1].1.subscriber_id, "sub-1");

    let stats = h.state.stats.recompute("welcome", later).await.unwrap();
    assert_eq!(stats.total_entered, 1);
    assert_eq!(stats.total_completed, 1);
    assert_eq!(stats.conversion_rate, 1.0);
    assert_eq!(stats.steps.len(), 3);
    assert!(stats.steps.iter().all(|funnel| funnel.entered == 1 && funnel.completed == 1));
}

#[tokio::test]
async fn capacity_admits_one_of_two_concurrent_requests() {
    let h = harness().await;
    let settings = SequenceSettings {
        max_concurrent_enrollments: Some(1),
        ..Default::default()
    };
    h.active_sequence("capped", TriggerConfig::Manual, settings, vec![email("only", 1)])
        .await;

    let engine = &h.state.engine;
    let (first, second) = tokio::join!(
        engine.request_enrollment("capped", "sub-a", Map::new(), t0()),
        engine.request_enrollment("capped", "sub-b", Map::new(), t0()),
    );
    let outcomes = [first.unwrap(), second.unwrap()];

    assert_eq!(outcomes.iter().filter(|o| o.enrolled).count(), 1);
    let refused = outcomes.iter().find(|o| !o.enrolled).unwrap();
    assert_eq!(refused.reason, Some(RejectReason::CapacityReached));
}

#[tokio::test]
async fn condition_takes_the_false_branch() {
    let h = harness().await;
    h.active_sequence(
        "branching",
        TriggerConfig::Manual,
        SequenceSettings::default(),
        vec![
            segment_check("check", 1, "vip", BranchTarget::Goto { order: 5 }, BranchTarget::Goto { order: 2 }),
            email("two", 2),
            email("three", 3),
            email("four", 4),
            email("five", 5),
        ],
    )
    .await;
    h.directory.add_to_segment("sub-vip", "vip");

    let regular = h.enroll("branching", "sub-regular", t0()).await;
    let vip = h.enroll("branching", "sub-vip", t0()).await;

    let report = h.steps.sweep(t0()).await.unwrap();
    assert_eq!(report.advanced, 2);

    assert_eq!(h.enrollment(regular).await.current_step_id.as_deref(), Some("two"));
    assert_eq!(h.enrollment(vip).await.current_step_id.as_deref(), Some("five"));

    let executions = h.state.engine.enrollments().list_executions(regular).await.unwrap();
    assert_eq!(executions[0].result, Some(json!({ "branch": "false" })));
}

#[tokio::test]
async fn email_failure_without_retries_exits() {
    let h = harness().await;
    let settings = SequenceSettings {
        retry_limit: Some(0),
        ..Default::default()
    };
    h.active_sequence("fragile", TriggerConfig::Manual, settings, vec![email("only", 1)])
        .await;
    let id = h.enroll("fragile", "sub-1", t0()).await;
    h.jobs.fail_next(1);

    let report = h.steps.sweep(t0()).await.unwrap();
    assert_eq!(report.exited, 1);

    let exited = h.enrollment(id).await;
    assert_eq!(exited.status, EnrollmentStatus::Exited);
    assert_eq!(exited.exit_reason, Some(ExitReason::StepFailed));
    assert!(exited.next_scheduled_at.is_none());

    let executions = h.state.engine.enrollments().list_executions(id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Failed);
    assert!(executions[0].error.is_some());

    let again = h.steps.sweep(t0() + Duration::hours(1)).await.unwrap();
    assert_eq!(again.claimed, 0);
}

#[tokio::test]
async fn failed_callback_without_retries_exits() {
    let h = harness().await;
    h.active_sequence("single", TriggerConfig::Manual, SequenceSettings::default(), vec![email("only", 1)])
        .await;
    let id = h.enroll("single", "sub-1", t0()).await;
    h.steps.sweep(t0()).await.unwrap();
    let job = h.jobs.last_job_id().unwrap();

    let outcome = h.state.engine.on_job_result(&failed(&job), t0()).await.unwrap();

    assert_eq!(outcome, CallbackOutcome::Exited);
    assert_eq!(h.enrollment(id).await.exit_reason, Some(ExitReason::StepFailed));
}

#[tokio::test]
async fn failed_callback_with_retries_left_is_requeued() {
    let h = harness().await;
    let settings = SequenceSettings {
        retry_limit: Some(1),
        ..Default::default()
    };
    h.active_sequence("retrying", TriggerConfig::Manual, settings, vec![email("only", 1)])
        .await;
    let id = h.enroll("retrying", "sub-1", t0()).await;
    h.steps.sweep(t0()).await.unwrap();
    let first_job = h.jobs.last_job_id().unwrap();

    let outcome = h.state.engine.on_job_result(&failed(&first_job), t0()).await.unwrap();
    assert_eq!(outcome, CallbackOutcome::Retried);
    assert_eq!(h.enrollment(id).await.next_scheduled_at, Some(t0()));
    let duplicate = h.state.engine.on_job_result(&failed(&first_job), t0()).await.unwrap();
    assert_eq!(duplicate, CallbackOutcome::Ignored);

    let report = h.steps.sweep(t0()).await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(h.jobs.submitted().len(), 2);
    let second_job = h.jobs.last_job_id().unwrap();

    // the superseded job id no longer resolves anything
    let stale = h.state.engine.on_job_result(&completed(&first_job), t0()).await.unwrap();
    assert_eq!(stale, CallbackOutcome::Ignored);

    let outcome = h.state.engine.on_job_result(&completed(&second_job), t0()).await.unwrap();
    assert_eq!(outcome, CallbackOutcome::Completed);

    let executions = h.state.engine.enrollments().list_executions(id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].attempts, 2);
    assert_eq!(executions[0].status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn duplicate_job_results_change_nothing() {
    let h = harness().await;
    h.active_sequence(
        "dupes",
        TriggerConfig::Manual,
        SequenceSettings::default(),
        vec![email("first", 1), wait_hours("pause", 2, 1)],
    )
    .await;
    let id = h.enroll("dupes", "sub-1", t0()).await;
    h.steps.sweep(t0()).await.unwrap();
    let job = h.jobs.last_job_id().unwrap();

    let first = h.state.engine.on_job_result(&completed(&job), t0()).await.unwrap();
    assert_eq!(first, CallbackOutcome::Advanced);
    let before = h.enrollment(id).await;

    let replayed = h
        .state
        .engine
        .on_job_result(&completed(&job), t0() + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(replayed, CallbackOutcome::Ignored);
    assert_eq!(h.enrollment(id).await, before);

    let unknown = h.state.engine.on_job_result(&completed("job-404"), t0()).await.unwrap();
    assert_eq!(unknown, CallbackOutcome::Ignored);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sweeps_claim_each_enrollment_once() {
    let dir = tempfile::tempdir().unwrap();
    let database = Database::open(dir.path().to_str().unwrap()).await.unwrap();
    let h = harness_on(&database).await;
    h.active_sequence("busy", TriggerConfig::Manual, SequenceSettings::default(), vec![email("only", 1)])
        .await;
    for n in 0..20 {
        h.enroll("busy", &format!("sub-{}", n), t0()).await;
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let scheduler = Arc::new(StepScheduler::new(Arc::clone(&h.state.engine), 100, 60));
        handles.push(tokio::spawn(async move { scheduler.sweep(t0()).await }));
    }
    let mut claimed = 0;
    let mut dispatched = 0;
    for handle in handles {
        let report = handle.await.unwrap().unwrap();
        claimed += report.claimed;
        dispatched += report.dispatched;
    }

    assert_eq!(claimed, 20);
    assert_eq!(dispatched, 20);
    let jobs = h.jobs.submitted();
    assert_eq!(jobs.len(), 20);
    let distinct: HashSet<_> = jobs.iter().map(|(_, job)| job.enrollment_id).collect();
    assert_eq!(distinct.len(), 20);
}

#[tokio::test]
async fn paused_sequences_hold_enrollments_until_resumed() {
    let h = harness().await;
    h.active_sequence(
        "pausable",
        TriggerConfig::Manual,
        SequenceSettings::default(),
        vec![wait_hours("pause", 1, 1), email("after", 2)],
    )
    .await;
    let id = h.enroll("pausable", "sub-1", t0()).await;
    h.steps.sweep(t0()).await.unwrap();

    let paused = h.state.engine.pause_sequence("pausable", t0()).await.unwrap();
    assert_eq!(paused, 1);
    assert_eq!(h.enrollment(id).await.status, EnrollmentStatus::Paused);

    let refused = h
        .state
        .engine
        .request_enrollment("pausable", "sub-2", Map::new(), t0())
        .await
        .unwrap();
    assert_eq!(refused.reason, Some(RejectReason::SequenceNotActive));

    let idle = h.steps.sweep(t0() + Duration::hours(2)).await.unwrap();
    assert_eq!(idle.claimed, 0);

    let resumed_at = t0() + Duration::hours(3);
    assert_eq!(h.state.engine.resume_sequence("pausable", resumed_at).await.unwrap(), 1);
    let resumed = h.enrollment(id).await;
    assert_eq!(resumed.status, EnrollmentStatus::Active);
    assert_eq!(resumed.next_scheduled_at, Some(resumed_at));

    let report = h.steps.sweep(resumed_at).await.unwrap();
    assert_eq!(report.advanced, 1);
    assert_eq!(h.enrollment(id).await.current_step_id.as_deref(), Some("after"));
}

#[tokio::test]
async fn one_live_enrollment_per_subscriber() {
    let h = harness().await;
    h.active_sequence("once", TriggerConfig::Manual, SequenceSettings::default(), vec![email("only", 1)])
        .await;
    let reentrant = SequenceSettings {
        allow_reentry: true,
        ..Default::default()
    };
    h.active_sequence("again", TriggerConfig::Manual, reentrant, vec![email("only", 1)])
        .await;

    let engine = &h.state.engine;
    let first = h.enroll("once", "sub-1", t0()).await;
    let duplicate = engine.request_enrollment("once", "sub-1", Map::new(), t0()).await.unwrap();
    assert_eq!(duplicate.reason, Some(RejectReason::AlreadyEnrolled));

    engine.force_exit(first, t0()).await.unwrap();
    let after_exit = engine.request_enrollment("once", "sub-1", Map::new(), t0()).await.unwrap();
    assert!(after_exit.enrolled, "exited runs do not block a new enrollment");

    let run = h.enroll("again", "sub-1", t0()).await;
    h.steps.sweep(t0()).await.unwrap();
    let (job, _) = h
        .jobs
        .submitted()
        .into_iter()
        .find(|(_, job)| job.enrollment_id == run)
        .unwrap();
    engine.on_job_result(&completed(&job), t0()).await.unwrap();
    assert_eq!(h.enrollment(run).await.status, EnrollmentStatus::Completed);
    let reentry = engine.request_enrollment("again", "sub-1", Map::new(), t0()).await.unwrap();
    assert!(reentry.enrolled);

    let missing = engine.request_enrollment("nope", "sub-1", Map::new(), t0()).await.unwrap();
    assert_eq!(missing.reason, Some(RejectReason::SequenceNotFound));
}

#[tokio::test]
async fn terminal_enrollments_are_immutable() {
    let h = harness().await;
    h.active_sequence("final", TriggerConfig::Manual, SequenceSettings::default(), vec![email("only", 1)])
        .await;
    let id = h.enroll("final", "sub-1", t0()).await;

    let exited = h.state.engine.force_exit(id, t0()).await.unwrap();
    assert_eq!(exited.exit_reason, Some(ExitReason::Manual));

    let again = h.state.engine.force_exit(id, t0()).await;
    assert!(matches!(again, Err(EngineError::InvalidTransition(_))));

    let mut revived = h.enrollment(id).await;
    revived.status = EnrollmentStatus::Active;
    revived.next_scheduled_at = Some(t0());
    assert!(!h.state.engine.enrollments().save_state(&revived).await.unwrap());
    assert_eq!(h.enrollment(id).await.status, EnrollmentStatus::Exited);
}

#[tokio::test]
async fn emails_wait_out_quiet_hours() {
    let h = harness().await;
    let settings = SequenceSettings {
        quiet_hours: Some(QuietHours { start_hour: 22, end_hour: 7 }),
        ..Default::default()
    };
    h.active_sequence("polite", TriggerConfig::Manual, settings, vec![email("only", 1)])
        .await;
    let late = Utc.with_ymd_and_hms(2026, 3, 2, 23, 0, 0).unwrap();
    let id = h.enroll("polite", "sub-1", late).await;

    let report = h.steps.sweep(late).await.unwrap();
    assert_eq!(report.deferred, 1);
    let morning = Utc.with_ymd_and_hms(2026, 3, 3, 7, 0, 0).unwrap();
    assert_eq!(h.enrollment(id).await.next_scheduled_at, Some(morning));
    assert!(h.jobs.submitted().is_empty());

    let report = h.steps.sweep(morning).await.unwrap();
    assert_eq!(report.dispatched, 1);
}

#[tokio::test]
async fn leaving_the_audience_exits_at_the_next_step() {
    let h = harness().await;
    let settings = SequenceSettings {
        required_segment: Some("members".into()),
        ..Default::default()
    };
    h.active_sequence(
        "members-only",
        TriggerConfig::Manual,
        settings,
        vec![wait_hours("pause", 1, 1), email("after", 2)],
    )
    .await;
    for sub in ["sub-left", "sub-unsub"] {
        h.directory.add_to_segment(sub, "members");
    }
    let left = h.enroll("members-only", "sub-left", t0()).await;
    let unsub = h.enroll("members-only", "sub-unsub", t0()).await;
    h.steps.sweep(t0()).await.unwrap();

    h.directory.remove_from_segment("sub-left", "members");
    h.directory.unsubscribe("sub-unsub");
    let report = h.steps.sweep(t0() + Duration::hours(1)).await.unwrap();

    assert_eq!(report.exited, 2);
    assert_eq!(h.enrollment(left).await.exit_reason, Some(ExitReason::SegmentLeft));
    assert_eq!(h.enrollment(unsub).await.exit_reason, Some(ExitReason::Unsubscribed));

    let refused = h
        .state
        .engine
        .request_enrollment("members-only", "sub-unsub", Map::new(), t0())
        .await
        .unwrap();
    assert_eq!(refused.reason, Some(RejectReason::Unsubscribed));
}

#[tokio::test]
async fn replay_starts_a_fresh_run_at_the_failed_step() {
    let h = harness().await;
    let settings = SequenceSettings {
        retry_limit: Some(0),
        ..Default::default()
    };
    h.active_sequence(
        "replayable",
        TriggerConfig::Manual,
        settings,
        vec![wait_hours("pause", 1, 1), email("mail", 2)],
    )
    .await;
    let original = h.enroll("replayable", "sub-1", t0()).await;
    h.steps.sweep(t0()).await.unwrap();
    let due = t0() + Duration::hours(1);
    h.steps.sweep(due).await.unwrap();
    h.jobs.fail_next(1);
    h.steps.sweep(due).await.unwrap();
    assert_eq!(h.enrollment(original).await.exit_reason, Some(ExitReason::StepFailed));

    let outcome = h.state.engine.replay_failed_step(original, due).await.unwrap();
    assert!(outcome.enrolled);
    let replay = h.enrollment(outcome.enrollment_id.unwrap()).await;
    assert_eq!(replay.current_step_id.as_deref(), Some("mail"));
    assert_eq!(replay.metadata.get("replay_of"), Some(&json!(original.to_string())));

    let report = h.steps.sweep(due).await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(h.enrollment(original).await.status, EnrollmentStatus::Exited);

    let not_failed = h.state.engine.replay_failed_step(replay.id, due).await;
    assert!(matches!(not_failed, Err(EngineError::InvalidTransition(_))));
}

#[tokio::test]
async fn inactive_steps_are_skipped_with_a_record() {
    let h = harness().await;
    let mut disabled = email("disabled", 1);
    disabled.active = false;
    h.active_sequence(
        "skipping",
        TriggerConfig::Manual,
        SequenceSettings::default(),
        vec![disabled, wait_hours("pause", 2, 1)],
    )
    .await;
    let id = h.enroll("skipping", "sub-1", t0()).await;

    h.steps.sweep(t0()).await.unwrap();

    let enrollment = h.enrollment(id).await;
    assert_eq!(enrollment.current_step_id.as_deref(), Some("pause"));
    assert_eq!(enrollment.next_scheduled_at, Some(t0() + Duration::hours(1)));
    let executions = h.state.engine.enrollments().list_executions(id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].step_id, "disabled");
    assert_eq!(executions[0].status, ExecutionStatus::Skipped);
    assert!(h.jobs.submitted().is_empty());
}

#[tokio::test]
async fn action_steps_run_inline() {
    let h = harness().await;
    h.active_sequence(
        "tagging",
        TriggerConfig::Manual,
        SequenceSettings::default(),
        vec![
            step("tag", 1, StepConfig::Action(ActionConfig::AddTag { tag: "onboarded".into() })),
            step(
                "remember",
                2,
                StepConfig::Action(ActionConfig::SetMetadata { key: "bucket".into(), value: json!("b") }),
            ),
            step(
                "notify",
                3,
                StepConfig::Action(ActionConfig::Webhook { url: "https://crm.test/hook".into() }),
            ),
        ],
    )
    .await;
    let id = h.enroll("tagging", "sub-1", t0()).await;

    for _ in 0..3 {
        h.steps.sweep(t0()).await.unwrap();
    }

    assert!(h.actions.tags("sub-1").contains("onboarded"));
    assert_eq!(
        h.actions.webhook_calls(),
        vec![("https://crm.test/hook".to_string(), "sub-1".to_string())]
    );
    let done = h.enrollment(id).await;
    assert_eq!(done.status, EnrollmentStatus::Completed);
    assert_eq!(done.metadata.get("bucket"), Some(&json!("b")));
}

#[tokio::test]
async fn events_enroll_into_matching_sequences() {
    let h = harness().await;
    h.active_sequence(
        "vip-welcome",
        TriggerConfig::TagAdded { tag: "vip".into() },
        SequenceSettings::default(),
        vec![email("only", 1)],
    )
    .await;
    h.active_sequence(
        "trial-welcome",
        TriggerConfig::TagAdded { tag: "trial".into() },
        SequenceSettings::default(),
        vec![email("only", 1)],
    )
    .await;

    let event = TriggerEvent {
        kind: EventKind::TagAdded,
        subscriber_id: "sub-1".into(),
        payload: json!({ "tag": "vip" }),
    };
    let matches = h.state.triggers.evaluate(&event, t0()).await.unwrap();

    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].sequence_id, "vip-welcome");
    assert!(matches[0].outcome.enrolled);
    let enrollment = h.enrollment(matches[0].outcome.enrollment_id.unwrap()).await;
    assert_eq!(enrollment.metadata["trigger"]["payload"]["tag"], json!("vip"));
}

#[tokio::test]
async fn date_scan_enrolls_once_per_anniversary() {
    let h = harness().await;
    h.active_sequence(
        "birthday",
        TriggerConfig::DateBased { field: "birthday".into(), offset_days: 0 },
        SequenceSettings { allow_reentry: true, ..Default::default() },
        vec![email("only", 1)],
    )
    .await;
    let today = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
    h.directory.set_date("sub-1", "birthday", today);
    h.directory.set_date("sub-2", "birthday", today.succ_opt().unwrap());

    let first = h.state.triggers.scan_date_triggers(t0()).await.unwrap();
    assert_eq!(first.len(), 1);
    assert!(first[0].outcome.enrolled);

    let second = h.state.triggers.scan_date_triggers(t0() + Duration::hours(1)).await.unwrap();
    assert!(second.is_empty());
}

/// Reports success from inside `submit_email_job`, the way a fast queue can
struct ReportsBeforeReturning {
    inner: Arc<InMemoryJobRunner>,
    engine: OnceLock<Arc<EnrollmentEngine>>,
    outcomes: Mutex<Vec<CallbackOutcome>>,
}

#[async_trait]
impl JobRunner for ReportsBeforeReturning {
    async fn submit_email_job(&self, job: &EmailJob) -> EngineResult<()> {
        self.inner.submit_email_job(job).await?;
        if let Some(engine) = self.engine.get() {
            let outcome = engine.on_job_result(&completed(&job.job_id), t0()).await?;
            self.outcomes.lock().unwrap().push(outcome);
        }
        Ok(())
    }
}

#[tokio::test]
async fn results_arriving_before_submit_returns_still_advance() {
    let database = Database::in_memory().await.unwrap();
    let mut runner = None;
    let h = harness_with(&database, |jobs| -> Arc<dyn JobRunner> {
        let wrapped = Arc::new(ReportsBeforeReturning {
            inner: jobs,
            engine: OnceLock::new(),
            outcomes: Mutex::default(),
        });
        runner = Some(Arc::clone(&wrapped));
        wrapped
    })
    .await;
    let runner = runner.unwrap();
    assert!(runner.engine.set(Arc::clone(&h.state.engine)).is_ok());

    h.active_sequence(
        "fast",
        TriggerConfig::Manual,
        SequenceSettings::default(),
        vec![email("hello", 1), wait_hours("pause", 2, 24)],
    )
    .await;
    let id = h.enroll("fast", "sub-1", t0()).await;

    let report = h.steps.sweep(t0()).await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(*runner.outcomes.lock().unwrap(), vec![CallbackOutcome::Advanced]);

    let moved_on = h.enrollment(id).await;
    assert_eq!(moved_on.current_step_id.as_deref(), Some("pause"));
    assert_eq!(moved_on.next_scheduled_at, Some(t0() + Duration::hours(24)));
    assert!(moved_on.claim_token.is_none());
    let executions = h.state.engine.enrollments().list_executions(id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Completed);

    let report = h.steps.sweep(t0() + Duration::hours(24)).await.unwrap();
    assert_eq!(report.completed, 1);
}

/// Never answers its first submission, like a worker that hangs mid-dispatch
struct StallsOnce {
    inner: Arc<InMemoryJobRunner>,
    stalled: AtomicBool,
}

#[async_trait]
impl JobRunner for StallsOnce {
    async fn submit_email_job(&self, job: &EmailJob) -> EngineResult<()> {
        if !self.stalled.swap(true, Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.submit_email_job(job).await
    }
}

#[tokio::test]
async fn abandoned_dispatch_is_reclaimed_after_the_lease() {
    let database = Database::in_memory().await.unwrap();
    let h = harness_with(&database, |jobs| -> Arc<dyn JobRunner> {
        Arc::new(StallsOnce {
            inner: jobs,
            stalled: AtomicBool::new(false),
        })
    })
    .await;
    h.active_sequence("stuck", TriggerConfig::Manual, SequenceSettings::default(), vec![email("only", 1)])
        .await;
    let id = h.enroll("stuck", "sub-1", t0()).await;

    let abandoned = tokio::time::timeout(std::time::Duration::from_millis(200), h.steps.sweep(t0())).await;
    assert!(abandoned.is_err(), "the first dispatch never returns");

    let stranded = h.enrollment(id).await;
    assert_eq!(stranded.current_step_id.as_deref(), Some("only"));
    assert_eq!(stranded.next_scheduled_at, Some(t0()));
    assert!(stranded.claim_token.is_some());
    let executions = h.state.engine.enrollments().list_executions(id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Executing);
    let job = executions[0].email_job_id.clone().unwrap();

    let within_lease = h.steps.sweep(t0() + Duration::seconds(LEASE_SECS - 1)).await.unwrap();
    assert_eq!(within_lease.claimed, 0);

    let after_lease = t0() + Duration::seconds(LEASE_SECS + 1);
    let report = h.steps.sweep(after_lease).await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.dispatched, 1);

    // same execution, same job id, retry budget untouched
    let executions = h.state.engine.enrollments().list_executions(id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].attempts, 1);
    assert_eq!(executions[0].email_job_id.as_deref(), Some(job.as_str()));
    assert_eq!(h.jobs.submitted().len(), 1);
    assert!(h.enrollment(id).await.next_scheduled_at.is_none());

    let outcome = h.state.engine.on_job_result(&completed(&job), after_lease).await.unwrap();
    assert_eq!(outcome, CallbackOutcome::Completed);
}

#[tokio::test]
async fn pause_missed_by_the_registry_still_refuses_enrollment() {
    let h = harness().await;
    h.active_sequence("racy", TriggerConfig::Manual, SequenceSettings::default(), vec![email("only", 1)])
        .await;
    // paused in storage by another instance; this registry still says active
    h.state
        .engine
        .sequences()
        .transition("racy", &[SequenceStatus::Active], SequenceStatus::Paused, t0())
        .await
        .unwrap();

    let outcome = h
        .state
        .engine
        .request_enrollment("racy", "sub-1", Map::new(), t0())
        .await
        .unwrap();

    assert!(!outcome.enrolled);
    assert_eq!(outcome.reason, Some(RejectReason::SequenceNotActive));
    let filter = EnrollmentFilter {
        sequence_id: Some("racy".into()),
        ..Default::default()
    };
    assert!(h.state.engine.enrollments().list(&filter).await.unwrap().is_empty());
}

#[tokio::test]
async fn a_lost_claim_records_no_skipped_steps() {
    let h = harness().await;
    let mut disabled = email("disabled", 1);
    disabled.active = false;
    h.active_sequence(
        "skipping",
        TriggerConfig::Manual,
        SequenceSettings::default(),
        vec![disabled, wait_hours("pause", 2, 1)],
    )
    .await;
    let id = h.enroll("skipping", "sub-1", t0()).await;

    let storage = h.state.engine.enrollments();
    let claimed = storage
        .claim_due(t0(), t0() + Duration::seconds(LEASE_SECS), "worker-a", 1)
        .await
        .unwrap()
        .remove(0);
    let mut impostor = claimed.clone();
    impostor.claim_token = Some("worker-b".into());

    let lost = h.state.engine.process_due(impostor, t0()).await.unwrap();
    assert_eq!(lost, DueOutcome::ClaimLost);
    assert!(storage.list_executions(id).await.unwrap().is_empty());

    let held = h.state.engine.process_due(claimed, t0()).await.unwrap();
    assert_eq!(held, DueOutcome::Advanced);
    let executions = storage.list_executions(id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Skipped);
}
