//! Step scheduler and background jobs
//!
//! `StepScheduler::sweep` is one unit of scheduling work: claim a bounded
//! batch of due enrollments under a fresh lease token and hand each one to the
//! engine once. Any number of instances may sweep the same database; the
//! claim UPDATE guarantees each due enrollment is processed by one of them.
//!
//! `SchedulerService` drives the sweep and the periodic maintenance jobs
//! (date trigger scan, stats projection, registry refresh) with
//! tokio-cron-scheduler.

use crate::config::SchedulerConfig;
use crate::enrollment::EnrollmentStorage;
use crate::error::EngineResult;
use crate::runtime::engine::{DueOutcome, EnrollmentEngine};
use crate::runtime::stats::StatsAggregator;
use crate::runtime::trigger::TriggerEvaluator;
use crate::sequence::SequenceRegistry;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// Tally of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub claimed: usize,
    pub advanced: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub exited: usize,
    pub deferred: usize,
    pub released: usize,
    pub claims_lost: usize,
    pub errors: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: DueOutcome) {
        match outcome {
            DueOutcome::Advanced => self.advanced += 1,
            DueOutcome::Dispatched => self.dispatched += 1,
            DueOutcome::Completed => self.completed += 1,
            DueOutcome::Exited(_) => self.exited += 1,
            DueOutcome::Deferred => self.deferred += 1,
            DueOutcome::Released => self.released += 1,
            DueOutcome::ClaimLost => self.claims_lost += 1,
        }
    }
}

pub struct StepScheduler {
    enrollments: EnrollmentStorage,
    engine: Arc<EnrollmentEngine>,
    batch_size: u32,
    lease: Duration,
}

impl StepScheduler {
    pub fn new(engine: Arc<EnrollmentEngine>, batch_size: u32, lease_secs: u64) -> Self {
        Self {
            enrollments: engine.enrollments().clone(),
            engine,
            batch_size,
            lease: Duration::seconds(i64::try_from(lease_secs).unwrap_or(i64::MAX / 1000)),
        }
    }

    /// Claim and process up to `batch_size` enrollments due at `now`
    pub async fn sweep(&self, now: DateTime<Utc>) -> EngineResult<SweepReport> {
        let token = Uuid::new_v4().to_string();
        let claimed = self
            .enrollments
            .claim_due(now, now + self.lease, &token, self.batch_size)
            .await?;

        let mut report = SweepReport {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }
        tracing::debug!("🧹 Sweep {} claimed {} enrollments", token, claimed.len());

        for enrollment in claimed {
            let id = enrollment.id;
            match self.engine.process_due(enrollment, now).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    tracing::error!("❌ Processing enrollment {} failed: {}", id, e);
                    report.errors += 1;
                    if let Err(release) = self.enrollments.release_claim(id, &token).await {
                        tracing::error!("❌ Could not release claim on {}: {}", id, release);
                    }
                }
            }
        }

        tracing::info!(
            "✅ Sweep done: {} claimed, {} dispatched, {} completed, {} exited, {} lost, {} errors",
            report.claimed,
            report.dispatched,
            report.completed,
            report.exited,
            report.claims_lost,
            report.errors
        );
        Ok(report)
    }
}

/// Background driver for sweeps and maintenance jobs
pub struct SchedulerService {
    scheduler: Arc<RwLock<JobScheduler>>,
    steps: Arc<StepScheduler>,
    triggers: Arc<TriggerEvaluator>,
    stats: Arc<StatsAggregator>,
    registry: Arc<SequenceRegistry>,
    config: SchedulerConfig,
}

impl SchedulerService {
    pub async fn new(
        steps: Arc<StepScheduler>,
        triggers: Arc<TriggerEvaluator>,
        stats: Arc<StatsAggregator>,
        registry: Arc<SequenceRegistry>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;

        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            steps,
            triggers,
            stats,
            registry,
            config,
        })
    }

    /// Register every job and start ticking
    pub async fn start(&self) -> Result<()> {
        tracing::info!("⏰ Starting scheduler service");

        let jobs = vec![
            self.sweep_job()?,
            self.date_scan_job()?,
            self.stats_job()?,
            self.refresh_job()?,
        ];
        {
            let scheduler = self.scheduler.write().await;
            for job in jobs {
                scheduler.add(job).await?;
            }
            scheduler.start().await?;
        }

        tracing::info!(
            "✅ Scheduler started: sweep every {}s, date scan '{}', stats '{}'",
            self.config.sweep_interval_secs,
            self.config.date_scan_cron,
            self.config.stats_cron
        );
        Ok(())
    }

    fn sweep_job(&self) -> Result<Job> {
        let steps = Arc::clone(&self.steps);
        let every = std::time::Duration::from_secs(self.config.sweep_interval_secs.max(1));

        Ok(Job::new_repeated_async(every, move |_uuid, _l| {
            let steps = Arc::clone(&steps);
            Box::pin(async move {
                if let Err(e) = steps.sweep(Utc::now()).await {
                    tracing::error!("❌ Sweep failed: {}", e);
                }
            })
        })?)
    }

    fn date_scan_job(&self) -> Result<Job> {
        let triggers = Arc::clone(&self.triggers);

        Ok(Job::new_async(self.config.date_scan_cron.as_str(), move |_uuid, _l| {
            let triggers = Arc::clone(&triggers);
            Box::pin(async move {
                if let Err(e) = triggers.scan_date_triggers(Utc::now()).await {
                    tracing::error!("❌ Date trigger scan failed: {}", e);
                }
            })
        })?)
    }

    fn stats_job(&self) -> Result<Job> {
        let stats = Arc::clone(&self.stats);

        Ok(Job::new_async(self.config.stats_cron.as_str(), move |_uuid, _l| {
            let stats = Arc::clone(&stats);
            Box::pin(async move {
                if let Err(e) = stats.recompute_all(Utc::now()).await {
                    tracing::error!("❌ Stats projection failed: {}", e);
                }
            })
        })?)
    }

    fn refresh_job(&self) -> Result<Job> {
        let registry = Arc::clone(&self.registry);
        let every = std::time::Duration::from_secs(self.config.registry_refresh_secs.max(1));

        Ok(Job::new_repeated_async(every, move |_uuid, _l| {
            let registry = Arc::clone(&registry);
            Box::pin(async move {
                if let Err(e) = registry.refresh().await {
                    tracing::error!("❌ Registry refresh failed: {}", e);
                }
            })
        })?)
    }
}
