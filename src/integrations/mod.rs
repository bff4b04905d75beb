//! External collaborator ports
//!
//! The engine talks to the outside world through three narrow traits:
//! - `JobRunner`: hands off email sends, results come back via `on_job_result`
//!   keyed by the `job_id` the engine put on the job
//! - `SubscriberDirectory`: read-only identity and segment membership
//! - `ActionHandler`: synchronous side effects of action steps (tags, webhooks)
//!
//! `http` holds reqwest-backed adapters, `memory` in-process ones used for
//! local runs and tests.

pub mod http;
pub mod memory;

use crate::config::IntegrationsConfig;
use crate::error::EngineResult;
use crate::sequence::types::ActionConfig;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

pub use http::{HttpActionHandler, HttpJobRunner, HttpSubscriberDirectory};
pub use memory::{InMemoryActionHandler, InMemoryDirectory, InMemoryJobRunner};

/// Email send request handed to the job runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailJob {
    /// Correlation id, assigned and persisted by the engine before submission
    pub job_id: String,
    pub enrollment_id: Uuid,
    pub step_id: String,
    pub subscriber_id: String,
    pub subject: String,
    pub template_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    /// Enrollment metadata, exposed to the template
    pub variables: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Failed,
}

/// Completion notification reported by the job runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub provider_message_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Submit an email send; its result must be reported under `job.job_id`
    ///
    /// The result may arrive before this call returns.
    async fn submit_email_job(&self, job: &EmailJob) -> EngineResult<()>;
}

#[async_trait]
pub trait SubscriberDirectory: Send + Sync {
    async fn get_subscriber_segments(&self, subscriber_id: &str) -> EngineResult<HashSet<String>>;

    async fn is_unsubscribed(&self, subscriber_id: &str) -> EngineResult<bool>;

    /// Subscribers whose date attribute `field` falls on `date`
    async fn subscribers_with_date(&self, field: &str, date: NaiveDate) -> EngineResult<Vec<String>>;
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Perform an external action step; the returned value becomes the execution result
    async fn perform(
        &self,
        subscriber_id: &str,
        action: &ActionConfig,
        metadata: &Map<String, Value>,
    ) -> EngineResult<Value>;
}

/// The three ports wired into the engine
#[derive(Clone)]
pub struct Integrations {
    pub jobs: Arc<dyn JobRunner>,
    pub directory: Arc<dyn SubscriberDirectory>,
    pub actions: Arc<dyn ActionHandler>,
}

impl Integrations {
    /// HTTP adapters where a URL is configured, in-memory ones elsewhere
    pub fn from_config(config: &IntegrationsConfig) -> Self {
        let jobs: Arc<dyn JobRunner> = match &config.job_runner_url {
            Some(url) => Arc::new(HttpJobRunner::new(url)),
            None => {
                tracing::warn!("⚠️ No job runner configured, email jobs stay in memory");
                Arc::new(InMemoryJobRunner::new())
            }
        };
        let directory: Arc<dyn SubscriberDirectory> = match &config.directory_url {
            Some(url) => Arc::new(HttpSubscriberDirectory::new(url)),
            None => {
                tracing::warn!("⚠️ No subscriber directory configured, using an empty in-memory one");
                Arc::new(InMemoryDirectory::new())
            }
        };
        let actions: Arc<dyn ActionHandler> = Arc::new(HttpActionHandler::new(config.actions_url.as_deref()));

        Self { jobs, directory, actions }
    }
}
