//! reqwest-backed adapters for the external collaborators
//!
//! Wire contract (JSON everywhere):
//! - job runner: `POST {base}/jobs/email` with the job, any 2xx accepts it
//! - directory: `GET {base}/subscribers/{id}` -> `{ "unsubscribed": bool, "segments": [...] }`,
//!   `GET {base}/subscribers?date_field=..&date=YYYY-MM-DD` -> `{ "subscribers": [...] }`
//! - actions: `POST {base}/subscribers/{id}/tags`, `DELETE {base}/subscribers/{id}/tags/{tag}`

use crate::error::{EngineError, EngineResult};
use crate::integrations::{ActionHandler, EmailJob, JobRunner, SubscriberDirectory};
use crate::sequence::types::ActionConfig;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::time::Duration;

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_default()
}

fn integration_error(context: &str, err: impl std::fmt::Display) -> EngineError {
    EngineError::Integration(format!("{}: {}", context, err))
}

async fn checked(response: reqwest::Response, context: &str) -> EngineResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(EngineError::Integration(format!("{} returned {}: {}", context, status, body)))
    }
}

/// Job runner reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpJobRunner {
    client: reqwest::Client,
    base_url: String,
}

impl HttpJobRunner {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: client(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl JobRunner for HttpJobRunner {
    async fn submit_email_job(&self, job: &EmailJob) -> EngineResult<()> {
        let url = format!("{}/jobs/email", self.base_url);
        tracing::debug!("📨 Submitting email job {} for enrollment {} to {}", job.job_id, job.enrollment_id, url);

        let response = self
            .client
            .post(&url)
            .json(job)
            .send()
            .await
            .map_err(|e| integration_error("job runner request failed", e))?;
        checked(response, "job runner").await?;
        Ok(())
    }
}

/// Subscriber directory reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpSubscriberDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSubscriberDirectory {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: client(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn subscriber(&self, subscriber_id: &str) -> EngineResult<SubscriberRecord> {
        let url = format!("{}/subscribers/{}", self.base_url, subscriber_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| integration_error("directory request failed", e))?;
        checked(response, "directory")
            .await?
            .json()
            .await
            .map_err(|e| integration_error("directory response", e))
    }
}

#[derive(Deserialize)]
struct SubscriberRecord {
    #[serde(default)]
    unsubscribed: bool,
    #[serde(default)]
    segments: HashSet<String>,
}

#[derive(Deserialize)]
struct SubscriberList {
    subscribers: Vec<String>,
}

#[async_trait]
impl SubscriberDirectory for HttpSubscriberDirectory {
    async fn get_subscriber_segments(&self, subscriber_id: &str) -> EngineResult<HashSet<String>> {
        Ok(self.subscriber(subscriber_id).await?.segments)
    }

    async fn is_unsubscribed(&self, subscriber_id: &str) -> EngineResult<bool> {
        Ok(self.subscriber(subscriber_id).await?.unsubscribed)
    }

    async fn subscribers_with_date(&self, field: &str, date: NaiveDate) -> EngineResult<Vec<String>> {
        let url = format!("{}/subscribers", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("date_field", field.to_string()), ("date", date.to_string())])
            .send()
            .await
            .map_err(|e| integration_error("directory request failed", e))?;
        let list: SubscriberList = checked(response, "directory")
            .await?
            .json()
            .await
            .map_err(|e| integration_error("directory response", e))?;
        Ok(list.subscribers)
    }
}

/// Action endpoint reached over HTTP; webhook actions call their own URL
#[derive(Debug, Clone)]
pub struct HttpActionHandler {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl HttpActionHandler {
    /// `base_url` serves tag changes; without it only webhook actions work
    pub fn new(base_url: Option<&str>) -> Self {
        Self {
            client: client(),
            base_url: base_url.map(|url| url.trim_end_matches('/').to_string()),
        }
    }

    fn tags_url(&self, subscriber_id: &str) -> EngineResult<String> {
        let base = self
            .base_url
            .as_ref()
            .ok_or_else(|| EngineError::Integration("no action endpoint configured".into()))?;
        Ok(format!("{}/subscribers/{}/tags", base, subscriber_id))
    }
}

#[async_trait]
impl ActionHandler for HttpActionHandler {
    async fn perform(
        &self,
        subscriber_id: &str,
        action: &ActionConfig,
        metadata: &Map<String, Value>,
    ) -> EngineResult<Value> {
        let response = match action {
            ActionConfig::AddTag { tag } => self
                .client
                .post(self.tags_url(subscriber_id)?)
                .json(&json!({ "tag": tag }))
                .send()
                .await,
            ActionConfig::RemoveTag { tag } => self
                .client
                .delete(format!("{}/{}", self.tags_url(subscriber_id)?, tag))
                .send()
                .await,
            ActionConfig::Webhook { url } => self
                .client
                .post(url)
                .json(&json!({ "subscriber_id": subscriber_id, "metadata": metadata }))
                .send()
                .await,
            ActionConfig::SetMetadata { .. } => {
                return Err(EngineError::Integration("set_metadata is applied by the engine".into()));
            }
        }
        .map_err(|e| integration_error("action request failed", e))?;

        let status = checked(response, "action endpoint").await?.status();
        Ok(json!({ "status": status.as_u16() }))
    }
}
