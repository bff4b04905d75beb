//! In-process adapters
//!
//! Used when no external endpoint is configured and throughout the test
//! suites. State sits behind `std::sync` locks that are never held across
//! an await point.

use crate::error::{EngineError, EngineResult};
use crate::integrations::{ActionHandler, EmailJob, JobRunner, SubscriberDirectory};
use crate::sequence::types::ActionConfig;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};

/// Records every submitted job; can be told to refuse the next N submissions
#[derive(Debug, Default)]
pub struct InMemoryJobRunner {
    submitted: Mutex<Vec<(String, EmailJob)>>,
    failures: AtomicU32,
}

impl InMemoryJobRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` submissions fail with an integration error
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Submitted jobs in order, with their correlation ids
    pub fn submitted(&self) -> Vec<(String, EmailJob)> {
        self.submitted.lock().map(|jobs| jobs.clone()).unwrap_or_default()
    }

    pub fn last_job_id(&self) -> Option<String> {
        self.submitted().last().map(|(id, _)| id.clone())
    }
}

#[async_trait]
impl JobRunner for InMemoryJobRunner {
    async fn submit_email_job(&self, job: &EmailJob) -> EngineResult<()> {
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(EngineError::Integration("job runner unavailable".into()));
        }

        self.submitted
            .lock()
            .map_err(|_| EngineError::Integration("job runner state poisoned".into()))?
            .push((job.job_id.clone(), job.clone()));

        tracing::debug!("📨 Accepted in-memory email job {} for {}", job.job_id, job.subscriber_id);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DirectoryState {
    segments: HashMap<String, HashSet<String>>,
    unsubscribed: HashSet<String>,
    /// field -> (subscriber -> date)
    dates: HashMap<String, HashMap<String, NaiveDate>>,
}

/// Mutable subscriber directory
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    state: RwLock<DirectoryState>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, DirectoryState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, DirectoryState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_to_segment(&self, subscriber_id: &str, segment_id: &str) {
        self.write()
            .segments
            .entry(subscriber_id.to_string())
            .or_default()
            .insert(segment_id.to_string());
    }

    pub fn remove_from_segment(&self, subscriber_id: &str, segment_id: &str) {
        if let Some(segments) = self.write().segments.get_mut(subscriber_id) {
            segments.remove(segment_id);
        }
    }

    pub fn unsubscribe(&self, subscriber_id: &str) {
        self.write().unsubscribed.insert(subscriber_id.to_string());
    }

    pub fn set_date(&self, subscriber_id: &str, field: &str, date: NaiveDate) {
        self.write()
            .dates
            .entry(field.to_string())
            .or_default()
            .insert(subscriber_id.to_string(), date);
    }
}

#[async_trait]
impl SubscriberDirectory for InMemoryDirectory {
    async fn get_subscriber_segments(&self, subscriber_id: &str) -> EngineResult<HashSet<String>> {
        Ok(self.read().segments.get(subscriber_id).cloned().unwrap_or_default())
    }

    async fn is_unsubscribed(&self, subscriber_id: &str) -> EngineResult<bool> {
        Ok(self.read().unsubscribed.contains(subscriber_id))
    }

    async fn subscribers_with_date(&self, field: &str, date: NaiveDate) -> EngineResult<Vec<String>> {
        let state = self.read();
        let mut matches: Vec<String> = state
            .dates
            .get(field)
            .map(|by_subscriber| {
                by_subscriber
                    .iter()
                    .filter(|(_, d)| **d == date)
                    .map(|(subscriber, _)| subscriber.clone())
                    .collect()
            })
            .unwrap_or_default();
        matches.sort();
        Ok(matches)
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> EngineError {
    EngineError::Integration("action state poisoned".into())
}

/// Applies tag actions to its own tag table and records webhook calls
#[derive(Debug, Default)]
pub struct InMemoryActionHandler {
    tags: Mutex<HashMap<String, HashSet<String>>>,
    webhooks: Mutex<Vec<(String, String)>>,
    failures: AtomicU32,
}

impl InMemoryActionHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn tags(&self, subscriber_id: &str) -> HashSet<String> {
        self.tags
            .lock()
            .ok()
            .and_then(|tags| tags.get(subscriber_id).cloned())
            .unwrap_or_default()
    }

    /// (url, subscriber_id) pairs in call order
    pub fn webhook_calls(&self) -> Vec<(String, String)> {
        self.webhooks.lock().map(|calls| calls.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ActionHandler for InMemoryActionHandler {
    async fn perform(
        &self,
        subscriber_id: &str,
        action: &ActionConfig,
        _metadata: &Map<String, Value>,
    ) -> EngineResult<Value> {
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(EngineError::Integration("action endpoint unavailable".into()));
        }

        match action {
            ActionConfig::AddTag { tag } => {
                self.tags
                    .lock()
                    .map_err(poisoned)?
                    .entry(subscriber_id.to_string())
                    .or_default()
                    .insert(tag.clone());
                Ok(json!({ "tag_added": tag }))
            }
            ActionConfig::RemoveTag { tag } => {
                if let Some(tags) = self.tags.lock().map_err(poisoned)?.get_mut(subscriber_id) {
                    tags.remove(tag);
                }
                Ok(json!({ "tag_removed": tag }))
            }
            ActionConfig::Webhook { url } => {
                self.webhooks
                    .lock()
                    .map_err(poisoned)?
                    .push((url.clone(), subscriber_id.to_string()));
                Ok(json!({ "status": 200 }))
            }
            ActionConfig::SetMetadata { .. } => {
                Err(EngineError::Integration("set_metadata is applied by the engine".into()))
            }
        }
    }
}
