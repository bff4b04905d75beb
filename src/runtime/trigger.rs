//! Trigger evaluation
//!
//! Turns domain events into enrollment requests for every active sequence
//! whose trigger accepts them, and runs the periodic scan behind
//! `date_based` triggers. Manual and webhook triggers skip matching and call
//! `EnrollmentEngine::request_enrollment` directly.

use crate::enrollment::{EnrollmentFilter, EnrollmentOutcome};
use crate::error::EngineResult;
use crate::integrations::SubscriberDirectory;
use crate::runtime::engine::EnrollmentEngine;
use crate::sequence::types::TriggerConfig;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Event-driven trigger kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Subscription,
    TagAdded,
    TagRemoved,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Subscription => "subscription",
            EventKind::TagAdded => "tag_added",
            EventKind::TagRemoved => "tag_removed",
        }
    }
}

/// A domain event, e.g. `{ "kind": "tag_added", "subscriber_id": "s1", "payload": { "tag": "vip" } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub kind: EventKind,
    pub subscriber_id: String,
    #[serde(default)]
    pub payload: Value,
}

/// Per-sequence answer to an event
#[derive(Debug, Clone, Serialize)]
pub struct TriggerMatch {
    pub sequence_id: String,
    #[serde(flatten)]
    pub outcome: EnrollmentOutcome,
}

/// Whether `trigger` accepts an event of `kind` carrying `payload`
pub fn accepts(trigger: &TriggerConfig, kind: EventKind, payload: &Value) -> bool {
    let field = |name: &str| payload.get(name).and_then(Value::as_str);
    match (trigger, kind) {
        (TriggerConfig::Subscription { list_id: None }, EventKind::Subscription) => true,
        (TriggerConfig::Subscription { list_id: Some(list) }, EventKind::Subscription) => {
            field("list_id") == Some(list.as_str())
        }
        (TriggerConfig::TagAdded { tag }, EventKind::TagAdded)
        | (TriggerConfig::TagRemoved { tag }, EventKind::TagRemoved) => field("tag") == Some(tag.as_str()),
        _ => false,
    }
}

pub struct TriggerEvaluator {
    engine: Arc<EnrollmentEngine>,
    directory: Arc<dyn SubscriberDirectory>,
}

impl TriggerEvaluator {
    pub fn new(engine: Arc<EnrollmentEngine>, directory: Arc<dyn SubscriberDirectory>) -> Self {
        Self { engine, directory }
    }

    /// Request enrollment in every active sequence whose trigger accepts `event`
    pub async fn evaluate(&self, event: &TriggerEvent, now: DateTime<Utc>) -> EngineResult<Vec<TriggerMatch>> {
        let mut matches = Vec::new();
        let mut candidates = self.engine.registry().active_sequences();
        candidates.sort_by(|a, b| a.sequence.id.cmp(&b.sequence.id));

        for definition in candidates {
            if !accepts(&definition.sequence.trigger, event.kind, &event.payload) {
                continue;
            }

            let mut context = Map::new();
            context.insert("kind".into(), json!(event.kind.as_str()));
            context.insert("payload".into(), event.payload.clone());

            let outcome = self
                .engine
                .request_enrollment(&definition.sequence.id, &event.subscriber_id, context, now)
                .await?;
            matches.push(TriggerMatch {
                sequence_id: definition.sequence.id.clone(),
                outcome,
            });
        }

        tracing::debug!(
            "🎯 Event {} for {} matched {} sequences",
            event.kind.as_str(),
            event.subscriber_id,
            matches.len()
        );
        Ok(matches)
    }

    /// Enroll subscribers whose date field plus `offset_days` is today
    ///
    /// A subscriber already enrolled for the same anniversary date is not
    /// enrolled again, even when the sequence allows re-entry.
    pub async fn scan_date_triggers(&self, now: DateTime<Utc>) -> EngineResult<Vec<TriggerMatch>> {
        let today = now.date_naive();
        let mut matches = Vec::new();

        for definition in self.engine.registry().active_sequences() {
            let TriggerConfig::DateBased { field, offset_days } = &definition.sequence.trigger else {
                continue;
            };
            let target = today - Duration::days(i64::from(*offset_days));
            let date = target.to_string();

            for subscriber_id in self.directory.subscribers_with_date(field, target).await? {
                if self.already_enrolled_for(&definition.sequence.id, &subscriber_id, &date).await? {
                    continue;
                }

                let mut context = Map::new();
                context.insert("kind".into(), json!("date_based"));
                context.insert("field".into(), json!(field));
                context.insert("date".into(), json!(date));

                let outcome = self
                    .engine
                    .request_enrollment(&definition.sequence.id, &subscriber_id, context, now)
                    .await?;
                matches.push(TriggerMatch {
                    sequence_id: definition.sequence.id.clone(),
                    outcome,
                });
            }
        }

        let enrolled = matches.iter().filter(|m| m.outcome.enrolled).count();
        tracing::info!("📅 Date trigger scan for {}: {} enrolled of {} matched", today, enrolled, matches.len());
        Ok(matches)
    }

    async fn already_enrolled_for(&self, sequence_id: &str, subscriber_id: &str, date: &str) -> EngineResult<bool> {
        let previous = self
            .engine
            .enrollments()
            .list(&EnrollmentFilter {
                sequence_id: Some(sequence_id.to_string()),
                subscriber_id: Some(subscriber_id.to_string()),
                ..Default::default()
            })
            .await?;

        Ok(previous.iter().any(|enrollment| {
            enrollment
                .metadata
                .get("trigger")
                .and_then(|trigger| trigger.get("date"))
                .and_then(Value::as_str)
                == Some(date)
        }))
    }
}
