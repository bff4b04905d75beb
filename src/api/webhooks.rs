//! Inbound trigger and callback endpoints
//!
//! - `POST /api/events`: domain events matched against active sequences
//! - `POST /webhook/{sequence_id}`: webhook trigger of one sequence
//! - `POST /api/jobs/results`: job-runner completion callback

use crate::api::{api_error, client_error, ApiResult, AppState};
use crate::enrollment::EnrollmentOutcome;
use crate::integrations::JobResult;
use crate::runtime::{CallbackOutcome, TriggerEvent};
use crate::sequence::types::TriggerConfig;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::post,
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Header carrying the shared secret of a webhook trigger
pub const SECRET_HEADER: &str = "x-dripway-secret";

#[derive(Debug, Deserialize)]
pub struct WebhookRequest {
    pub subscriber_id: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Serialize)]
pub struct JobResultResponse {
    pub job_id: String,
    pub outcome: CallbackOutcome,
}

pub fn create_webhook_routes() -> Router<AppState> {
    Router::new()
        .route("/api/events", post(receive_event))
        .route("/webhook/{sequence_id}", post(execute_webhook))
        .route("/api/jobs/results", post(receive_job_result))
}

/// POST /api/events
/// Body: { "kind": "tag_added", "subscriber_id": "...", "payload": { "tag": "vip" } }
async fn receive_event(State(state): State<AppState>, Json(event): Json<TriggerEvent>) -> ApiResult<Value> {
    tracing::info!("📥 Event {} for subscriber {}", event.kind.as_str(), event.subscriber_id);

    let matches = state
        .triggers
        .evaluate(&event, Utc::now())
        .await
        .map_err(|e| api_error("Failed to evaluate event", e))?;
    Ok(Json(json!({ "matches": matches })))
}

/// Enroll through a sequence's webhook trigger
///
/// POST /webhook/{sequence_id}
/// Body: { "subscriber_id": "...", "data": { ... } }
async fn execute_webhook(
    State(state): State<AppState>,
    Path(sequence_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<WebhookRequest>,
) -> ApiResult<EnrollmentOutcome> {
    tracing::info!("📥 Webhook request received for sequence {}", sequence_id);

    let definition = state
        .engine
        .registry()
        .get_or_load(&sequence_id)
        .await
        .map_err(|e| api_error("Failed to load sequence", e))?;

    let expected_secret = match definition.as_deref().map(|def| &def.sequence.trigger) {
        Some(TriggerConfig::Webhook { secret }) => secret.clone(),
        _ => {
            tracing::warn!("❌ Webhook called for sequence without webhook trigger: {}", sequence_id);
            return Err(client_error(StatusCode::NOT_FOUND, "no webhook trigger for this sequence"));
        }
    };

    if let Some(expected) = expected_secret {
        let presented = headers.get(SECRET_HEADER).and_then(|value| value.to_str().ok());
        if presented != Some(expected.as_str()) {
            tracing::warn!("❌ Webhook secret mismatch for sequence {}", sequence_id);
            return Err(client_error(StatusCode::UNAUTHORIZED, "invalid webhook secret"));
        }
    }

    let mut context = Map::new();
    context.insert("kind".into(), json!("webhook"));
    context.insert("payload".into(), payload.data);

    state
        .engine
        .request_enrollment(&sequence_id, &payload.subscriber_id, context, Utc::now())
        .await
        .map(Json)
        .map_err(|e| api_error("Failed to enroll from webhook", e))
}

/// POST /api/jobs/results
/// Body: { "job_id": "...", "status": "completed" | "failed", "provider_message_id": "...", "error": "..." }
async fn receive_job_result(
    State(state): State<AppState>,
    Json(result): Json<JobResult>,
) -> ApiResult<JobResultResponse> {
    let outcome = state
        .engine
        .on_job_result(&result, Utc::now())
        .await
        .map_err(|e| api_error("Failed to apply job result", e))?;

    tracing::debug!("📬 Job {} result applied: {:?}", result.job_id, outcome);
    Ok(Json(JobResultResponse {
        job_id: result.job_id,
        outcome,
    }))
}
