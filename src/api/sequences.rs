//! Sequence management REST API endpoints
//!
//! Definitions are created as drafts, edited while draft or paused, and moved
//! through their lifecycle with explicit action endpoints. Every change
//! reloads the sequence into the registry.

use crate::api::{api_error, client_error, ApiResult, AppState};
use crate::enrollment::EnrollmentOutcome;
use crate::error::EngineError;
use crate::sequence::types::{
    Sequence, SequenceDefinition, SequenceSettings, SequenceStats, SequenceStatus, Step, TriggerConfig,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Response for sequence creation and lifecycle operations
#[derive(Debug, Serialize)]
pub struct SequenceResponse {
    pub id: String,
    pub status: SequenceStatus,
    pub message: String,
}

/// Body of `POST /api/sequences`
#[derive(Debug, Deserialize)]
pub struct CreateSequenceRequest {
    pub id: String,
    pub owner: String,
    pub name: String,
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub settings: SequenceSettings,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
pub struct ReplaceStepsRequest {
    pub steps: Vec<Step>,
}

/// Body of a manual enrollment
#[derive(Debug, Deserialize)]
pub struct EnrollRequest {
    pub subscriber_id: String,
    #[serde(default)]
    pub context: Map<String, Value>,
}

pub fn create_sequence_routes() -> Router<AppState> {
    Router::new()
        .route("/api/sequences", post(create_sequence).get(list_sequences))
        .route("/api/sequences/{id}", get(get_sequence).delete(delete_sequence))
        .route("/api/sequences/{id}/steps", put(replace_steps))
        .route("/api/sequences/{id}/activate", post(activate_sequence))
        .route("/api/sequences/{id}/pause", post(pause_sequence))
        .route("/api/sequences/{id}/resume", post(resume_sequence))
        .route("/api/sequences/{id}/complete", post(complete_sequence))
        .route("/api/sequences/{id}/stats", get(sequence_stats))
        .route("/api/sequences/{id}/enrollments", post(enroll_subscriber))
}

/// Create a draft sequence, optionally with its steps
///
/// POST /api/sequences
async fn create_sequence(
    State(state): State<AppState>,
    Json(payload): Json<CreateSequenceRequest>,
) -> ApiResult<SequenceResponse> {
    if payload.id.trim().is_empty() || payload.name.trim().is_empty() {
        return Err(client_error(StatusCode::BAD_REQUEST, "sequence id and name are required"));
    }

    let now = Utc::now();
    let sequence = Sequence {
        id: payload.id.clone(),
        owner: payload.owner,
        name: payload.name,
        status: SequenceStatus::Draft,
        trigger: payload.trigger,
        settings: payload.settings,
        stats: SequenceStats::default(),
        created_at: now,
        updated_at: now,
    };

    let sequences = state.engine.sequences();
    sequences
        .create_sequence(&sequence)
        .await
        .map_err(|e| api_error("Failed to create sequence", e))?;

    if !payload.steps.is_empty() {
        if let Err(e) = state.engine.update_steps(&sequence.id, payload.steps).await {
            // keep creation atomic from the caller's point of view
            if let Err(rollback) = sequences.delete_sequence(&sequence.id).await {
                tracing::error!("❌ Failed to roll back sequence {}: {}", sequence.id, rollback);
            }
            return Err(api_error("Failed to store steps", e));
        }
    }

    tracing::info!("🔥 Created sequence: {} ({})", sequence.id, sequence.name);
    Ok(Json(SequenceResponse {
        id: sequence.id,
        status: SequenceStatus::Draft,
        message: format!("Sequence '{}' created as draft", sequence.name),
    }))
}

/// GET /api/sequences
async fn list_sequences(State(state): State<AppState>) -> ApiResult<Value> {
    let sequences = state
        .engine
        .sequences()
        .list_sequences()
        .await
        .map_err(|e| api_error("Failed to list sequences", e))?;
    Ok(Json(json!({ "sequences": sequences })))
}

/// Sequence with its ordered steps
///
/// GET /api/sequences/{id}
async fn get_sequence(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<SequenceDefinition> {
    state
        .engine
        .sequences()
        .load_definition(&id)
        .await
        .map_err(|e| api_error("Failed to load sequence", e))?
        .map(Json)
        .ok_or_else(|| api_error("Failed to load sequence", EngineError::not_found(format!("sequence '{}'", id))))
}

/// DELETE /api/sequences/{id}; enrollments and executions cascade
async fn delete_sequence(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Value> {
    match state.engine.delete_sequence(&id).await {
        Ok(true) => {
            tracing::info!("🗑️ Deleted sequence: {}", id);
            Ok(Json(json!({ "message": "Sequence deleted successfully" })))
        }
        Ok(false) => Err(api_error("Delete", EngineError::not_found(format!("sequence '{}'", id)))),
        Err(e) => Err(api_error("Failed to delete sequence", e)),
    }
}

/// PUT /api/sequences/{id}/steps
async fn replace_steps(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<ReplaceStepsRequest>,
) -> ApiResult<Value> {
    let count = payload.steps.len();
    state
        .engine
        .update_steps(&id, payload.steps)
        .await
        .map_err(|e| api_error("Failed to replace steps", e))?;
    Ok(Json(json!({ "id": id, "steps": count })))
}

/// POST /api/sequences/{id}/activate
async fn activate_sequence(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<SequenceResponse> {
    state
        .engine
        .activate_sequence(&id, Utc::now())
        .await
        .map_err(|e| api_error("Failed to activate sequence", e))?;
    Ok(Json(SequenceResponse {
        message: format!("Sequence '{}' is active", id),
        id,
        status: SequenceStatus::Active,
    }))
}

/// POST /api/sequences/{id}/pause
async fn pause_sequence(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<SequenceResponse> {
    let paused = state
        .engine
        .pause_sequence(&id, Utc::now())
        .await
        .map_err(|e| api_error("Failed to pause sequence", e))?;
    Ok(Json(SequenceResponse {
        message: format!("Sequence '{}' paused, {} enrollments held", id, paused),
        id,
        status: SequenceStatus::Paused,
    }))
}

/// POST /api/sequences/{id}/resume
async fn resume_sequence(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<SequenceResponse> {
    let resumed = state
        .engine
        .resume_sequence(&id, Utc::now())
        .await
        .map_err(|e| api_error("Failed to resume sequence", e))?;
    Ok(Json(SequenceResponse {
        message: format!("Sequence '{}' resumed, {} enrollments released", id, resumed),
        id,
        status: SequenceStatus::Active,
    }))
}

/// POST /api/sequences/{id}/complete
async fn complete_sequence(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<SequenceResponse> {
    state
        .engine
        .complete_sequence(&id, Utc::now())
        .await
        .map_err(|e| api_error("Failed to complete sequence", e))?;
    Ok(Json(SequenceResponse {
        message: format!("Sequence '{}' completed, existing enrollments drain", id),
        id,
        status: SequenceStatus::Completed,
    }))
}

/// Freshly recomputed stats
///
/// GET /api/sequences/{id}/stats
async fn sequence_stats(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<SequenceStats> {
    state
        .stats
        .recompute(&id, Utc::now())
        .await
        .map(Json)
        .map_err(|e| api_error("Failed to compute stats", e))
}

/// Manual enrollment
///
/// POST /api/sequences/{id}/enrollments
/// Body: { "subscriber_id": "...", "context": { ... } }
async fn enroll_subscriber(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<EnrollRequest>,
) -> ApiResult<EnrollmentOutcome> {
    let mut context = Map::new();
    context.insert("kind".into(), json!("manual"));
    context.insert("payload".into(), Value::Object(payload.context));

    state
        .engine
        .request_enrollment(&id, &payload.subscriber_id, context, Utc::now())
        .await
        .map(Json)
        .map_err(|e| api_error("Failed to enroll subscriber", e))
}
