//! Enrollment operator endpoints
//!
//! Listing, inspection with execution history, force-exit and replay of a
//! failed step.

use crate::api::{api_error, ApiResult, AppState};
use crate::enrollment::{Enrollment, EnrollmentFilter, EnrollmentOutcome};
use crate::error::EngineError;
use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

pub fn create_enrollment_routes() -> Router<AppState> {
    Router::new()
        .route("/api/enrollments", get(list_enrollments))
        .route("/api/enrollments/{id}", get(get_enrollment))
        .route("/api/enrollments/{id}/exit", post(exit_enrollment))
        .route("/api/enrollments/{id}/replay", post(replay_enrollment))
}

/// GET /api/enrollments?sequence_id=&status=&subscriber_id=&limit=
async fn list_enrollments(
    State(state): State<AppState>,
    Query(filter): Query<EnrollmentFilter>,
) -> ApiResult<Value> {
    let enrollments = state
        .engine
        .enrollments()
        .list(&filter)
        .await
        .map_err(|e| api_error("Failed to list enrollments", e))?;
    Ok(Json(json!({ "enrollments": enrollments })))
}

/// Enrollment plus its execution history, oldest first
///
/// GET /api/enrollments/{id}
async fn get_enrollment(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Value> {
    let storage = state.engine.enrollments();
    let enrollment = storage
        .get(id)
        .await
        .map_err(|e| api_error("Failed to load enrollment", e))?
        .ok_or_else(|| api_error("Lookup", EngineError::not_found(format!("enrollment '{}'", id))))?;
    let executions = storage
        .list_executions(id)
        .await
        .map_err(|e| api_error("Failed to load executions", e))?;

    Ok(Json(json!({ "enrollment": enrollment, "executions": executions })))
}

/// POST /api/enrollments/{id}/exit
async fn exit_enrollment(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Enrollment> {
    state
        .engine
        .force_exit(id, Utc::now())
        .await
        .map(Json)
        .map_err(|e| api_error("Failed to exit enrollment", e))
}

/// POST /api/enrollments/{id}/replay
async fn replay_enrollment(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<EnrollmentOutcome> {
    state
        .engine
        .replay_failed_step(id, Utc::now())
        .await
        .map(Json)
        .map_err(|e| api_error("Failed to replay enrollment", e))
}
