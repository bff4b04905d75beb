//! HTTP API layer
//!
//! - Sequence management and lifecycle (`/api/sequences/*`)
//! - Enrollment operator surface (`/api/enrollments/*`)
//! - Inbound triggers and job-runner callbacks (`/api/events`, `/webhook/*`, `/api/jobs/results`)

pub mod enrollments;

pub mod sequences;

pub mod webhooks;

use crate::error::EngineError;
use crate::runtime::{EnrollmentEngine, StatsAggregator, TriggerEvaluator};
use axum::{http::StatusCode, response::Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

pub use enrollments::create_enrollment_routes;
pub use sequences::create_sequence_routes;
pub use webhooks::create_webhook_routes;

/// Shared handles for every handler
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<EnrollmentEngine>,
    pub triggers: Arc<TriggerEvaluator>,
    pub stats: Arc<StatsAggregator>,
}

/// Error half of every handler result: status plus `{ "error": "..." }`
pub type ApiError = (StatusCode, Json<Value>);

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// 400 invalid definition, 404 not found, 409 conflict or bad transition, 500 otherwise
pub fn error_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::InvalidSequenceDefinition(_) => StatusCode::BAD_REQUEST,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Conflict(_) | EngineError::InvalidTransition(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn api_error(context: &str, err: EngineError) -> ApiError {
    let status = error_status(&err);
    if status.is_server_error() {
        tracing::error!("❌ {}: {}", context, err);
    } else {
        tracing::debug!("{}: {}", context, err);
    }
    (status, Json(json!({ "error": err.to_string() })))
}

pub(crate) fn client_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

/// All API routes with state applied
pub fn create_api_routes(state: AppState) -> Router {
    Router::new()
        .merge(create_sequence_routes())
        .merge(create_enrollment_routes())
        .merge(create_webhook_routes())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_statuses() {
        assert_eq!(error_status(&EngineError::invalid("x")), StatusCode::BAD_REQUEST);
        assert_eq!(error_status(&EngineError::not_found("x")), StatusCode::NOT_FOUND);
        assert_eq!(error_status(&EngineError::Conflict("x".into())), StatusCode::CONFLICT);
        assert_eq!(error_status(&EngineError::InvalidTransition("x".into())), StatusCode::CONFLICT);
        assert_eq!(
            error_status(&EngineError::Integration("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
