pub mod accounts;
pub mod config;
pub mod live_logs;
pub mod schedule;
pub mod sign_tasks;
pub mod tasks;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::Value;
use tracing::warn;

use super::AppState;
use crate::core::engine::{RunResult, trigger};
use crate::core::error::EngineError;

pub(crate) type ApiResult = Result<Json<Value>, ApiError>;

/// Error body: `{"success": false, "error": "..."}` with a matching status.
#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: format!("{} not found", what.into()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::InvalidInput(_) | EngineError::ScheduleValidation { .. } => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!("Request failed: {}", err);
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "success": false, "error": self.message })),
        )
            .into_response()
    }
}

/// Rejects triggers the scheduler would refuse.
pub(crate) fn check_trigger(raw: &str) -> Result<(), ApiError> {
    trigger::to_cron(raw)
        .and_then(|cron| trigger::with_seconds(&cron))
        .map(|_| ())
        .map_err(|e| ApiError::bad_request(format!("invalid trigger '{}': {}", raw.trim(), e)))
}

/// Reconciles the schedule after a mutation and adds the report to `body`.
pub(crate) async fn synced(state: &AppState, mut body: Value) -> Json<Value> {
    let report = state.engine.sync().await;
    if let Value::Object(map) = &mut body {
        map.insert("success".to_string(), Value::Bool(true));
        map.insert(
            "sync".to_string(),
            serde_json::to_value(&report).unwrap_or(Value::Null),
        );
    }
    Json(body)
}

/// A manual run's body is the run result itself, so top-level `success` is
/// the run outcome.
pub(crate) fn run_body(result: RunResult) -> ApiResult {
    Ok(Json(serde_json::to_value(result).map_err(EngineError::from)?))
}
