use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

use crate::error::EngineError;

pub mod audit;
pub mod conflicts;
pub mod positions;
pub mod sections;
pub mod trains;

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// Transport-side rendering of the engine error taxonomy.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, retry_after) = match &self.0 {
            EngineError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION", None),
            EngineError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", None),
            EngineError::Stale { .. } => (StatusCode::CONFLICT, "STALE", None),
            EngineError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN", None),
            EngineError::RateLimited { retry_after_secs } => {
                (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", Some(*retry_after_secs))
            }
            EngineError::Precondition(_) => (StatusCode::CONFLICT, "PRECONDITION", None),
            EngineError::Transient(_) => (StatusCode::SERVICE_UNAVAILABLE, "TRANSIENT", None),
            EngineError::Overloaded => (StatusCode::SERVICE_UNAVAILABLE, "OVERLOADED", None),
            EngineError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", None),
        };
        let message = match &self.0 {
            // Internal details stay in the log; the caller gets the code.
            EngineError::Internal { correlation_id } => {
                format!("internal error, reference {}", correlation_id)
            }
            other => other.to_string(),
        };
        let mut body = json!({ "code": code, "message": message });
        if let Some(secs) = retry_after {
            body["retry_after_secs"] = json!(secs);
        }
        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}
