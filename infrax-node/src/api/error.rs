//! API Error Handling
//!
//! Maps node errors onto HTTP status codes.

use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};

use crate::error::NodeError;

/// Seconds a client is asked to wait after a full queue
const RETRY_AFTER_SECONDS: &str = "1";

/// API error type
#[derive(Debug)]
pub struct ApiError(pub NodeError);

impl From<NodeError> for ApiError {
    fn from(err: NodeError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            NodeError::DuplicateJob(_)
            | NodeError::InvalidTransition { .. }
            | NodeError::InvalidState { .. }
            | NodeError::Conflict(_) => StatusCode::CONFLICT,
            NodeError::NotFound(_) | NodeError::AppNotFound(_) => StatusCode::NOT_FOUND,
            NodeError::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            NodeError::Validation(_) => StatusCode::BAD_REQUEST,
            NodeError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            NodeError::Storage(_) | NodeError::Serialization(_) | NodeError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Internal error: {}", self.0);
            "Internal server error".to_string()
        } else {
            self.0.to_string()
        };

        let body = Json(serde_json::json!({ "error": message }));
        if status == StatusCode::TOO_MANY_REQUESTS {
            (status, [(header::RETRY_AFTER, RETRY_AFTER_SECONDS)], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
