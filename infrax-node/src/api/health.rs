//! Health Check API Handler

use axum::{http::StatusCode, response::IntoResponse};

/// GET /__health
/// Liveness check, answers as long as the HTTP surface is up
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
