//! API Module
//!
//! HTTP surface of the node: the router channel for job submission,
//! cancellation and app management, plus health and status for operators.

pub mod app;
pub mod error;
pub mod health;
pub mod job;
pub mod status;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::node::Node;

/// Create the main API router with all endpoints
pub fn create_router(node: Arc<Node>) -> Router {
    Router::new()
        // Health check
        .route("/__health", get(health::health_check))
        .route("/health", get(health::health_check))
        // Job endpoints
        .route("/job", post(job::submit_job))
        .route("/jobs", get(job::list_jobs))
        .route("/job/{id}", get(job::get_job))
        .route("/job/{id}/cancel", post(job::cancel_job))
        // App endpoints
        .route(
            "/app/{app_id}",
            post(app::install_app).delete(app::uninstall_app),
        )
        .route("/apps", get(app::list_apps))
        // Node status
        .route("/status", get(status::get_status))
        // Add state and middleware
        .with_state(node)
        .layer(TraceLayer::new_for_http())
}
