//! Node Status API Handler

use axum::{Json, extract::State};
use infrax_core::domain::node::NodeStatus;
use std::sync::Arc;

use crate::api::error::ApiResult;
use crate::node::Node;

/// GET /status
/// Slot utilization, queue depth, pending uploads and recent failures
pub async fn get_status(State(node): State<Arc<Node>>) -> ApiResult<Json<NodeStatus>> {
    Ok(Json(node.status().await?))
}
