//! Node DTOs
//!
//! Bodies the node sends to the router about itself.

use serde::{Deserialize, Serialize};

use crate::domain::node::NodeState;

/// Registration of a node with the router
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNode {
    pub node_id: String,
    /// Port the node's request surface listens on
    pub port: u16,
    pub max_concurrent_jobs: usize,
}

/// Router's answer to a registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredNode {
    pub id: String,
}

/// Availability update pushed to the router
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStateUpdate {
    pub node_id: String,
    pub state: NodeState,
}
