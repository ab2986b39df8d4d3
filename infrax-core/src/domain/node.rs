//! Node domain model
//!
//! Status the node reports about itself to operators and the router.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Coarse availability of the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeState {
    /// At least one execution slot is free
    Idle,

    /// Every execution slot is taken
    Busy,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Idle => write!(f, "IDLE"),
            NodeState::Busy => write!(f, "BUSY"),
        }
    }
}

/// What failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Job,
    Upload,
}

/// A recent failure surfaced for operator attention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub job_id: Uuid,
    pub kind: FailureKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Snapshot of node health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub state: NodeState,
    pub slots_total: usize,
    pub slots_in_use: usize,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub pending_uploads: usize,
    pub recent_failures: Vec<FailureReport>,
}
