//! Job DTOs

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::file::FileRef;
use crate::domain::job::{JobRequest, JobState, ResourceLimits};

/// Request to submit a job to a node
///
/// The router normally assigns the id; when absent the node generates one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitJob {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub app: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub input: Option<serde_json::Value>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub files: Vec<FileRef>,
}

impl SubmitJob {
    /// Stamps the submission time and freezes the request
    pub fn into_request(self) -> JobRequest {
        JobRequest {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            app: self.app,
            args: self.args,
            input: self.input,
            env: self.env,
            limits: self.limits,
            files: self.files,
            submitted_at: Utc::now(),
        }
    }
}

/// Query parameters for listing jobs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListJobsQuery {
    #[serde(default)]
    pub state: Option<JobState>,
}
