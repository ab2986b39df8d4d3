//! Upload domain types
//!
//! An upload task is the packaged result of a terminal job, kept until the
//! router acknowledges it or retries are exhausted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::job::{JobRecord, JobState};

/// Delivery state of an upload task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadState {
    Pending,
    Delivered,
    PermanentlyFailed,
}

impl UploadState {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadState::Pending => "Pending",
            UploadState::Delivered => "Delivered",
            UploadState::PermanentlyFailed => "PermanentlyFailed",
        }
    }
}

impl std::str::FromStr for UploadState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(UploadState::Pending),
            "Delivered" => Ok(UploadState::Delivered),
            "PermanentlyFailed" => Ok(UploadState::PermanentlyFailed),
            other => Err(format!("unknown upload state '{}'", other)),
        }
    }
}

/// Result body sent to the router for a finished job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResultPayload {
    pub job_id: Uuid,
    pub state: JobState,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    /// Captured stdout followed by stderr (truncated by the node)
    pub output: Option<String>,
    pub execution_time_secs: f64,
    /// Files the job left in its output directory, relative to it
    #[serde(default)]
    pub output_files: Vec<String>,
    /// Router ids of the uploaded output files, in `output_files` order
    #[serde(default)]
    pub file_ids: Vec<String>,
}

impl JobResultPayload {
    /// Builds the payload for a terminal record
    pub fn from_record(record: &JobRecord, output: Option<String>, output_files: Vec<String>) -> Self {
        Self {
            job_id: record.id(),
            state: record.state,
            success: record.state == JobState::Succeeded,
            exit_code: record.exit_code,
            error: record.failure.as_ref().map(ToString::to_string).or_else(|| {
                (record.state == JobState::Cancelled).then(|| "cancelled".to_string())
            }),
            output,
            execution_time_secs: record.execution_time_secs().unwrap_or(0.0),
            output_files,
            file_ids: Vec::new(),
        }
    }
}

/// A terminal job's result awaiting delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadTask {
    pub job_id: Uuid,
    /// Stable across re-deliveries so the router can deduplicate
    pub idempotency_key: String,
    pub result: JobResultPayload,
    pub state: UploadState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadTask {
    pub fn new(result: JobResultPayload) -> Self {
        let now = Utc::now();
        Self {
            job_id: result.job_id,
            idempotency_key: Self::key_for(result.job_id),
            result,
            state: UploadState::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// One key per job: a job has exactly one result
    pub fn key_for(job_id: Uuid) -> String {
        format!("job-result-{}", job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::{FailureReason, JobRequest};

    #[test]
    fn test_payload_for_failed_record() {
        let mut record = JobRecord::queued(JobRequest::new("false"));
        record.state = JobState::Failed;
        record.exit_code = Some(1);
        record.failure = Some(FailureReason::ExitCode { code: 1 });

        let payload = JobResultPayload::from_record(&record, None, vec![]);
        assert!(!payload.success);
        assert_eq!(payload.exit_code, Some(1));
        assert_eq!(payload.error.as_deref(), Some("exited with code 1"));
    }

    #[test]
    fn test_payload_for_cancelled_record() {
        let mut record = JobRecord::queued(JobRequest::new("sleep"));
        record.state = JobState::Cancelled;

        let payload = JobResultPayload::from_record(&record, None, vec![]);
        assert!(!payload.success);
        assert_eq!(payload.error.as_deref(), Some("cancelled"));
    }

    #[test]
    fn test_idempotency_key_is_stable() {
        let record = JobRecord::queued(JobRequest::new("true"));
        let a = UploadTask::new(JobResultPayload::from_record(&record, None, vec![]));
        let b = UploadTask::new(JobResultPayload::from_record(&record, None, vec![]));
        assert_eq!(a.idempotency_key, b.idempotency_key);
        assert_eq!(a.state, UploadState::Pending);
    }
}
