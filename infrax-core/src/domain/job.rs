//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::file::FileRef;

/// Resource ceilings for a single job
///
/// Unset values fall back to the node's configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU time ceiling in seconds (RLIMIT_CPU)
    #[serde(default)]
    pub cpu_seconds: Option<u64>,

    /// Address space ceiling in bytes (RLIMIT_AS)
    #[serde(default)]
    pub memory_bytes: Option<u64>,

    /// Wall-clock timeout in seconds
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// A unit of work submitted by the router
///
/// Immutable once created: the store keeps it verbatim inside the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: Uuid,
    /// App reference, resolved to an executable by the node
    pub app: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Input payload, written to `input.json` in the job workspace
    #[serde(default)]
    pub input: Option<serde_json::Value>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub limits: ResourceLimits,
    /// Router files placed under the workspace's `input/` before launch
    #[serde(default)]
    pub files: Vec<FileRef>,
    pub submitted_at: DateTime<Utc>,
}

impl JobRequest {
    /// Creates a request for `app` with a fresh id and no arguments
    pub fn new(app: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            app: app.into(),
            args: Vec::new(),
            input: None,
            env: HashMap::new(),
            limits: ResourceLimits::default(),
            files: Vec::new(),
            submitted_at: Utc::now(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.limits.timeout_seconds = Some(seconds);
        self
    }
}

/// Job lifecycle state
///
/// `Queued -> Running -> {Succeeded, Failed, Cancelled}`; a queued job may
/// also be cancelled directly. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Queued,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether `next` directly follows `self` in the lifecycle
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Running)
                | (JobState::Queued, JobState::Cancelled)
                | (JobState::Running, JobState::Succeeded)
                | (JobState::Running, JobState::Failed)
                | (JobState::Running, JobState::Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "Queued",
            JobState::Running => "Running",
            JobState::Succeeded => "Succeeded",
            JobState::Failed => "Failed",
            JobState::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown job state '{}'", s))
    }
}

/// Why a job ended up in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The process ran and exited unsuccessfully
    ExitCode { code: i32 },
    /// The process exceeded its wall-clock timeout and was killed
    Timeout { after_seconds: u64 },
    /// The process could not be started at all
    Launch { message: String },
    /// The node restarted while the job was running
    RecoveredAfterCrash,
    /// The node itself failed while supervising the job
    Internal { message: String },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::ExitCode { code } => write!(f, "exited with code {}", code),
            FailureReason::Timeout { after_seconds } => {
                write!(f, "timed out after {}s", after_seconds)
            }
            FailureReason::Launch { message } => write!(f, "launch error: {}", message),
            FailureReason::RecoveredAfterCrash => write!(f, "recovered after node crash"),
            FailureReason::Internal { message } => write!(f, "internal error: {}", message),
        }
    }
}

/// Lifecycle record of a job
///
/// Owned by the scheduler until terminal; the uploader only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub request: JobRequest,
    pub state: JobState,
    pub failure: Option<FailureReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// Job workspace holding `stdout.log`, `stderr.log` and `output/`
    pub output_location: Option<String>,
    pub retry_count: u32,
    /// Process group of the running job
    pub pid: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Wraps a fresh request in a `Queued` record
    pub fn queued(request: JobRequest) -> Self {
        Self {
            updated_at: request.submitted_at,
            request,
            state: JobState::Queued,
            failure: None,
            started_at: None,
            finished_at: None,
            exit_code: None,
            output_location: None,
            retry_count: 0,
            pid: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.request.id
    }

    /// Wall-clock runtime, when the job has both started and finished
    pub fn execution_time_secs(&self) -> Option<f64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}
