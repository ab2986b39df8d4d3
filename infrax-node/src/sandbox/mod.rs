//! Execution Sandbox
//!
//! Runs one job in an isolated child process and reports how it ended.
//! A runner never returns an error: every way a job can end, including a
//! failure to launch it, is an [`ExecutionOutcome`].

pub mod files;
pub mod identity;
pub mod process;
pub mod resolver;

use async_trait::async_trait;
use infrax_core::domain::job::{FailureReason, JobRequest};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::config::{Config, NetworkPolicy};
use crate::scheduler::slots::ExecutionSlot;

pub use files::FileSource;
pub use identity::ProcessIdentity;
pub use process::ProcessSandbox;
pub use resolver::AppResolver;

/// Why the scheduler asks a running job to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Operator cancellation; the job ends Cancelled
    Cancel,

    /// Node shutdown; the job is left Running for recovery
    Shutdown,
}

/// A freshly spawned job process, announced before it is waited on
#[derive(Debug)]
pub struct SpawnedProcess {
    pub identity: ProcessIdentity,
    /// Answered once the identity is stored. The runner waits for it, so a
    /// crash can never leave a live group the store does not know about.
    pub recorded: oneshot::Sender<()>,
}

/// Channels between the scheduler and one running job
#[derive(Debug)]
pub struct JobControl {
    pub stop: oneshot::Receiver<StopReason>,

    /// Receives the process identity once the child is spawned
    pub spawned: Option<oneshot::Sender<SpawnedProcess>>,
}

impl JobControl {
    pub fn new(stop: oneshot::Receiver<StopReason>) -> Self {
        Self {
            stop,
            spawned: None,
        }
    }

    pub fn with_spawn_notifier(mut self, spawned: oneshot::Sender<SpawnedProcess>) -> Self {
        self.spawned = Some(spawned);
        self
    }
}

/// How a job ended
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeStatus {
    Succeeded,
    Failed(FailureReason),
    Cancelled,
    /// Stopped by shutdown before it finished
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: OutcomeStatus,
    pub exit_code: Option<i32>,
    /// Job workspace, when one was created
    pub workspace: Option<PathBuf>,
    /// Captured stdout then stderr, truncated
    pub output: Option<String>,
    /// Files under the workspace's `output/`, relative to it
    pub output_files: Vec<String>,
}

impl ExecutionOutcome {
    pub fn failed(reason: FailureReason) -> Self {
        Self {
            status: OutcomeStatus::Failed(reason),
            exit_code: None,
            workspace: None,
            output: None,
            output_files: Vec::new(),
        }
    }

    pub fn launch_error(message: impl Into<String>) -> Self {
        Self::failed(FailureReason::Launch {
            message: message.into(),
        })
    }
}

/// Runs a job to completion while it holds an execution slot
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn run(
        &self,
        request: &JobRequest,
        slot: &ExecutionSlot,
        control: JobControl,
    ) -> ExecutionOutcome;
}

/// Everything a sandbox needs from the node configuration
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    pub workspace_base: PathBuf,
    pub resolver: AppResolver,
    pub inherit_env: bool,
    pub network: NetworkPolicy,
    pub default_timeout: Duration,
    pub default_memory_bytes: Option<u64>,
    pub default_cpu_seconds: Option<u64>,
    pub max_output_bytes: usize,
}

impl SandboxPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workspace_base: config.workspace_base.clone(),
            resolver: AppResolver::new(
                config.app_dir.clone(),
                config.app_entrypoint.clone(),
                config.allow_path_lookup,
            ),
            inherit_env: config.inherit_env,
            network: config.network,
            default_timeout: config.job_timeout(),
            default_memory_bytes: config.default_memory_bytes,
            default_cpu_seconds: config.default_cpu_seconds,
            max_output_bytes: config.max_output_bytes,
        }
    }

    /// Wall-clock limit for `request`
    pub fn timeout_for(&self, request: &JobRequest) -> Duration {
        request
            .limits
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }

    pub fn memory_for(&self, request: &JobRequest) -> Option<u64> {
        request.limits.memory_bytes.or(self.default_memory_bytes)
    }

    pub fn cpu_for(&self, request: &JobRequest) -> Option<u64> {
        request.limits.cpu_seconds.or(self.default_cpu_seconds)
    }
}

/// SIGKILL a whole process group
///
/// Returns false when the group no longer exists.
#[cfg(unix)]
pub fn kill_process_group(pgid: u32) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return false;
    };
    if pgid <= 1 {
        return false;
    }
    // SAFETY: killpg has no memory-safety preconditions
    unsafe { libc::killpg(pgid, libc::SIGKILL) == 0 }
}

#[cfg(not(unix))]
pub fn kill_process_group(_pgid: u32) -> bool {
    false
}

/// Whether any process of the group is still alive
#[cfg(unix)]
pub fn process_group_alive(pgid: u32) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return false;
    };
    if pgid <= 1 {
        return false;
    }
    // SAFETY: signal 0 only checks for existence
    unsafe { libc::killpg(pgid, 0) == 0 }
}

#[cfg(not(unix))]
pub fn process_group_alive(_pgid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_falls_back_to_defaults() {
        let config = Config {
            job_timeout_seconds: 42,
            default_memory_bytes: Some(1024),
            ..Default::default()
        };
        let policy = SandboxPolicy::from_config(&config);

        let request = JobRequest::new("true");
        assert_eq!(policy.timeout_for(&request), Duration::from_secs(42));
        assert_eq!(policy.memory_for(&request), Some(1024));
        assert_eq!(policy.cpu_for(&request), None);

        let request = request.with_timeout(3);
        assert_eq!(policy.timeout_for(&request), Duration::from_secs(3));
    }

    #[test]
    fn test_kill_rejects_init_and_missing_groups() {
        assert!(!kill_process_group(0));
        assert!(!kill_process_group(1));
        assert!(!process_group_alive(u32::MAX));
    }
}
