//! Process sandbox
//!
//! Each job runs as a child process in its own process group, inside a
//! private workspace directory:
//!
//! ```text
//! <workspace_base>/<job_id>/
//!     input.json     request input, when present
//!     input/         router files listed by the request
//!     stdout.log
//!     stderr.log
//!     output/        files the job wants returned
//! ```
//!
//! The group is killed on timeout, cancellation and shutdown, and once more
//! after every exit so no descendant outlives its job.

use async_trait::async_trait;
use infrax_core::domain::job::{FailureReason, JobRequest};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::files::{FileSource, download_all};
use super::{
    ExecutionOutcome, JobControl, OutcomeStatus, ProcessIdentity, SandboxPolicy, SandboxRunner,
    SpawnedProcess, StopReason, kill_process_group,
};
use crate::config::NetworkPolicy;
use crate::scheduler::slots::ExecutionSlot;

/// Directory below a workspace whose files are returned with the result
pub const OUTPUT_DIR: &str = "output";
const INPUT_FILE: &str = "input.json";
const INPUT_DIR: &str = "input";
const STDOUT_FILE: &str = "stdout.log";
const STDERR_FILE: &str = "stderr.log";

pub struct ProcessSandbox {
    policy: SandboxPolicy,
    files: Option<Arc<dyn FileSource>>,
}

enum Ended {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Stopped(StopReason),
}

impl ProcessSandbox {
    pub fn new(policy: SandboxPolicy) -> Self {
        Self {
            policy,
            files: None,
        }
    }

    /// Where input files listed by requests are downloaded from
    pub fn with_file_source(mut self, files: Arc<dyn FileSource>) -> Self {
        self.files = Some(files);
        self
    }

    /// Workspace directory of a job
    pub fn workspace_for(&self, request: &JobRequest) -> PathBuf {
        self.policy.workspace_base.join(request.id.to_string())
    }

    async fn prepare_workspace(&self, request: &JobRequest) -> Result<PathBuf, String> {
        let workspace = self.workspace_for(request);
        tokio::fs::create_dir_all(workspace.join(OUTPUT_DIR))
            .await
            .map_err(|e| format!("failed to create workspace {}: {}", workspace.display(), e))?;

        if let Some(input) = &request.input {
            let raw = serde_json::to_vec_pretty(input)
                .map_err(|e| format!("failed to encode input: {}", e))?;
            tokio::fs::write(workspace.join(INPUT_FILE), raw)
                .await
                .map_err(|e| format!("failed to write input: {}", e))?;
        }

        if !request.files.is_empty() {
            let Some(source) = self.files.as_deref() else {
                return Err("request lists input files but no file source is set".to_string());
            };
            download_all(source, &request.files, &workspace.join(INPUT_DIR)).await?;
        }

        Ok(workspace)
    }

    fn build_command(
        &self,
        request: &JobRequest,
        program: &Path,
        workspace: &Path,
    ) -> Result<Command, String> {
        let mut command = match self.policy.network {
            NetworkPolicy::Allow => Command::new(program),
            NetworkPolicy::Deny => {
                let mut command = Command::new("unshare");
                command
                    .args(["--user", "--map-root-user", "--net", "--"])
                    .arg(program);
                command
            }
        };
        command.args(&request.args);

        if !self.policy.inherit_env {
            command.env_clear();
        }
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }
        command
            .envs(&request.env)
            .env("INFRAX_JOB_ID", request.id.to_string())
            .env("INFRAX_WORKSPACE", workspace)
            .env("INFRAX_OUTPUT_DIR", workspace.join(OUTPUT_DIR));
        if request.input.is_some() {
            command.env("INFRAX_INPUT", workspace.join(INPUT_FILE));
        }
        if !request.files.is_empty() {
            command.env("INFRAX_INPUT_DIR", workspace.join(INPUT_DIR));
        }

        let stdout = std::fs::File::create(workspace.join(STDOUT_FILE))
            .map_err(|e| format!("failed to create stdout log: {}", e))?;
        let stderr = std::fs::File::create(workspace.join(STDERR_FILE))
            .map_err(|e| format!("failed to create stderr log: {}", e))?;

        command
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            let cpu_seconds = self.policy.cpu_for(request);
            let memory_bytes = self.policy.memory_for(request);

            command.process_group(0);
            // SAFETY: the hook only calls async-signal-safe setrlimit
            unsafe {
                command.pre_exec(move || apply_rlimits(cpu_seconds, memory_bytes));
            }
        }

        Ok(command)
    }

    async fn collect(&self, workspace: &Path) -> (Option<String>, Vec<String>) {
        let limit = self.policy.max_output_bytes;
        let stdout = read_truncated(&workspace.join(STDOUT_FILE), limit).await;
        let stderr = read_truncated(&workspace.join(STDERR_FILE), limit).await;

        let output = match (stdout, stderr) {
            (Some(out), Some(err)) => Some(format!("{}\n{}", out, err)),
            (out, err) => out.or(err),
        };

        (output, list_output_files(&workspace.join(OUTPUT_DIR)).await)
    }
}

#[async_trait]
impl SandboxRunner for ProcessSandbox {
    async fn run(
        &self,
        request: &JobRequest,
        _slot: &ExecutionSlot,
        control: JobControl,
    ) -> ExecutionOutcome {
        let job_id = request.id;
        let JobControl { mut stop, spawned } = control;

        let workspace = match self.prepare_workspace(request).await {
            Ok(workspace) => workspace,
            Err(e) => return ExecutionOutcome::launch_error(e),
        };
        let launch_error = |message: String| ExecutionOutcome {
            workspace: Some(workspace.clone()),
            ..ExecutionOutcome::launch_error(message)
        };

        let program = match self.policy.resolver.resolve(&request.app) {
            Ok(program) => program,
            Err(e) => return launch_error(e),
        };

        let mut command = match self.build_command(request, &program, &workspace) {
            Ok(command) => command,
            Err(e) => return launch_error(e),
        };

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return launch_error(format!("failed to start {}: {}", program.display(), e));
            }
        };

        let pgid = child.id();
        info!(
            "Started job {} ({}) as process group {:?}",
            job_id,
            program.display(),
            pgid
        );
        if let (Some(pgid), Some(spawned)) = (pgid, spawned) {
            let (recorded, ack) = oneshot::channel();
            let announced = spawned.send(SpawnedProcess {
                identity: ProcessIdentity::capture(pgid),
                recorded,
            });
            // An error only means nobody records spawns
            if announced.is_ok() {
                let _ = ack.await;
            }
        }

        let timeout = self.policy.timeout_for(request);
        let ended = tokio::select! {
            status = child.wait() => Ended::Exited(status),
            _ = tokio::time::sleep(timeout) => Ended::TimedOut,
            Ok(reason) = &mut stop => Ended::Stopped(reason),
        };

        let ended = match ended {
            Ended::Exited(status) => Ended::Exited(status),
            other => {
                if let Some(pgid) = pgid {
                    kill_process_group(pgid);
                }
                // With the group dead any error here only means it was already reaped
                let _ = child.start_kill();
                let _ = child.wait().await;
                other
            }
        };

        // Descendants that escaped the exit of the leader
        if let Some(pgid) = pgid {
            if kill_process_group(pgid) {
                debug!("Killed leftover processes of job {}", job_id);
            }
        }

        let (status, exit_code) = match ended {
            Ended::Exited(Ok(status)) => classify(status),
            Ended::Exited(Err(e)) => (
                OutcomeStatus::Failed(FailureReason::Internal {
                    message: format!("failed to wait for process: {}", e),
                }),
                None,
            ),
            Ended::TimedOut => {
                warn!("Job {} timed out after {:?}", job_id, timeout);
                (
                    OutcomeStatus::Failed(FailureReason::Timeout {
                        after_seconds: timeout.as_secs(),
                    }),
                    None,
                )
            }
            Ended::Stopped(StopReason::Cancel) => {
                info!("Job {} cancelled", job_id);
                (OutcomeStatus::Cancelled, None)
            }
            Ended::Stopped(StopReason::Shutdown) => {
                info!("Job {} interrupted by shutdown", job_id);
                (OutcomeStatus::Interrupted, None)
            }
        };

        let (output, output_files) = self.collect(&workspace).await;

        ExecutionOutcome {
            status,
            exit_code,
            workspace: Some(workspace),
            output,
            output_files,
        }
    }
}

/// Exit 0 succeeds, anything else fails; death by signal N reads as 128 + N
fn classify(status: ExitStatus) -> (OutcomeStatus, Option<i32>) {
    let code = match status.code() {
        Some(code) => code,
        None => signal_code(status),
    };

    if code == 0 {
        (OutcomeStatus::Succeeded, Some(0))
    } else {
        (OutcomeStatus::Failed(FailureReason::ExitCode { code }), Some(code))
    }
}

#[cfg(unix)]
fn signal_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|signal| 128 + signal).unwrap_or(-1)
}

#[cfg(not(unix))]
fn signal_code(_status: ExitStatus) -> i32 {
    -1
}

#[cfg(unix)]
fn apply_rlimits(cpu_seconds: Option<u64>, memory_bytes: Option<u64>) -> std::io::Result<()> {
    // Soft CPU limit sends SIGXCPU, the hard limit one second later SIGKILL
    if let Some(seconds) = cpu_seconds {
        let limit = libc::rlimit {
            rlim_cur: seconds as libc::rlim_t,
            rlim_max: seconds.saturating_add(1) as libc::rlim_t,
        };
        // SAFETY: plain syscall on a stack value
        if unsafe { libc::setrlimit(libc::RLIMIT_CPU, &limit) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }

    if let Some(bytes) = memory_bytes {
        let limit = libc::rlimit {
            rlim_cur: bytes as libc::rlim_t,
            rlim_max: bytes as libc::rlim_t,
        };
        // SAFETY: plain syscall on a stack value
        if unsafe { libc::setrlimit(libc::RLIMIT_AS, &limit) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }

    Ok(())
}

async fn read_truncated(path: &Path, limit: usize) -> Option<String> {
    let file = tokio::fs::File::open(path).await.ok()?;
    let mut buf = Vec::new();
    file.take(limit as u64).read_to_end(&mut buf).await.ok()?;

    if buf.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Regular files below `root`, relative to it, sorted
async fn list_output_files(root: &Path) -> Vec<String> {
    let mut files = Vec::new();
    let mut dirs = vec![root.to_path_buf()];

    while let Some(dir) = dirs.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            match entry.file_type().await {
                Ok(kind) if kind.is_dir() => dirs.push(path),
                Ok(kind) if kind.is_file() => {
                    if let Ok(relative) = path.strip_prefix(root) {
                        files.push(relative.to_string_lossy().into_owned());
                    }
                }
                _ => {}
            }
        }
    }

    files.sort();
    files
}
