//! End-to-end scenarios against a node running real processes

#![cfg(unix)]

use async_trait::async_trait;
use infrax_client::UploadAck;
use infrax_core::domain::job::{FailureReason, JobRecord, JobRequest, JobState};
use infrax_core::domain::upload::{UploadState, UploadTask};
use infrax_node::config::{Config, RecoveryPolicy};
use infrax_node::repository::{job_repository, upload_repository};
use infrax_node::repository::job_repository::StateFields;
use infrax_node::sandbox::{ProcessIdentity, ProcessSandbox, SandboxPolicy, process_group_alive};
use infrax_node::upload::{ResultSink, UploadError};
use infrax_node::{Node, NodeError, db};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Stand-in for the router's result endpoint
///
/// Remembers results by idempotency key. With `drop_first_ack` the first
/// delivery is accepted but the answer is lost, as after a network timeout.
#[derive(Default)]
struct FakeRouter {
    results: Mutex<HashSet<String>>,
    deliveries: Mutex<usize>,
    drop_first_ack: bool,
}

impl FakeRouter {
    fn accepted(&self) -> usize {
        self.results.lock().unwrap().len()
    }

    fn deliveries(&self) -> usize {
        *self.deliveries.lock().unwrap()
    }
}

#[async_trait]
impl ResultSink for FakeRouter {
    async fn deliver(&self, task: &UploadTask) -> Result<UploadAck, UploadError> {
        let attempt = {
            let mut deliveries = self.deliveries.lock().unwrap();
            *deliveries += 1;
            *deliveries
        };

        let first = self
            .results
            .lock()
            .unwrap()
            .insert(task.idempotency_key.clone());
        if !first {
            return Ok(UploadAck::AlreadyDelivered);
        }

        if self.drop_first_ack && attempt == 1 {
            return Err(UploadError::Transient("timed out waiting for ack".into()));
        }
        Ok(UploadAck::Accepted)
    }
}

struct Harness {
    dir: PathBuf,
    database_url: String,
}

impl Harness {
    fn new() -> Self {
        let dir = std::env::temp_dir()
            .join("infrax-node-scenarios")
            .join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&dir).unwrap();
        let database_url = format!("sqlite://{}?mode=rwc", dir.join("node.db").display());
        Self { dir, database_url }
    }

    fn config(&self, slots: usize, queue_capacity: usize) -> Config {
        Config {
            local_only: true,
            database_url: self.database_url.clone(),
            workspace_base: self.dir.join("jobs"),
            max_concurrent_jobs: slots,
            queue_capacity,
            upload_backoff_base_ms: 5,
            upload_backoff_max_ms: 20,
            ..Default::default()
        }
    }

    async fn pool(&self) -> SqlitePool {
        db::connect(&self.database_url).await.unwrap()
    }

    async fn start(&self, config: Config, sink: Arc<dyn ResultSink>) -> Node {
        let runner = Arc::new(ProcessSandbox::new(SandboxPolicy::from_config(&config)));
        Node::with_parts(config, self.pool().await, runner, sink)
            .await
            .unwrap()
    }

    /// Job that runs until its gate file appears
    fn gated(&self) -> (JobRequest, PathBuf) {
        let gate = self.dir.join(format!("gate-{}", Uuid::new_v4()));
        let script = format!(
            "while [ ! -f '{}' ]; do sleep 0.05; done",
            gate.display()
        );
        (shell(&script), gate)
    }
}

fn shell(script: &str) -> JobRequest {
    JobRequest::new("sh").with_args(["-c", script])
}

fn open(gate: &Path) {
    std::fs::write(gate, b"").unwrap();
}

async fn wait_for(node: &Node, id: Uuid, state: JobState) -> JobRecord {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let record = node.get_job(id).await.unwrap();
        if record.state == state {
            return record;
        }
        assert!(
            Instant::now() < deadline,
            "job {} stuck in {} waiting for {}",
            id,
            record.state,
            state
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_upload(pool: &SqlitePool, id: Uuid, state: UploadState) -> UploadTask {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(task) = upload_repository::find_by_job(pool, id).await.unwrap() {
            if task.state == state {
                return task;
            }
        }
        assert!(Instant::now() < deadline, "upload of {} never reached {:?}", id, state);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn third_job_waits_for_a_free_slot() {
    let harness = Harness::new();
    let node = harness.start(harness.config(2, 8), Arc::new(FakeRouter::default())).await;

    let jobs: Vec<(JobRequest, PathBuf)> = (0..3).map(|_| harness.gated()).collect();
    for (request, _) in &jobs {
        node.submit(request.clone()).await.unwrap();
    }

    wait_for(&node, jobs[0].0.id, JobState::Running).await;
    wait_for(&node, jobs[1].0.id, JobState::Running).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(node.get_job(jobs[2].0.id).await.unwrap().state, JobState::Queued);

    let status = node.status().await.unwrap();
    assert_eq!(status.slots_in_use, 2);
    assert_eq!(status.queue_depth, 1);

    open(&jobs[0].1);
    let first = wait_for(&node, jobs[0].0.id, JobState::Succeeded).await;
    let third = wait_for(&node, jobs[2].0.id, JobState::Running).await;
    assert!(third.started_at.unwrap() >= first.finished_at.unwrap());

    open(&jobs[1].1);
    open(&jobs[2].1);
    for (request, _) in &jobs {
        let record = wait_for(&node, request.id, JobState::Succeeded).await;
        assert!(record.request.submitted_at <= record.started_at.unwrap());
        assert!(record.started_at <= record.finished_at);
        assert_eq!(record.exit_code, Some(0));
    }

    node.shutdown().await;
}

#[tokio::test]
async fn running_jobs_never_exceed_slots() {
    let harness = Harness::new();
    let node = harness.start(harness.config(2, 16), Arc::new(FakeRouter::default())).await;

    let jobs = 6;
    for _ in 0..jobs {
        node.submit(shell("sleep 0.2")).await.unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let running = job_repository::count_by_state(node.pool(), JobState::Running)
            .await
            .unwrap();
        assert!(running <= 2, "{} jobs running on 2 slots", running);

        let succeeded = job_repository::count_by_state(node.pool(), JobState::Succeeded)
            .await
            .unwrap();
        if succeeded == jobs {
            break;
        }
        assert!(Instant::now() < deadline, "jobs did not finish");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    node.shutdown().await;
}

#[tokio::test]
async fn full_queue_rejects_immediately() {
    let harness = Harness::new();
    let node = harness.start(harness.config(1, 1), Arc::new(FakeRouter::default())).await;

    let (running, gate) = harness.gated();
    node.submit(running.clone()).await.unwrap();
    wait_for(&node, running.id, JobState::Running).await;
    node.submit(shell("true")).await.unwrap();

    let rejected = shell("true");
    let started = Instant::now();
    let err = node.submit(rejected.clone()).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(matches!(err, NodeError::CapacityExceeded { capacity: 1 }));
    assert!(matches!(node.get_job(rejected.id).await, Err(NodeError::NotFound(_))));
    assert_eq!(node.status().await.unwrap().queue_depth, 1);

    open(&gate);
    node.shutdown().await;
}

#[tokio::test]
async fn timeout_fails_the_job() {
    let harness = Harness::new();
    let node = harness.start(harness.config(1, 8), Arc::new(FakeRouter::default())).await;

    let request = shell("sleep 30 & sleep 30").with_timeout(1);
    node.submit(request.clone()).await.unwrap();

    let record = wait_for(&node, request.id, JobState::Failed).await;
    assert_eq!(
        record.failure,
        Some(FailureReason::Timeout { after_seconds: 1 })
    );
    assert_eq!(record.pid, None);

    let status = node.status().await.unwrap();
    assert_eq!(status.recent_failures.len(), 1);
    assert_eq!(status.recent_failures[0].job_id, request.id);

    node.shutdown().await;
}

#[tokio::test]
async fn launch_errors_are_distinct_from_exit_codes() {
    let harness = Harness::new();
    let node = harness.start(harness.config(2, 8), Arc::new(FakeRouter::default())).await;

    let missing = JobRequest::new("no-such-app-for-infrax");
    let failing = shell("exit 7");
    node.submit(missing.clone()).await.unwrap();
    node.submit(failing.clone()).await.unwrap();

    let missing = wait_for(&node, missing.id, JobState::Failed).await;
    assert!(matches!(missing.failure, Some(FailureReason::Launch { .. })));
    assert_eq!(missing.exit_code, None);

    let failing = wait_for(&node, failing.id, JobState::Failed).await;
    assert_eq!(failing.failure, Some(FailureReason::ExitCode { code: 7 }));
    assert_eq!(failing.exit_code, Some(7));

    node.shutdown().await;
}

#[tokio::test]
async fn cancel_queued_and_running_jobs() {
    let harness = Harness::new();
    let router = Arc::new(FakeRouter::default());
    let node = harness.start(harness.config(1, 8), router.clone()).await;

    let (running, _gate) = harness.gated();
    let (queued, _) = harness.gated();
    node.submit(running.clone()).await.unwrap();
    node.submit(queued.clone()).await.unwrap();
    wait_for(&node, running.id, JobState::Running).await;

    let cancelled = node.cancel(queued.id).await.unwrap();
    assert_eq!(cancelled.state, JobState::Cancelled);
    assert!(cancelled.started_at.is_none());

    let cancelled = node.cancel(running.id).await.unwrap();
    assert_eq!(cancelled.state, JobState::Cancelled);
    assert!(cancelled.started_at.is_some());

    assert!(matches!(
        node.cancel(running.id).await,
        Err(NodeError::InvalidState { .. })
    ));
    assert!(matches!(
        node.cancel(Uuid::new_v4()).await,
        Err(NodeError::NotFound(_))
    ));

    // Both cancellations are reported to the router exactly once
    wait_for_upload(node.pool(), queued.id, UploadState::Delivered).await;
    wait_for_upload(node.pool(), running.id, UploadState::Delivered).await;
    assert_eq!(router.accepted(), 2);

    node.shutdown().await;
}

#[tokio::test]
async fn ambiguous_upload_failure_is_not_double_counted() {
    let harness = Harness::new();
    let router = Arc::new(FakeRouter {
        drop_first_ack: true,
        ..Default::default()
    });
    let node = harness.start(harness.config(1, 8), router.clone()).await;

    let request = shell("echo done");
    node.submit(request.clone()).await.unwrap();
    wait_for(&node, request.id, JobState::Succeeded).await;

    let task = wait_for_upload(node.pool(), request.id, UploadState::Delivered).await;
    assert_eq!(router.deliveries(), 2);
    assert_eq!(router.accepted(), 1);
    assert_eq!(task.attempts, 2);
    assert!(task.result.success);
    assert!(task.result.output.unwrap().contains("done"));

    node.shutdown().await;
}

#[tokio::test]
async fn delivered_job_workspace_is_removed() {
    let harness = Harness::new();
    let config = Config {
        local_only: false,
        ..harness.config(1, 8)
    };
    let node = harness.start(config, Arc::new(FakeRouter::default())).await;

    let request = shell("echo kept > output/result.txt");
    node.submit(request.clone()).await.unwrap();
    let record = wait_for(&node, request.id, JobState::Succeeded).await;
    let workspace = PathBuf::from(record.output_location.unwrap());

    let task = wait_for_upload(node.pool(), request.id, UploadState::Delivered).await;
    assert_eq!(task.result.output_files, vec!["result.txt".to_string()]);

    let deadline = Instant::now() + Duration::from_secs(10);
    while workspace.exists() {
        assert!(Instant::now() < deadline, "{} was never removed", workspace.display());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    node.shutdown().await;
}

/// Leaves a Running record behind as if the node had been killed
async fn crashed_job(harness: &Harness, process: Option<ProcessIdentity>) -> Uuid {
    let pool = harness.pool().await;
    let id = job_repository::create(&pool, shell("echo again"))
        .await
        .unwrap()
        .id();
    job_repository::update_state(&pool, id, JobState::Running, StateFields::default())
        .await
        .unwrap();
    if let Some(process) = process {
        job_repository::record_pid(&pool, id, &process).await.unwrap();
    }
    pool.close().await;
    id
}

fn orphan_group() -> std::process::Child {
    use std::os::unix::process::CommandExt;

    std::process::Command::new("sleep")
        .arg("30")
        .process_group(0)
        .spawn()
        .unwrap()
}

// Identities are only verifiable where /proc tells boot id and start time
#[cfg(target_os = "linux")]
#[tokio::test]
async fn restart_fails_orphaned_running_job() {
    let harness = Harness::new();

    // A process group that outlived the node
    let mut orphan = orphan_group();
    let id = crashed_job(&harness, Some(ProcessIdentity::capture(orphan.id()))).await;

    let router = Arc::new(FakeRouter::default());
    let node = harness.start(harness.config(1, 8), router.clone()).await;

    let record = node.get_job(id).await.unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.failure, Some(FailureReason::RecoveredAfterCrash));

    let status = orphan.wait().unwrap();
    assert!(!status.success());
    assert!(!process_group_alive(orphan.id()));

    wait_for_upload(node.pool(), id, UploadState::Delivered).await;
    assert_eq!(router.accepted(), 1);

    node.shutdown().await;
}

#[tokio::test]
async fn restart_spares_group_that_is_not_the_jobs() {
    let harness = Harness::new();

    // The recorded group id now belongs to an unrelated process
    let mut stranger = orphan_group();
    let mut recorded = ProcessIdentity::capture(stranger.id());
    recorded.start_time = Some(recorded.start_time.map_or(1, |ticks| ticks + 1));
    recorded.boot_id.get_or_insert_with(|| "earlier-boot".to_string());
    let id = crashed_job(&harness, Some(recorded)).await;

    let node = harness.start(harness.config(1, 8), Arc::new(FakeRouter::default())).await;

    let record = node.get_job(id).await.unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert!(process_group_alive(stranger.id()));

    stranger.kill().unwrap();
    stranger.wait().unwrap();
    node.shutdown().await;
}

#[tokio::test]
async fn restart_requeues_running_job_when_configured() {
    let harness = Harness::new();
    let id = crashed_job(&harness, None).await;

    let config = Config {
        recovery_policy: RecoveryPolicy::Requeue,
        ..harness.config(1, 8)
    };
    let node = harness.start(config, Arc::new(FakeRouter::default())).await;

    let record = wait_for(&node, id, JobState::Succeeded).await;
    assert_eq!(record.retry_count, 1);

    node.shutdown().await;
}

#[tokio::test]
async fn shutdown_and_restart_resumes_work() {
    let harness = Harness::new();
    let config = Config {
        recovery_policy: RecoveryPolicy::Requeue,
        ..harness.config(1, 8)
    };

    let node = harness.start(config.clone(), Arc::new(FakeRouter::default())).await;
    let (running, gate) = harness.gated();
    let queued = shell("true");
    node.submit(running.clone()).await.unwrap();
    node.submit(queued.clone()).await.unwrap();
    wait_for(&node, running.id, JobState::Running).await;
    node.shutdown().await;
    node.pool().close().await;

    // The gate opens while the node is down: the rerun finishes at once
    open(&gate);

    let node = harness.start(config, Arc::new(FakeRouter::default())).await;
    let rerun = wait_for(&node, running.id, JobState::Succeeded).await;
    assert_eq!(rerun.retry_count, 1);
    wait_for(&node, queued.id, JobState::Succeeded).await;

    node.shutdown().await;
}
