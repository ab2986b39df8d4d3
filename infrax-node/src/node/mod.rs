//! Node Coordinator
//!
//! The single entry point of the node. Wires the job store, the scheduler
//! and the uploader together from one [`Config`], and answers requests and
//! status queries. Nothing here is global: several nodes can run in one
//! process, each with its own configuration and store.

pub mod apps;
pub mod failures;
pub mod router;

use infrax_core::domain::job::{JobRecord, JobRequest, JobState};
use infrax_core::domain::node::{NodeState, NodeStatus};
use infrax_core::domain::upload::UploadState;
use infrax_core::dto::job::SubmitJob;
use infrax_client::RouterClient;
use sqlx::SqlitePool;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::error::{NodeError, Result};
use crate::repository::{job_repository, upload_repository};
use crate::sandbox::{ProcessSandbox, SandboxPolicy, SandboxRunner};
use crate::scheduler::recovery::{self, RecoverySettings};
use crate::scheduler::reporter::ReportHandle;
use crate::scheduler::{Scheduler, SchedulerContext, SchedulerHandle, SchedulerSettings};
use crate::upload::{LogSink, ResultSink, RouterSink, UploadSettings, Uploader};

use apps::{AppCatalog, AppStore};
use failures::FailureLog;

/// What a node talks to outside itself
pub struct NodeServices {
    pub sink: Arc<dyn ResultSink>,
    pub reports: ReportHandle,
    /// Source of installable apps; none on local-only nodes
    pub catalog: Option<Arc<dyn AppCatalog>>,
}

impl NodeServices {
    /// Results logged, nothing reported, no installs
    pub fn local() -> Self {
        Self {
            sink: Arc::new(LogSink),
            reports: ReportHandle::disabled(),
            catalog: None,
        }
    }

    /// Everything backed by the router
    pub fn router(client: RouterClient) -> Self {
        let (reports, _task) = ReportHandle::spawn(Arc::new(client.clone()));
        Self {
            sink: Arc::new(RouterSink::new(client.clone())),
            reports,
            catalog: Some(Arc::new(client)),
        }
    }
}

pub struct Node {
    config: Arc<Config>,
    pool: SqlitePool,
    scheduler: SchedulerHandle,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
    uploader: Mutex<Option<Uploader>>,
    failures: FailureLog,
    apps: Option<AppStore>,
}

impl Node {
    /// Start a node with the process sandbox, backed by the router
    ///
    /// Local-only nodes log results instead of uploading them, report no
    /// job states and cannot fetch files or install apps.
    pub async fn start(config: Config) -> Result<Self> {
        let pool = db::connect_with(&config.database_url, config.database_busy_timeout()).await?;
        let sandbox = ProcessSandbox::new(SandboxPolicy::from_config(&config));

        let (sandbox, services) = if config.local_only {
            (sandbox, NodeServices::local())
        } else {
            let client = router_client(&config)?;
            (
                sandbox.with_file_source(Arc::new(client.clone())),
                NodeServices::router(client),
            )
        };

        Self::with_services(config, pool, Arc::new(sandbox), services).await
    }

    /// Start a node delivering to `sink`, with no other outside services
    pub async fn with_parts(
        config: Config,
        pool: SqlitePool,
        runner: Arc<dyn SandboxRunner>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self> {
        let services = NodeServices {
            sink,
            ..NodeServices::local()
        };
        Self::with_services(config, pool, runner, services).await
    }

    /// Start a node from explicit parts
    ///
    /// Order matters: crashed jobs are resolved and pending uploads resumed
    /// before the scheduler can produce new results.
    pub async fn with_services(
        config: Config,
        pool: SqlitePool,
        runner: Arc<dyn SandboxRunner>,
        services: NodeServices,
    ) -> Result<Self> {
        let NodeServices {
            sink,
            reports,
            catalog,
        } = services;
        let config = Arc::new(config);
        let failures = FailureLog::default();

        let report = recovery::recover_running(
            &pool,
            RecoverySettings::from_config(&config),
            &failures,
        )
        .await?;
        if !report.requeued.is_empty() || !report.failed.is_empty() {
            info!(
                "Recovery: {} requeued, {} failed, {} process group(s) killed, {} left unverified",
                report.requeued.len(),
                report.failed.len(),
                report.killed,
                report.unverified
            );
        }

        let uploader = Uploader::start(
            pool.clone(),
            sink,
            UploadSettings::from_config(&config),
            failures.clone(),
        );
        uploader.resume_pending(&pool).await?;

        let ctx = SchedulerContext {
            pool: pool.clone(),
            runner,
            uploader: uploader.handle(),
            failures: failures.clone(),
            reports,
        };
        let (scheduler, scheduler_task) =
            Scheduler::start(ctx, SchedulerSettings::from_config(&config)).await?;

        let apps = AppStore::from_config(&config, catalog, pool.clone());

        info!("Node {} ready", config.node_id);

        Ok(Self {
            config,
            pool,
            scheduler,
            scheduler_task: Mutex::new(Some(scheduler_task)),
            uploader: Mutex::new(Some(uploader)),
            failures,
            apps,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Validate and submit a request
    pub async fn submit(&self, request: JobRequest) -> Result<JobRecord> {
        validate(&request)?;
        self.scheduler.submit(request).await
    }

    /// Submit a request body received from the router
    pub async fn submit_job(&self, req: SubmitJob) -> Result<JobRecord> {
        self.submit(req.into_request()).await
    }

    pub async fn cancel(&self, id: Uuid) -> Result<JobRecord> {
        self.scheduler.cancel(id).await
    }

    pub async fn get_job(&self, id: Uuid) -> Result<JobRecord> {
        job_repository::get(&self.pool, id).await
    }

    /// All jobs newest first, or the jobs in `state` oldest first
    pub async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<JobRecord>> {
        match state {
            Some(state) => job_repository::list_by_state(&self.pool, state).await,
            None => job_repository::list_all(&self.pool).await,
        }
    }

    /// Start installing an app; 409 while it is installed or installing
    pub fn install_app(&self, app_id: &str) -> Result<()> {
        self.apps()?.install(app_id).map(drop)
    }

    /// Remove an app with no queued or running jobs
    pub async fn uninstall_app(&self, app_id: &str) -> Result<()> {
        self.apps()?.uninstall(app_id).await
    }

    pub async fn list_apps(&self) -> Result<Vec<String>> {
        self.apps()?.list().await
    }

    fn apps(&self) -> Result<&AppStore> {
        self.apps.as_ref().ok_or_else(|| {
            NodeError::Validation("node has no app_dir, apps are resolved from paths".to_string())
        })
    }

    /// Idle while at least one slot is free
    pub fn state(&self) -> NodeState {
        if self.scheduler.slots().available() == 0 {
            NodeState::Busy
        } else {
            NodeState::Idle
        }
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        let slots = self.scheduler.slots();
        let pending_uploads =
            upload_repository::count_by_state(&self.pool, UploadState::Pending).await?;

        Ok(NodeStatus {
            node_id: self.config.node_id.clone(),
            state: self.state(),
            slots_total: slots.total(),
            slots_in_use: slots.in_use(),
            queue_depth: self.scheduler.queue_depth(),
            queue_capacity: self.scheduler.queue_capacity(),
            pending_uploads,
            recent_failures: self.failures.snapshot(),
        })
    }

    /// Stop the scheduler, then the uploader
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        info!("Shutting down node {}", self.config.node_id);
        self.scheduler.shutdown().await;

        let task = self.scheduler_task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Scheduler task failed: {}", e);
            }
        }

        let uploader = self.uploader.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(uploader) = uploader {
            uploader.shutdown().await;
        }
    }
}

/// Router client with the upload timeout applied to every call
pub fn router_client(config: &Config) -> Result<RouterClient> {
    let http = reqwest::Client::builder()
        .timeout(config.upload_timeout())
        .build()
        .map_err(|e| NodeError::Unavailable(format!("failed to build HTTP client: {}", e)))?;

    Ok(RouterClient::with_client(
        config.router_url.clone(),
        config.node_id.clone(),
        http,
    ))
}

fn validate(request: &JobRequest) -> Result<()> {
    if request.id.is_nil() {
        return Err(NodeError::Validation("job id cannot be nil".to_string()));
    }

    if request.app.trim().is_empty() {
        return Err(NodeError::Validation("app cannot be empty".to_string()));
    }

    if request.limits.timeout_seconds == Some(0) {
        return Err(NodeError::Validation(
            "timeout_seconds must be greater than 0".to_string(),
        ));
    }

    if request.limits.memory_bytes == Some(0) || request.limits.cpu_seconds == Some(0) {
        return Err(NodeError::Validation(
            "resource limits must be greater than 0".to_string(),
        ));
    }

    if let Some(key) = request
        .env
        .keys()
        .find(|key| key.is_empty() || key.contains('=') || key.starts_with("INFRAX_"))
    {
        return Err(NodeError::Validation(format!(
            "environment variable '{}' is not allowed",
            key
        )));
    }

    Ok(())
}
