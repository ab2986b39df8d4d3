//! Upload worker pool
//!
//! Tasks are queued on an unbounded channel so enqueueing never blocks the
//! job that produced them. A fixed set of workers drains the channel, each
//! call bounded by a timeout, transient failures retried with capped
//! exponential backoff.
//!
//! An attempt first uploads the job's output files when the sink stores
//! files, then delivers the result naming them. Once a task is Delivered or
//! PermanentlyFailed the job workspace is deleted unless workspaces are
//! retained.

use infrax_client::UploadAck;
use infrax_core::domain::node::FailureKind;
use infrax_core::domain::upload::UploadTask;
use sqlx::SqlitePool;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::sink::{ResultSink, UploadError};
use crate::config::Config;
use crate::error::Result;
use crate::node::failures::FailureLog;
use crate::repository::upload_repository;
use crate::sandbox::process::OUTPUT_DIR;

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub workers: usize,
    pub attempt_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Retries after the first attempt before giving up
    pub retry_limit: u32,
    /// Where job workspaces live
    pub workspace_base: PathBuf,
    /// Keep a job's workspace once its task is settled
    pub retain_workspaces: bool,
}

impl UploadSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.upload_workers.max(1),
            attempt_timeout: config.upload_timeout(),
            backoff_base: Duration::from_millis(config.upload_backoff_base_ms),
            backoff_max: Duration::from_millis(config.upload_backoff_max_ms),
            retry_limit: config.upload_retry_limit,
            workspace_base: config.workspace_base.clone(),
            retain_workspaces: config.retain_workspaces || config.local_only,
        }
    }

    fn workspace_of(&self, task: &UploadTask) -> PathBuf {
        self.workspace_base.join(task.job_id.to_string())
    }

    /// Delay before retry number `retry` (0-based): base * 2^retry, capped
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(31));
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

/// Sending side of the upload queue
#[derive(Debug, Clone)]
pub struct UploaderHandle {
    tx: flume::Sender<UploadTask>,
}

impl UploaderHandle {
    /// Create a handle and the queue it feeds
    pub fn channel() -> (Self, flume::Receiver<UploadTask>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }

    /// Queue a task for delivery; false once the uploader is gone
    ///
    /// A task that cannot be queued stays Pending in the store and is picked
    /// up again on the next start.
    pub fn enqueue(&self, task: UploadTask) -> bool {
        let job_id = task.job_id;
        match self.tx.send(task) {
            Ok(()) => true,
            Err(_) => {
                warn!("Uploader stopped, result of job {} left pending", job_id);
                false
            }
        }
    }
}

struct Worker {
    id: usize,
    pool: SqlitePool,
    sink: Arc<dyn ResultSink>,
    settings: UploadSettings,
    failures: FailureLog,
    shutdown: watch::Receiver<bool>,
}

pub struct Uploader {
    handle: UploaderHandle,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Uploader {
    /// Spawn the worker pool
    pub fn start(
        pool: SqlitePool,
        sink: Arc<dyn ResultSink>,
        settings: UploadSettings,
        failures: FailureLog,
    ) -> Self {
        let (handle, rx) = UploaderHandle::channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        info!("Starting {} upload worker(s)", settings.workers);

        let workers = (0..settings.workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    pool: pool.clone(),
                    sink: Arc::clone(&sink),
                    settings: settings.clone(),
                    failures: failures.clone(),
                    shutdown: shutdown_rx.clone(),
                };
                tokio::spawn(worker.run(rx.clone()))
            })
            .collect();

        Self {
            handle,
            shutdown,
            workers,
        }
    }

    pub fn handle(&self) -> UploaderHandle {
        self.handle.clone()
    }

    /// Queue every task still Pending in the store
    pub async fn resume_pending(&self, pool: &SqlitePool) -> Result<usize> {
        let pending = upload_repository::pending(pool).await?;
        let count = pending.len();
        for task in pending {
            self.handle.enqueue(task);
        }

        if count > 0 {
            info!("Resumed {} pending upload(s)", count);
        }
        Ok(count)
    }

    /// Stop the workers
    ///
    /// In-flight attempts are abandoned; their tasks stay Pending.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!("Upload worker panicked: {}", e);
            }
        }
        info!("Uploader stopped");
    }
}

impl Worker {
    async fn run(mut self, rx: flume::Receiver<UploadTask>) {
        debug!("Upload worker {} started", self.id);

        loop {
            let task = tokio::select! {
                task = rx.recv_async() => match task {
                    Ok(task) => task,
                    Err(_) => break,
                },
                _ = self.shutdown.changed() => break,
            };

            if !self.deliver(task).await {
                break;
            }
        }

        debug!("Upload worker {} stopped", self.id);
    }

    /// Deliver one task; false if shutdown interrupted it
    async fn deliver(&mut self, mut task: UploadTask) -> bool {
        let job_id = task.job_id;
        let mut retries = 0;

        loop {
            let attempt = Self::attempt(&self.pool, self.sink.as_ref(), &self.settings, &mut task);
            let attempt = tokio::select! {
                attempt = attempt => attempt,
                _ = self.shutdown.changed() => return false,
            };

            match attempt {
                Ok(ack) => {
                    self.acknowledge(&task, ack).await;
                    self.discard_workspace(&task).await;
                    return true;
                }
                Err(UploadError::Rejected(message)) => {
                    self.give_up(&task, &message).await;
                    self.discard_workspace(&task).await;
                    return true;
                }
                Err(UploadError::Transient(message)) => {
                    if let Err(e) =
                        upload_repository::record_attempt(&self.pool, job_id, &message).await
                    {
                        // Task no longer Pending (delivered by another worker)
                        debug!("Stopping delivery of job {} result: {}", job_id, e);
                        return true;
                    }

                    if retries >= self.settings.retry_limit {
                        self.give_up(&task, &message).await;
                        self.discard_workspace(&task).await;
                        return true;
                    }

                    let delay = self.settings.backoff(retries);
                    retries += 1;
                    warn!(
                        "Upload of job {} result failed ({}), retry {}/{} in {:?}",
                        job_id, message, retries, self.settings.retry_limit, delay
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.changed() => return false,
                    }
                }
            }
        }
    }

    /// Output files first, when the sink takes them, then the result
    async fn attempt(
        pool: &SqlitePool,
        sink: &dyn ResultSink,
        settings: &UploadSettings,
        task: &mut UploadTask,
    ) -> std::result::Result<UploadAck, UploadError> {
        let files_pending = task.result.file_ids.len() < task.result.output_files.len();
        if sink.stores_files() && files_pending {
            let output = settings.workspace_of(task).join(OUTPUT_DIR);
            let mut ids = Vec::with_capacity(task.result.output_files.len());
            for relative in &task.result.output_files {
                let key = format!("{}-file-{}", task.idempotency_key, relative);
                ids.push(upload_output_file(sink, settings, &output, relative, &key).await?);
            }

            task.result.file_ids = ids;
            // The per-file keys make a repeated upload harmless if this is lost
            if let Err(e) =
                upload_repository::record_file_ids(pool, task.job_id, &task.result).await
            {
                warn!("Failed to store file ids of job {}: {}", task.job_id, e);
            }
        }

        bounded(settings, sink.deliver(task)).await
    }

    async fn discard_workspace(&self, task: &UploadTask) {
        if self.settings.retain_workspaces {
            return;
        }

        let workspace = self.settings.workspace_of(task);
        match tokio::fs::remove_dir_all(&workspace).await {
            Ok(()) => debug!("Removed workspace {}", workspace.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove workspace {}: {}", workspace.display(), e),
        }
    }

    async fn acknowledge(&self, task: &UploadTask, ack: UploadAck) {
        match upload_repository::mark_delivered(&self.pool, task.job_id).await {
            Ok(true) => info!("Delivered result of job {} ({:?})", task.job_id, ack),
            Ok(false) => debug!("Result of job {} was already marked delivered", task.job_id),
            Err(e) => error!(
                "Result of job {} delivered but not recorded: {}",
                task.job_id, e
            ),
        }
    }

    async fn give_up(&self, task: &UploadTask, message: &str) {
        error!(
            "Giving up on result of job {}: {}",
            task.job_id, message
        );

        match upload_repository::mark_permanently_failed(&self.pool, task.job_id, message).await {
            Ok(true) => self.failures.record(
                task.job_id,
                FailureKind::Upload,
                format!("result upload failed: {}", message),
            ),
            Ok(false) => {}
            Err(e) => error!("Failed to record upload failure of job {}: {}", task.job_id, e),
        }
    }
}

async fn upload_output_file(
    sink: &dyn ResultSink,
    settings: &UploadSettings,
    output: &Path,
    relative: &str,
    key: &str,
) -> std::result::Result<String, UploadError> {
    let path = output.join(relative);
    let content = tokio::fs::read(&path).await.map_err(|e| {
        UploadError::Rejected(format!("cannot read output file {}: {}", path.display(), e))
    })?;

    let relative = Path::new(relative);
    let name = relative
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| UploadError::Rejected(format!("bad output file {}", relative.display())))?;
    let dir = relative
        .parent()
        .map(|dir| dir.to_string_lossy().into_owned())
        .filter(|dir| !dir.is_empty());

    bounded(settings, sink.upload_file(&name, dir.as_deref(), content, key)).await
}

/// One sink call, cut off after the attempt timeout
async fn bounded<T>(
    settings: &UploadSettings,
    call: impl Future<Output = std::result::Result<T, UploadError>>,
) -> std::result::Result<T, UploadError> {
    tokio::time::timeout(settings.attempt_timeout, call)
        .await
        .unwrap_or_else(|_| {
            Err(UploadError::Transient(format!(
                "no answer within {:?}",
                settings.attempt_timeout
            )))
        })
}
