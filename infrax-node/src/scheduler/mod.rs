//! Scheduler / Dispatcher
//!
//! A single actor task owns the FIFO queue and the table of running jobs.
//! Everything else talks to it through [`SchedulerHandle`], so queue order
//! and job ownership never need a lock:
//!
//! - `submit` admits or rejects a request and returns without waiting for a
//!   slot
//! - after every message the actor pairs the head of the queue with free
//!   execution slots and spawns one job task per pairing
//! - job tasks report back when their outcome is stored; their slot is
//!   released by the actor on that report
//!
//! The Running count in the store can therefore never exceed the slot pool.
//!
//! A job leaves the queue only once its move to Running is stored. When the
//! store refuses the move, the job goes back to the head of the queue and
//! dispatch pauses until a retry timer wakes the actor.

pub mod execution;
pub mod recovery;
pub mod reporter;
pub mod slots;

use chrono::Utc;
use infrax_core::domain::job::{JobRecord, JobRequest, JobState};
use sqlx::SqlitePool;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{NodeError, Result};
use crate::node::failures::FailureLog;
use crate::repository::job_repository::{self, StateFields};
use crate::sandbox::{SandboxRunner, StopReason};
use crate::upload::UploaderHandle;

use execution::JobExecution;
use reporter::ReportHandle;
use slots::{ExecutionSlot, SlotPool};

const COMMAND_BUFFER: usize = 256;

/// Pause before dispatching again after the store failed a start
const DISPATCH_RETRY: Duration = Duration::from_millis(250);

/// Scheduler tunables taken from the node configuration
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_concurrent_jobs: usize,
    pub queue_capacity: usize,
    /// Bound on how long `cancel` waits for a running job to die
    pub cancel_timeout: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent_jobs: config.max_concurrent_jobs,
            queue_capacity: config.queue_capacity,
            cancel_timeout: config.cancel_timeout(),
        }
    }
}

/// Messages understood by the scheduler actor
pub(crate) enum Command {
    Submit {
        request: JobRequest,
        reply: oneshot::Sender<Result<JobRecord>>,
    },
    Cancel {
        id: Uuid,
        reply: oneshot::Sender<Result<JobRecord>>,
    },
    /// Sent by a job task once its outcome is stored (`None` if it was not)
    Finished {
        id: Uuid,
        record: Option<JobRecord>,
        slot: Arc<ExecutionSlot>,
    },
    /// Dispatch again after a paused start
    Retry,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Shared dependencies of the actor and the job tasks it spawns
#[derive(Clone)]
pub struct SchedulerContext {
    pub pool: SqlitePool,
    pub runner: Arc<dyn SandboxRunner>,
    pub uploader: UploaderHandle,
    pub failures: FailureLog,
    pub reports: ReportHandle,
}

/// Cloneable front door of the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
    slots: SlotPool,
    queue_depth: Arc<AtomicUsize>,
    queue_capacity: usize,
    cancel_timeout: Duration,
}

impl SchedulerHandle {
    /// Admit a request
    ///
    /// Fails with `CapacityExceeded` when the queue is full, `DuplicateJob`
    /// when the id is taken. Otherwise the job is persisted as Queued and
    /// returned without waiting for a slot.
    pub async fn submit(&self, request: JobRequest) -> Result<JobRecord> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Submit { request, reply }).await?;
        rx.await.map_err(|_| scheduler_gone())?
    }

    /// Cancel a queued or running job
    ///
    /// A queued job is dropped from the queue without ever starting. A
    /// running job has its process group killed; the call returns once the
    /// job is recorded Cancelled, or fails after the cancel timeout.
    pub async fn cancel(&self, id: Uuid) -> Result<JobRecord> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel { id, reply }).await?;

        tokio::time::timeout(self.cancel_timeout, rx)
            .await
            .map_err(|_| {
                NodeError::Unavailable(format!(
                    "cancellation of job {} not confirmed within {:?}",
                    id, self.cancel_timeout
                ))
            })?
            .map_err(|_| scheduler_gone())?
    }

    /// Jobs waiting for a slot
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Acquire)
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn slots(&self) -> &SlotPool {
        &self.slots
    }

    /// Stop the actor
    ///
    /// Running jobs are killed and left Running in the store so the next
    /// start recovers them; queued jobs stay Queued.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).await.map_err(|_| scheduler_gone())
    }
}

fn scheduler_gone() -> NodeError {
    NodeError::Unavailable("scheduler is not running".to_string())
}

struct RunningJob {
    stop: Option<oneshot::Sender<StopReason>>,
    /// Cancel requests waiting for the job to end
    waiters: Vec<oneshot::Sender<Result<JobRecord>>>,
}

pub struct Scheduler {
    ctx: SchedulerContext,
    slots: SlotPool,
    queue: VecDeque<JobRequest>,
    running: HashMap<Uuid, RunningJob>,
    queue_depth: Arc<AtomicUsize>,
    queue_capacity: usize,
    cancel_timeout: Duration,
    events: mpsc::Sender<Command>,
    /// A retry timer is armed; dispatch waits for it
    retry_pending: bool,
}

impl Scheduler {
    /// Spawn the actor
    ///
    /// Jobs already Queued in the store are loaded first, oldest
    /// submission first. Crash recovery of Running jobs must have run
    /// before this (see [`recovery::recover_running`]).
    pub async fn start(
        ctx: SchedulerContext,
        settings: SchedulerSettings,
    ) -> Result<(SchedulerHandle, JoinHandle<()>)> {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let slots = SlotPool::new(settings.max_concurrent_jobs);
        let queue_depth = Arc::new(AtomicUsize::new(0));

        let mut scheduler = Scheduler {
            ctx,
            slots: slots.clone(),
            queue: VecDeque::new(),
            running: HashMap::new(),
            queue_depth: Arc::clone(&queue_depth),
            queue_capacity: settings.queue_capacity,
            cancel_timeout: settings.cancel_timeout,
            events: tx.clone(),
            retry_pending: false,
        };

        let queued = job_repository::list_by_state(&scheduler.ctx.pool, JobState::Queued).await?;
        if !queued.is_empty() {
            info!("Reloaded {} queued job(s)", queued.len());
        }
        for record in queued {
            scheduler.enqueue(record.request);
        }

        info!(
            "Starting scheduler ({} slot(s), queue capacity {})",
            settings.max_concurrent_jobs, settings.queue_capacity
        );
        let task = tokio::spawn(scheduler.run(rx));

        let handle = SchedulerHandle {
            tx,
            slots,
            queue_depth,
            queue_capacity: settings.queue_capacity,
            cancel_timeout: settings.cancel_timeout,
        };
        Ok((handle, task))
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        self.dispatch().await;

        while let Some(command) = rx.recv().await {
            match command {
                Command::Submit { request, reply } => {
                    let result = self.admit(request).await;
                    let _ = reply.send(result);
                }
                Command::Cancel { id, reply } => self.cancel(id, reply).await,
                Command::Finished { id, record, slot } => {
                    drop(slot);
                    self.complete(id, record);
                }
                Command::Retry => self.retry_pending = false,
                Command::Shutdown { reply } => {
                    self.stop_running(&mut rx).await;
                    let _ = reply.send(());
                    break;
                }
            }

            self.dispatch().await;
        }

        self.slots.close();
        info!("Scheduler stopped");
    }

    async fn admit(&mut self, request: JobRequest) -> Result<JobRecord> {
        if self.queue.len() >= self.queue_capacity {
            warn!(
                "Rejecting job {}: queue full ({} jobs)",
                request.id, self.queue_capacity
            );
            return Err(NodeError::CapacityExceeded {
                capacity: self.queue_capacity,
            });
        }

        let record = job_repository::create(&self.ctx.pool, request.clone()).await?;
        info!("Queued job {} (app {})", record.id(), record.request.app);
        self.enqueue(request);
        Ok(record)
    }

    /// Insert keeping the queue ordered by submission time
    fn enqueue(&mut self, request: JobRequest) {
        let position = self
            .queue
            .iter()
            .rposition(|queued| queued.submitted_at <= request.submitted_at)
            .map_or(0, |index| index + 1);
        self.queue.insert(position, request);
        self.sync_depth();
    }

    fn sync_depth(&self) {
        self.queue_depth.store(self.queue.len(), Ordering::Release);
    }

    /// Pair queued jobs with free slots, head of the queue first
    async fn dispatch(&mut self) {
        while !self.retry_pending && !self.queue.is_empty() {
            let Some(slot) = self.slots.try_acquire() else {
                break;
            };
            let Some(request) = self.queue.pop_front() else {
                break;
            };
            self.sync_depth();

            let fields = StateFields {
                started_at: Some(Utc::now()),
                ..Default::default()
            };
            match job_repository::update_state(&self.ctx.pool, request.id, JobState::Running, fields)
                .await
            {
                Ok(record) => {
                    self.ctx.reports.report(&record);
                    self.launch(request, slot);
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        "Failed to start job {}, retrying in {:?}: {}",
                        request.id, DISPATCH_RETRY, e
                    );
                    self.queue.push_front(request);
                    self.sync_depth();
                    self.schedule_retry();
                }
                // Cancelled or removed behind the scheduler's back
                Err(e) => error!("Dropping job {} from the queue: {}", request.id, e),
            }
        }
    }

    fn schedule_retry(&mut self) {
        if self.retry_pending {
            return;
        }
        self.retry_pending = true;

        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DISPATCH_RETRY).await;
            let _ = events.send(Command::Retry).await;
        });
    }

    fn launch(&mut self, request: JobRequest, slot: ExecutionSlot) {
        let id = request.id;
        let (stop_tx, stop_rx) = oneshot::channel();

        let execution = JobExecution::new(self.ctx.clone(), self.events.clone());
        tokio::spawn(execution.run(request, Arc::new(slot), stop_rx));

        self.running.insert(
            id,
            RunningJob {
                stop: Some(stop_tx),
                waiters: Vec::new(),
            },
        );
        debug!("Job {} running ({} slot(s) in use)", id, self.slots.in_use());
    }

    async fn cancel(&mut self, id: Uuid, reply: oneshot::Sender<Result<JobRecord>>) {
        if let Some(position) = self.queue.iter().position(|queued| queued.id == id) {
            let Some(request) = self.queue.remove(position) else {
                return;
            };
            self.sync_depth();
            let result = self.cancel_queued(request).await;
            let _ = reply.send(result);
            return;
        }

        if let Some(job) = self.running.get_mut(&id) {
            if let Some(stop) = job.stop.take() {
                info!("Cancelling running job {}", id);
                let _ = stop.send(StopReason::Cancel);
            }
            job.waiters.push(reply);
            return;
        }

        let result = match job_repository::get(&self.ctx.pool, id).await {
            Ok(record) if record.state.is_terminal() => Err(NodeError::InvalidState {
                id,
                state: record.state,
            }),
            Ok(record) => Err(NodeError::Unavailable(format!(
                "job {} is {} but not tracked by the scheduler",
                id, record.state
            ))),
            Err(e) => Err(e),
        };
        let _ = reply.send(result);
    }

    async fn cancel_queued(&mut self, request: JobRequest) -> Result<JobRecord> {
        let id = request.id;
        match job_repository::finish(
            &self.ctx.pool,
            id,
            JobState::Cancelled,
            StateFields::default(),
            None,
            Vec::new(),
        )
        .await
        {
            Ok((record, task)) => {
                info!("Cancelled queued job {}", id);
                self.ctx.reports.report(&record);
                self.ctx.uploader.enqueue(task);
                Ok(record)
            }
            Err(e) => {
                self.enqueue(request);
                Err(e)
            }
        }
    }

    fn complete(&mut self, id: Uuid, record: Option<JobRecord>) {
        let Some(job) = self.running.remove(&id) else {
            warn!("Completion of unknown job {}", id);
            return;
        };

        for waiter in job.waiters {
            let result = match &record {
                Some(record) if record.state == JobState::Cancelled => Ok(record.clone()),
                Some(record) => Err(NodeError::InvalidState {
                    id,
                    state: record.state,
                }),
                None => Err(NodeError::Unavailable(format!(
                    "job {} stopped without a recorded outcome",
                    id
                ))),
            };
            let _ = waiter.send(result);
        }
    }

    /// Kill every running job and wait, bounded, for their tasks to report
    async fn stop_running(&mut self, rx: &mut mpsc::Receiver<Command>) {
        if self.running.is_empty() {
            return;
        }

        info!("Stopping {} running job(s)", self.running.len());
        for job in self.running.values_mut() {
            if let Some(stop) = job.stop.take() {
                let _ = stop.send(StopReason::Shutdown);
            }
        }

        let deadline = tokio::time::Instant::now() + self.cancel_timeout;
        while !self.running.is_empty() {
            let command = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(command)) => command,
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "{} job(s) did not stop within {:?}",
                        self.running.len(),
                        self.cancel_timeout
                    );
                    break;
                }
            };

            match command {
                Command::Finished { id, record, slot } => {
                    drop(slot);
                    self.complete(id, record);
                }
                Command::Retry => {}
                Command::Submit { reply, .. } => {
                    let _ = reply.send(Err(NodeError::Unavailable(
                        "node is shutting down".to_string(),
                    )));
                }
                Command::Cancel { reply, .. } => {
                    let _ = reply.send(Err(NodeError::Unavailable(
                        "node is shutting down".to_string(),
                    )));
                }
                Command::Shutdown { reply } => {
                    let _ = reply.send(());
                }
            }
        }
    }
}
