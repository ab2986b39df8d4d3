//! Job task
//!
//! One task per running job: runs it in the sandbox, stores the outcome and
//! its upload task, then hands the slot back to the scheduler. The slot is
//! held until the outcome is stored, however long the store takes.

use chrono::Utc;
use infrax_core::domain::job::{FailureReason, JobRecord, JobRequest, JobState};
use infrax_core::domain::node::FailureKind;
use infrax_core::domain::upload::UploadTask;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::slots::ExecutionSlot;
use super::{Command, SchedulerContext};
use crate::error::{NodeError, Result};
use crate::repository::job_repository::{self, StateFields};
use crate::repository::upload_repository;
use crate::sandbox::{ExecutionOutcome, JobControl, OutcomeStatus, SpawnedProcess, StopReason};

const FINISH_RETRY_BASE: Duration = Duration::from_millis(100);
const FINISH_RETRY_MAX: Duration = Duration::from_secs(5);

pub(crate) struct JobExecution {
    ctx: SchedulerContext,
    events: mpsc::Sender<Command>,
}

impl JobExecution {
    pub(crate) fn new(ctx: SchedulerContext, events: mpsc::Sender<Command>) -> Self {
        Self { ctx, events }
    }

    pub(crate) async fn run(
        self,
        request: JobRequest,
        slot: Arc<ExecutionSlot>,
        stop: oneshot::Receiver<StopReason>,
    ) {
        let id = request.id;

        let (spawned_tx, spawned_rx) = oneshot::channel::<SpawnedProcess>();
        let control = JobControl::new(stop).with_spawn_notifier(spawned_tx);

        // The runner waits for this record before it waits on the child
        let pool = self.ctx.pool.clone();
        let pid_recorder = tokio::spawn(async move {
            if let Ok(spawned) = spawned_rx.await {
                if let Err(e) = job_repository::record_pid(&pool, id, &spawned.identity).await {
                    warn!("Failed to record process group of job {}: {}", id, e);
                }
                let _ = spawned.recorded.send(());
            }
        });

        // A panicking runner must not take the slot or the node with it
        let runner = Arc::clone(&self.ctx.runner);
        let running_slot = Arc::clone(&slot);
        let running_request = request.clone();
        let outcome = match tokio::spawn(async move {
            runner.run(&running_request, &running_slot, control).await
        })
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Runner of job {} crashed: {}", id, e);
                ExecutionOutcome::failed(FailureReason::Internal {
                    message: format!("runner crashed: {}", e),
                })
            }
        };

        // The pid must be written before the terminal transition clears it
        let _ = pid_recorder.await;

        let record = self.record_outcome(&request, outcome).await;

        if self
            .events
            .send(Command::Finished { id, record, slot })
            .await
            .is_err()
        {
            debug!("Scheduler gone before job {} reported back", id);
        }
    }

    /// Persist the outcome; `None` when the job stays Running
    async fn record_outcome(
        &self,
        request: &JobRequest,
        outcome: ExecutionOutcome,
    ) -> Option<JobRecord> {
        let id = request.id;
        let (state, failure) = match outcome.status {
            OutcomeStatus::Succeeded => (JobState::Succeeded, None),
            OutcomeStatus::Failed(reason) => (JobState::Failed, Some(reason)),
            OutcomeStatus::Cancelled => (JobState::Cancelled, None),
            OutcomeStatus::Interrupted => {
                info!("Job {} interrupted, left Running for recovery", id);
                return None;
            }
        };

        let fields = StateFields {
            finished_at: Some(Utc::now()),
            exit_code: outcome.exit_code,
            failure: failure.clone(),
            output_location: outcome
                .workspace
                .as_ref()
                .map(|workspace| workspace.display().to_string()),
            ..Default::default()
        };

        match self
            .finish_with_retry(id, state, fields, outcome.output, outcome.output_files)
            .await
        {
            Ok((record, task)) => {
                match &failure {
                    Some(reason) => {
                        warn!("Job {} failed: {}", id, reason);
                        self.ctx
                            .failures
                            .record(id, FailureKind::Job, reason.to_string());
                    }
                    None => info!("Job {} finished: {}", id, record.state),
                }
                self.ctx.reports.report(&record);
                self.ctx.uploader.enqueue(task);
                Some(record)
            }
            Err(e) => {
                error!("Failed to record outcome of job {}: {}", id, e);
                None
            }
        }
    }

    /// Store the terminal transition, retrying while the store is unavailable
    ///
    /// A commit that failed on the way back may still have landed; the
    /// retry then meets a terminal record and picks up what was stored.
    async fn finish_with_retry(
        &self,
        id: Uuid,
        state: JobState,
        fields: StateFields,
        output: Option<String>,
        output_files: Vec<String>,
    ) -> Result<(JobRecord, UploadTask)> {
        let mut delay = FINISH_RETRY_BASE;
        let mut retried = false;

        loop {
            let finished = job_repository::finish(
                &self.ctx.pool,
                id,
                state,
                fields.clone(),
                output.clone(),
                output_files.clone(),
            )
            .await;

            match finished {
                Err(e) if e.is_retryable() => {
                    warn!(
                        "Failed to record outcome of job {}, retrying in {:?}: {}",
                        id, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(FINISH_RETRY_MAX);
                    retried = true;
                }
                Err(NodeError::InvalidTransition { from, .. }) if retried && from.is_terminal() => {
                    return self.stored_outcome(id).await;
                }
                other => return other,
            }
        }
    }

    async fn stored_outcome(&self, id: Uuid) -> Result<(JobRecord, UploadTask)> {
        let record = job_repository::get(&self.ctx.pool, id).await?;
        let task = upload_repository::find_by_job(&self.ctx.pool, id)
            .await?
            .ok_or_else(|| {
                NodeError::Unavailable(format!("job {} is {} without a result", id, record.state))
            })?;
        Ok((record, task))
    }
}
