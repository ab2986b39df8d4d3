//! Crash recovery
//!
//! A job found Running at startup has no supervising task: the node died
//! while it ran. Its process group is killed if it survived and is provably
//! still the job's, then the job is failed or put back in the queue
//! according to the recovery policy.

use infrax_core::domain::job::{FailureReason, JobState};
use infrax_core::domain::node::FailureKind;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{Config, RecoveryPolicy};
use crate::error::Result;
use crate::node::failures::FailureLog;
use crate::repository::job_repository::{self, StateFields};
use crate::sandbox::{ProcessIdentity, kill_process_group, process_group_alive};

#[derive(Debug, Clone, Copy)]
pub struct RecoverySettings {
    pub policy: RecoveryPolicy,
    /// Requeues allowed per job before it is failed instead
    pub max_attempts: u32,
}

impl RecoverySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            policy: config.recovery_policy,
            max_attempts: config.max_recovery_attempts,
        }
    }
}

/// What recovery did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: Vec<Uuid>,
    pub failed: Vec<Uuid>,
    /// Orphaned process groups that were still alive and got killed
    pub killed: usize,
    /// Live groups under a recorded id that could not be proven to be the
    /// job's, left alone
    pub unverified: usize,
}

/// Resolve every Running job left behind by a previous run
///
/// Failed jobs get their upload task in the store; the uploader picks it up
/// with the other pending tasks.
pub async fn recover_running(
    pool: &SqlitePool,
    settings: RecoverySettings,
    failures: &FailureLog,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let orphans = job_repository::list_by_state(pool, JobState::Running).await?;

    if orphans.is_empty() {
        return Ok(report);
    }
    warn!("Found {} job(s) left Running by a previous run", orphans.len());

    for record in orphans {
        let id = record.id();

        if let Some(identity) = job_repository::recorded_process(pool, id).await? {
            reap_orphan(id, &identity, &mut report);
        }

        let requeue = settings.policy == RecoveryPolicy::Requeue
            && record.retry_count < settings.max_attempts;

        if requeue {
            let record = job_repository::requeue_after_crash(pool, id).await?;
            info!(
                "Requeued job {} after crash (attempt {})",
                id, record.retry_count
            );
            report.requeued.push(id);
        } else {
            job_repository::finish(
                pool,
                id,
                JobState::Failed,
                StateFields {
                    failure: Some(FailureReason::RecoveredAfterCrash),
                    ..Default::default()
                },
                None,
                Vec::new(),
            )
            .await?;
            warn!("Failed job {} after crash", id);
            failures.record(
                id,
                FailureKind::Job,
                FailureReason::RecoveredAfterCrash.to_string(),
            );
            report.failed.push(id);
        }
    }

    Ok(report)
}

/// Kill the group of a crashed job unless the id now belongs to someone else
fn reap_orphan(id: Uuid, identity: &ProcessIdentity, report: &mut RecoveryReport) {
    let pgid = identity.pgid;
    if !process_group_alive(pgid) {
        return;
    }

    if !identity.matches_live() {
        warn!(
            "Process group {} recorded for job {} cannot be verified as the job's, leaving it alone",
            pgid, id
        );
        report.unverified += 1;
        return;
    }

    if kill_process_group(pgid) {
        warn!("Killed orphaned process group {} of job {}", pgid, id);
        report.killed += 1;
    }
}
