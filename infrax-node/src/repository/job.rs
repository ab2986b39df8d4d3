//! Job Repository
//!
//! Durable mapping from job id to JobRecord. Every state change is a
//! compare-and-set on the current state inside a transaction, so concurrent
//! writers can never both move the same job and a crash leaves either the
//! old or the new row.

use chrono::{DateTime, Utc};
use infrax_core::domain::job::{FailureReason, JobRecord, JobRequest, JobState};
use infrax_core::domain::upload::{JobResultPayload, UploadTask};
use sqlx::types::Json;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::{NodeError, Result};
use crate::repository::upload;
use crate::sandbox::ProcessIdentity;

/// Fields written together with a state transition
///
/// `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct StateFields {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub failure: Option<FailureReason>,
    pub output_location: Option<String>,
}

/// Create a new Queued job
///
/// Fails with `DuplicateJob` if a job with the same id exists.
pub async fn create(pool: &SqlitePool, request: JobRequest) -> Result<JobRecord> {
    let record = JobRecord::queued(request);

    let inserted = sqlx::query(
        r#"
        INSERT INTO jobs (id, app, request, state, submitted_at, retry_count, updated_at)
        VALUES (?, ?, ?, ?, ?, 0, ?)
        "#,
    )
    .bind(record.id())
    .bind(&record.request.app)
    .bind(Json(&record.request))
    .bind(JobState::Queued.as_str())
    .bind(record.request.submitted_at)
    .bind(record.updated_at)
    .execute(pool)
    .await;

    match inserted {
        Ok(_) => Ok(record),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            Err(NodeError::DuplicateJob(record.id()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Find a job by ID
pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<JobRecord>> {
    let mut conn = pool.acquire().await?;
    fetch(&mut conn, id).await
}

/// Get a job by ID, `NotFound` if absent
pub async fn get(pool: &SqlitePool, id: Uuid) -> Result<JobRecord> {
    find_by_id(pool, id).await?.ok_or(NodeError::NotFound(id))
}

/// Jobs in `state`, oldest submission first
pub async fn list_by_state(pool: &SqlitePool, state: JobState) -> Result<Vec<JobRecord>> {
    let rows = sqlx::query_as::<_, JobRow>(&format!(
        "{} WHERE state = ? ORDER BY submitted_at ASC, seq ASC",
        SELECT_JOB
    ))
    .bind(state.as_str())
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(JobRecord::try_from).collect()
}

/// List all jobs, newest first
pub async fn list_all(pool: &SqlitePool) -> Result<Vec<JobRecord>> {
    let rows = sqlx::query_as::<_, JobRow>(&format!(
        "{} ORDER BY submitted_at DESC, seq DESC",
        SELECT_JOB
    ))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(JobRecord::try_from).collect()
}

/// Move a job to `new_state`
///
/// Fails with `NotFound` or `InvalidTransition`. Entering a terminal state
/// through this function does not create an upload task; use [`finish`].
pub async fn update_state(
    pool: &SqlitePool,
    id: Uuid,
    new_state: JobState,
    fields: StateFields,
) -> Result<JobRecord> {
    let mut tx = pool.begin().await?;
    let record = transition(&mut tx, id, new_state, &fields).await?;
    tx.commit().await?;
    Ok(record)
}

/// Move a job to a terminal state and create its upload task atomically
///
/// `output` and `output_files` are packaged into the result as they are.
pub async fn finish(
    pool: &SqlitePool,
    id: Uuid,
    new_state: JobState,
    fields: StateFields,
    output: Option<String>,
    output_files: Vec<String>,
) -> Result<(JobRecord, UploadTask)> {
    if !new_state.is_terminal() {
        return Err(NodeError::Validation(format!(
            "{} is not a terminal state",
            new_state
        )));
    }

    let fields = StateFields {
        finished_at: fields.finished_at.or_else(|| Some(Utc::now())),
        ..fields
    };

    let mut tx = pool.begin().await?;
    let record = transition(&mut tx, id, new_state, &fields).await?;
    let task = UploadTask::new(JobResultPayload::from_record(&record, output, output_files));
    upload::insert(&mut tx, &task).await?;
    tx.commit().await?;

    Ok((record, task))
}

/// Record the process group of a running job
pub async fn record_pid(pool: &SqlitePool, id: Uuid, identity: &ProcessIdentity) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET pid = ?, pid_boot_id = ?, pid_start_time = ?, updated_at = ?
        WHERE id = ? AND state = ?
        "#,
    )
    .bind(i64::from(identity.pgid))
    .bind(identity.boot_id.as_deref())
    .bind(identity.start_time.and_then(|t| i64::try_from(t).ok()))
    .bind(Utc::now())
    .bind(id)
    .bind(JobState::Running.as_str())
    .execute(pool)
    .await?;

    Ok(())
}

/// Process group recorded for a job, if any
pub async fn recorded_process(pool: &SqlitePool, id: Uuid) -> Result<Option<ProcessIdentity>> {
    let row: Option<(Option<i64>, Option<String>, Option<i64>)> =
        sqlx::query_as("SELECT pid, pid_boot_id, pid_start_time FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;

    Ok(row.and_then(|(pid, boot_id, start_time)| {
        let pgid = u32::try_from(pid?).ok()?;
        Some(ProcessIdentity {
            pgid,
            boot_id,
            start_time: start_time.and_then(|t| u64::try_from(t).ok()),
        })
    }))
}

/// Put a crashed Running job back in the queue
///
/// The only transition that revisits a state. Used solely by crash
/// recovery; it bumps `retry_count` so the attempt stays visible.
pub async fn requeue_after_crash(pool: &SqlitePool, id: Uuid) -> Result<JobRecord> {
    let mut tx = pool.begin().await?;

    let updated = sqlx::query(
        r#"
        UPDATE jobs
        SET state = ?, retry_count = retry_count + 1, pid = NULL,
            pid_boot_id = NULL, pid_start_time = NULL,
            started_at = NULL, updated_at = ?
        WHERE id = ? AND state = ?
        "#,
    )
    .bind(JobState::Queued.as_str())
    .bind(Utc::now())
    .bind(id)
    .bind(JobState::Running.as_str())
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() == 0 {
        let state = current_state(&mut tx, id).await?;
        return Err(NodeError::InvalidTransition {
            id,
            from: state,
            to: JobState::Queued,
        });
    }

    let record = fetch(&mut tx, id).await?.ok_or(NodeError::NotFound(id))?;
    tx.commit().await?;
    Ok(record)
}

/// Queued or Running jobs of `app`
pub async fn count_active_for_app(pool: &SqlitePool, app: &str) -> Result<usize> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE app = ? AND state IN (?, ?)")
            .bind(app)
            .bind(JobState::Queued.as_str())
            .bind(JobState::Running.as_str())
            .fetch_one(pool)
            .await?;

    Ok(count as usize)
}

/// Number of jobs per state
pub async fn count_by_state(pool: &SqlitePool, state: JobState) -> Result<usize> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE state = ?")
        .bind(state.as_str())
        .fetch_one(pool)
        .await?;

    Ok(count as usize)
}

// =============================================================================
// Helper Functions
// =============================================================================

const SELECT_JOB: &str = r#"
    SELECT id, request, state, failure, started_at, finished_at, exit_code,
           output_location, retry_count, pid, updated_at
    FROM jobs
"#;

async fn fetch(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<JobRecord>> {
    let row = sqlx::query_as::<_, JobRow>(&format!("{} WHERE id = ?", SELECT_JOB))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    row.map(JobRecord::try_from).transpose()
}

async fn current_state(conn: &mut SqliteConnection, id: Uuid) -> Result<JobState> {
    let state: Option<(String,)> = sqlx::query_as("SELECT state FROM jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    match state {
        Some((state,)) => parse_state(&state),
        None => Err(NodeError::NotFound(id)),
    }
}

/// States from which `next` may be entered
fn predecessors(next: JobState) -> Vec<JobState> {
    JobState::ALL
        .into_iter()
        .filter(|state| state.can_transition_to(next))
        .collect()
}

/// Conditional update: only rows currently in a legal predecessor state move
///
/// The write comes first so the transaction holds the write lock before it
/// reads anything back.
async fn transition(
    conn: &mut SqliteConnection,
    id: Uuid,
    new_state: JobState,
    fields: &StateFields,
) -> Result<JobRecord> {
    let allowed = predecessors(new_state);
    if allowed.is_empty() {
        let from = current_state(conn, id).await?;
        return Err(NodeError::InvalidTransition {
            id,
            from,
            to: new_state,
        });
    }

    let placeholders = vec!["?"; allowed.len()].join(", ");
    let sql = format!(
        r#"
        UPDATE jobs
        SET state = ?,
            started_at = COALESCE(?, started_at),
            finished_at = COALESCE(?, finished_at),
            exit_code = COALESCE(?, exit_code),
            failure = COALESCE(?, failure),
            output_location = COALESCE(?, output_location),
            pid = CASE WHEN ? THEN NULL ELSE pid END,
            pid_boot_id = CASE WHEN ? THEN NULL ELSE pid_boot_id END,
            pid_start_time = CASE WHEN ? THEN NULL ELSE pid_start_time END,
            updated_at = ?
        WHERE id = ? AND state IN ({})
        "#,
        placeholders
    );

    let mut query = sqlx::query(&sql)
        .bind(new_state.as_str())
        .bind(fields.started_at)
        .bind(fields.finished_at)
        .bind(fields.exit_code)
        .bind(fields.failure.as_ref().map(Json))
        .bind(fields.output_location.as_deref())
        .bind(new_state.is_terminal())
        .bind(new_state.is_terminal())
        .bind(new_state.is_terminal())
        .bind(Utc::now())
        .bind(id);
    for state in &allowed {
        query = query.bind(state.as_str());
    }

    let updated = query.execute(&mut *conn).await?;

    if updated.rows_affected() == 0 {
        let from = current_state(conn, id).await?;
        return Err(NodeError::InvalidTransition {
            id,
            from,
            to: new_state,
        });
    }

    fetch(conn, id).await?.ok_or(NodeError::NotFound(id))
}

fn parse_state(s: &str) -> Result<JobState> {
    s.parse::<JobState>()
        .map_err(|e| NodeError::Storage(sqlx::Error::Decode(e.into())))
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    #[allow(dead_code)]
    id: Uuid,
    request: Json<JobRequest>,
    state: String,
    failure: Option<Json<FailureReason>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    output_location: Option<String>,
    retry_count: i64,
    pid: Option<i64>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = NodeError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(JobRecord {
            request: row.request.0,
            state: parse_state(&row.state)?,
            failure: row.failure.map(|f| f.0),
            started_at: row.started_at,
            finished_at: row.finished_at,
            exit_code: row.exit_code,
            output_location: row.output_location,
            retry_count: row.retry_count.max(0) as u32,
            pid: row.pid.and_then(|p| u32::try_from(p).ok()),
            updated_at: row.updated_at,
        })
    }
}
