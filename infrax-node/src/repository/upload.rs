//! Upload Repository
//!
//! Persistence for upload tasks. Tasks are only ever inserted together with
//! the terminal transition of their job (see `job::finish`).

use chrono::{DateTime, Utc};
use infrax_core::domain::upload::{JobResultPayload, UploadState, UploadTask};
use sqlx::types::Json;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::{NodeError, Result};

/// Insert a fresh task inside the caller's transaction
pub(crate) async fn insert(conn: &mut SqliteConnection, task: &UploadTask) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO uploads (job_id, idempotency_key, result, state, attempts, last_error, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(task.job_id)
    .bind(&task.idempotency_key)
    .bind(Json(&task.result))
    .bind(task.state.as_str())
    .bind(i64::from(task.attempts))
    .bind(task.last_error.as_deref())
    .bind(task.created_at)
    .bind(task.updated_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Find the upload task of a job
pub async fn find_by_job(pool: &SqlitePool, job_id: Uuid) -> Result<Option<UploadTask>> {
    let row = sqlx::query_as::<_, UploadRow>(&format!("{} WHERE job_id = ?", SELECT_UPLOAD))
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    row.map(UploadTask::try_from).transpose()
}

/// Tasks in `state`, oldest first
pub async fn list_by_state(pool: &SqlitePool, state: UploadState) -> Result<Vec<UploadTask>> {
    let rows = sqlx::query_as::<_, UploadRow>(&format!(
        "{} WHERE state = ? ORDER BY created_at ASC",
        SELECT_UPLOAD
    ))
    .bind(state.as_str())
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(UploadTask::try_from).collect()
}

/// Tasks still awaiting acknowledgement
pub async fn pending(pool: &SqlitePool) -> Result<Vec<UploadTask>> {
    list_by_state(pool, UploadState::Pending).await
}

/// Mark a task delivered
///
/// Returns true only for the call that actually moved it out of Pending,
/// so repeated acknowledgements are counted once.
pub async fn mark_delivered(pool: &SqlitePool, job_id: Uuid) -> Result<bool> {
    let updated = sqlx::query(
        r#"
        UPDATE uploads
        SET state = ?, attempts = attempts + 1, last_error = NULL, updated_at = ?
        WHERE job_id = ? AND state = ?
        "#,
    )
    .bind(UploadState::Delivered.as_str())
    .bind(Utc::now())
    .bind(job_id)
    .bind(UploadState::Pending.as_str())
    .execute(pool)
    .await?;

    Ok(updated.rows_affected() == 1)
}

/// Store the router ids of a task's output files
///
/// Written once the files are uploaded so that later attempts deliver the
/// same ids instead of uploading again.
pub async fn record_file_ids(pool: &SqlitePool, job_id: Uuid, result: &JobResultPayload) -> Result<()> {
    let updated = sqlx::query(
        r#"
        UPDATE uploads
        SET result = ?, updated_at = ?
        WHERE job_id = ? AND state = ?
        "#,
    )
    .bind(Json(result))
    .bind(Utc::now())
    .bind(job_id)
    .bind(UploadState::Pending.as_str())
    .execute(pool)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(NodeError::NotFound(job_id));
    }
    Ok(())
}

/// Record a failed delivery attempt, returning the new attempt count
pub async fn record_attempt(pool: &SqlitePool, job_id: Uuid, error: &str) -> Result<u32> {
    let attempts: Option<(i64,)> = sqlx::query_as(
        r#"
        UPDATE uploads
        SET attempts = attempts + 1, last_error = ?, updated_at = ?
        WHERE job_id = ? AND state = ?
        RETURNING attempts
        "#,
    )
    .bind(error)
    .bind(Utc::now())
    .bind(job_id)
    .bind(UploadState::Pending.as_str())
    .fetch_optional(pool)
    .await?;

    match attempts {
        Some((attempts,)) => Ok(attempts.max(0) as u32),
        None => Err(NodeError::NotFound(job_id)),
    }
}

/// Give up on a task; true if it was still Pending
pub async fn mark_permanently_failed(pool: &SqlitePool, job_id: Uuid, error: &str) -> Result<bool> {
    let updated = sqlx::query(
        r#"
        UPDATE uploads
        SET state = ?, last_error = ?, updated_at = ?
        WHERE job_id = ? AND state = ?
        "#,
    )
    .bind(UploadState::PermanentlyFailed.as_str())
    .bind(error)
    .bind(Utc::now())
    .bind(job_id)
    .bind(UploadState::Pending.as_str())
    .execute(pool)
    .await?;

    Ok(updated.rows_affected() == 1)
}

pub async fn count_by_state(pool: &SqlitePool, state: UploadState) -> Result<usize> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM uploads WHERE state = ?")
        .bind(state.as_str())
        .fetch_one(pool)
        .await?;

    Ok(count as usize)
}

// =============================================================================
// Database Row Types
// =============================================================================

const SELECT_UPLOAD: &str = r#"
    SELECT job_id, idempotency_key, result, state, attempts, last_error, created_at, updated_at
    FROM uploads
"#;

#[derive(sqlx::FromRow)]
struct UploadRow {
    job_id: Uuid,
    idempotency_key: String,
    result: Json<JobResultPayload>,
    state: String,
    attempts: i64,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UploadRow> for UploadTask {
    type Error = NodeError;

    fn try_from(row: UploadRow) -> Result<Self> {
        let state = row
            .state
            .parse::<UploadState>()
            .map_err(|e| NodeError::Storage(sqlx::Error::Decode(e.into())))?;

        Ok(UploadTask {
            job_id: row.job_id,
            idempotency_key: row.idempotency_key,
            result: row.result.0,
            state,
            attempts: row.attempts.max(0) as u32,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
