use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use std::time::Duration;

/// How long a statement waits for another connection's write lock
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens (or creates) the job store database
///
/// Writes are fully synchronous so that an acknowledged transition survives
/// a crash of the node or the host.
pub async fn create_pool(
    database_url: &str,
    busy_timeout: Duration,
) -> Result<SqlitePool, sqlx::Error> {
    let in_memory = database_url.contains(":memory:");

    let mut options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(busy_timeout)
        .foreign_keys(true);
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    // Every connection to :memory: is its own database
    let max_connections = if in_memory { 1 } else { 5 };

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    // Create jobs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id BLOB NOT NULL UNIQUE,
            app TEXT NOT NULL,
            request TEXT NOT NULL,
            state TEXT NOT NULL,
            failure TEXT,
            submitted_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT,
            exit_code INTEGER,
            output_location TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            pid INTEGER,
            pid_boot_id TEXT,
            pid_start_time INTEGER,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    add_missing_columns(pool, "jobs", JOB_COLUMNS_ADDED).await?;

    // Create uploads table, at most one task per job
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS uploads (
            job_id BLOB PRIMARY KEY REFERENCES jobs(id) ON DELETE CASCADE,
            idempotency_key TEXT NOT NULL UNIQUE,
            result TEXT NOT NULL,
            state TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for the scheduler and uploader scans
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state, submitted_at, seq)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_uploads_state ON uploads(state, created_at)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}

/// Columns added to `jobs` after its first release, with their types
const JOB_COLUMNS_ADDED: &[(&str, &str)] =
    &[("pid_boot_id", "TEXT"), ("pid_start_time", "INTEGER")];

async fn add_missing_columns(
    pool: &SqlitePool,
    table: &str,
    columns: &[(&str, &str)],
) -> Result<(), sqlx::Error> {
    let existing: Vec<(String,)> =
        sqlx::query_as(&format!("SELECT name FROM pragma_table_info('{}')", table))
            .fetch_all(pool)
            .await?;

    for (name, kind) in columns {
        if existing.iter().any(|(column,)| column == name) {
            continue;
        }
        sqlx::query(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, name, kind))
            .execute(pool)
            .await?;
        tracing::info!("Added column {}.{}", table, name);
    }

    Ok(())
}

/// Opens the store and brings its schema up to date
pub async fn connect(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    connect_with(database_url, DEFAULT_BUSY_TIMEOUT).await
}

pub async fn connect_with(
    database_url: &str,
    busy_timeout: Duration,
) -> Result<SqlitePool, sqlx::Error> {
    let pool = create_pool(database_url, busy_timeout).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

#[cfg(test)]
pub(crate) mod test_support {
    use sqlx::{Connection, SqliteConnection, SqlitePool};
    use std::path::PathBuf;
    use std::time::Duration;

    /// Fresh scratch directory under the system temp dir
    pub fn scratch_dir(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("infrax-node-tests")
            .join(format!("{}-{}", prefix, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// File-backed store in its own scratch directory
    pub async fn test_pool() -> SqlitePool {
        let dir = scratch_dir("db");
        let url = format!("sqlite://{}?mode=rwc", dir.join("node.db").display());
        super::connect(&url).await.unwrap()
    }

    /// Store whose writes give up quickly on a locked database, and its URL
    pub async fn contended_pool() -> (SqlitePool, String) {
        let dir = scratch_dir("db");
        let url = format!("sqlite://{}?mode=rwc", dir.join("node.db").display());
        let pool = super::connect_with(&url, Duration::from_millis(50))
            .await
            .unwrap();
        (pool, url)
    }

    /// Another connection holding the database write lock
    pub struct WriteLock(SqliteConnection);

    impl WriteLock {
        pub async fn acquire(url: &str) -> Self {
            let mut conn = SqliteConnection::connect(url).await.unwrap();
            sqlx::query("BEGIN IMMEDIATE")
                .execute(&mut conn)
                .await
                .unwrap();
            Self(conn)
        }

        pub async fn release(mut self) {
            sqlx::query("ROLLBACK").execute(&mut self.0).await.unwrap();
            self.0.close().await.unwrap();
        }
    }
}
