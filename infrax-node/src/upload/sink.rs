//! Transport seam for result delivery

use async_trait::async_trait;
use infrax_client::{RouterClient, UploadAck};
use infrax_core::domain::upload::UploadTask;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UploadError {
    /// Worth retrying: network trouble, router overloaded or down
    #[error("transient upload failure: {0}")]
    Transient(String),

    /// The router refused the result; retrying cannot help
    #[error("upload rejected: {0}")]
    Rejected(String),
}

/// Somewhere job results can be delivered to
///
/// Implementations must pass `task.idempotency_key` along so that a
/// repeated delivery is recognised by the receiver. Sinks that store files
/// receive a job's output files before its result, and the result carries
/// the ids they returned.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn deliver(&self, task: &UploadTask) -> Result<UploadAck, UploadError>;

    fn stores_files(&self) -> bool {
        false
    }

    /// Store one output file, returning its id
    ///
    /// `dir` is the file's directory below `output/`. The key is stable per
    /// job and file.
    async fn upload_file(
        &self,
        name: &str,
        dir: Option<&str>,
        content: Vec<u8>,
        idempotency_key: &str,
    ) -> Result<String, UploadError> {
        let _ = (dir, content, idempotency_key);
        Err(UploadError::Rejected(format!(
            "cannot store file {}: sink keeps no files",
            name
        )))
    }
}

fn classify(e: infrax_client::ClientError) -> UploadError {
    if e.is_transient() {
        UploadError::Transient(e.to_string())
    } else {
        UploadError::Rejected(e.to_string())
    }
}

/// Delivers results to the router over HTTP
pub struct RouterSink {
    client: RouterClient,
}

impl RouterSink {
    pub fn new(client: RouterClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResultSink for RouterSink {
    async fn deliver(&self, task: &UploadTask) -> Result<UploadAck, UploadError> {
        self.client
            .upload_result(&task.result, &task.idempotency_key)
            .await
            .map_err(classify)
    }

    fn stores_files(&self) -> bool {
        true
    }

    async fn upload_file(
        &self,
        name: &str,
        dir: Option<&str>,
        content: Vec<u8>,
        idempotency_key: &str,
    ) -> Result<String, UploadError> {
        self.client
            .upload_file(name, dir, content, idempotency_key)
            .await
            .map_err(classify)
    }
}

/// Acknowledges every result after logging it
///
/// Used by local-only nodes: results stay readable from the job store and
/// the job workspace, which such nodes never delete.
pub struct LogSink;

#[async_trait]
impl ResultSink for LogSink {
    async fn deliver(&self, task: &UploadTask) -> Result<UploadAck, UploadError> {
        tracing::info!(
            "Result of job {}: {} (exit code {:?})",
            task.job_id,
            task.result.state,
            task.result.exit_code
        );
        Ok(UploadAck::Accepted)
    }
}
