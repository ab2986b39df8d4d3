//! Job state reporting
//!
//! Every stored transition of a job is pushed to the router, best effort.
//! One task sends the reports in the order the transitions were stored; a
//! failed report is logged and dropped, the result upload stays the
//! authoritative record of how a job ended.

use async_trait::async_trait;
use infrax_client::RouterClient;
use infrax_core::domain::job::JobRecord;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Receiver of job state changes
#[async_trait]
pub trait StateReporter: Send + Sync {
    async fn report(&self, record: &JobRecord) -> Result<(), String>;
}

#[async_trait]
impl StateReporter for RouterClient {
    async fn report(&self, record: &JobRecord) -> Result<(), String> {
        self.update_job_state(record)
            .await
            .map_err(|e| e.to_string())
    }
}

/// Queue of state reports, cheap to clone
#[derive(Debug, Clone, Default)]
pub struct ReportHandle {
    tx: Option<flume::Sender<JobRecord>>,
}

impl ReportHandle {
    /// A handle that drops every report
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Start the sending task; it ends once every handle is dropped
    pub fn spawn(reporter: Arc<dyn StateReporter>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = flume::unbounded::<JobRecord>();
        let task = tokio::spawn(async move {
            while let Ok(record) = rx.recv_async().await {
                match reporter.report(&record).await {
                    Ok(()) => debug!("Reported job {} as {}", record.id(), record.state),
                    Err(e) => warn!(
                        "Failed to report job {} as {}: {}",
                        record.id(),
                        record.state,
                        e
                    ),
                }
            }
        });
        (Self { tx: Some(tx) }, task)
    }

    pub fn report(&self, record: &JobRecord) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(record.clone());
        }
    }
}
