//! Node-facing endpoints
//!
//! Job submission, inspection and cancellation on a single node.

use infrax_core::domain::job::{JobRecord, JobState};
use infrax_core::domain::node::NodeStatus;
use infrax_core::dto::job::SubmitJob;
use reqwest::Client;
use uuid::Uuid;

use crate::error::Result;
use crate::{handle_empty_response, handle_response};

/// HTTP client for a node's request surface
#[derive(Debug, Clone)]
pub struct NodeClient {
    /// Base URL of the node (e.g., "http://localhost:8000")
    base_url: String,
    client: Client,
}

impl NodeClient {
    /// Create a new node client
    ///
    /// # Example
    /// ```
    /// use infrax_client::NodeClient;
    ///
    /// let client = NodeClient::new("http://localhost:8000");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a node client with a custom HTTP client
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        Self {
            base_url: crate::normalize_base_url(base_url),
            client,
        }
    }

    /// Get the base URL of the node
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check that the node answers
    pub async fn health(&self) -> Result<()> {
        let url = format!("{}/__health", self.base_url);
        let response = self.client.get(&url).send().await?;

        handle_empty_response(response).await
    }

    /// Submit a job
    ///
    /// Fails with status 429 when the node's queue is full.
    pub async fn submit_job(&self, req: SubmitJob) -> Result<JobRecord> {
        let url = format!("{}/job", self.base_url);
        let response = self.client.post(&url).json(&req).send().await?;

        handle_response(response).await
    }

    /// Get a job by ID
    pub async fn get_job(&self, job_id: Uuid) -> Result<JobRecord> {
        let url = format!("{}/job/{}", self.base_url, job_id);
        let response = self.client.get(&url).send().await?;

        handle_response(response).await
    }

    /// List jobs, optionally only those in `state`
    pub async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<JobRecord>> {
        let url = format!("{}/jobs", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(state) = state {
            request = request.query(&[("state", state.as_str())]);
        }
        let response = request.send().await?;

        handle_response(response).await
    }

    /// Cancel a queued or running job
    ///
    /// Returns the record once the job is confirmed cancelled.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<JobRecord> {
        let url = format!("{}/job/{}/cancel", self.base_url, job_id);
        let response = self.client.post(&url).send().await?;

        handle_response(response).await
    }

    /// Install an app from the router in the background
    ///
    /// Fails with status 409 when the app is installed or being installed.
    pub async fn install_app(&self, app_id: &str) -> Result<()> {
        let url = format!("{}/app/{}", self.base_url, app_id);
        let response = self.client.post(&url).send().await?;

        handle_empty_response(response).await
    }

    /// Remove an installed app
    pub async fn uninstall_app(&self, app_id: &str) -> Result<()> {
        let url = format!("{}/app/{}", self.base_url, app_id);
        let response = self.client.delete(&url).send().await?;

        handle_empty_response(response).await
    }

    /// Ids of the installed apps
    pub async fn list_apps(&self) -> Result<Vec<String>> {
        let url = format!("{}/apps", self.base_url);
        let response = self.client.get(&url).send().await?;

        handle_response(response).await
    }

    /// Current node status
    pub async fn status(&self) -> Result<NodeStatus> {
        let url = format!("{}/status", self.base_url);
        let response = self.client.get(&url).send().await?;

        handle_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = NodeClient::new("http://localhost:8000");
        assert_eq!(client.base_url(), "http://localhost:8000");
    }

    #[test]
    fn test_client_with_custom_client() {
        let client = NodeClient::with_client("http://localhost:8000/", Client::new());
        assert_eq!(client.base_url(), "http://localhost:8000");
    }
}
