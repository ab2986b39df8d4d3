//! Router-facing endpoints
//!
//! Calls the node makes outward to the central router.

use infrax_core::domain::job::JobRecord;
use infrax_core::domain::upload::JobResultPayload;
use infrax_core::dto::app::{AppErrorReport, AppManifest};
use infrax_core::dto::file::FileUploaded;
use infrax_core::dto::node::{NodeStateUpdate, RegisterNode, RegisteredNode};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};

use crate::error::{ClientError, Result};
use crate::{IDEMPOTENCY_KEY_HEADER, NODE_ID_HEADER, handle_empty_response, handle_response};

/// How the router acknowledged a result upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadAck {
    /// First delivery of this result
    Accepted,
    /// The router already holds a result under this idempotency key
    AlreadyDelivered,
}

/// HTTP client for the router API
#[derive(Debug, Clone)]
pub struct RouterClient {
    /// Base URL of the router (e.g., "https://router.infrax.dev")
    base_url: String,
    /// Identity sent with every call
    node_id: String,
    client: Client,
}

impl RouterClient {
    /// Create a new router client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the router API
    /// * `node_id` - Identity of this node
    pub fn new(base_url: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self::with_client(base_url, node_id, Client::new())
    }

    /// Create a router client with a custom HTTP client (timeouts, TLS, ...)
    pub fn with_client(
        base_url: impl Into<String>,
        node_id: impl Into<String>,
        client: Client,
    ) -> Self {
        Self {
            base_url: crate::normalize_base_url(base_url),
            node_id: node_id.into(),
            client,
        }
    }

    /// Get the base URL of the router
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // =============================================================================
    // Node Registration & State
    // =============================================================================

    /// Register this node with the router
    pub async fn register_node(&self, req: &RegisterNode) -> Result<RegisteredNode> {
        let url = format!("{}/node", self.base_url);
        let response = self
            .client
            .post(&url)
            .header(NODE_ID_HEADER, &self.node_id)
            .json(req)
            .send()
            .await?;

        handle_response(response).await
    }

    /// Report the node's availability
    pub async fn update_node_state(&self, update: &NodeStateUpdate) -> Result<()> {
        let url = format!("{}/node/state", self.base_url);
        let response = self
            .client
            .put(&url)
            .header(NODE_ID_HEADER, &self.node_id)
            .json(update)
            .send()
            .await?;

        handle_empty_response(response).await
    }

    /// Report a job's state change
    pub async fn update_job_state(&self, record: &JobRecord) -> Result<()> {
        let url = format!("{}/job/{}", self.base_url, record.id());
        let response = self
            .client
            .put(&url)
            .header(NODE_ID_HEADER, &self.node_id)
            .json(record)
            .send()
            .await?;

        handle_empty_response(response).await
    }

    // =============================================================================
    // Apps
    // =============================================================================

    /// Fetch an app's manifest
    pub async fn get_app(&self, app_id: &str) -> Result<AppManifest> {
        let url = format!("{}/app/{}", self.base_url, app_id);
        let response = self
            .client
            .get(&url)
            .header(NODE_ID_HEADER, &self.node_id)
            .send()
            .await?;

        handle_response(response).await
    }

    /// Record that this node has `app_id` installed
    pub async fn add_app(&self, app_id: &str) -> Result<()> {
        let url = format!("{}/node/{}/app/{}", self.base_url, self.node_id, app_id);
        let response = self
            .client
            .put(&url)
            .header(NODE_ID_HEADER, &self.node_id)
            .send()
            .await?;

        handle_empty_response(response).await
    }

    /// Record that this node no longer has `app_id`
    pub async fn remove_app(&self, app_id: &str) -> Result<()> {
        let url = format!("{}/node/{}/app/{}", self.base_url, self.node_id, app_id);
        let response = self
            .client
            .delete(&url)
            .header(NODE_ID_HEADER, &self.node_id)
            .send()
            .await?;

        handle_empty_response(response).await
    }

    /// Report a failed install or uninstall
    pub async fn report_app_error(&self, app_id: &str, report: &AppErrorReport) -> Result<()> {
        let url = format!("{}/app/{}", self.base_url, app_id);
        let response = self
            .client
            .put(&url)
            .header(NODE_ID_HEADER, &self.node_id)
            .json(report)
            .send()
            .await?;

        handle_empty_response(response).await
    }

    // =============================================================================
    // Files
    // =============================================================================

    /// Download a file's content
    pub async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        let url = format!("{}/file/{}", self.base_url, file_id);
        let response = self
            .client
            .get(&url)
            .header(NODE_ID_HEADER, &self.node_id)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(response.bytes().await?.to_vec())
    }

    /// Upload a file, returning the id the router stored it under
    ///
    /// # Arguments
    /// * `name` - File name
    /// * `path` - Directory relative to the job's output root, if any
    /// * `content` - File content
    /// * `idempotency_key` - Stable per file so a retried upload is not stored twice
    pub async fn upload_file(
        &self,
        name: &str,
        path: Option<&str>,
        content: Vec<u8>,
        idempotency_key: &str,
    ) -> Result<String> {
        let url = format!("{}/file", self.base_url);
        let mut form = Form::new().part("file", Part::bytes(content).file_name(name.to_string()));
        if let Some(path) = path {
            form = form.text("path", path.to_string());
        }

        let response = self
            .client
            .post(&url)
            .header(NODE_ID_HEADER, &self.node_id)
            .header(IDEMPOTENCY_KEY_HEADER, idempotency_key)
            .multipart(form)
            .send()
            .await?;

        let uploaded: FileUploaded = handle_response(response).await?;
        Ok(uploaded.id)
    }

    // =============================================================================
    // Results
    // =============================================================================

    /// Deliver a job result
    ///
    /// The idempotency key makes re-delivery safe: a router that already
    /// holds the result answers 409, which is reported as
    /// [`UploadAck::AlreadyDelivered`].
    pub async fn upload_result(
        &self,
        result: &JobResultPayload,
        idempotency_key: &str,
    ) -> Result<UploadAck> {
        let url = format!("{}/job/{}/result", self.base_url, result.job_id);
        let response = self
            .client
            .post(&url)
            .header(NODE_ID_HEADER, &self.node_id)
            .header(IDEMPOTENCY_KEY_HEADER, idempotency_key)
            .json(result)
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            tracing::debug!("Router already holds result for job {}", result.job_id);
            return Ok(UploadAck::AlreadyDelivered);
        }

        handle_empty_response(response)
            .await
            .map(|_| UploadAck::Accepted)
            .map_err(|e| match e {
                ClientError::ApiError { status, message } => ClientError::ApiError {
                    status,
                    message: format!("result upload rejected: {}", message),
                },
                other => other,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_client_trims_trailing_slash() {
        let client = RouterClient::new("http://router:9000/", "node-1");
        assert_eq!(client.base_url(), "http://router:9000");
    }
}
