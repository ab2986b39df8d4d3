//! InfraX HTTP Client
//!
//! Typed HTTP clients for the two sides of an InfraX node:
//! - [`RouterClient`]: used by the node to register itself, report its
//!   availability and job states, fetch apps and files, and deliver job
//!   results to the central router
//! - [`NodeClient`]: used by the CLI (or a router) to submit, inspect and
//!   cancel jobs on a node and to manage its apps
//!
//! # Example
//!
//! ```no_run
//! use infrax_client::NodeClient;
//! use infrax_core::dto::job::SubmitJob;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = NodeClient::new("http://localhost:8000");
//!
//!     let job = client.submit_job(SubmitJob {
//!         app: "echo".to_string(),
//!         args: vec!["hello".to_string()],
//!         ..Default::default()
//!     }).await?;
//!
//!     println!("Submitted job: {}", job.id());
//!     Ok(())
//! }
//! ```

pub mod error;
mod node;
mod router;

// Re-export commonly used types
pub use error::{ClientError, Result};
pub use node::NodeClient;
pub use router::{RouterClient, UploadAck};

use serde::de::DeserializeOwned;

/// Name of the header carrying an upload's idempotency key
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Name of the header identifying the calling node to the router
pub const NODE_ID_HEADER: &str = "X-Node-Id";

fn normalize_base_url(base_url: impl Into<String>) -> String {
    base_url.into().trim_end_matches('/').to_string()
}

/// Handle an API response and deserialize JSON
///
/// Checks the status code and returns an appropriate error if the request
/// failed, or deserializes the response body if successful.
async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();

    if !status.is_success() {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(ClientError::api_error(status.as_u16(), error_text));
    }

    response
        .json()
        .await
        .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
}

/// Handle an API response that returns no content
async fn handle_empty_response(response: reqwest::Response) -> Result<()> {
    let status = response.status();

    if !status.is_success() {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(ClientError::api_error(status.as_u16(), error_text));
    }

    Ok(())
}
