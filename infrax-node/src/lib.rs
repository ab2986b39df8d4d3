//! InfraX Node
//!
//! Local agent that receives App/Job execution requests from the router,
//! runs them in isolated processes and uploads their results.
//!
//! Architecture:
//! - Repository: durable job store and upload tasks (SQLite)
//! - Scheduler: bounded FIFO queue, execution slots and crash recovery
//! - Sandbox: one child process group per job with limits and timeout
//! - Upload: worker pool delivering results with retry and backoff
//! - Node: the coordinator wiring it all from one configuration
//! - API: HTTP surface for the router and operators

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod node;
pub mod repository;
pub mod sandbox;
pub mod scheduler;
pub mod upload;

pub use config::Config;
pub use error::{NodeError, Result};
pub use node::Node;
