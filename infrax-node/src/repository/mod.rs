//! Repository Module
//!
//! Durable store for the node. Each repository handles database operations
//! for one domain entity.

pub mod job;
pub mod upload;

// Re-export for convenience
pub use job as job_repository;
pub use upload as upload_repository;
