//! Data Transfer Objects
//!
//! Bodies exchanged between the router, the node and the CLI.

pub mod app;
pub mod file;
pub mod job;
pub mod node;
