//! Core domain types
//!
//! These types are persisted by the node's job store, carried through the
//! scheduler and uploader, and serialized over the node's HTTP surface.

pub mod file;
pub mod job;
pub mod node;
pub mod upload;
