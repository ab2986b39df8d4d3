//! InfraX Core
//!
//! Core types shared by the InfraX node, its HTTP client and the CLI.
//!
//! This crate contains:
//! - Domain types: jobs, their lifecycle, upload tasks and node status
//! - DTOs: request/response bodies exchanged with the node and the router

pub mod domain;
pub mod dto;
