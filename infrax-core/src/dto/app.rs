//! App DTOs
//!
//! What the router tells a node about an app, and what the node reports
//! back when installing or removing one fails.

use serde::{Deserialize, Serialize};

use crate::domain::file::FileRef;

/// An app as served by the router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppManifest {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Files making up the app, placed relative to its directory
    #[serde(default)]
    pub files: Vec<FileRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppErrorKind {
    InstallError,
    UninstallError,
}

/// Failure of an app operation, reported to the router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppErrorReport {
    pub error: String,
    #[serde(rename = "type")]
    pub kind: AppErrorKind,
}
