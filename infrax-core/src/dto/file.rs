//! File DTOs

use serde::{Deserialize, Serialize};

/// Router's answer to a file upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUploaded {
    pub id: String,
}
