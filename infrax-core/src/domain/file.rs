//! File references
//!
//! Files are stored by the router and addressed by id. A node downloads
//! the ones a job or an app lists and uploads the ones a job produces.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// A file held by the router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub id: String,
    /// File name, a single path component
    pub name: String,
    /// Directory relative to the destination root, if not at its top
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl FileRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            path: None,
            content_type: None,
            size: None,
        }
    }

    pub fn in_dir(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Location of the file below a destination root
    ///
    /// `None` when the name or directory would escape the root.
    pub fn relative_path(&self) -> Option<PathBuf> {
        let name = Path::new(&self.name);
        let mut components = name.components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) {
            return None;
        }

        let mut relative = PathBuf::new();
        if let Some(dir) = self.path.as_deref().filter(|dir| !dir.is_empty()) {
            let dir = Path::new(dir);
            if !dir
                .components()
                .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
            {
                return None;
            }
            relative.push(dir);
        }
        relative.push(name);
        Some(relative)
    }
}
