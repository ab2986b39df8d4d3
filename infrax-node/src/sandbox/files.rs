//! Router file downloads
//!
//! Jobs list input files and apps list their content as [`FileRef`]s; both
//! are fetched through a [`FileSource`] into a directory tree.

use async_trait::async_trait;
use infrax_client::RouterClient;
use infrax_core::domain::file::FileRef;
use std::path::Path;
use tracing::debug;

/// Where referenced files are fetched from
#[async_trait]
pub trait FileSource: Send + Sync {
    async fn fetch(&self, file: &FileRef) -> Result<Vec<u8>, String>;
}

#[async_trait]
impl FileSource for RouterClient {
    async fn fetch(&self, file: &FileRef) -> Result<Vec<u8>, String> {
        self.download_file(&file.id)
            .await
            .map_err(|e| format!("failed to download file {} ({}): {}", file.id, file.name, e))
    }
}

/// Fetch every file into `root`, keeping each one's relative directory
pub async fn download_all<S: FileSource + ?Sized>(
    source: &S,
    files: &[FileRef],
    root: &Path,
) -> Result<(), String> {
    for file in files {
        let relative = file
            .relative_path()
            .ok_or_else(|| format!("file {} has an invalid name or path", file.id))?;
        let target = root.join(relative);

        let content = source.fetch(file).await?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("failed to create {}: {}", parent.display(), e))?;
        }
        tokio::fs::write(&target, &content)
            .await
            .map_err(|e| format!("failed to write {}: {}", target.display(), e))?;
        debug!("Fetched file {} to {}", file.id, target.display());
    }

    Ok(())
}
