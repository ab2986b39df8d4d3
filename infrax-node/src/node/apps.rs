//! Installed apps
//!
//! An app is a directory under `app_dir` holding an executable entrypoint.
//! Installing fetches the app's manifest and files from the router into a
//! staging directory that is renamed into place once complete, so a job
//! never resolves a half-written app. Installs run in the background and
//! their failures are reported to the router rather than to the caller.

use async_trait::async_trait;
use infrax_client::RouterClient;
use infrax_core::dto::app::{AppErrorKind, AppErrorReport, AppManifest};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{NodeError, Result};
use crate::repository::job_repository;
use crate::sandbox::files::{FileSource, download_all};
use crate::sandbox::resolver::{AppResolver, is_plain_name};

/// The router's side of app management
#[async_trait]
pub trait AppCatalog: FileSource {
    async fn manifest(&self, app_id: &str) -> std::result::Result<AppManifest, String>;

    /// Tell the router the app is now available here
    async fn installed(&self, app_id: &str) -> std::result::Result<(), String>;

    async fn uninstalled(&self, app_id: &str) -> std::result::Result<(), String>;

    async fn failed(&self, app_id: &str, report: &AppErrorReport) -> std::result::Result<(), String>;
}

#[async_trait]
impl AppCatalog for RouterClient {
    async fn manifest(&self, app_id: &str) -> std::result::Result<AppManifest, String> {
        self.get_app(app_id).await.map_err(|e| e.to_string())
    }

    async fn installed(&self, app_id: &str) -> std::result::Result<(), String> {
        self.add_app(app_id).await.map_err(|e| e.to_string())
    }

    async fn uninstalled(&self, app_id: &str) -> std::result::Result<(), String> {
        self.remove_app(app_id).await.map_err(|e| e.to_string())
    }

    async fn failed(&self, app_id: &str, report: &AppErrorReport) -> std::result::Result<(), String> {
        self.report_app_error(app_id, report)
            .await
            .map_err(|e| e.to_string())
    }
}

pub struct AppStore {
    app_dir: PathBuf,
    entrypoint: String,
    resolver: AppResolver,
    /// Absent on local-only nodes, which cannot install
    catalog: Option<Arc<dyn AppCatalog>>,
    pool: SqlitePool,
    /// Apps with an install in flight
    installing: Arc<Mutex<HashSet<String>>>,
}

impl AppStore {
    pub fn new(
        app_dir: PathBuf,
        entrypoint: String,
        catalog: Option<Arc<dyn AppCatalog>>,
        pool: SqlitePool,
    ) -> Self {
        Self {
            resolver: AppResolver::new(Some(app_dir.clone()), entrypoint.clone(), false),
            app_dir,
            entrypoint,
            catalog,
            pool,
            installing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Store for the configured app directory, if there is one
    pub fn from_config(
        config: &Config,
        catalog: Option<Arc<dyn AppCatalog>>,
        pool: SqlitePool,
    ) -> Option<Self> {
        let app_dir = config.app_dir.clone()?;
        Some(Self::new(
            app_dir,
            config.app_entrypoint.clone(),
            catalog,
            pool,
        ))
    }

    /// Start installing `app_id` in the background
    ///
    /// Fails with `Conflict` when the app directory already exists or an
    /// install of the same app is running.
    pub fn install(&self, app_id: &str) -> Result<JoinHandle<()>> {
        let target = self.app_path(app_id)?;
        let Some(catalog) = &self.catalog else {
            return Err(NodeError::Unavailable(
                "apps cannot be installed without a router".to_string(),
            ));
        };

        {
            let mut installing = self.installing.lock().unwrap_or_else(|e| e.into_inner());
            if installing.contains(app_id) {
                return Err(NodeError::Conflict(format!(
                    "app {} is being installed",
                    app_id
                )));
            }
            if target.exists() {
                return Err(NodeError::Conflict(format!(
                    "app {} is already installed",
                    app_id
                )));
            }
            installing.insert(app_id.to_string());
        }

        info!("Installing app {}", app_id);
        let install = Install {
            app_id: app_id.to_string(),
            app_dir: self.app_dir.clone(),
            target,
            entrypoint: self.entrypoint.clone(),
            catalog: Arc::clone(catalog),
            installing: Arc::clone(&self.installing),
        };
        Ok(tokio::spawn(install.run()))
    }

    /// Remove an installed app
    ///
    /// Refused while the app has an install in flight or queued or running
    /// jobs.
    pub async fn uninstall(&self, app_id: &str) -> Result<()> {
        let target = self.app_path(app_id)?;

        if self
            .installing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(app_id)
        {
            return Err(NodeError::Conflict(format!(
                "app {} is being installed",
                app_id
            )));
        }
        if !target.exists() {
            return Err(NodeError::AppNotFound(app_id.to_string()));
        }

        let active = job_repository::count_active_for_app(&self.pool, app_id).await?;
        if active > 0 {
            return Err(NodeError::Conflict(format!(
                "app {} has {} queued or running job(s)",
                app_id, active
            )));
        }

        // Out of the resolver's sight first, then gone
        let removing = self
            .app_dir
            .join(format!(".removing-{}-{}", app_id, Uuid::new_v4()));
        let removed = match tokio::fs::rename(&target, &removing).await {
            Ok(()) => tokio::fs::remove_dir_all(&removing).await,
            Err(e) => Err(e),
        };

        if let Err(e) = removed {
            error!("Failed to uninstall app {}: {}", app_id, e);
            if let Some(catalog) = &self.catalog {
                report_failure(
                    catalog.as_ref(),
                    app_id,
                    AppErrorKind::UninstallError,
                    e.to_string(),
                )
                .await;
            }
            return Err(NodeError::Io(e));
        }

        info!("Uninstalled app {}", app_id);
        if let Some(catalog) = &self.catalog {
            if let Err(e) = catalog.uninstalled(app_id).await {
                warn!("Failed to tell the router app {} is gone: {}", app_id, e);
            }
        }
        Ok(())
    }

    /// Installed apps that resolve to a runnable entrypoint, sorted
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.app_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut apps = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if self.resolver.resolve(&name).is_ok() {
                apps.push(name);
            }
        }

        apps.sort();
        Ok(apps)
    }

    fn app_path(&self, app_id: &str) -> Result<PathBuf> {
        if !is_plain_name(app_id) || app_id.starts_with('.') {
            return Err(NodeError::Validation(format!(
                "invalid app id '{}'",
                app_id
            )));
        }
        Ok(self.app_dir.join(app_id))
    }
}

/// One background install
struct Install {
    app_id: String,
    app_dir: PathBuf,
    target: PathBuf,
    entrypoint: String,
    catalog: Arc<dyn AppCatalog>,
    installing: Arc<Mutex<HashSet<String>>>,
}

impl Install {
    async fn run(self) {
        let result = self.fetch().await;

        // The app directory is in place (or not) before the marker goes
        self.installing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.app_id);

        match result {
            Ok(()) => {
                info!("Installed app {}", self.app_id);
                if let Err(e) = self.catalog.installed(&self.app_id).await {
                    warn!("Failed to tell the router app {} is installed: {}", self.app_id, e);
                }
            }
            Err(e) => {
                error!("Failed to install app {}: {}", self.app_id, e);
                report_failure(
                    self.catalog.as_ref(),
                    &self.app_id,
                    AppErrorKind::InstallError,
                    e,
                )
                .await;
            }
        }
    }

    async fn fetch(&self) -> std::result::Result<(), String> {
        let manifest = self.catalog.manifest(&self.app_id).await?;

        let staging = self
            .app_dir
            .join(format!(".staging-{}-{}", self.app_id, Uuid::new_v4()));
        let staged = self.stage(&manifest, &staging).await;
        if staged.is_err() {
            let _ = tokio::fs::remove_dir_all(&staging).await;
        }
        staged
    }

    async fn stage(&self, manifest: &AppManifest, staging: &Path) -> std::result::Result<(), String> {
        tokio::fs::create_dir_all(staging)
            .await
            .map_err(|e| format!("failed to create {}: {}", staging.display(), e))?;

        download_all(self.catalog.as_ref(), &manifest.files, staging).await?;

        let entrypoint = staging.join(&self.entrypoint);
        if !entrypoint.is_file() {
            return Err(format!(
                "app {} has no entrypoint '{}'",
                self.app_id, self.entrypoint
            ));
        }
        make_executable(&entrypoint)
            .await
            .map_err(|e| format!("failed to make {} executable: {}", entrypoint.display(), e))?;

        tokio::fs::rename(staging, &self.target)
            .await
            .map_err(|e| format!("failed to move app into {}: {}", self.target.display(), e))
    }
}

async fn report_failure(catalog: &dyn AppCatalog, app_id: &str, kind: AppErrorKind, error: String) {
    let report = AppErrorReport { error, kind };
    if let Err(e) = catalog.failed(app_id, &report).await {
        warn!("Failed to report {:?} of app {}: {}", kind, app_id, e);
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(all(test, unix))]
pub(crate) mod test_support {
    use super::*;
    use infrax_core::domain::file::FileRef;
    use std::collections::HashMap;
    use tokio::sync::oneshot;

    /// Catalog serving manifests and files from memory, logging every call
    #[derive(Default)]
    pub struct MemoryCatalog {
        manifests: Mutex<HashMap<String, AppManifest>>,
        files: Mutex<HashMap<String, Vec<u8>>>,
        /// Holds the next manifest request until the sender fires
        pub hold: Mutex<Option<oneshot::Receiver<()>>>,
        pub events: Mutex<Vec<String>>,
    }

    impl MemoryCatalog {
        /// An app whose entrypoint `run` echoes its name
        pub fn with_app(self, app_id: &str) -> Self {
            let file_id = format!("{}-run", app_id);
            let script = format!("#!/bin/sh\necho {}\n", app_id);
            self.with_manifest(app_id, vec![(FileRef::new(&file_id, "run"), script.into_bytes())])
        }

        pub fn with_manifest(self, app_id: &str, files: Vec<(FileRef, Vec<u8>)>) -> Self {
            let manifest = AppManifest {
                id: app_id.to_string(),
                name: None,
                files: files.iter().map(|(file, _)| file.clone()).collect(),
            };
            self.manifests
                .lock()
                .unwrap()
                .insert(app_id.to_string(), manifest);
            for (file, content) in files {
                self.files.lock().unwrap().insert(file.id, content);
            }
            self
        }

        pub fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn log(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[async_trait]
    impl FileSource for MemoryCatalog {
        async fn fetch(&self, file: &FileRef) -> std::result::Result<Vec<u8>, String> {
            self.files
                .lock()
                .unwrap()
                .get(&file.id)
                .cloned()
                .ok_or_else(|| format!("no file {}", file.id))
        }
    }

    #[async_trait]
    impl AppCatalog for MemoryCatalog {
        async fn manifest(&self, app_id: &str) -> std::result::Result<AppManifest, String> {
            let hold = self.hold.lock().unwrap().take();
            if let Some(hold) = hold {
                let _ = hold.await;
            }
            self.manifests
                .lock()
                .unwrap()
                .get(app_id)
                .cloned()
                .ok_or_else(|| format!("no app {}", app_id))
        }

        async fn installed(&self, app_id: &str) -> std::result::Result<(), String> {
            self.log(format!("installed {}", app_id));
            Ok(())
        }

        async fn uninstalled(&self, app_id: &str) -> std::result::Result<(), String> {
            self.log(format!("uninstalled {}", app_id));
            Ok(())
        }

        async fn failed(
            &self,
            app_id: &str,
            report: &AppErrorReport,
        ) -> std::result::Result<(), String> {
            self.log(format!("{:?} {}", report.kind, app_id));
            Ok(())
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::test_support::MemoryCatalog;
    use super::*;
    use crate::db::test_support::{scratch_dir, test_pool};
    use infrax_core::domain::file::FileRef;
    use infrax_core::domain::job::JobRequest;
    use tokio::sync::oneshot;

    async fn store(catalog: MemoryCatalog) -> (AppStore, Arc<MemoryCatalog>, PathBuf) {
        let app_dir = scratch_dir("apps");
        let catalog = Arc::new(catalog);
        let store = AppStore::new(
            app_dir.clone(),
            "run".to_string(),
            Some(catalog.clone()),
            test_pool().await,
        );
        (store, catalog, app_dir)
    }

    fn hidden_entries(app_dir: &Path) -> usize {
        std::fs::read_dir(app_dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with('.'))
            .count()
    }

    #[tokio::test]
    async fn test_install_places_runnable_app() {
        let (store, catalog, app_dir) = store(MemoryCatalog::default().with_app("hello")).await;

        store.install("hello").unwrap().await.unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["hello".to_string()]);
        assert_eq!(
            store.resolver.resolve("hello").unwrap(),
            std::path::absolute(app_dir.join("hello").join("run")).unwrap()
        );
        assert_eq!(catalog.events(), vec!["installed hello".to_string()]);
        assert_eq!(hidden_entries(&app_dir), 0);
    }

    #[tokio::test]
    async fn test_install_keeps_nested_files() {
        let catalog = MemoryCatalog::default().with_manifest(
            "model",
            vec![
                (FileRef::new("r", "run"), b"#!/bin/sh\n".to_vec()),
                (FileRef::new("w", "weights.bin").in_dir("data"), b"\x00\x01".to_vec()),
            ],
        );
        let (store, _catalog, app_dir) = store(catalog).await;

        store.install("model").unwrap().await.unwrap();
        assert_eq!(
            std::fs::read(app_dir.join("model/data/weights.bin")).unwrap(),
            b"\x00\x01"
        );
    }

    #[tokio::test]
    async fn test_install_twice_conflicts() {
        let (store, catalog, _app_dir) = store(MemoryCatalog::default().with_app("hello")).await;
        let (release, hold) = oneshot::channel();
        *catalog.hold.lock().unwrap() = Some(hold);

        let install = store.install("hello").unwrap();
        assert!(matches!(store.install("hello"), Err(NodeError::Conflict(_))));
        assert!(matches!(store.uninstall("hello").await, Err(NodeError::Conflict(_))));

        release.send(()).unwrap();
        install.await.unwrap();
        assert!(matches!(store.install("hello"), Err(NodeError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_failed_install_is_reported_and_cleaned_up() {
        // No entrypoint among the files
        let catalog = MemoryCatalog::default()
            .with_manifest("broken", vec![(FileRef::new("x", "readme"), b"hi".to_vec())]);
        let (store, catalog, app_dir) = store(catalog).await;

        store.install("broken").unwrap().await.unwrap();
        store.install("unknown").unwrap().await.unwrap();

        assert_eq!(
            catalog.events(),
            vec![
                "InstallError broken".to_string(),
                "InstallError unknown".to_string()
            ]
        );
        assert!(!app_dir.join("broken").exists());
        assert_eq!(hidden_entries(&app_dir), 0);
        assert!(store.list().await.unwrap().is_empty());

        // A failed install can be retried
        assert!(store.install("broken").is_ok());
    }

    #[tokio::test]
    async fn test_invalid_app_ids_are_rejected() {
        let (store, _catalog, _app_dir) = store(MemoryCatalog::default()).await;
        for app_id in ["", "..", "../etc", "a/b", ".staging-x"] {
            assert!(
                matches!(store.install(app_id), Err(NodeError::Validation(_))),
                "{} accepted",
                app_id
            );
        }
    }

    #[tokio::test]
    async fn test_uninstall() {
        let (store, catalog, app_dir) = store(MemoryCatalog::default().with_app("hello")).await;

        assert!(matches!(
            store.uninstall("hello").await,
            Err(NodeError::AppNotFound(_))
        ));

        store.install("hello").unwrap().await.unwrap();
        store.uninstall("hello").await.unwrap();

        assert!(!app_dir.join("hello").exists());
        assert_eq!(hidden_entries(&app_dir), 0);
        assert_eq!(
            catalog.events(),
            vec!["installed hello".to_string(), "uninstalled hello".to_string()]
        );
    }

    #[tokio::test]
    async fn test_uninstall_refused_with_active_jobs() {
        let (store, _catalog, app_dir) = store(MemoryCatalog::default().with_app("hello")).await;
        store.install("hello").unwrap().await.unwrap();
        job_repository::create(&store.pool, JobRequest::new("hello"))
            .await
            .unwrap();

        assert!(matches!(
            store.uninstall("hello").await,
            Err(NodeError::Conflict(_))
        ));
        assert!(app_dir.join("hello").join("run").exists());
    }

    #[tokio::test]
    async fn test_local_store_lists_and_removes_but_cannot_install() {
        let app_dir = scratch_dir("apps");
        let entrypoint = app_dir.join("hello").join("run");
        std::fs::create_dir_all(entrypoint.parent().unwrap()).unwrap();
        std::fs::write(&entrypoint, "#!/bin/sh\n").unwrap();
        make_executable(&entrypoint).await.unwrap();

        let store = AppStore::new(app_dir.clone(), "run".to_string(), None, test_pool().await);
        assert_eq!(store.list().await.unwrap(), vec!["hello".to_string()]);
        assert!(matches!(store.install("other"), Err(NodeError::Unavailable(_))));

        store.uninstall("hello").await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }
}
