//! App resolution
//!
//! Maps the app reference of a job to the executable that runs it.

use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AppResolver {
    /// Installed apps, one directory per app
    app_dir: Option<PathBuf>,
    /// Executable inside an app directory
    entrypoint: String,
    allow_path_lookup: bool,
}

impl AppResolver {
    pub fn new(app_dir: Option<PathBuf>, entrypoint: String, allow_path_lookup: bool) -> Self {
        Self {
            app_dir,
            entrypoint,
            allow_path_lookup,
        }
    }

    /// Resolve `app` to an executable path
    ///
    /// With an app directory the reference must be a plain app name.
    /// Otherwise it is an executable path, or a bare name searched on `PATH`
    /// when lookups are allowed. Paths come back absolute: the job is
    /// launched from its workspace, not from the node's working directory.
    pub fn resolve(&self, app: &str) -> Result<PathBuf, String> {
        if app.trim().is_empty() {
            return Err("app reference is empty".to_string());
        }

        if let Some(app_dir) = &self.app_dir {
            return self.resolve_installed(app_dir, app);
        }

        if app.contains('/') {
            let path = std::path::absolute(app)
                .map_err(|e| format!("cannot resolve '{}': {}", app, e))?;
            return if is_executable(&path) {
                Ok(path)
            } else {
                Err(format!("'{}' is not an executable file", app))
            };
        }

        if !self.allow_path_lookup {
            return Err(format!("unknown app '{}'", app));
        }

        search_path(app).ok_or_else(|| format!("'{}' not found on PATH", app))
    }

    fn resolve_installed(&self, app_dir: &Path, app: &str) -> Result<PathBuf, String> {
        if !is_plain_name(app) {
            return Err(format!("invalid app name '{}'", app));
        }

        let program = app_dir.join(app).join(&self.entrypoint);
        if is_executable(&program) {
            std::path::absolute(&program)
                .map_err(|e| format!("cannot resolve {}: {}", program.display(), e))
        } else {
            Err(format!(
                "app '{}' is not installed (expected {})",
                app,
                program.display()
            ))
        }
    }
}

/// A single path component that stays inside its parent directory
pub fn is_plain_name(app: &str) -> bool {
    let mut components = Path::new(app).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn search_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
        .and_then(|program| std::path::absolute(program).ok())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
