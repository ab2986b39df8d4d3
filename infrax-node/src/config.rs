//! Node configuration
//!
//! Defines every tunable of the node: listen address, concurrency and queue
//! bounds, timeouts, upload retry policy, storage locations and the sandbox
//! policy. Loaded once at startup and handed to each component.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// What to do with a job found `Running` after a restart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Mark it Failed(RecoveredAfterCrash)
    Fail,
    /// Put it back at the tail of the queue
    Requeue,
}

impl FromStr for RecoveryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fail" => Ok(RecoveryPolicy::Fail),
            "requeue" => Ok(RecoveryPolicy::Requeue),
            other => Err(format!("unknown recovery policy '{}'", other)),
        }
    }
}

/// Network access granted to job processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    Allow,
    /// Run the job in a fresh network namespace (Linux, requires `unshare`)
    Deny,
}

impl FromStr for NetworkPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "allow" => Ok(NetworkPolicy::Allow),
            "deny" => Ok(NetworkPolicy::Deny),
            other => Err(format!("unknown network policy '{}'", other)),
        }
    }
}

/// Node configuration
///
/// Every field has a default, so a TOML file only needs the keys it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity of this node towards the router
    pub node_id: String,

    /// Router base URL (e.g., "https://router.infrax.dev")
    pub router_url: String,

    /// Skip router registration and heartbeats
    pub local_only: bool,

    pub listen_host: String,
    pub listen_port: u16,

    /// Number of execution slots
    pub max_concurrent_jobs: usize,

    /// Maximum number of queued (not yet running) jobs
    pub queue_capacity: usize,

    /// Default wall-clock timeout for a job
    pub job_timeout_seconds: u64,

    /// Retries after the first failed upload attempt
    pub upload_retry_limit: u32,

    pub upload_workers: usize,
    pub upload_timeout_seconds: u64,
    pub upload_backoff_base_ms: u64,
    pub upload_backoff_max_ms: u64,

    /// How long a cancel request waits for the process to die
    pub cancel_timeout_seconds: u64,

    pub heartbeat_interval_seconds: u64,

    /// sqlx SQLite URL of the job store
    pub database_url: String,

    /// How long a store write waits for a locked database
    pub database_busy_timeout_ms: u64,

    /// Directory under which each job gets its own workspace
    pub workspace_base: PathBuf,

    /// Keep job workspaces after their result is delivered or given up on.
    /// Local-only nodes always keep them: nothing else holds the output.
    pub retain_workspaces: bool,

    /// Directory of installed apps; when unset, apps are executables
    pub app_dir: Option<PathBuf>,

    /// Executable inside an installed app's directory
    pub app_entrypoint: String,

    pub recovery_policy: RecoveryPolicy,

    /// Requeue at most this many times before failing the job
    pub max_recovery_attempts: u32,

    pub default_memory_bytes: Option<u64>,
    pub default_cpu_seconds: Option<u64>,

    /// Pass the node's environment through to jobs
    pub inherit_env: bool,

    /// Resolve bare app names through `PATH` when no `app_dir` is set
    pub allow_path_lookup: bool,

    pub network: NetworkPolicy,

    /// Captured output included in an upload, per stream
    pub max_output_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            router_url: "http://localhost:8080".to_string(),
            local_only: false,
            listen_host: "0.0.0.0".to_string(),
            listen_port: 8000,
            max_concurrent_jobs: 2,
            queue_capacity: 64,
            job_timeout_seconds: 300, // 5 minutes
            upload_retry_limit: 5,
            upload_workers: 2,
            upload_timeout_seconds: 10,
            upload_backoff_base_ms: 500,
            upload_backoff_max_ms: 30_000,
            cancel_timeout_seconds: 10,
            heartbeat_interval_seconds: 30,
            database_url: "sqlite://infrax-node.db?mode=rwc".to_string(),
            database_busy_timeout_ms: 5_000,
            workspace_base: std::env::temp_dir().join("infrax-node").join("jobs"),
            retain_workspaces: false,
            app_dir: None,
            app_entrypoint: "run".to_string(),
            recovery_policy: RecoveryPolicy::Fail,
            max_recovery_attempts: 3,
            default_memory_bytes: None,
            default_cpu_seconds: None,
            inherit_env: false,
            allow_path_lookup: true,
            network: NetworkPolicy::Allow,
            max_output_bytes: 64 * 1024,
        }
    }
}

impl Config {
    /// Loads the configuration for the node binary
    ///
    /// Starts from the TOML file named by `INFRAX_CONFIG` (or the defaults)
    /// and applies `INFRAX_*` environment overrides on top.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var("INFRAX_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML configuration file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path.display(), e))?;
        Self::from_toml(&raw)
            .map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e))
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Creates configuration from defaults plus environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overrides fields from `INFRAX_<FIELD>` environment variables
    ///
    /// Unparseable values are ignored and the current value is kept.
    pub fn apply_env(&mut self) {
        override_from_env("INFRAX_NODE_ID", &mut self.node_id);
        override_from_env("INFRAX_ROUTER_URL", &mut self.router_url);
        override_from_env("INFRAX_LOCAL_ONLY", &mut self.local_only);
        override_from_env("INFRAX_LISTEN_HOST", &mut self.listen_host);
        override_from_env("INFRAX_LISTEN_PORT", &mut self.listen_port);
        override_from_env("INFRAX_MAX_CONCURRENT_JOBS", &mut self.max_concurrent_jobs);
        override_from_env("INFRAX_QUEUE_CAPACITY", &mut self.queue_capacity);
        override_from_env("INFRAX_JOB_TIMEOUT_SECONDS", &mut self.job_timeout_seconds);
        override_from_env("INFRAX_UPLOAD_RETRY_LIMIT", &mut self.upload_retry_limit);
        override_from_env("INFRAX_UPLOAD_WORKERS", &mut self.upload_workers);
        override_from_env("INFRAX_UPLOAD_TIMEOUT_SECONDS", &mut self.upload_timeout_seconds);
        override_from_env("INFRAX_UPLOAD_BACKOFF_BASE_MS", &mut self.upload_backoff_base_ms);
        override_from_env("INFRAX_UPLOAD_BACKOFF_MAX_MS", &mut self.upload_backoff_max_ms);
        override_from_env("INFRAX_CANCEL_TIMEOUT_SECONDS", &mut self.cancel_timeout_seconds);
        override_from_env(
            "INFRAX_HEARTBEAT_INTERVAL_SECONDS",
            &mut self.heartbeat_interval_seconds,
        );
        override_from_env("INFRAX_DATABASE_URL", &mut self.database_url);
        override_from_env(
            "INFRAX_DATABASE_BUSY_TIMEOUT_MS",
            &mut self.database_busy_timeout_ms,
        );
        override_from_env("INFRAX_WORKSPACE_BASE", &mut self.workspace_base);
        override_from_env("INFRAX_RETAIN_WORKSPACES", &mut self.retain_workspaces);
        override_from_env("INFRAX_APP_ENTRYPOINT", &mut self.app_entrypoint);
        override_from_env("INFRAX_RECOVERY_POLICY", &mut self.recovery_policy);
        override_from_env("INFRAX_MAX_RECOVERY_ATTEMPTS", &mut self.max_recovery_attempts);
        override_from_env("INFRAX_INHERIT_ENV", &mut self.inherit_env);
        override_from_env("INFRAX_ALLOW_PATH_LOOKUP", &mut self.allow_path_lookup);
        override_from_env("INFRAX_NETWORK", &mut self.network);
        override_from_env("INFRAX_MAX_OUTPUT_BYTES", &mut self.max_output_bytes);

        if let Ok(dir) = std::env::var("INFRAX_APP_DIR") {
            self.app_dir = Some(PathBuf::from(dir));
        }
        if let Some(bytes) = parse_env("INFRAX_DEFAULT_MEMORY_BYTES") {
            self.default_memory_bytes = Some(bytes);
        }
        if let Some(seconds) = parse_env("INFRAX_DEFAULT_CPU_SECONDS") {
            self.default_cpu_seconds = Some(seconds);
        }
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_id.is_empty() {
            anyhow::bail!("node_id cannot be empty");
        }

        if !self.local_only
            && !self.router_url.starts_with("http://")
            && !self.router_url.starts_with("https://")
        {
            anyhow::bail!("router_url must start with http:// or https://");
        }

        if self.max_concurrent_jobs == 0 {
            anyhow::bail!("max_concurrent_jobs must be greater than 0");
        }

        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be greater than 0");
        }

        if self.job_timeout_seconds == 0 {
            anyhow::bail!("job_timeout_seconds must be greater than 0");
        }

        if self.upload_workers == 0 {
            anyhow::bail!("upload_workers must be greater than 0");
        }

        if self.upload_timeout_seconds == 0 || self.cancel_timeout_seconds == 0 {
            anyhow::bail!("upload and cancel timeouts must be greater than 0");
        }

        if self.upload_backoff_base_ms > self.upload_backoff_max_ms {
            anyhow::bail!("upload_backoff_base_ms cannot exceed upload_backoff_max_ms");
        }

        if self.database_url.is_empty() {
            anyhow::bail!("database_url cannot be empty");
        }

        if self.app_entrypoint.is_empty() || self.app_entrypoint.contains('/') {
            anyhow::bail!("app_entrypoint must be a plain file name");
        }

        Ok(())
    }

    /// Address the HTTP surface binds to
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_seconds)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_seconds)
    }

    pub fn database_busy_timeout(&self) -> Duration {
        Duration::from_millis(self.database_busy_timeout_ms)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_secs(self.cancel_timeout_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds.max(1))
    }
}

fn parse_env<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

fn override_from_env<T: FromStr>(name: &str, target: &mut T) {
    if let Some(value) = parse_env(name) {
        *target = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.job_timeout(), Duration::from_secs(300));
        assert_eq!(config.recovery_policy, RecoveryPolicy::Fail);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        // Valid config should pass
        assert!(config.validate().is_ok());

        // Zero slots should fail
        config.max_concurrent_jobs = 0;
        assert!(config.validate().is_err());
        config.max_concurrent_jobs = 1;

        // Invalid URL should fail unless the node runs local-only
        config.router_url = "not-a-url".to_string();
        assert!(config.validate().is_err());
        config.local_only = true;
        assert!(config.validate().is_ok());

        config.app_entrypoint = "bin/run".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = Config::from_toml(
            r#"
            listen_port = 9100
            max_concurrent_jobs = 4
            queue_capacity = 8
            job_timeout_seconds = 60
            upload_retry_limit = 2
            recovery_policy = "requeue"
            network = "deny"
            app_dir = "/opt/infrax/apps"
            retain_workspaces = true
            "#,
        )
        .unwrap();

        assert_eq!(config.listen_port, 9100);
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.job_timeout_seconds, 60);
        assert_eq!(config.upload_retry_limit, 2);
        assert_eq!(config.recovery_policy, RecoveryPolicy::Requeue);
        assert_eq!(config.network, NetworkPolicy::Deny);
        assert_eq!(config.app_dir, Some(PathBuf::from("/opt/infrax/apps")));
        assert!(config.retain_workspaces);
        // Untouched keys keep their defaults
        assert_eq!(config.listen_host, "0.0.0.0");
        assert_eq!(config.upload_workers, 2);
        assert_eq!(config.database_busy_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("Requeue".parse::<RecoveryPolicy>(), Ok(RecoveryPolicy::Requeue));
        assert_eq!("deny".parse::<NetworkPolicy>(), Ok(NetworkPolicy::Deny));
        assert!("maybe".parse::<RecoveryPolicy>().is_err());
    }
}
