use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::state::Side;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream polling settings
    #[serde(default)]
    pub poll: PollConfig,

    /// Where side working copies live
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// Tracked upstream repositories
    #[serde(default)]
    pub repos: Vec<RepoConfig>,

    /// How a side's backend is built and started
    pub backend: BackendConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen address (default: 127.0.0.1:8080)
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path answered from controller state instead of being proxied
    #[serde(default = "default_status_path")]
    pub status_path: String,

    /// Max time to wait for the backend to respond
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per backend address (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listen
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid listen address '{}': {}", self.listen, e))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            status_path: default_status_path(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// What to do after a cycle that attempted a build and failed
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RetryPolicy {
    /// Retry on the next regular tick
    #[default]
    Fixed,
}

impl RetryPolicy {
    /// Delay before the next cycle, given whether the last one failed a build
    pub fn next_delay(&self, interval: Duration, _build_failed: bool) -> Duration {
        match self {
            RetryPolicy::Fixed => interval,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollConfig {
    /// Seconds between upstream change checks
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,

    /// Metadata endpoint listing repository heads
    #[serde(default = "default_metadata_url")]
    pub metadata_url: String,

    /// Branch whose head is tracked
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Timeout for a single metadata request
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Larger metadata responses are discarded
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            metadata_url: default_metadata_url(),
            branch: default_branch(),
            fetch_timeout_secs: default_fetch_timeout(),
            max_body_bytes: default_max_body_bytes(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    /// Root directory; each side gets `<dir>/a` and `<dir>/b`
    #[serde(default = "default_workspace_dir")]
    pub dir: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            dir: default_workspace_dir(),
        }
    }
}

/// A tracked upstream repository
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RepoConfig {
    /// Name as it appears in the metadata response
    pub name: String,

    /// Clone URL
    pub remote: String,

    /// Checkout location relative to the side directory (default: the name)
    pub path: Option<String>,
}

impl RepoConfig {
    pub fn new(name: &str, remote: &str) -> Self {
        Self {
            name: name.to_string(),
            remote: remote.to_string(),
            path: None,
        }
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn relative_path(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.name)
    }
}

/// Backend build and start settings, shared by both sides
///
/// # Security Warning
///
/// `command` and `build_command` are executed with the permissions of the
/// proxy process. Protect configuration files accordingly.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Command to execute to start the backend
    pub command: String,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Shell-style command run in the side directory before starting
    pub build_command: Option<String>,

    /// Working directory relative to the side directory
    pub working_dir: Option<String>,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Host the backend listens on
    #[serde(default = "default_backend_host")]
    pub host: String,

    /// Port used by side A
    #[serde(default = "default_port_a")]
    pub port_a: u16,

    /// Port used by side B
    #[serde(default = "default_port_b")]
    pub port_b: u16,

    /// Health check endpoint path
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// How long a backend may take to answer its health check
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Health check polling interval in milliseconds
    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl BackendConfig {
    /// Create a backend config with defaults
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            build_command: None,
            working_dir: None,
            env: HashMap::new(),
            host: default_backend_host(),
            port_a: default_port_a(),
            port_b: default_port_b(),
            health_path: default_health_path(),
            startup_timeout_secs: default_startup_timeout(),
            health_check_interval_ms: default_health_interval(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }

    /// Set arguments for this backend config (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set the per-side ports (builder pattern)
    pub fn with_ports(mut self, port_a: u16, port_b: u16) -> Self {
        self.port_a = port_a;
        self.port_b = port_b;
        self
    }

    pub fn port(&self, side: Side) -> u16 {
        match side {
            Side::A => self.port_a,
            Side::B => self.port_b,
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Validate the backend configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.command.trim().is_empty() {
            errors.push("backend: 'command' must not be empty".to_string());
        }
        if self.port_a == 0 || self.port_b == 0 {
            errors.push("backend: 'port_a' and 'port_b' must be greater than 0".to_string());
        }
        if self.port_a == self.port_b {
            errors.push(format!(
                "backend: sides need distinct ports, both are {}",
                self.port_a
            ));
        }
        if !self.health_path.starts_with('/') {
            errors.push(format!(
                "backend: 'health_path' must start with '/', got '{}'",
                self.health_path
            ));
        }
        if let Some(ref dir) = self.working_dir {
            if let Err(e) = check_side_relative(dir, true) {
                errors.push(format!("backend: 'working_dir' {}", e));
            }
        }
        if let Some(ref build) = self.build_command {
            if let Err(e) = shell_words::split(build) {
                errors.push(format!("backend: cannot parse 'build_command': {}", e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// A path inside a side directory must stay inside it. Only plain components
/// are accepted; `allow_root` also admits `.` for the side directory itself.
fn check_side_relative(path: &str, allow_root: bool) -> Result<(), String> {
    let path = Path::new(path);
    if path.is_absolute() {
        return Err("must be relative to the side directory".to_string());
    }
    let mut plain = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => plain += 1,
            Component::CurDir if allow_root => {}
            _ => return Err(format!("must not contain '{}'", component.as_os_str().to_string_lossy())),
        }
    }
    if plain == 0 && !allow_root {
        return Err("must not be empty".to_string());
    }
    Ok(())
}

// Default value functions
fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_status_path() -> String {
    "/_tipstatus".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_poll_interval() -> u64 {
    10
}

fn default_metadata_url() -> String {
    "https://go.googlesource.com/?b=master&format=JSON".to_string()
}

fn default_branch() -> String {
    "master".to_string()
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_max_body_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_workspace_dir() -> PathBuf {
    std::env::temp_dir().join("tipproxy")
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port_a() -> u16 {
    8081
}

fn default_port_b() -> u16 {
    8082
}

fn default_health_path() -> String {
    "/".to_string()
}

fn default_startup_timeout() -> u64 {
    600 // toolchain builds are slow
}

fn default_health_interval() -> u64 {
    500
}

fn default_shutdown_grace_period() -> u64 {
    10
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Names of the repositories whose heads make up the signature
    pub fn tracked_names(&self) -> Vec<String> {
        self.repos.iter().map(|r| r.name.clone()).collect()
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.server.listen_addr() {
            errors.push(e.to_string());
        }
        if !self.server.status_path.starts_with('/') {
            errors.push(format!(
                "server: 'status_path' must start with '/', got '{}'",
                self.server.status_path
            ));
        }
        if self.poll.max_body_bytes == 0 {
            errors.push("poll: 'max_body_bytes' must be greater than 0".to_string());
        }
        if self.poll.interval_secs == 0 {
            errors.push("poll: 'interval_secs' must be greater than 0".to_string());
        }
        if self.repos.is_empty() {
            errors.push("at least one [[repos]] entry is required".to_string());
        }

        let mut seen = HashSet::new();
        for repo in &self.repos {
            if repo.name.is_empty() {
                errors.push("repos: 'name' must not be empty".to_string());
            } else if !seen.insert(repo.name.as_str()) {
                errors.push(format!("repos: duplicate repository '{}'", repo.name));
            }
            if repo.remote.is_empty() {
                errors.push(format!("repos: '{}' requires 'remote'", repo.name));
            }
            if let Err(e) = check_side_relative(repo.relative_path(), false) {
                errors.push(format!("repos: '{}' path {}", repo.name, e));
            }
        }

        // `git clean -x` in an outer checkout would delete a nested one
        for (i, outer) in self.repos.iter().enumerate() {
            for inner in self.repos.iter().skip(i + 1) {
                let (a, b) = (Path::new(outer.relative_path()), Path::new(inner.relative_path()));
                if a.starts_with(b) || b.starts_with(a) {
                    errors.push(format!(
                        "repos: '{}' and '{}' have overlapping paths",
                        outer.name, inner.name
                    ));
                }
            }
        }

        if let Err(backend_errors) = self.backend.validate() {
            errors.extend(backend_errors);
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
