use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that pins the upstream host for every preview target
pub const TARGET_HOST_ENV: &str = "LUCIDCODER_PREVIEW_TARGET_HOST";

/// Global configuration for the preview gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Preview proxy timings and routing settings
    #[serde(default)]
    pub preview: PreviewSettings,

    /// Port-base overrides used when a dev server has to pick fresh ports
    #[serde(default)]
    pub ports: PortSettings,

    /// Projects that can be previewed, keyed by project id
    #[serde(default)]
    pub projects: HashMap<String, ProjectConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port serving preview traffic (default: 5100)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Port for the admin API (default: 5199, set to 0 to disable)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the admin API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Maximum idle connections per dev server (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            admin_port: default_admin_port(),
            admin_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// Timings and routing knobs for the preview proxy.
///
/// None of the numeric defaults are derived from anything; they are the values
/// the embedding editor has been tuned against.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PreviewSettings {
    /// How long a frontend port that refused a connection is skipped
    #[serde(default = "default_bad_port_ttl")]
    pub bad_port_ttl_ms: u64,

    /// Sliding window in which connection failures are counted
    #[serde(default = "default_failure_window")]
    pub failure_window_ms: u64,

    /// Failures within one window before a restart is considered
    #[serde(default = "default_restart_failure_threshold")]
    pub restart_failure_threshold: u32,

    /// Minimum time between two restart attempts for the same project
    #[serde(default = "default_restart_cooldown")]
    pub restart_cooldown_ms: u64,

    /// Upper bound for connecting to a dev server and receiving its response,
    /// and for how long a streamed response body may go without data
    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout_ms: u64,

    /// Delay before a placeholder page reloads itself
    #[serde(default = "default_reload_delay")]
    pub reload_delay_ms: u64,

    /// Window in which duplicate context-menu signals are dropped by the bridge
    #[serde(default = "default_context_menu_debounce")]
    pub context_menu_debounce_ms: u64,

    /// Fallback navigation polling interval of the bridge
    #[serde(default = "default_nav_poll_interval")]
    pub nav_poll_interval_ms: u64,

    /// Path prefixes that are never treated as preview traffic
    #[serde(default = "default_bypass_prefixes")]
    pub bypass_prefixes: Vec<String>,

    /// Fixed upstream host; `0.0.0.0` means `localhost`
    pub target_host: Option<String>,
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            bad_port_ttl_ms: default_bad_port_ttl(),
            failure_window_ms: default_failure_window(),
            restart_failure_threshold: default_restart_failure_threshold(),
            restart_cooldown_ms: default_restart_cooldown(),
            proxy_timeout_ms: default_proxy_timeout(),
            reload_delay_ms: default_reload_delay(),
            context_menu_debounce_ms: default_context_menu_debounce(),
            nav_poll_interval_ms: default_nav_poll_interval(),
            bypass_prefixes: default_bypass_prefixes(),
            target_host: None,
        }
    }
}

impl PreviewSettings {
    pub fn bad_port_ttl(&self) -> Duration {
        Duration::from_millis(self.bad_port_ttl_ms)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_millis(self.restart_cooldown_ms)
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy_timeout_ms)
    }

    /// Apply the target host environment override, if set
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var(TARGET_HOST_ENV) {
            let value = value.trim();
            if !value.is_empty() {
                self.target_host = Some(value.to_string());
            }
        }
    }
}

/// Port-base overrides for dev servers that need new ports
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct PortSettings {
    pub frontend_base: Option<u16>,
    pub backend_base: Option<u16>,
}

/// Configuration for a single previewable project
#[derive(Debug, Deserialize, Clone)]
pub struct ProjectConfig {
    /// Project root on disk
    pub path: PathBuf,

    /// Start the dev servers when the gateway boots
    #[serde(default)]
    pub autostart: bool,

    /// Frontend dev server (the preview target)
    pub frontend: Option<DevServerConfig>,

    /// Backend dev server
    pub backend: Option<DevServerConfig>,
}

/// How to launch one dev server
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the permissions of the
/// gateway. Configuration files must only be writable by the service user.
#[derive(Debug, Deserialize, Clone)]
pub struct DevServerConfig {
    /// Command to execute
    pub command: String,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory, relative to the project path
    pub working_dir: Option<PathBuf>,

    /// Preferred port (exported to the process as `PORT`)
    pub port: Option<u16>,

    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl DevServerConfig {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            working_dir: None,
            port: None,
            env: HashMap::new(),
        }
    }

    /// Set arguments (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set the preferred port (builder pattern)
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

impl ProjectConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            autostart: false,
            frontend: None,
            backend: None,
        }
    }

    /// Set the frontend dev server (builder pattern)
    pub fn with_frontend(mut self, frontend: DevServerConfig) -> Self {
        self.frontend = Some(frontend);
        self
    }

    /// Set the backend dev server (builder pattern)
    pub fn with_backend(mut self, backend: DevServerConfig) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Validate the project configuration
    pub fn validate(&self, project_id: &str) -> Result<(), String> {
        if project_id.trim().is_empty() {
            return Err("Project ids must not be empty".to_string());
        }

        if self.path.as_os_str().is_empty() {
            return Err(format!("Project '{}': 'path' must not be empty", project_id));
        }

        for (role, server) in [("frontend", &self.frontend), ("backend", &self.backend)] {
            if let Some(server) = server {
                if server.command.trim().is_empty() {
                    return Err(format!(
                        "Project '{}': {} requires a 'command'",
                        project_id, role
                    ));
                }
            }
        }

        if self.backend.is_some() && self.frontend.is_none() {
            return Err(format!(
                "Project '{}': a backend without a frontend cannot be previewed",
                project_id
            ));
        }

        Ok(())
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    5100
}

fn default_admin_port() -> u16 {
    5199
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_bad_port_ttl() -> u64 {
    5_000
}

fn default_failure_window() -> u64 {
    5_000
}

fn default_restart_failure_threshold() -> u32 {
    2
}

fn default_restart_cooldown() -> u64 {
    30_000
}

fn default_proxy_timeout() -> u64 {
    7_000
}

fn default_reload_delay() -> u64 {
    900
}

fn default_context_menu_debounce() -> u64 {
    75
}

fn default_nav_poll_interval() -> u64 {
    500
}

fn default_bypass_prefixes() -> Vec<String> {
    vec![
        "/api".to_string(),
        "/socket.io".to_string(),
        "/coverage".to_string(),
    ]
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.preview.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for (project_id, project) in &self.projects {
            if let Err(e) = project.validate(project_id) {
                errors.push(e);
            }
        }

        if self.preview.restart_failure_threshold == 0 {
            errors.push("preview.restart_failure_threshold must be at least 1".to_string());
        }

        if self.preview.proxy_timeout_ms == 0 {
            errors.push("preview.proxy_timeout_ms must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
