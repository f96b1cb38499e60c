use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::store::AppId;

const CONFIG_FILE: &str = "lnfly.toml";

/// Name of the single file each app may persist data into.
pub const STORAGE_FILE: &str = "storage.json";

/// Environment variable that replaces the runtime executable.
pub const ENV_DENO_PATH: &str = "DENO_PATH";
/// Environment variable that relocates the durable working directory.
pub const ENV_WORK_DIR: &str = "WORK_DIR";
/// Environment variable holding the wallet URL used when an app has none.
pub const ENV_DEFAULT_NWC_URL: &str = "DEFAULT_NWC_URL";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
}

/// Runtime configuration - how untrusted backend code is executed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Command prefix used to run a backend file, split shell-style
    /// - Default: "deno run"
    /// - Custom: "/opt/deno/bin/deno run"
    #[serde(default = "default_runtime_command")]
    pub command: String,

    /// Heap ceiling for the runtime (e.g., "32m")
    #[serde(default = "default_memory")]
    pub memory: String,

    /// Host variables the runtime itself needs. They are set in the child
    /// environment but never granted to the untrusted code.
    #[serde(default = "default_passthrough_env")]
    pub passthrough_env: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: default_runtime_command(),
            memory: default_memory(),
            passthrough_env: default_passthrough_env(),
        }
    }
}

impl RuntimeConfig {
    /// Split the command string into a program and its leading arguments
    pub fn program_and_args(&self) -> Result<(String, Vec<String>)> {
        let mut words = shell_words::split(&self.command)
            .with_context(|| format!("Invalid runtime command: {}", self.command))?;
        if words.is_empty() {
            anyhow::bail!("Runtime command is empty");
        }
        let program = words.remove(0);
        Ok((program, words))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root for durable data: app records and per-app storage
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Where materialized backend sources are written (defaults to the
    /// system temp dir)
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            scratch_dir: None,
        }
    }
}

impl PathsConfig {
    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("lnfly_deno_apps"))
    }

    pub fn records_dir(&self) -> PathBuf {
        self.work_dir.join("records")
    }

    pub fn storage_dir(&self, app_id: &AppId) -> PathBuf {
        self.work_dir.join("apps").join(app_id.as_str())
    }

    pub fn storage_path(&self, app_id: &AppId) -> PathBuf {
        self.storage_dir(app_id).join(STORAGE_FILE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortsConfig {
    /// First port handed out
    #[serde(default = "default_base_port")]
    pub base: u16,

    /// Test-bind each candidate before handing it out
    #[serde(default = "default_true")]
    pub verify_free: bool,

    /// Busy candidates skipped before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            base: default_base_port(),
            verify_free: true,
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// How long a fresh process must survive before it counts as running
    #[serde(default = "default_grace_ms")]
    pub startup_grace_ms: u64,

    /// How long SIGTERM is given before SIGKILL
    #[serde(default = "default_grace_ms")]
    pub stop_grace_ms: u64,

    /// Idle time after which a running backend is stopped
    #[serde(default = "default_inactivity_secs")]
    pub inactivity_timeout_secs: u64,

    /// Treat a stdout line mentioning the bound port as readiness
    #[serde(default = "default_true")]
    pub ready_on_port_log: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            startup_grace_ms: default_grace_ms(),
            stop_grace_ms: default_grace_ms(),
            inactivity_timeout_secs: default_inactivity_secs(),
            ready_on_port_log: true,
        }
    }
}

impl LifecycleConfig {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Upper bound for a single forwarded request
    #[serde(default = "default_proxy_timeout")]
    pub timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_proxy_timeout(),
        }
    }
}

impl ProxyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletConfig {
    /// Wallet connection URL handed to apps that have none of their own
    #[serde(default)]
    pub default_nwc_url: Option<String>,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_runtime_command() -> String {
    "deno run".to_string()
}

fn default_memory() -> String {
    "32m".to_string()
}

fn default_passthrough_env() -> Vec<String> {
    vec!["PATH".to_string(), "HOME".to_string(), "DENO_DIR".to_string()]
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_base_port() -> u16 {
    9000
}

fn default_max_attempts() -> u16 {
    100
}

fn default_grace_ms() -> u64 {
    5_000
}

fn default_inactivity_secs() -> u64 {
    600
}

fn default_proxy_timeout() -> u64 {
    30
}

fn default_bind() -> String {
    "0.0.0.0:3001".to_string()
}

impl Config {
    /// Load configuration from `lnfly.toml` in a directory, using defaults if not found
    pub fn load(dir: &Path) -> Result<Self> {
        Self::load_from(&dir.join(CONFIG_FILE))
    }

    /// Load configuration from an explicit file, using defaults if not found
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        Ok(config)
    }

    /// Apply deployment overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_with(|key| std::env::var(key).ok());
    }

    /// Apply deployment overrides using a custom variable lookup.
    ///
    /// Empty values are ignored.
    pub fn apply_env_overrides_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(deno) = get(ENV_DENO_PATH) {
            self.runtime.command = shell_words::join([deno.as_str(), "run"]);
        }
        if let Some(work_dir) = get(ENV_WORK_DIR) {
            self.paths.work_dir = PathBuf::from(work_dir);
        }
        if let Some(url) = get(ENV_DEFAULT_NWC_URL) {
            self.wallet.default_nwc_url = Some(url);
        }
    }
}
