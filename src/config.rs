use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub(crate) const CONFIG_FILE: &str = "imaginate.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

/// Language model backend configuration (any OpenAI-compatible endpoint)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Base URL of the chat completions API
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Name of the environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model driving the coding agent
    #[serde(default = "default_agent_model")]
    pub name: String,

    /// Sampling temperature for the coding agent
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Model used by the title and response generators
    #[serde(default = "default_auxiliary_model")]
    pub auxiliary: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Retries for rate limits, server errors and network failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_key_env: default_api_key_env(),
            name: default_agent_model(),
            temperature: default_temperature(),
            auxiliary: default_auxiliary_model(),
            request_timeout_secs: default_request_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

impl ModelConfig {
    /// Reads the API key from the configured environment variable.
    pub fn api_key(&self) -> Result<String> {
        std::env::var(&self.api_key_env).with_context(|| {
            format!(
                "Model API key not found. Set the {} environment variable \
                 (or change model.api_key_env in {CONFIG_FILE}).",
                self.api_key_env
            )
        })
    }
}

/// Coding agent loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Hard ceiling on model calls (and therefore agent invocations) per run
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Template (Docker image) each sandbox is created from
    #[serde(default = "default_template")]
    pub template: String,

    /// Idle timeout in seconds, refreshed on every reconnect
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,

    /// Timeout for a single shell command in seconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Port the generated app is served on inside the sandbox
    #[serde(default = "default_port")]
    pub port: u16,

    /// Working directory relative tool paths resolve against
    #[serde(default = "default_workdir")]
    pub workdir: String,

    /// Host name used when building the public preview URL
    #[serde(default = "default_public_host")]
    pub public_host: String,

    /// Scheme used when building the public preview URL
    #[serde(default = "default_public_scheme")]
    pub public_scheme: String,

    /// Command that starts the template's dev server (optional)
    #[serde(default)]
    pub start_command: Option<String>,

    /// Resource limits
    #[serde(default)]
    pub resources: ResourceConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            template: default_template(),
            timeout_secs: default_sandbox_timeout(),
            command_timeout_secs: default_command_timeout(),
            port: default_port(),
            workdir: default_workdir(),
            public_host: default_public_host(),
            public_scheme: default_public_scheme(),
            start_command: None,
            resources: ResourceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Memory limit (e.g., "2g")
    #[serde(default = "default_memory")]
    pub memory: String,

    /// CPU limit (e.g., "2")
    #[serde(default = "default_cpus")]
    pub cpus: String,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpus: default_cpus(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding conversations, run records and logs
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StoreConfig {
    /// Resolves the data directory: `~` expands to the home directory, relative
    /// paths are taken from `base`.
    pub fn resolve_data_dir(&self, base: &Path) -> Result<PathBuf> {
        let expanded = expand_path(&self.data_dir)?;
        let path = PathBuf::from(expanded);
        Ok(if path.is_absolute() {
            path
        } else {
            base.join(path)
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Replay only the most recent N conversation turns (unset = all)
    #[serde(default)]
    pub max_turns: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Also write JSON logs to `<data_dir>/logs`
    #[serde(default)]
    pub file: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Target notified when a run succeeds: "webhook:<url>", a bare URL, or "none"
    #[serde(default)]
    pub on_complete: Option<String>,

    /// Target notified when a run ends without a result
    #[serde(default)]
    pub on_error: Option<String>,
}

// Default value functions
fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_agent_model() -> String {
    "gpt-4.1".to_string()
}

fn default_temperature() -> f64 {
    0.1
}

fn default_auxiliary_model() -> String {
    "gpt-4o".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_iterations() -> u32 {
    15
}

fn default_template() -> String {
    "imaginate-dev".to_string()
}

fn default_sandbox_timeout() -> u64 {
    5 * 60
}

fn default_command_timeout() -> u64 {
    60
}

fn default_port() -> u16 {
    3000
}

fn default_workdir() -> String {
    "/home/user".to_string()
}

fn default_public_host() -> String {
    "localhost".to_string()
}

fn default_public_scheme() -> String {
    "http".to_string()
}

fn default_memory() -> String {
    "2g".to_string()
}

fn default_cpus() -> String {
    "2".to_string()
}

fn default_data_dir() -> String {
    ".imaginate".to_string()
}

/// Expand ~ to home directory
fn expand_path(path: &str) -> Result<String> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(rest).display().to_string())
    } else {
        Ok(path.to_string())
    }
}

impl Config {
    /// Load configuration from `path`, or `imaginate.toml` in `project_dir`,
    /// using defaults if the file does not exist
    pub fn load(project_dir: &Path, path: Option<&Path>) -> Result<Self> {
        let config_path = path.map_or_else(|| project_dir.join(CONFIG_FILE), Path::to_path_buf);

        if !config_path.exists() {
            if path.is_some() {
                anyhow::bail!("Config file not found: {}", config_path.display());
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        Ok(config)
    }
}
