use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LoomError, Result};

/// Top-level StoryLoom configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// Pause between consecutive nodes of one execution.
    #[serde(default = "default_inter_node_delay")]
    pub inter_node_delay_ms: u64,
    /// Upper bound on a single capability call.
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
    /// Default page size for execution history.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Retry policy for execution-state writes.
    #[serde(default = "default_persistence_retry")]
    pub persistence_retry: RetryConfig,
    /// Runtime logging configuration.
    #[serde(default)]
    pub log: Option<LogConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            inter_node_delay_ms: default_inter_node_delay(),
            node_timeout_secs: default_node_timeout(),
            history_limit: default_history_limit(),
            persistence_retry: default_persistence_retry(),
            log: None,
        }
    }
}

fn default_workspace() -> String { "~/.storyloom".to_string() }
fn default_inter_node_delay() -> u64 { 250 }
fn default_node_timeout() -> u64 { 300 }
fn default_history_limit() -> usize { 20 }

fn default_persistence_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        initial_backoff_ms: 200,
        max_backoff_ms: 5_000,
    }
}

/// JSONL execution logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable execution logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
        }
    }
}

fn default_log_enabled() -> bool { true }

/// Provider configuration per capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default)]
    pub text: Option<ModelConfig>,
    #[serde(default)]
    pub text_fallbacks: Vec<ModelConfig>,
    #[serde(default)]
    pub image: Option<ModelConfig>,
    #[serde(default)]
    pub video: Option<ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl ModelConfig {
    pub fn new(provider: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model_id: model_id.into(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            retry: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.7 }

/// Retry configuration with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Legacy single bearer token (admin).
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token: None,
            api_keys: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub name: String,
    pub key: String,
    #[serde(default)]
    pub role: ApiKeyRole,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyRole {
    #[default]
    Viewer,
    Operator,
    Admin,
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path. Default: <workspace>/storyloom.db
    #[serde(default)]
    pub path: Option<String>,
}

impl AppConfig {
    /// Load config from a TOML file, expanding `${ENV_VAR}` references first.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| LoomError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| LoomError::Config(e.to_string()))
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.engine.workspace)
    }

    /// Resolve the database path.
    pub fn database_path(&self) -> PathBuf {
        match &self.storage.path {
            Some(p) => expand_home(p),
            None => self.workspace_dir().join("storyloom.db"),
        }
    }

    /// Resolve the execution log directory, if logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.engine.log.as_ref().filter(|l| l.enabled)?;
        Some(match &log.log_dir {
            Some(dir) => expand_home(dir),
            None => self.workspace_dir().join("logs"),
        })
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
