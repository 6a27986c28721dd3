//! `mao` configuration: file discovery, TOML parsing and environment overrides.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use agent::AgentsConfig;
use agent::embedding::{DEFAULT_EMBEDDING_DIMENSION, DEFAULT_EMBEDDING_MODEL};
use gateway::GatewayConfig;
use proto::ConfigError;
use serde::{Deserialize, Serialize};
use tracing::debug;

const CONFIG_FILE_NAME: &str = "mao.toml";

fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
}

/// Expands a leading `~` to `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix('~') {
        Some(rest) => PathBuf::from(format!("{}{rest}", home_dir())),
        None => PathBuf::from(path),
    }
}

/// Top-level CLI configuration.
///
/// Agent profiles, refinement, critics, context and pricing live at the top
/// level of the file next to the sections below.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Retry policy for model calls.
    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Conversation database.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Run log files.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Embedding model used by semantic context.
    #[serde(default)]
    pub embedding: EmbeddingSettings,

    /// Per-provider endpoint overrides.
    #[serde(default)]
    pub providers: ProvidersConfig,

    #[serde(flatten)]
    pub orchestration: AgentsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub retry_count: u32,
    pub retry_delay_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            retry_count: 1,
            retry_delay_ms: 1000,
        }
    }
}

impl GatewaySettings {
    pub fn to_gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            retry_count: self.retry_count,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file path; `~` is expanded.
    pub db_path: String,
    pub memory_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: format!("{}/.mao/memory.db", home_dir()),
            memory_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for per-run JSON logs and the `--debug` trace log.
    pub log_dir: String,
    pub write_run_logs: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: format!("{}/.mao/logs", home_dir()),
            write_run_logs: true,
        }
    }
}

impl LoggingConfig {
    pub fn log_dir_path(&self) -> PathBuf {
        expand_home(&self.log_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub model: String,
    pub dimension: usize,
    /// OpenAI-compatible endpoint; the OpenAI API when unset.
    pub base_url: Option<String>,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            dimension: DEFAULT_EMBEDDING_DIMENSION,
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Provider tag → base URL, e.g. `ollama = "http://gpu-box:11434/v1"`.
    pub base_urls: BTreeMap<String, String>,
}

impl ProvidersConfig {
    pub fn base_url(&self, provider: &str) -> Option<&str> {
        self.base_urls.get(provider).map(String::as_str)
    }
}

/// `1/true/yes/on` and `0/false/no/off`, case-insensitive.
fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Loads configuration from explicit path, fallback locations, and env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = path.map(|p| p.to_path_buf()).or_else(|| {
            // Look in current dir, then home dir
            let cwd = std::env::current_dir().ok()?.join(CONFIG_FILE_NAME);
            if cwd.exists() {
                return Some(cwd);
            }
            let home_config = PathBuf::from(home_dir()).join(".mao").join("config.toml");
            if home_config.exists() {
                return Some(home_config);
            }
            None
        });
        debug!(path = ?config_path, "Config file resolved");

        let mut config = match config_path {
            Some(path) => Self::from_toml(&std::fs::read_to_string(&path)?)?,
            None => Config::default(),
        };
        config.apply_env_overrides()?;
        config.orchestration.validate()?;

        debug!(
            agents = config.orchestration.agents.len(),
            db_path = %config.storage.db_path,
            memory_enabled = config.storage.memory_enabled,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Toml(e.to_string()))
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(path) = std::env::var("MAO_DB_PATH") {
            self.storage.db_path = path;
        }
        if let Ok(dir) = std::env::var("MAO_LOG_DIR") {
            self.logging.log_dir = dir;
        }
        if let Ok(raw) = std::env::var("MAO_MEMORY_ENABLED") {
            self.storage.memory_enabled = parse_flag(&raw).ok_or_else(|| ConfigError::InvalidValue {
                field: "MAO_MEMORY_ENABLED".to_string(),
                reason: format!("expected true/false, got {raw:?}"),
            })?;
        }
        if let Ok(model) = std::env::var("MAO_EMBEDDING_MODEL") {
            self.embedding.model = model;
        }
        Ok(())
    }
}
