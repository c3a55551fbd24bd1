//! Configuration management
//!
//! This module handles loading, validation, and management of the Drover
//! configuration. Configuration is stored in TOML format at
//! ~/.drover/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Data directory, log level
//! - **routing**: Complexity thresholds and fan-out bounds for the task router
//! - **sandbox**: Default resource limits for isolated runs
//! - **memory**: Retrieval depth and the optional embedding backend
//! - **inference**: Inference provider settings
//!
//! # Path Expansion
//!
//! The configuration system automatically expands ~ to the user's home
//! directory and creates the data directory if it doesn't exist.

use sdk::errors::CoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
///
/// Represents the complete Drover configuration loaded from
/// ~/.drover/config.toml. Every section has serde defaults so a partial
/// file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Task router settings
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Sandbox manager settings
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Memory guild settings
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Inference provider settings
    #[serde(default)]
    pub inference: InferenceConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Data directory path (supports ~ expansion); holds the database and
    /// sandbox workspaces
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format ("auto", "pretty", "json"); "auto" follows the
    /// build profile
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Task router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Complexity score below which tasks go straight to a direct
    /// inference call (0.0-1.0)
    #[serde(default = "default_low_threshold")]
    pub low_threshold: f64,

    /// Complexity score above which tasks are routed to the sandbox
    /// (0.0-1.0)
    #[serde(default = "default_high_threshold")]
    pub high_threshold: f64,

    /// Maximum recursion depth for fan-out decomposition
    #[serde(default = "default_max_fanout_depth")]
    pub max_fanout_depth: u32,

    /// Upper bound on concurrently running subtasks
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Retry bound for transient tool dispatch failures
    #[serde(default = "default_tool_retry_limit")]
    pub tool_retry_limit: u32,

    /// Base backoff between tool dispatch retries, in milliseconds
    #[serde(default = "default_tool_retry_backoff_ms")]
    pub tool_retry_backoff_ms: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            low_threshold: default_low_threshold(),
            high_threshold: default_high_threshold(),
            max_fanout_depth: default_max_fanout_depth(),
            max_workers: default_max_workers(),
            tool_retry_limit: default_tool_retry_limit(),
            tool_retry_backoff_ms: default_tool_retry_backoff_ms(),
        }
    }
}

/// Sandbox manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Default wall-clock ceiling per run, in milliseconds
    #[serde(default = "default_wall_clock_ms")]
    pub default_wall_clock_ms: u64,

    /// Default memory ceiling per run, in bytes
    #[serde(default = "default_memory_bytes")]
    pub default_memory_bytes: u64,

    /// Cap on captured stdout/stderr per run, in bytes
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Whether runs may request network access. Off by default; a run
    /// asking for the network while this is off is refused before any
    /// provisioning happens.
    #[serde(default)]
    pub allow_network: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_wall_clock_ms: default_wall_clock_ms(),
            default_memory_bytes: default_memory_bytes(),
            max_output_bytes: default_max_output_bytes(),
            allow_network: false,
        }
    }
}

/// Memory guild configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Default number of records returned by a retrieval
    #[serde(default = "default_retrieve_k")]
    pub retrieve_k: usize,

    /// Embedding backend; when absent the guild runs in degraded
    /// (lexical) mode, which is a first-class operating mode
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            retrieve_k: default_retrieve_k(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

/// Embedding backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Whether to attempt embedding at all
    #[serde(default)]
    pub enabled: bool,

    /// Base URL of the embedding service
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,

    /// Model name for embedding requests
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Environment variable holding the API key (never the key itself)
    #[serde(default = "default_embedding_api_key_env")]
    pub api_key_env: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_embedding_base_url(),
            model: default_embedding_model(),
            api_key_env: default_embedding_api_key_env(),
        }
    }
}

/// Inference provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Preferred provider ("ollama" or "openai"); the router treats both
    /// as interchangeable implementations of one contract
    #[serde(default = "default_inference_provider")]
    pub default_provider: String,

    #[serde(default)]
    pub ollama: OllamaConfig,

    #[serde(default)]
    pub openai: OpenAiConfig,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            default_provider: default_inference_provider(),
            ollama: OllamaConfig::default(),
            openai: OpenAiConfig::default(),
        }
    }
}

/// Local (Ollama) provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,

    #[serde(default = "default_ollama_model")]
    pub model: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_base_url(),
            model: default_ollama_model(),
        }
    }
}

/// Remote (OpenAI-compatible) provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    #[serde(default = "default_openai_model")]
    pub model: String,

    /// Environment variable holding the API key (never the key itself)
    #[serde(default = "default_openai_api_key_env")]
    pub api_key_env: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            model: default_openai_model(),
            api_key_env: default_openai_api_key_env(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "auto".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.drover")
}

fn default_low_threshold() -> f64 {
    0.3
}

fn default_high_threshold() -> f64 {
    0.7
}

fn default_max_fanout_depth() -> u32 {
    3
}

fn default_max_workers() -> usize {
    4
}

fn default_tool_retry_limit() -> u32 {
    2
}

fn default_tool_retry_backoff_ms() -> u64 {
    250
}

fn default_wall_clock_ms() -> u64 {
    30_000
}

fn default_memory_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_retrieve_k() -> usize {
    5
}

fn default_embedding_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_embedding_api_key_env() -> String {
    "DROVER_EMBEDDING_API_KEY".to_string()
}

fn default_inference_provider() -> String {
    "ollama".to_string()
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "llama3.2".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_openai_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            routing: RoutingConfig::default(),
            sandbox: SandboxConfig::default(),
            memory: MemoryConfig::default(),
            inference: InferenceConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.drover/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default
    /// configuration. Validates the configuration after loading and returns
    /// descriptive errors if validation fails.
    pub fn load_or_create() -> Result<Self, CoreError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, CoreError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| CoreError::Validation(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| CoreError::Validation(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, CoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                CoreError::Validation(format!("Failed to create config directory: {}", e))
            })?;
        }

        let mut config = Self::default();
        config.validate_and_process()?;

        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| CoreError::Validation(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| CoreError::Validation(format!("Failed to write config file: {}", e)))?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.drover/config.toml)
    fn default_config_path() -> Result<PathBuf, CoreError> {
        let home = dirs::home_dir().ok_or_else(|| {
            CoreError::Validation("Could not determine home directory".to_string())
        })?;

        Ok(home.join(".drover").join("config.toml"))
    }

    /// Path to the SQLite database inside the data directory
    pub fn db_path(&self) -> PathBuf {
        self.core.data_dir.join("drover.db")
    }

    /// Root directory for per-run sandbox workspaces
    pub fn sandbox_root(&self) -> PathBuf {
        self.core.data_dir.join("sandboxes")
    }

    /// Validate and process configuration
    ///
    /// Validates field ranges, expands ~ in the data directory, and creates
    /// the data directory if it doesn't exist.
    fn validate_and_process(&mut self) -> Result<(), CoreError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(CoreError::Validation(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        let valid_log_formats = ["auto", "pretty", "json"];
        if !valid_log_formats.contains(&self.core.log_format.as_str()) {
            return Err(CoreError::Validation(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.core.log_format,
                valid_log_formats.join(", ")
            )));
        }

        let valid_providers = ["ollama", "openai"];
        if !valid_providers.contains(&self.inference.default_provider.as_str()) {
            return Err(CoreError::Validation(format!(
                "Invalid default provider '{}'. Must be one of: {}",
                self.inference.default_provider,
                valid_providers.join(", ")
            )));
        }

        if !(0.0..=1.0).contains(&self.routing.low_threshold) {
            return Err(CoreError::Validation(
                "low_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.routing.high_threshold) {
            return Err(CoreError::Validation(
                "high_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.routing.low_threshold > self.routing.high_threshold {
            return Err(CoreError::Validation(
                "low_threshold must not exceed high_threshold".to_string(),
            ));
        }
        if self.routing.max_workers == 0 {
            return Err(CoreError::Validation(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.routing.max_fanout_depth == 0 {
            return Err(CoreError::Validation(
                "max_fanout_depth must be at least 1".to_string(),
            ));
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;

        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                CoreError::Validation(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, CoreError> {
    let path_str = path.to_string_lossy();

    if let Some(stripped) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir().ok_or_else(|| {
            CoreError::Validation("Could not determine home directory".to_string())
        })?;
        Ok(home.join(stripped))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| CoreError::Validation("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}
