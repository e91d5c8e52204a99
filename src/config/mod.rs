// Aglogen Assistant — Configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::crypto::ApiKeyEncryption;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("home directory not found")]
    NoHomeDir,
    #[error("encryption key is not configured; generate one with `aglogen-assistant keygen`")]
    MissingEncryptionKey,
    #[error("encryption key is invalid: {0}")]
    InvalidEncryptionKey(String),
    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub rag: RagConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Empty means any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_true")]
    pub persist: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            persist: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Security
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    #[serde(default)]
    pub encryption_key: String,
}

// ---------------------------------------------------------------------------
// RAG
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    /// `openai` or `hash` (offline).
    #[serde(default = "default_embedding_provider")]
    pub embedding_provider: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_base: String,
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default = "default_k")]
    pub default_k: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            embedding_provider: default_embedding_provider(),
            embedding_model: default_embedding_model(),
            api_key: String::new(),
            api_base: String::new(),
            dimensions: default_dimensions(),
            min_score: default_min_score(),
            default_k: default_k(),
        }
    }
}

// ---------------------------------------------------------------------------
// Assistant
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Per-provider base URL overrides, keyed by provider name.
    #[serde(default)]
    pub api_bases: HashMap<String, String>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: default_max_tool_iterations(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            system_prompt: default_system_prompt(),
            api_bases: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Categories exposed to the assistant and the HTTP catalog. Empty enables all.
    #[serde(default = "default_categories")]
    pub enabled_categories: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled_categories: default_categories(),
        }
    }
}

impl ToolsConfig {
    pub fn is_enabled(&self, category: &str) -> bool {
        self.enabled_categories.is_empty() || self.enabled_categories.iter().any(|c| c == category)
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8000
}
fn default_data_dir() -> String {
    "~/.aglogen/data".into()
}
fn default_true() -> bool {
    true
}
fn default_embedding_provider() -> String {
    "hash".into()
}
fn default_embedding_model() -> String {
    crate::rag::embedding::DEFAULT_EMBEDDING_MODEL.into()
}
fn default_dimensions() -> usize {
    crate::rag::embedding::DEFAULT_DIMENSIONS
}
fn default_min_score() -> f64 {
    crate::rag::search::DEFAULT_MIN_SCORE
}
fn default_k() -> usize {
    crate::rag::search::DEFAULT_K
}
fn default_max_tool_iterations() -> usize {
    10
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_temperature() -> f64 {
    0.7
}
fn default_system_prompt() -> String {
    "You are the Aglogen research assistant. You help scientists run and analyze \
     fractal aggregate simulations (DLA, CCA, ballistic and tunable models). \
     Use the available tools to start simulations, inspect results, run fractal \
     analyses and search the knowledge base. Report numbers with their units \
     and say when a task is still running."
        .into()
}
fn default_categories() -> Vec<String> {
    ["simulation", "analysis", "study", "utility", "knowledge"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load config from a JSON file, falling back to defaults if missing.
    /// Environment overrides are applied in both cases.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            serde_json::from_str(&contents)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (prefix: AGLOGEN_)
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("AGLOGEN_SERVER_HOST") {
            self.server.host = v;
        }
        if let Ok(v) = std::env::var("AGLOGEN_SERVER_PORT") {
            if let Ok(n) = v.parse() {
                self.server.port = n;
            }
        }
        if let Ok(v) = std::env::var("AGLOGEN_SERVER_ALLOWED_ORIGINS") {
            self.server.allowed_origins = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(v) = std::env::var("AGLOGEN_STORAGE_DATA_DIR") {
            self.storage.data_dir = v;
        }
        if let Ok(v) = std::env::var("AGLOGEN_STORAGE_PERSIST") {
            self.storage.persist = v.parse().unwrap_or(true);
        }
        if let Ok(v) = std::env::var("AGLOGEN_SECURITY_ENCRYPTION_KEY") {
            self.security.encryption_key = v;
        }
        // RAG overrides
        if let Ok(v) = std::env::var("AGLOGEN_RAG_EMBEDDING_PROVIDER") {
            self.rag.embedding_provider = v;
        }
        if let Ok(v) = std::env::var("AGLOGEN_RAG_EMBEDDING_MODEL") {
            self.rag.embedding_model = v;
        }
        if let Ok(v) = std::env::var("AGLOGEN_RAG_API_KEY") {
            self.rag.api_key = v;
        }
        if let Ok(v) = std::env::var("AGLOGEN_RAG_API_BASE") {
            self.rag.api_base = v;
        }
        if let Ok(v) = std::env::var("AGLOGEN_RAG_DIMENSIONS") {
            if let Ok(n) = v.parse() {
                self.rag.dimensions = n;
            }
        }
        // Assistant overrides
        if let Ok(v) = std::env::var("AGLOGEN_ASSISTANT_MAX_TOOL_ITERATIONS") {
            if let Ok(n) = v.parse() {
                self.assistant.max_tool_iterations = n;
            }
        }
        if let Ok(v) = std::env::var("AGLOGEN_ASSISTANT_MAX_TOKENS") {
            if let Ok(n) = v.parse() {
                self.assistant.max_tokens = n;
            }
        }
        if let Ok(v) = std::env::var("AGLOGEN_ASSISTANT_TEMPERATURE") {
            if let Ok(n) = v.parse() {
                self.assistant.temperature = n;
            }
        }
    }

    /// Get the default config file path: ~/.aglogen/config.json
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(home.join(".aglogen").join("config.json"))
    }

    /// Resolve the data directory, expanding `~` to the home directory.
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        let dir = &self.storage.data_dir;
        if let Some(stripped) = dir.strip_prefix('~') {
            let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
            Ok(home.join(dir.strip_prefix("~/").unwrap_or(stripped)))
        } else {
            Ok(PathBuf::from(dir))
        }
    }

    /// The encryption helper for stored provider keys.
    pub fn encryption(&self) -> Result<ApiKeyEncryption, ConfigError> {
        if self.security.encryption_key.trim().is_empty() {
            return Err(ConfigError::MissingEncryptionKey);
        }
        ApiKeyEncryption::new(&self.security.encryption_key)
            .map_err(|e| ConfigError::InvalidEncryptionKey(e.to_string()))
    }

    /// Validate configuration for basic correctness.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.encryption()?;

        if self.server.port == 0 {
            return Err(ConfigError::Other("server.port must be non-zero".to_string()));
        }

        if !(0.0..=1.0).contains(&self.rag.min_score) {
            return Err(ConfigError::Other(format!(
                "rag.min_score must be between 0 and 1, got {}",
                self.rag.min_score
            )));
        }

        if self.rag.embedding_provider == "openai" && self.rag.api_key.is_empty() {
            tracing::warn!("RAG embedding provider is 'openai' but no API key is configured");
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
