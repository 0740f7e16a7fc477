//! kbforge Configuration Management
//!
//! Handles configuration from environment variables and TOML files
//! with sensible defaults for a local OpenAI-compatible model server.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Range extraction configuration
    pub extraction: ExtractionConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileReadError {
            path: path.clone(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path,
            message: e.to_string(),
        })
    }

    /// Merge with environment variables (env takes precedence)
    pub fn with_env_override(mut self) -> Result<Self, ConfigError> {
        self.apply_env()?;
        Ok(self)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        // LLM
        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            self.llm.provider = provider.parse()?;
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.llm.openai_api_key = Some(key);
        }
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            self.llm.openai_base_url = Some(url);
        }
        if let Ok(url) = std::env::var("OLLAMA_URL") {
            self.llm.ollama_url = url;
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Ok(temperature) = std::env::var("LLM_TEMPERATURE") {
            self.llm.temperature = parse_env("LLM_TEMPERATURE", temperature)?;
        }

        // Extraction
        if let Ok(attempts) = std::env::var("GENERATION_MAX_ATTEMPTS") {
            self.extraction.max_attempts = parse_env("GENERATION_MAX_ATTEMPTS", attempts)?;
        }
        if let Ok(timeout) = std::env::var("GENERATION_TIMEOUT_SECS") {
            self.extraction.timeout_secs = parse_env("GENERATION_TIMEOUT_SECS", timeout)?;
        }
        if let Ok(dir) = std::env::var("QUARANTINE_DIR") {
            self.extraction.quarantine_dir = PathBuf::from(dir);
        }

        // Logging
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value,
    })
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// LLM provider to use
    pub provider: LlmProvider,

    /// API key for OpenAI-compatible servers
    pub openai_api_key: Option<String>,

    /// Base URL for OpenAI-compatible servers (vLLM, LM Studio, ...)
    pub openai_base_url: Option<String>,

    /// Ollama server URL
    pub ollama_url: String,

    /// Model name to use
    pub model: String,

    /// Maximum tokens for completion
    pub max_tokens: u32,

    /// Temperature for generation
    pub temperature: f32,

    /// Reasoning toggle forwarded to servers that understand it
    pub enable_thinking: Option<bool>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::OpenAI,
            openai_api_key: None,
            openai_base_url: None,
            ollama_url: "http://localhost:11434".to_string(),
            model: "Qwen3-8B".to_string(),
            max_tokens: 4096,
            temperature: 0.1,
            enable_thinking: Some(false),
        }
    }
}

/// Supported LLM providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAI,
    Ollama,
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" | "vllm" => Ok(Self::OpenAI),
            "ollama" => Ok(Self::Ollama),
            _ => Err(ConfigError::InvalidValue {
                key: "LLM_PROVIDER".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Which prompt the generation collaborator sends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptKind {
    /// Entities and triples in one call
    Joint,
    /// Triples only, guided by matched entities
    Relations,
}

impl std::str::FromStr for PromptKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "joint" => Ok(Self::Joint),
            "relations" => Ok(Self::Relations),
            _ => Err(ConfigError::InvalidValue {
                key: "prompt".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Range extraction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Generation attempts per chunk (first call included)
    pub max_attempts: u32,

    /// Wall-clock limit for one generation attempt, in seconds
    pub timeout_secs: u64,

    /// Fixed pause between attempts, in milliseconds
    pub retry_backoff_ms: u64,

    /// Matched entities rendered into the prompt context
    pub max_context_entities: usize,

    /// Where unparsable payloads are written
    pub quarantine_dir: PathBuf,

    /// Prompt variant
    pub prompt: PromptKind,
}

impl ExtractionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout_secs: 180,
            retry_backoff_ms: 1000,
            max_context_entities: 15,
            quarantine_dir: PathBuf::from("debug_output"),
            prompt: PromptKind::Relations,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// JSON format for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}
