//! LLM Client implementations
//!
//! Provides abstraction for OpenAI-compatible (OpenAI, vLLM) and Ollama
//! completion APIs.

use async_trait::async_trait;
use kbforge_core::{KbError, LlmClient, LlmConfig, LlmProvider, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

// ============================================================================
// OpenAI-compatible Client
// ============================================================================

/// OpenAI-compatible chat completions client
pub struct OpenAiClient {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    enable_thinking: Option<bool>,
}

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    enable_thinking: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct Choice {
    message: Message,
    finish_reason: Option<String>,
}

impl OpenAiClient {
    /// Create a new client against the public OpenAI endpoint
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            client: Client::new(),
            api_key: Some(api_key.into()),
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            model: model.into(),
            max_tokens,
            temperature,
            enable_thinking: None,
        }
    }

    /// Create from config
    ///
    /// A self-hosted server (custom base URL) may run without an API key;
    /// the public endpoint may not.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        if config.openai_base_url.is_none() && config.openai_api_key.is_none() {
            return Err(KbError::ConfigError(
                "OpenAI API key required when no base URL is set".to_string(),
            ));
        }

        let base_url = config
            .openai_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string());

        Ok(Self {
            client: Client::new(),
            api_key: config.openai_api_key.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            enable_thinking: config.enable_thinking,
        })
    }

    /// Set custom base URL (for vLLM or other compatible APIs)
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let request = OpenAiRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            enable_thinking: self.enable_thinking,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Content-Type", "application/json")
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| KbError::LlmError(format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(KbError::LlmError(format!(
                "Completion error ({status}): {error_text}"
            )));
        }

        let result: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| KbError::LlmError(format!("Failed to parse response: {e}")))?;

        result
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| KbError::LlmError("No response generated".to_string()))
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Ollama Client
// ============================================================================

/// Ollama API client
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool,
    format: String,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct OllamaResponse {
    response: String,
    done: bool,
}

impl OllamaClient {
    /// Create a new Ollama client
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            temperature: 0.1,
        }
    }

    /// Create from config
    pub fn from_config(config: &LlmConfig) -> Self {
        let mut client = Self::new(config.ollama_url.clone(), config.model.clone());
        client.temperature = config.temperature;
        client
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let request = OllamaRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            stream: false,
            // Force JSON output
            format: "json".to_string(),
            options: OllamaOptions {
                temperature: self.temperature,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| KbError::LlmError(format!("Ollama request failed: {e}")))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(KbError::LlmError(format!("Ollama error: {error_text}")));
        }

        let result: OllamaResponse = response
            .json()
            .await
            .map_err(|e| KbError::LlmError(format!("Failed to parse Ollama response: {e}")))?;

        Ok(result.response)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Factory function
// ============================================================================

/// Create an LLM client from config
pub fn create_llm_client(config: &LlmConfig) -> Result<Box<dyn LlmClient>> {
    match config.provider {
        LlmProvider::OpenAI => Ok(Box::new(OpenAiClient::from_config(config)?)),
        LlmProvider::Ollama => Ok(Box::new(OllamaClient::from_config(config))),
    }
}

// ============================================================================
// Tests
// ============================================================================
