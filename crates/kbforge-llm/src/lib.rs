//! kbforge LLM - Generation collaborator
//!
//! This crate provides the pieces behind the `Generator` trait:
//! - HTTP clients for OpenAI-compatible servers (OpenAI, vLLM) and Ollama
//! - Prompt templates for relation-only and joint entity/triple extraction
//! - `LlmGenerator`, which renders a chunk prompt and calls a client

pub mod generator;
pub mod llm;
pub mod prompt;

pub use generator::LlmGenerator;
pub use llm::{create_llm_client, OllamaClient, OpenAiClient};
pub use prompt::PromptTemplate;

use kbforge_core::{LlmConfig, PromptKind, Result};

/// Build the generation collaborator for a provider config and prompt kind
pub fn create_generator(config: &LlmConfig, prompt: PromptKind) -> Result<LlmGenerator> {
    let client = create_llm_client(config)?;
    Ok(LlmGenerator::new(client, PromptTemplate::builtin(prompt)))
}
