//! LLM-backed generation collaborator
//!
//! Renders the chunk prompt and forwards it to an [`LlmClient`]. Retries
//! and timeouts are applied by the caller, which owns that policy.

use async_trait::async_trait;
use kbforge_core::{GenerationRequest, Generator, LlmClient, Result};
use tracing::debug;

use crate::prompt::PromptTemplate;

/// Generator that turns a chunk into one completion
pub struct LlmGenerator {
    client: Box<dyn LlmClient>,
    template: PromptTemplate,
}

impl LlmGenerator {
    pub fn new(client: Box<dyn LlmClient>, template: PromptTemplate) -> Self {
        Self { client, template }
    }
}

#[async_trait]
impl Generator for LlmGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let prompt = self.template.render(request);
        debug!(
            chunk_id = %request.chunk_id,
            model = self.client.model(),
            prompt_chars = prompt.chars().count(),
            matched_entities = request.entities.len(),
            "Sending extraction prompt"
        );
        self.client.generate(&prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbforge_core::{ChunkId, KbError};
    use std::sync::Mutex;

    /// Records every prompt and answers with a fixed payload
    struct EchoClient {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LlmClient for EchoClient {
        async fn generate(&self, prompt: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            if prompt.contains("FAIL") {
                return Err(KbError::LlmError("boom".to_string()));
            }
            Ok(r#"{"triples": []}"#.to_string())
        }

        fn model(&self) -> &str {
            "echo"
        }
    }

    #[tokio::test]
    async fn test_generator_renders_and_forwards() {
        let generator = LlmGenerator::new(
            Box::new(EchoClient {
                prompts: Mutex::new(Vec::new()),
            }),
            PromptTemplate::new("{chunk_id}|{entities}|{text}"),
        );

        let request = GenerationRequest {
            text: "焊接".to_string(),
            chunk_id: ChunkId::Index(3),
            entities: Vec::new(),
            entity_context: "ctx".to_string(),
        };

        let payload = generator.generate(&request).await.unwrap();
        assert_eq!(payload, r#"{"triples": []}"#);

        let failing = GenerationRequest {
            text: "FAIL".to_string(),
            ..request
        };
        assert!(generator.generate(&failing).await.is_err());
    }
}
