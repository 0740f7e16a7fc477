//! Prompt templates for chunk-level extraction

use kbforge_core::{GenerationRequest, PromptKind};

const RELATIONS_TEMPLATE: &str = include_str!("prompts/relations.txt");
const JOINT_TEMPLATE: &str = include_str!("prompts/joint.txt");

/// A prompt template with `{text}`, `{chunk_id}` and `{entities}` slots
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    template: String,
}

impl PromptTemplate {
    /// Built-in template for a prompt kind
    pub fn builtin(kind: PromptKind) -> Self {
        let template = match kind {
            PromptKind::Relations => RELATIONS_TEMPLATE,
            PromptKind::Joint => JOINT_TEMPLATE,
        };
        Self::new(template)
    }

    /// Custom template
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Fill the template for one chunk
    pub fn render(&self, request: &GenerationRequest) -> String {
        let chunk_id = request.chunk_id.to_string();
        let slots = [
            ("text", request.text.as_str()),
            ("chunk_id", chunk_id.as_str()),
            ("entities", request.entity_context.as_str()),
        ];
        fill_slots(&self.template, &slots)
    }
}

/// Single-pass substitution so that slot values are never re-scanned
fn fill_slots(template: &str, slots: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        let slot = slots.iter().find(|(name, _)| {
            after
                .strip_prefix(name)
                .is_some_and(|tail| tail.starts_with('}'))
        });

        match slot {
            Some((name, value)) => {
                out.push_str(value);
                rest = &after[name.len() + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}
