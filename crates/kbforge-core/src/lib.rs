//! kbforge Core - Record types, traits, and shared errors
//!
//! This crate defines the abstractions shared by the kbforge workspace:
//! - Knowledge records (entities, triples) and the chunk stream record
//! - Chunk identifiers as they appear in chunk metadata and output files
//! - Common error types
//! - The LLM client and generation collaborator traits
//! - Configuration management

pub mod config;

pub use config::{
    AppConfig, ConfigError, ExtractionConfig, LlmConfig, LlmProvider, LoggingConfig, PromptKind,
};

use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Core error types for kbforge operations
#[derive(Error, Debug)]
pub enum KbError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Generation timed out after {0}s")]
    Timeout(u64),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KbError {
    /// Attach a path to an IO error
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, KbError>;

// ============================================================================
// Chunk Identifiers
// ============================================================================

/// Identifier of a chunk in the source stream.
///
/// Chunk metadata carries either a numeric position or a string label.
/// Numeric strings are normalized to `Index` on the way in so that `"3"`
/// and `3` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum ChunkId {
    Index(u64),
    Label(String),
}

impl ChunkId {
    /// Build a chunk id from a metadata value, if it has a usable shape
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_u64().map(Self::Index),
            serde_json::Value::String(s) => Some(Self::from(s.as_str())),
            serde_json::Value::Object(map) => ["chunk_id", "index"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Self::from_value)),
            _ => None,
        }
    }
}

impl From<u64> for ChunkId {
    fn from(index: u64) -> Self {
        Self::Index(index)
    }
}

impl From<&str> for ChunkId {
    fn from(label: &str) -> Self {
        let trimmed = label.trim();
        match trimmed.parse::<u64>() {
            Ok(index) => Self::Index(index),
            Err(_) => Self::Label(trimmed.to_string()),
        }
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index(index) => write!(f, "{index}"),
            Self::Label(label) => write!(f, "{label}"),
        }
    }
}

impl<'de> Deserialize<'de> for ChunkId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Index(u64),
            Label(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Index(index) => Self::Index(index),
            Raw::Label(label) => Self::from(label.as_str()),
        })
    }
}

/// Deserialize a field that may be a single string or a list of strings
pub fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(value)) => vec![value],
        Some(OneOrMany::Many(values)) => values,
        None => Vec::new(),
    })
}

/// Append `item` unless it is already present, keeping first-seen order
pub fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) -> bool {
    if items.contains(&item) {
        false
    } else {
        items.push(item);
        true
    }
}

// ============================================================================
// Knowledge Records
// ============================================================================

/// Canonical row describing a named concept.
///
/// `name` is the unique key (exact string match). `chunk_ids` lists the
/// chunks the entity was extracted from; `relation_chunk_ids` is absent
/// until enrichment, which fills it with chunks where the entity was
/// referenced inside a triple (possibly none).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    #[serde(rename = "entity_name")]
    pub name: String,

    #[serde(rename = "type", default, deserialize_with = "one_or_many")]
    pub types: Vec<String>,

    #[serde(default, deserialize_with = "one_or_many")]
    pub domain_relevance: Vec<String>,

    #[serde(default)]
    pub summary: String,

    #[serde(default, alias = "entity_chunk_id")]
    pub chunk_ids: Vec<ChunkId>,

    #[serde(
        default,
        alias = "relation_chunk_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub relation_chunk_ids: Option<Vec<ChunkId>>,
}

impl EntityRecord {
    /// Create an entity with only its name set
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            types: Vec::new(),
            domain_relevance: Vec::new(),
            summary: String::new(),
            chunk_ids: Vec::new(),
            relation_chunk_ids: None,
        }
    }

    /// Chunks referencing this entity through a triple; empty before enrichment
    pub fn references(&self) -> &[ChunkId] {
        self.relation_chunk_ids.as_deref().unwrap_or_default()
    }

    /// Reference set, created empty on first use
    pub fn references_mut(&mut self) -> &mut Vec<ChunkId> {
        self.relation_chunk_ids.get_or_insert_with(Vec::new)
    }

    /// Add a type tag (ignored if already present)
    pub fn with_type(mut self, entity_type: impl Into<String>) -> Self {
        push_unique(&mut self.types, entity_type.into());
        self
    }

    /// Add a domain-relevance tag (ignored if already present)
    pub fn with_domain_relevance(mut self, relevance: impl Into<String>) -> Self {
        push_unique(&mut self.domain_relevance, relevance.into());
        self
    }

    /// Set summary
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    /// Add a provenance chunk id (ignored if already present)
    pub fn with_chunk_id(mut self, chunk_id: impl Into<ChunkId>) -> Self {
        push_unique(&mut self.chunk_ids, chunk_id.into());
        self
    }
}

/// A directed (subject, relation, object) assertion tagged with its chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripleRecord {
    pub subject: String,

    #[serde(alias = "predicate")]
    pub relation: String,

    pub object: String,

    pub chunk_id: ChunkId,
}

impl TripleRecord {
    /// Create a new triple
    pub fn new(
        subject: impl Into<String>,
        relation: impl Into<String>,
        object: impl Into<String>,
        chunk_id: impl Into<ChunkId>,
    ) -> Self {
        Self {
            subject: subject.into(),
            relation: relation.into(),
            object: object.into(),
            chunk_id: chunk_id.into(),
        }
    }
}

/// One record of the newline-delimited chunk stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    #[serde(rename = "chunk_content", default)]
    pub content: String,

    #[serde(default)]
    pub source: String,

    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl ChunkRecord {
    /// Create a chunk record
    pub fn new(content: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            source: source.into(),
            metadata: None,
        }
    }

    /// Set metadata
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Chunk id carried by the metadata, or the global stream index
    pub fn chunk_id(&self, global_index: u64) -> ChunkId {
        self.metadata
            .as_ref()
            .and_then(ChunkId::from_value)
            .unwrap_or(ChunkId::Index(global_index))
    }
}

// ============================================================================
// Generation
// ============================================================================

/// Input handed to the generation collaborator for one chunk
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Chunk content
    pub text: String,

    /// Chunk identifier
    pub chunk_id: ChunkId,

    /// Known entities matched in the chunk
    pub entities: Vec<EntityRecord>,

    /// Human-readable rendering of `entities`
    pub entity_context: String,
}

// ============================================================================
// Traits
// ============================================================================

/// Trait for LLM clients
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate a response
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Model name for logging
    fn model(&self) -> &str;
}

/// The generation collaborator: one textual payload per chunk
#[async_trait::async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_normalizes_numeric_strings() {
        assert_eq!(ChunkId::from("12"), ChunkId::Index(12));
        assert_eq!(ChunkId::from(" 7 "), ChunkId::Index(7));
        assert_eq!(
            ChunkId::from("doc-3"),
            ChunkId::Label("doc-3".to_string())
        );

        let parsed: Vec<ChunkId> = serde_json::from_str(r#"[1, "1", "a"]"#).unwrap();
        assert_eq!(parsed[0], parsed[1]);
        assert_eq!(parsed[2], ChunkId::Label("a".to_string()));
    }

    #[test]
    fn test_chunk_id_from_metadata() {
        let chunk = ChunkRecord::new("text", "a.md");
        assert_eq!(chunk.chunk_id(4), ChunkId::Index(4));

        let chunk = ChunkRecord::new("text", "a.md").with_metadata(serde_json::json!(42));
        assert_eq!(chunk.chunk_id(4), ChunkId::Index(42));

        let chunk = ChunkRecord::new("text", "a.md")
            .with_metadata(serde_json::json!({"chunk_id": "c-9", "page": 2}));
        assert_eq!(chunk.chunk_id(4), ChunkId::Label("c-9".to_string()));

        let chunk = ChunkRecord::new("text", "a.md").with_metadata(serde_json::json!([1]));
        assert_eq!(chunk.chunk_id(4), ChunkId::Index(4));
    }

    #[test]
    fn test_entity_record_wire_format() {
        let json = r#"{
            "entity_name": "龙骨",
            "type": "部件",
            "domain_relevance": ["domain_specific"],
            "summary": "船体底部纵向构件",
            "chunk_ids": [3, "4"]
        }"#;

        let entity: EntityRecord = serde_json::from_str(json).unwrap();
        assert_eq!(entity.name, "龙骨");
        assert_eq!(entity.types, vec!["部件".to_string()]);
        assert_eq!(entity.chunk_ids, vec![ChunkId::Index(3), ChunkId::Index(4)]);
        assert!(entity.relation_chunk_ids.is_none());

        let value = serde_json::to_value(&entity).unwrap();
        assert_eq!(value["entity_name"], "龙骨");
        assert_eq!(value["type"], serde_json::json!(["部件"]));
        assert!(value.get("relation_chunk_ids").is_none());
    }

    #[test]
    fn test_entity_builder_dedups_tags() {
        let entity = EntityRecord::new("焊接")
            .with_type("工艺")
            .with_type("工艺")
            .with_chunk_id(1u64)
            .with_chunk_id(1u64);

        assert_eq!(entity.types.len(), 1);
        assert_eq!(entity.chunk_ids.len(), 1);
    }

    #[test]
    fn test_triple_accepts_predicate_alias() {
        let triple: TripleRecord = serde_json::from_str(
            r#"{"subject": "焊接", "predicate": "acts_on", "object": "钢板", "chunk_id": "5"}"#,
        )
        .unwrap();

        assert_eq!(triple, TripleRecord::new("焊接", "acts_on", "钢板", 5u64));
    }
}
