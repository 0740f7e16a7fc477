//! kbforge Extractor - Range extraction and knowledge-base merging
//!
//! Builds a knowledge base of entities and triples from a chunked corpus:
//! - `matcher`: Aho-Corasick matching of known entity names
//! - `sanitizer`: cleaning, repair and validation of generation payloads
//! - `checkpoint`: atomic run checkpoints
//! - `controller`: resumable, failure-tolerant range extraction
//! - `knowledge` / `merge`: deduplicated entity store and file merging

use std::path::PathBuf;

use kbforge_core::KbError;
use thiserror::Error;

pub mod checkpoint;
pub mod controller;
pub mod knowledge;
pub mod matcher;
pub mod merge;
pub mod retry;
pub mod sanitizer;
pub mod stream;

pub use checkpoint::{write_json_atomic, CheckpointManager, RecordKind};
pub use controller::{
    ExtractionRequest, RangeExtractionController, RunOutput, RunPhase, RunSummary,
};
pub use knowledge::{KnowledgeBase, UnionEffect};
pub use matcher::{MatcherStats, MultiPatternMatcher, NO_ENTITY_FOUND};
pub use merge::{
    discover_run_files, enrich_files, merge_entity_dir, merge_triple_dir, read_records,
    KnowledgeBaseMerger, MergeError, MergeReport,
};
pub use retry::RetryPolicy;
pub use sanitizer::{ChunkExtraction, DecodePath, OutputSanitizer, SanitizeOutcome};
pub use stream::{count_chunks, load_entity_dictionary, read_chunk_range};

/// Errors that end an extraction run
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Chunk file not found: {0}")]
    MissingChunkFile(PathBuf),

    #[error("Entity dictionary not found: {0}")]
    MissingEntityDictionary(PathBuf),

    #[error("Invalid entity dictionary {path}: {reason}")]
    InvalidEntityDictionary { path: PathBuf, reason: String },

    #[error("Malformed chunk record at {path}:{line}: {reason}")]
    MalformedChunk {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Cannot read chunk file {path}: {source}")]
    ChunkRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "No chunks in range [{start}, {})",
        .end.map_or_else(|| "end".to_string(), |end| end.to_string())
    )]
    EmptyRange { start: u64, end: Option<u64> },

    #[error("Cannot create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Final checkpoint failed: {0}")]
    Checkpoint(#[source] KbError),

    #[error(transparent)]
    Core(#[from] KbError),
}

impl ExtractError {
    /// Raised before any chunk was processed
    pub fn is_boundary(&self) -> bool {
        !matches!(self, Self::Checkpoint(_) | Self::Core(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_range_message() {
        let bounded = ExtractError::EmptyRange {
            start: 5,
            end: Some(5),
        };
        assert_eq!(bounded.to_string(), "No chunks in range [5, 5)");

        let open = ExtractError::EmptyRange {
            start: 9,
            end: None,
        };
        assert_eq!(open.to_string(), "No chunks in range [9, end)");
        assert!(open.is_boundary());
    }
}
