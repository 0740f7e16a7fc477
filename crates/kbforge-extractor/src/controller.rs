//! Range extraction controller
//!
//! Drives one extraction run over the chunks with global index in
//! `[start, end)`:
//!
//! ```text
//! Idle -> Loading -> Processing{match, generate, sanitize, accumulate, checkpoint}* -> Complete
//!                \-> Failed
//! ```
//!
//! Chunks are processed strictly in stream order with at most one
//! generation call in flight. A chunk whose generation fails is skipped;
//! only input problems and a failed terminal write end a run with an error.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use kbforge_core::{
    ChunkId, ChunkRecord, EntityRecord, ExtractionConfig, GenerationRequest, Generator,
    TripleRecord,
};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::checkpoint::{CheckpointManager, RecordKind};
use crate::knowledge::KnowledgeBase;
use crate::matcher::{render_context, MultiPatternMatcher};
use crate::retry::RetryPolicy;
use crate::sanitizer::{OutputSanitizer, SanitizeOutcome};
use crate::stream::{load_entity_dictionary, read_chunk_range};
use crate::ExtractError;

/// Lifecycle of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Idle,
    Loading,
    Processing,
    Complete,
    Failed,
}

/// Inputs and bounds of one run
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    /// Newline-delimited chunk stream
    pub input: PathBuf,
    /// Entity dictionary used for matching
    pub entities: PathBuf,
    /// Directory for checkpoints and final outputs
    pub output_dir: PathBuf,
    /// First global index, inclusive
    pub start: u64,
    /// Last global index, exclusive; `None` runs to the end of the stream
    pub end: Option<u64>,
}

impl ExtractionRequest {
    pub fn new(
        input: impl Into<PathBuf>,
        entities: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            input: input.into(),
            entities: entities.into(),
            output_dir: output_dir.into(),
            start: 0,
            end: None,
        }
    }

    pub fn with_start(mut self, start: u64) -> Self {
        self.start = start;
        self
    }

    pub fn with_end(mut self, end: u64) -> Self {
        self.end = Some(end);
        self
    }
}

/// What a completed run captured and what it did not
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub start: u64,
    /// Exclusive end of the chunks actually loaded
    pub end: u64,
    pub chunks_in_range: usize,
    /// Chunks whose generation succeeded
    pub chunks_processed: usize,
    /// Chunks skipped after generation failed
    pub chunks_skipped: usize,
    pub skipped_chunk_ids: Vec<ChunkId>,
    /// Chunks with blank content
    pub chunks_empty: usize,
    /// Chunks whose payload was unusable
    pub chunks_quarantined: usize,
    pub quarantine_files: Vec<PathBuf>,
    /// Generated elements dropped by validation
    pub records_dropped: usize,
    pub total_entities: usize,
    pub total_triples: usize,
    pub checkpoint_failures: usize,
    pub entities_file: Option<PathBuf>,
    pub triples_file: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Summary plus the accumulated records
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub summary: RunSummary,
    pub entities: Vec<EntityRecord>,
    pub triples: Vec<TripleRecord>,
}

/// Mutable state of one run, owned by the controller for its duration
struct RunState {
    kb: KnowledgeBase,
    triples: Vec<TripleRecord>,
    entity_checkpoints: CheckpointManager,
    triple_checkpoints: CheckpointManager,
    summary: RunSummary,
}

impl RunState {
    fn new(run_id: Uuid, request: &ExtractionRequest, chunks: &[(u64, ChunkRecord)]) -> Self {
        let end = chunks
            .last()
            .map_or(request.start, |(index, _)| index + 1);

        Self {
            kb: KnowledgeBase::new(),
            triples: Vec::new(),
            entity_checkpoints: CheckpointManager::new(
                &request.output_dir,
                RecordKind::Entities,
                request.start,
            ),
            triple_checkpoints: CheckpointManager::new(
                &request.output_dir,
                RecordKind::Triples,
                request.start,
            ),
            summary: RunSummary {
                run_id,
                start: request.start,
                end,
                chunks_in_range: chunks.len(),
                chunks_processed: 0,
                chunks_skipped: 0,
                skipped_chunk_ids: Vec::new(),
                chunks_empty: 0,
                chunks_quarantined: 0,
                quarantine_files: Vec::new(),
                records_dropped: 0,
                total_entities: 0,
                total_triples: 0,
                checkpoint_failures: 0,
                entities_file: None,
                triples_file: None,
                started_at: Utc::now(),
                finished_at: Utc::now(),
            },
        }
    }

    /// Entities are only persisted once the run has produced some
    fn persist_entities(&self) -> bool {
        !self.kb.is_empty() || self.entity_checkpoints.current().is_some()
    }

    fn checkpoint(&mut self, last: u64) {
        if self.persist_entities() {
            if let Err(e) = self.entity_checkpoints.commit(self.kb.records(), last) {
                error!(global_index = last, error = %e, "Entity checkpoint failed");
                self.summary.checkpoint_failures += 1;
            }
        }
        if let Err(e) = self.triple_checkpoints.commit(&self.triples, last) {
            error!(global_index = last, error = %e, "Triple checkpoint failed");
            self.summary.checkpoint_failures += 1;
        }
    }

    fn finalize(&mut self, range_last: u64) -> Result<(), ExtractError> {
        if self.persist_entities() {
            let path = self
                .entity_checkpoints
                .finalize(self.kb.records(), range_last)
                .map_err(ExtractError::Checkpoint)?;
            self.summary.entities_file = Some(path);
        }

        let path = self
            .triple_checkpoints
            .finalize(&self.triples, range_last)
            .map_err(ExtractError::Checkpoint)?;
        self.summary.triples_file = Some(path);
        Ok(())
    }
}

/// Runs range extraction against a generation collaborator
pub struct RangeExtractionController {
    generator: Box<dyn Generator>,
    sanitizer: OutputSanitizer,
    retry: RetryPolicy,
    max_context_entities: usize,
    phase: RunPhase,
}

impl RangeExtractionController {
    pub fn new(
        generator: Box<dyn Generator>,
        config: &ExtractionConfig,
    ) -> Result<Self, ExtractError> {
        Ok(Self {
            generator,
            sanitizer: OutputSanitizer::new(Some(config.quarantine_dir.clone()))?,
            retry: RetryPolicy::from_config(config),
            max_context_entities: config.max_context_entities,
            phase: RunPhase::Idle,
        })
    }

    /// Phase reached by the most recent run
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    fn transition(&mut self, next: RunPhase) {
        debug!(from = ?self.phase, to = ?next, "Run phase");
        self.phase = next;
    }

    /// Extract the requested range.
    ///
    /// Missing or malformed inputs and an empty range fail before any file
    /// is written.
    pub async fn run(&mut self, request: &ExtractionRequest) -> Result<RunOutput, ExtractError> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "extract_run",
            %run_id,
            start = request.start,
            end = ?request.end
        );

        self.phase = RunPhase::Idle;
        let result = self.run_phases(run_id, request).instrument(span).await;
        if result.is_err() {
            self.transition(RunPhase::Failed);
        }
        result
    }

    async fn run_phases(
        &mut self,
        run_id: Uuid,
        request: &ExtractionRequest,
    ) -> Result<RunOutput, ExtractError> {
        self.transition(RunPhase::Loading);
        let (matcher, chunks) = self.load(request)?;

        let mut state = RunState::new(run_id, request, &chunks);
        let range_last = state.summary.end - 1;
        info!(
            chunks = chunks.len(),
            first = request.start,
            last = range_last,
            entities = matcher.len(),
            "Processing chunk range"
        );

        self.transition(RunPhase::Processing);
        for (global_index, chunk) in &chunks {
            self.process_chunk(&matcher, &mut state, *global_index, chunk)
                .await;
        }

        state.finalize(range_last)?;

        state.summary.total_entities = state.kb.len();
        state.summary.total_triples = state.triples.len();
        state.summary.finished_at = Utc::now();
        self.transition(RunPhase::Complete);

        info!(
            processed = state.summary.chunks_processed,
            skipped = state.summary.chunks_skipped,
            empty = state.summary.chunks_empty,
            quarantined = state.summary.chunks_quarantined,
            entities = state.summary.total_entities,
            triples = state.summary.total_triples,
            "Extraction run complete"
        );

        Ok(RunOutput {
            summary: state.summary,
            entities: state.kb.into_records(),
            triples: state.triples,
        })
    }

    fn load(
        &self,
        request: &ExtractionRequest,
    ) -> Result<(MultiPatternMatcher, Vec<(u64, ChunkRecord)>), ExtractError> {
        if !request.input.is_file() {
            return Err(ExtractError::MissingChunkFile(request.input.clone()));
        }
        let dictionary = load_entity_dictionary(&request.entities)?;
        let chunks = read_chunk_range(&request.input, request.start, request.end)?;

        if chunks.is_empty() {
            warn!(start = request.start, end = ?request.end, "No chunks in range");
            return Err(ExtractError::EmptyRange {
                start: request.start,
                end: request.end,
            });
        }

        prepare_output_dir(&request.output_dir)?;
        Ok((MultiPatternMatcher::build(dictionary), chunks))
    }

    async fn process_chunk(
        &self,
        matcher: &MultiPatternMatcher,
        state: &mut RunState,
        global_index: u64,
        chunk: &ChunkRecord,
    ) {
        let content = chunk.content.trim();
        if content.is_empty() {
            warn!(global_index, "Chunk is empty, skipping");
            state.summary.chunks_empty += 1;
            return;
        }
        let chunk_id = chunk.chunk_id(global_index);

        // Match
        let matched: Vec<EntityRecord> = matcher
            .match_entities(content)
            .into_iter()
            .take(self.max_context_entities)
            .cloned()
            .collect();
        debug!(global_index, chunk_id = %chunk_id, matched = matched.len(), "Matched entities");

        let request = GenerationRequest {
            text: content.to_string(),
            chunk_id: chunk_id.clone(),
            entity_context: render_context(&matched),
            entities: matched,
        };

        // Generate
        let generator = self.generator.as_ref();
        let request = &request;
        let payload = match self
            .retry
            .run("generate", move || generator.generate(request))
            .await
        {
            Ok(payload) => payload,
            Err(e) => {
                warn!(global_index, chunk_id = %chunk_id, error = %e, "Generation failed, skipping chunk");
                state.summary.chunks_skipped += 1;
                state.summary.skipped_chunk_ids.push(chunk_id);
                return;
            }
        };
        state.summary.chunks_processed += 1;

        // Sanitize
        let extraction = match self.sanitizer.sanitize(&payload, &chunk_id) {
            SanitizeOutcome::Accepted { extraction, .. } => extraction,
            SanitizeOutcome::Quarantined { path, .. } => {
                state.summary.chunks_quarantined += 1;
                state.summary.quarantine_files.extend(path);
                Default::default()
            }
        };
        state.summary.records_dropped += extraction.dropped;

        // Accumulate
        let (entities, triples) = (extraction.entities.len(), extraction.triples.len());
        for entity in extraction.entities {
            state.kb.union(entity);
        }
        state.triples.extend(extraction.triples);

        // Checkpoint
        state.checkpoint(global_index);

        info!(
            global_index,
            chunk_id = %chunk_id,
            entities,
            triples,
            "Chunk extracted"
        );
    }
}

fn prepare_output_dir(dir: &Path) -> Result<(), ExtractError> {
    fs::create_dir_all(dir).map_err(|source| ExtractError::OutputDir {
        path: dir.to_path_buf(),
        source,
    })
}
