//! Knowledge-base merging
//!
//! Folds many run-output files into one deduplicated entity set and one
//! concatenated triple list, and enriches entities with the chunks where
//! triples reference them. Triples are never deduplicated.

use std::fs;
use std::path::{Path, PathBuf};

use kbforge_core::{EntityRecord, KbError, TripleRecord};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::checkpoint::{write_json_atomic, RecordKind};
use crate::knowledge::{KnowledgeBase, UnionEffect};

/// Errors that stop a merge
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("Cannot read input directory {path}: {source}")]
    InputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot read {path}: {source}")]
    Input {
        path: PathBuf,
        #[source]
        source: KbError,
    },

    #[error("Cannot write {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: KbError,
    },
}

/// Counters of one merge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub files_read: usize,
    /// Files that were not a JSON array, with the reason
    pub files_skipped: Vec<(PathBuf, String)>,
    /// Elements that did not deserialize as a record
    pub records_dropped: usize,
    pub entities_inserted: usize,
    pub entities_updated: usize,
    pub triples: usize,
    pub placeholders_created: usize,
    pub references_added: usize,
}

/// Run-output files of `kind` in `dir`, ordered by start index, then last
/// index, then name
pub fn discover_run_files(dir: &Path, kind: RecordKind) -> Result<Vec<PathBuf>, MergeError> {
    let entries = fs::read_dir(dir).map_err(|source| MergeError::InputDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files: Vec<((u64, u64), String, PathBuf)> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| MergeError::InputDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(bounds) = kind.parse_file_name(&name) {
            files.push((bounds, name, entry.path()));
        }
    }

    files.sort();
    Ok(files.into_iter().map(|(_, _, path)| path).collect())
}

/// Read a JSON array of records, dropping elements that do not deserialize.
///
/// Returns the records and the number of dropped elements.
pub fn read_records<T: DeserializeOwned>(path: &Path) -> kbforge_core::Result<(Vec<T>, usize)> {
    let text = fs::read_to_string(path).map_err(|e| KbError::io(path, e))?;
    let items: Vec<Value> = serde_json::from_str(&text)?;

    let mut records = Vec::with_capacity(items.len());
    let mut dropped = 0;
    for item in items {
        match serde_json::from_value(item) {
            Ok(record) => records.push(record),
            Err(_) => dropped += 1,
        }
    }
    Ok((records, dropped))
}

/// Accumulates entities and triples from run-output files
#[derive(Debug, Default)]
pub struct KnowledgeBaseMerger {
    kb: KnowledgeBase,
    triples: Vec<TripleRecord>,
    report: MergeReport,
}

impl KnowledgeBaseMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing entity set
    pub fn with_knowledge_base(kb: KnowledgeBase) -> Self {
        Self {
            kb,
            ..Self::default()
        }
    }

    /// Fold the entities of every file, in the given order
    pub fn merge_entities<P: AsRef<Path>>(&mut self, files: &[P]) -> &mut Self {
        for path in files {
            self.merge_entity_file(path.as_ref());
        }
        self
    }

    /// Fold one entity file; an unreadable file is skipped and reported
    pub fn merge_entity_file(&mut self, path: &Path) {
        let Some(entities) = self.read_file::<EntityRecord>(path) else {
            return;
        };

        for entity in entities {
            match self.kb.union(entity) {
                UnionEffect::Inserted => self.report.entities_inserted += 1,
                UnionEffect::Updated => self.report.entities_updated += 1,
                UnionEffect::Unchanged => {}
            }
        }
    }

    /// Concatenate the triples of every file, in the given order
    pub fn merge_triples<P: AsRef<Path>>(&mut self, files: &[P]) -> &mut Self {
        for path in files {
            self.merge_triple_file(path.as_ref());
        }
        self
    }

    pub fn merge_triple_file(&mut self, path: &Path) {
        let Some(triples) = self.read_file::<TripleRecord>(path) else {
            return;
        };
        self.report.triples += triples.len();
        self.triples.extend(triples);
    }

    /// Add triples already in memory
    pub fn extend_triples(&mut self, triples: impl IntoIterator<Item = TripleRecord>) {
        let before = self.triples.len();
        self.triples.extend(triples);
        self.report.triples += self.triples.len() - before;
    }

    /// Record every triple's subject and object as referenced by its chunk,
    /// creating placeholders for names not in the entity set
    pub fn enrich(&mut self) -> &mut Self {
        self.kb.track_references();
        for triple in &self.triples {
            for name in [&triple.subject, &triple.object] {
                match self.kb.add_reference(name, &triple.chunk_id) {
                    UnionEffect::Inserted => self.report.placeholders_created += 1,
                    UnionEffect::Updated => self.report.references_added += 1,
                    UnionEffect::Unchanged => {}
                }
            }
        }

        info!(
            placeholders = self.report.placeholders_created,
            references = self.report.references_added,
            entities = self.kb.len(),
            "Enriched entities from triples"
        );
        self
    }

    fn read_file<T: DeserializeOwned>(&mut self, path: &Path) -> Option<Vec<T>> {
        match read_records::<T>(path) {
            Ok((records, dropped)) => {
                self.report.files_read += 1;
                self.report.records_dropped += dropped;
                debug!(
                    path = %path.display(),
                    records = records.len(),
                    dropped,
                    "Read run output"
                );
                Some(records)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable file");
                self.report.files_skipped.push((path.to_path_buf(), e.to_string()));
                None
            }
        }
    }

    pub fn knowledge_base(&self) -> &KnowledgeBase {
        &self.kb
    }

    pub fn triples(&self) -> &[TripleRecord] {
        &self.triples
    }

    pub fn report(&self) -> &MergeReport {
        &self.report
    }

    /// Write the entity set as a pretty JSON array
    pub fn write_entities(&self, path: &Path) -> Result<(), MergeError> {
        write_output(path, self.kb.records())
    }

    /// Write the triple list as a pretty JSON array
    pub fn write_triples(&self, path: &Path) -> Result<(), MergeError> {
        write_output(path, &self.triples)
    }

    pub fn into_parts(self) -> (KnowledgeBase, Vec<TripleRecord>, MergeReport) {
        (self.kb, self.triples, self.report)
    }
}

fn write_output<T: Serialize + ?Sized>(path: &Path, data: &T) -> Result<(), MergeError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| MergeError::Output {
            path: path.to_path_buf(),
            source: KbError::io(parent, e),
        })?;
    }

    write_json_atomic(path, data).map_err(|source| MergeError::Output {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "Wrote merged output");
    Ok(())
}

/// Merge every `entities_*.json` in `input_dir` into `output`
pub fn merge_entity_dir(input_dir: &Path, output: &Path) -> Result<MergeReport, MergeError> {
    let files = discover_run_files(input_dir, RecordKind::Entities)?;
    let mut merger = KnowledgeBaseMerger::new();
    merger.merge_entities(&files);
    merger.write_entities(output)?;

    info!(
        files = files.len(),
        entities = merger.knowledge_base().len(),
        "Merged entity files"
    );
    Ok(merger.report)
}

/// Concatenate every `triples_*.json` in `input_dir` into `output`
pub fn merge_triple_dir(input_dir: &Path, output: &Path) -> Result<MergeReport, MergeError> {
    let files = discover_run_files(input_dir, RecordKind::Triples)?;
    let mut merger = KnowledgeBaseMerger::new();
    merger.merge_triples(&files);
    merger.write_triples(output)?;

    info!(
        files = files.len(),
        triples = merger.triples().len(),
        "Merged triple files"
    );
    Ok(merger.report)
}

/// Enrich the entity file with the triple file's references into `output`
pub fn enrich_files(
    entities: &Path,
    triples: &Path,
    output: &Path,
) -> Result<MergeReport, MergeError> {
    let (entity_records, _) =
        read_records::<EntityRecord>(entities).map_err(|source| MergeError::Input {
            path: entities.to_path_buf(),
            source,
        })?;
    let (triple_records, _) =
        read_records::<TripleRecord>(triples).map_err(|source| MergeError::Input {
            path: triples.to_path_buf(),
            source,
        })?;

    let mut merger = KnowledgeBaseMerger::with_knowledge_base(KnowledgeBase::from_records(
        entity_records,
    ));
    merger.extend_triples(triple_records);
    merger.enrich();
    merger.write_entities(output)?;
    Ok(merger.report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbforge_core::ChunkId;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, value: serde_json::Value) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, value.to_string()).unwrap();
        path
    }

    #[test]
    fn test_merge_union_across_files() {
        let dir = TempDir::new().unwrap();
        let file1 = write(
            dir.path(),
            "entities_0_9.json",
            serde_json::json!([{"entity_name": "A", "type": ["x"], "domain_relevance": [], "summary": "first", "chunk_ids": [1]}]),
        );
        let file2 = write(
            dir.path(),
            "entities_10_19.json",
            serde_json::json!([{"entity_name": "A", "type": ["y"], "domain_relevance": ["d"], "summary": "second", "chunk_ids": [1, 2]}]),
        );

        let mut merger = KnowledgeBaseMerger::new();
        merger.merge_entities(&[file1, file2]);

        let a = merger.knowledge_base().get("A").unwrap();
        assert_eq!(a.types, vec!["x", "y"]);
        assert_eq!(a.domain_relevance, vec!["d"]);
        assert_eq!(a.chunk_ids, vec![ChunkId::Index(1), ChunkId::Index(2)]);
        assert_eq!(a.summary, "first | second");
        assert_eq!(merger.report().entities_inserted, 1);
        assert_eq!(merger.report().entities_updated, 1);
    }

    #[test]
    fn test_discovery_orders_by_encoded_range() {
        let dir = TempDir::new().unwrap();
        for name in [
            "triples_100_199.json",
            "triples_0_99.json",
            "triples_0_49.json",
            "triples_x.json",
            "entities_0_1.json",
        ] {
            write(dir.path(), name, serde_json::json!([]));
        }

        let files: Vec<String> = discover_run_files(dir.path(), RecordKind::Triples)
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            files,
            vec!["triples_0_49.json", "triples_0_99.json", "triples_100_199.json"]
        );

        assert!(matches!(
            discover_run_files(&dir.path().join("missing"), RecordKind::Triples),
            Err(MergeError::InputDir { .. })
        ));
    }

    #[test]
    fn test_triples_concatenated_without_dedup() {
        let dir = TempDir::new().unwrap();
        let triple = serde_json::json!({"subject": "a", "relation": "r", "object": "b", "chunk_id": 1});
        let file1 = write(dir.path(), "triples_0_0.json", serde_json::json!([triple.clone()]));
        let file2 = write(
            dir.path(),
            "triples_1_1.json",
            serde_json::json!([triple, {"subject": "only subject"}]),
        );
        let broken = dir.path().join("triples_2_2.json");
        fs::write(&broken, "[{").unwrap();

        let mut merger = KnowledgeBaseMerger::new();
        merger.merge_triples(&[file1, file2, broken.clone()]);

        assert_eq!(merger.triples().len(), 2);
        assert_eq!(merger.triples()[0], merger.triples()[1]);
        assert_eq!(merger.report().records_dropped, 1);
        assert_eq!(merger.report().files_skipped.len(), 1);
        assert_eq!(merger.report().files_skipped[0].0, broken);
    }

    #[test]
    fn test_enrich_references_and_placeholders() {
        let mut merger = KnowledgeBaseMerger::with_knowledge_base(KnowledgeBase::from_records([
            EntityRecord::new("焊接").with_type("工艺").with_chunk_id(1u64),
        ]));
        merger.extend_triples([
            TripleRecord::new("焊接", "acts_on", "钢板", 2u64),
            TripleRecord::new("焊接", "acts_on", "钢板", 2u64),
            TripleRecord::new("钢板", "part_of", "船体", "c-3"),
        ]);
        merger.enrich();

        let kb = merger.knowledge_base();
        assert_eq!(kb.get("焊接").unwrap().references(), [ChunkId::Index(2)]);
        assert_eq!(
            kb.get("钢板").unwrap().references(),
            [ChunkId::Index(2), ChunkId::from("c-3")]
        );
        assert_eq!(kb.get("船体").unwrap().types, vec!["Unknown"]);
        assert_eq!(merger.report().placeholders_created, 2);
    }

    #[test]
    fn test_merge_entity_dir_writes_output() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "entities_0_0.json",
            serde_json::json!([{"entity_name": "龙骨", "type": "部件", "summary": "s", "chunk_ids": ["0"]}]),
        );
        let output = dir.path().join("kb").join("entities_kb.json");

        let report = merge_entity_dir(dir.path(), &output).unwrap();
        assert_eq!(report.files_read, 1);

        let (merged, dropped) = read_records::<EntityRecord>(&output).unwrap();
        assert_eq!(dropped, 0);
        assert_eq!(merged[0].chunk_ids, vec![ChunkId::Index(0)]);
    }

    #[test]
    fn test_enrich_files() {
        let dir = TempDir::new().unwrap();
        let entities = write(
            dir.path(),
            "e.json",
            serde_json::json!([{"entity_name": "龙骨", "type": ["部件"], "chunk_ids": [1]}]),
        );
        let triples = write(
            dir.path(),
            "t.json",
            serde_json::json!([{"subject": "a", "predicate": "r", "object": "b", "chunk_id": "4"}]),
        );
        let output = dir.path().join("enriched.json");

        let report = enrich_files(&entities, &triples, &output).unwrap();
        assert_eq!(report.placeholders_created, 2);

        let enriched: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(enriched[0]["entity_name"], "龙骨");
        assert_eq!(enriched[0]["relation_chunk_ids"], serde_json::json!([]));
        assert_eq!(enriched[1]["relation_chunk_ids"], serde_json::json!([4]));

        let missing = enrich_files(&dir.path().join("none.json"), &triples, &output);
        assert!(matches!(missing, Err(MergeError::Input { .. })));
    }
}
