//! Run checkpoints
//!
//! Every commit is serialized to a hidden temp file in the target directory,
//! synced, and renamed to `<kind>_<start>_<last>.json`; the previously
//! committed file is removed afterwards. A visible checkpoint is never torn
//! and at least one always exists once the first commit succeeded.

use std::fmt;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use kbforge_core::{KbError, Result};
use serde::Serialize;
use tracing::{debug, error};

/// Which record set a run-output file holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Entities,
    Triples,
}

impl RecordKind {
    /// File-name prefix
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entities => "entities",
            Self::Triples => "triples",
        }
    }

    /// File name for the range `start..=last`
    pub fn file_name(&self, start: u64, last: u64) -> String {
        format!("{}_{start}_{last}.json", self.as_str())
    }

    /// Parse `<kind>_<start>_<last>.json` back into its range bounds
    pub fn parse_file_name(&self, file_name: &str) -> Option<(u64, u64)> {
        let bounds = file_name
            .strip_prefix(self.as_str())?
            .strip_prefix('_')?
            .strip_suffix(".json")?;
        let (start, last) = bounds.split_once('_')?;
        Some((start.parse().ok()?, last.parse().ok()?))
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialize `data` as UTF-8 JSON with 4-space indentation and move it into
/// place with a rename
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, data: &T) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| KbError::ValidationError(format!("Not a file path: {}", path.display())))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let tmp = dir.join(format!(".{}.tmp", file_name.to_string_lossy()));

    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    data.serialize(&mut serializer)?;

    let mut file = File::create(&tmp).map_err(|e| KbError::io(&tmp, e))?;
    file.write_all(&buf).map_err(|e| KbError::io(&tmp, e))?;
    file.sync_all().map_err(|e| KbError::io(&tmp, e))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| KbError::io(path, e))
}

/// Keeps exactly one checkpoint file per `(kind, start)` run namespace
#[derive(Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    kind: RecordKind,
    start: u64,
    current: Option<PathBuf>,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, kind: RecordKind, start: u64) -> Self {
        Self {
            dir: dir.into(),
            kind,
            start,
            current: None,
        }
    }

    /// Path of the checkpoint whose last processed index is `last`
    pub fn path_for(&self, last: u64) -> PathBuf {
        self.dir.join(self.kind.file_name(self.start, last))
    }

    /// The most recently committed file of this run
    pub fn current(&self) -> Option<&Path> {
        self.current.as_deref()
    }

    /// Persist `data` as the state after global index `last`, then remove the
    /// previously committed file
    pub fn commit<T: Serialize + ?Sized>(&mut self, data: &T, last: u64) -> Result<PathBuf> {
        let path = self.path_for(last);
        write_json_atomic(&path, data)?;

        if let Some(previous) = self.current.replace(path.clone()) {
            if previous != path {
                match fs::remove_file(&previous) {
                    Ok(()) => debug!(path = %previous.display(), "Removed superseded checkpoint"),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => error!(
                        path = %previous.display(),
                        error = %e,
                        "Failed to remove superseded checkpoint"
                    ),
                }
            }
        }

        Ok(path)
    }

    /// Terminal commit named after the full range `start..=range_last`
    pub fn finalize<T: Serialize + ?Sized>(&mut self, data: &T, range_last: u64) -> Result<PathBuf> {
        let path = self.commit(data, range_last)?;
        debug!(kind = %self.kind, path = %path.display(), "Finalized run output");
        Ok(path)
    }

    /// Largest committed index for the run namespace `(kind, start)` in `dir`
    pub fn latest(dir: &Path, kind: RecordKind, start: u64) -> Result<Option<u64>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(KbError::io(dir, e)),
        };

        let mut latest = None;
        for entry in entries {
            let entry = entry.map_err(|e| KbError::io(dir, e))?;
            let name = entry.file_name();
            if let Some((run_start, last)) = kind.parse_file_name(&name.to_string_lossy()) {
                if run_start == start && latest.map_or(true, |current| last > current) {
                    latest = Some(last);
                }
            }
        }

        Ok(latest)
    }

    /// Next index to process when resuming a run that began at `start`.
    /// Each resumed run commits under its own start index, so the chain
    /// `start -> last + 1 -> ...` is followed until a namespace is empty.
    pub fn resume_point(dir: &Path, kind: RecordKind, start: u64) -> Result<u64> {
        let mut next = start;
        while let Some(last) = Self::latest(dir, kind, next)? {
            if last < next {
                break;
            }
            next = last + 1;
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbforge_core::TripleRecord;
    use tempfile::TempDir;

    fn json_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_file_name_round_trip() {
        assert_eq!(RecordKind::Entities.file_name(10, 42), "entities_10_42.json");
        assert_eq!(
            RecordKind::Triples.parse_file_name("triples_0_199.json"),
            Some((0, 199))
        );
        assert_eq!(RecordKind::Triples.parse_file_name("entities_0_1.json"), None);
        assert_eq!(RecordKind::Triples.parse_file_name("triples_0.json"), None);
        assert_eq!(RecordKind::Triples.parse_file_name(".triples_0_1.json.tmp"), None);
    }

    #[test]
    fn test_single_file_after_each_commit() {
        let dir = TempDir::new().unwrap();
        let mut manager = CheckpointManager::new(dir.path(), RecordKind::Triples, 5);

        let mut triples = Vec::new();
        for index in 5..9u64 {
            triples.push(TripleRecord::new("a", "r", "b", index));
            manager.commit(&triples, index).unwrap();
            assert_eq!(
                json_files(dir.path()),
                vec![format!("triples_5_{index}.json")]
            );
        }

        let written: Vec<TripleRecord> =
            serde_json::from_str(&fs::read_to_string(manager.current().unwrap()).unwrap()).unwrap();
        assert_eq!(written, triples);
    }

    #[test]
    fn test_finalize_replaces_last_commit() {
        let dir = TempDir::new().unwrap();
        let mut manager = CheckpointManager::new(dir.path(), RecordKind::Entities, 0);

        manager.commit(&["x"], 1).unwrap();
        let path = manager.finalize(&["x"], 3).unwrap();

        assert_eq!(path, dir.path().join("entities_0_3.json"));
        assert_eq!(json_files(dir.path()), vec!["entities_0_3.json"]);

        // Finalizing onto the last committed index keeps the single file
        let mut manager = CheckpointManager::new(dir.path(), RecordKind::Triples, 0);
        manager.commit(&["y"], 3).unwrap();
        manager.finalize(&["y"], 3).unwrap();
        assert_eq!(
            json_files(dir.path()),
            vec!["entities_0_3.json", "triples_0_3.json"]
        );
    }

    #[test]
    fn test_output_is_pretty_utf8() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.json");
        write_json_atomic(&path, &serde_json::json!({"name": "龙骨"})).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "{\n    \"name\": \"龙骨\"\n}");
    }

    #[test]
    fn test_latest_picks_largest_index_for_run() {
        let dir = TempDir::new().unwrap();
        for name in [
            "triples_0_7.json",
            "triples_0_12.json",
            "triples_20_30.json",
            "entities_0_99.json",
            "notes.txt",
        ] {
            fs::write(dir.path().join(name), "[]").unwrap();
        }

        assert_eq!(
            CheckpointManager::latest(dir.path(), RecordKind::Triples, 0).unwrap(),
            Some(12)
        );
        assert_eq!(
            CheckpointManager::latest(dir.path(), RecordKind::Triples, 1).unwrap(),
            None
        );
        assert_eq!(
            CheckpointManager::latest(&dir.path().join("missing"), RecordKind::Triples, 0).unwrap(),
            None
        );
    }

    #[test]
    fn test_resume_point_follows_resumed_runs() {
        let dir = TempDir::new().unwrap();
        for name in ["triples_0_4.json", "triples_5_7.json", "triples_20_30.json"] {
            fs::write(dir.path().join(name), "[]").unwrap();
        }

        let resume = |start| CheckpointManager::resume_point(dir.path(), RecordKind::Triples, start).unwrap();
        assert_eq!(resume(0), 8);
        assert_eq!(resume(5), 8);
        assert_eq!(resume(8), 8);
        assert_eq!(resume(20), 31);
    }
}
