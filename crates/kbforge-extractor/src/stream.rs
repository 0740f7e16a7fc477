//! Chunk stream and entity dictionary input
//!
//! The chunk stream is newline-delimited JSON, one `{chunk_content, source,
//! metadata}` record per line. Blank lines are not records. The global index
//! of a chunk is its position among records, starting at zero.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use kbforge_core::{ChunkRecord, EntityRecord};
use tracing::debug;

use crate::ExtractError;

/// Number of records in a chunk stream
pub fn count_chunks(path: &Path) -> Result<usize, ExtractError> {
    let reader = open_stream(path)?;
    let mut count = 0;
    for line in reader.lines() {
        let line = line.map_err(|source| ExtractError::ChunkRead {
            path: path.to_path_buf(),
            source,
        })?;
        if !line.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

/// Records with global index in `start..end` (`end` unbounded when `None`),
/// paired with that index, in stream order.
///
/// Records outside the range are not decoded.
pub fn read_chunk_range(
    path: &Path,
    start: u64,
    end: Option<u64>,
) -> Result<Vec<(u64, ChunkRecord)>, ExtractError> {
    let reader = open_stream(path)?;
    let mut chunks = Vec::new();
    let mut index = 0u64;

    for (line_no, line) in reader.lines().enumerate() {
        if end.is_some_and(|end| index >= end) {
            break;
        }

        let line = line.map_err(|source| ExtractError::ChunkRead {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }

        if index >= start {
            let chunk: ChunkRecord =
                serde_json::from_str(&line).map_err(|e| ExtractError::MalformedChunk {
                    path: path.to_path_buf(),
                    line: line_no + 1,
                    reason: e.to_string(),
                })?;
            chunks.push((index, chunk));
        }
        index += 1;
    }

    debug!(
        path = %path.display(),
        start,
        end = ?end,
        loaded = chunks.len(),
        "Loaded chunk range"
    );
    Ok(chunks)
}

fn open_stream(path: &Path) -> Result<BufReader<File>, ExtractError> {
    if !path.is_file() {
        return Err(ExtractError::MissingChunkFile(path.to_path_buf()));
    }
    let file = File::open(path).map_err(|source| ExtractError::ChunkRead {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(BufReader::new(file))
}

/// Load the entity dictionary: a JSON array of entity records
pub fn load_entity_dictionary(path: &Path) -> Result<Vec<EntityRecord>, ExtractError> {
    if !path.is_file() {
        return Err(ExtractError::MissingEntityDictionary(path.to_path_buf()));
    }

    let invalid = |reason: String| ExtractError::InvalidEntityDictionary {
        path: path.to_path_buf(),
        reason,
    };

    let text = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
    let entities: Vec<EntityRecord> =
        serde_json::from_str(&text).map_err(|e| invalid(e.to_string()))?;

    debug!(path = %path.display(), entities = entities.len(), "Loaded entity dictionary");
    Ok(entities)
}
