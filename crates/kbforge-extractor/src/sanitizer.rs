//! Generation output sanitizer
//!
//! Turns one raw generation payload into validated entity and triple
//! records:
//! 1. drop `<think>` reasoning spans and code-fence markers
//! 2. decode as JSON, falling back to the outermost `{...}` and `[...]`
//!    spans, earliest opener first
//! 3. on failure apply the repair rules once and decode again, whole text
//!    first and then its spans
//! 4. on a second failure quarantine the raw payload and yield nothing
//!
//! Elements failing validation are dropped one by one; they never abort
//! their siblings.

use std::fs;
use std::path::{Path, PathBuf};

use kbforge_core::{ChunkId, EntityRecord, KbError, Result, TripleRecord};
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

/// Keys an entity element must carry
const ENTITY_FIELDS: [&str; 4] = ["entity_name", "type", "domain_relevance", "summary"];

/// Records accepted from one chunk's payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkExtraction {
    pub entities: Vec<EntityRecord>,
    pub triples: Vec<TripleRecord>,
    /// Elements dropped by validation
    pub dropped: usize,
}

impl ChunkExtraction {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.triples.is_empty()
    }
}

/// How a payload was decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePath {
    /// Parsed as-is after cleaning
    Direct,
    /// Parsed after cutting the outermost object or array out of prose
    Salvaged,
    /// Parsed after the repair rules
    Repaired,
}

/// Result of sanitizing one payload
#[derive(Debug, Clone, PartialEq)]
pub enum SanitizeOutcome {
    Accepted {
        extraction: ChunkExtraction,
        decoded: DecodePath,
    },
    /// Unusable payload; `path` is `None` when it could not be persisted
    Quarantined {
        path: Option<PathBuf>,
        reason: String,
    },
}

impl SanitizeOutcome {
    /// Accepted records, empty for a quarantined payload
    pub fn into_extraction(self) -> ChunkExtraction {
        match self {
            Self::Accepted { extraction, .. } => extraction,
            Self::Quarantined { .. } => ChunkExtraction::default(),
        }
    }
}

/// Cleans, decodes, repairs and validates generation payloads
#[derive(Debug, Clone)]
pub struct OutputSanitizer {
    reasoning: Regex,
    fence: Regex,
    quarantine_dir: Option<PathBuf>,
}

impl OutputSanitizer {
    /// Create a sanitizer; quarantined payloads are written under `quarantine_dir`
    pub fn new(quarantine_dir: Option<PathBuf>) -> Result<Self> {
        let reasoning = Regex::new(r"(?s)<think>.*?</think>")
            .map_err(|e| KbError::ConfigError(format!("Invalid reasoning pattern: {e}")))?;
        let fence = Regex::new(r"```(?:json|JSON)?")
            .map_err(|e| KbError::ConfigError(format!("Invalid fence pattern: {e}")))?;

        Ok(Self {
            reasoning,
            fence,
            quarantine_dir,
        })
    }

    pub fn quarantine_dir(&self) -> Option<&Path> {
        self.quarantine_dir.as_deref()
    }

    /// Sanitize the payload generated for `chunk_id`
    pub fn sanitize(&self, raw: &str, chunk_id: &ChunkId) -> SanitizeOutcome {
        let cleaned = self.clean(raw);

        let (value, decoded) = match self.decode(&cleaned, chunk_id) {
            Ok(decoded) => decoded,
            Err(reason) => return self.quarantine(raw, chunk_id, reason),
        };

        match resolve(value, chunk_id) {
            Some(extraction) => {
                if extraction.dropped > 0 {
                    debug!(
                        chunk_id = %chunk_id,
                        dropped = extraction.dropped,
                        "Dropped invalid elements"
                    );
                }
                SanitizeOutcome::Accepted {
                    extraction,
                    decoded,
                }
            }
            None => self.quarantine(
                raw,
                chunk_id,
                "top-level value carries no entities or triples list".to_string(),
            ),
        }
    }

    /// Remove reasoning spans and code fences
    pub fn clean(&self, raw: &str) -> String {
        let without_reasoning = self.reasoning.replace_all(raw, "");
        // An unmatched closing tag means the opening one was cut off
        let tail = match without_reasoning.rfind("</think>") {
            Some(at) => &without_reasoning[at + "</think>".len()..],
            None => &without_reasoning[..],
        };
        self.fence.replace_all(tail, "").trim().to_string()
    }

    fn decode(
        &self,
        cleaned: &str,
        chunk_id: &ChunkId,
    ) -> std::result::Result<(Value, DecodePath), String> {
        if cleaned.is_empty() {
            return Err("payload is empty after cleaning".to_string());
        }

        if let Ok(value) = serde_json::from_str(cleaned) {
            return Ok((value, DecodePath::Direct));
        }

        if let Some(value) = decode_salvaged(cleaned) {
            return Ok((value, DecodePath::Salvaged));
        }

        warn!(chunk_id = %chunk_id, "First decode failed, applying repairs");
        let repaired = repair_json_text(cleaned);
        match serde_json::from_str(&repaired) {
            Ok(value) => Ok((value, DecodePath::Repaired)),
            Err(e) => decode_salvaged(&repaired)
                .map(|value| (value, DecodePath::Repaired))
                .ok_or_else(|| format!("decode failed after repair: {e}")),
        }
    }

    fn quarantine(&self, raw: &str, chunk_id: &ChunkId, reason: String) -> SanitizeOutcome {
        let path = self
            .quarantine_dir
            .as_deref()
            .and_then(|dir| match write_quarantine(dir, raw, chunk_id) {
                Ok(path) => Some(path),
                Err(e) => {
                    error!(chunk_id = %chunk_id, error = %e, "Failed to write quarantine file");
                    None
                }
            });

        error!(
            chunk_id = %chunk_id,
            reason = %reason,
            path = ?path,
            "Quarantined unusable payload"
        );

        SanitizeOutcome::Quarantined { path, reason }
    }
}

fn write_quarantine(dir: &Path, raw: &str, chunk_id: &ChunkId) -> Result<PathBuf> {
    fs::create_dir_all(dir).map_err(|e| KbError::io(dir, e))?;
    let path = dir.join(quarantine_file_name(chunk_id));
    fs::write(&path, raw).map_err(|e| KbError::io(&path, e))?;
    Ok(path)
}

/// `chunk_<id>_error.json`, with path-hostile characters replaced
pub fn quarantine_file_name(chunk_id: &ChunkId) -> String {
    let id: String = chunk_id
        .to_string()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("chunk_{id}_error.json")
}

/// First salvage span that decodes, if any
fn decode_salvaged(text: &str) -> Option<Value> {
    salvage_spans(text)
        .into_iter()
        .find_map(|span| serde_json::from_str(span).ok())
}

/// Outermost object and array spans strictly inside `text`, the one whose
/// opener comes first leading
fn salvage_spans(text: &str) -> Vec<&str> {
    let mut spans: Vec<(usize, &str)> = [('{', '}'), ('[', ']')]
        .into_iter()
        .filter_map(|(open, close)| {
            let start = text.find(open)?;
            let end = text.rfind(close)?;
            (end > start).then(|| (start, &text[start..=end]))
        })
        .filter(|(_, span)| span.len() < text.len())
        .collect();
    spans.sort_by_key(|(start, _)| *start);
    spans.into_iter().map(|(_, span)| span).collect()
}

/// Apply the repair rules in one escape-aware pass:
/// - `\xHH` becomes the character it names (JSON-escaped where needed)
/// - a backslash before a character that cannot follow one is dropped
/// - `\u` with fewer than four hex digits becomes a literal `\\u`
///
/// Valid escapes are copied through untouched, so repairing valid JSON text
/// is the identity and repairing twice equals repairing once.
pub fn repair_json_text(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c != '\\' {
            out.push(c);
            i += 1;
            continue;
        }

        let Some(&next) = chars.get(i + 1) else {
            out.push(c);
            break;
        };

        match next {
            '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' => {
                out.push('\\');
                out.push(next);
                i += 2;
            }
            'u' => {
                let digits = hex_run(&chars[i + 2..], 4);
                if digits == 4 {
                    out.extend(&chars[i..i + 6]);
                    i += 6;
                } else {
                    out.push_str("\\\\u");
                    i += 2;
                }
            }
            'x' if hex_run(&chars[i + 2..], 2) == 2 => {
                let hex: String = chars[i + 2..i + 4].iter().collect();
                match u8::from_str_radix(&hex, 16) {
                    Ok(byte) => push_escaped(&mut out, char::from(byte)),
                    Err(_) => out.push_str(&hex),
                }
                i += 4;
            }
            _ => {
                // Drop the backslash; the character is copied next round
                i += 1;
            }
        }
    }

    out
}

fn hex_run(chars: &[char], max: usize) -> usize {
    chars
        .iter()
        .take(max)
        .take_while(|c| c.is_ascii_hexdigit())
        .count()
}

fn push_escaped(out: &mut String, c: char) {
    match c {
        '"' => out.push_str("\\\""),
        '\\' => out.push_str("\\\\"),
        c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
        c => out.push(c),
    }
}

// ============================================================================
// Shape resolution and validation
// ============================================================================

fn resolve(value: Value, chunk_id: &ChunkId) -> Option<ChunkExtraction> {
    let mut extraction = ChunkExtraction::default();

    match value {
        Value::Object(mut map) => {
            let entities = take_list(&mut map, "entities");
            let triples = take_list(&mut map, "triples");
            if entities.is_none() && triples.is_none() {
                return None;
            }

            for item in entities.unwrap_or_default() {
                extraction.push_entity(item, chunk_id);
            }
            for item in triples.unwrap_or_default() {
                extraction.push_triple(item, chunk_id);
            }
        }
        Value::Array(items) => {
            for item in items {
                if item.get("subject").is_some() {
                    extraction.push_triple(item, chunk_id);
                } else if item.get("entity_name").is_some() {
                    extraction.push_entity(item, chunk_id);
                } else {
                    extraction.dropped += 1;
                }
            }
        }
        _ => return None,
    }

    Some(extraction)
}

fn take_list(map: &mut Map<String, Value>, key: &str) -> Option<Vec<Value>> {
    match map.remove(key) {
        Some(Value::Array(items)) => Some(items),
        _ => None,
    }
}

impl ChunkExtraction {
    fn push_entity(&mut self, item: Value, chunk_id: &ChunkId) {
        match validate_entity(item, chunk_id) {
            Some(entity) => self.entities.push(entity),
            None => self.dropped += 1,
        }
    }

    fn push_triple(&mut self, item: Value, chunk_id: &ChunkId) {
        match validate_triple(item, chunk_id) {
            Some(triple) => self.triples.push(triple),
            None => self.dropped += 1,
        }
    }
}

fn validate_entity(item: Value, chunk_id: &ChunkId) -> Option<EntityRecord> {
    let map = item.as_object()?;
    if !ENTITY_FIELDS.iter().all(|field| map.contains_key(*field)) {
        return None;
    }

    let mut entity: EntityRecord = serde_json::from_value(item).ok()?;
    entity.name = entity.name.trim().to_string();
    if entity.name.is_empty() || entity.types.is_empty() {
        return None;
    }

    entity.chunk_ids = vec![chunk_id.clone()];
    entity.relation_chunk_ids = None;
    Some(entity)
}

fn validate_triple(item: Value, chunk_id: &ChunkId) -> Option<TripleRecord> {
    let Value::Object(mut map) = item else {
        return None;
    };
    map.insert("chunk_id".to_string(), serde_json::to_value(chunk_id).ok()?);

    let mut triple: TripleRecord = serde_json::from_value(Value::Object(map)).ok()?;
    triple.subject = triple.subject.trim().to_string();
    triple.relation = triple.relation.trim().to_string();
    triple.object = triple.object.trim().to_string();

    if triple.subject.is_empty() || triple.relation.is_empty() || triple.object.is_empty() {
        return None;
    }
    Some(triple)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn sanitizer() -> OutputSanitizer {
        OutputSanitizer::new(None).unwrap()
    }

    fn accepted(outcome: SanitizeOutcome) -> (ChunkExtraction, DecodePath) {
        match outcome {
            SanitizeOutcome::Accepted {
                extraction,
                decoded,
            } => (extraction, decoded),
            other => panic!("expected accepted payload, got {other:?}"),
        }
    }

    #[test]
    fn test_clean_strips_reasoning_and_fences() {
        let raw = "<think>\n先分析 {\"not\": json}\n</think>\n```json\n{\"triples\": []}\n```";
        assert_eq!(sanitizer().clean(raw), r#"{"triples": []}"#);

        let cut = "reasoning without an opening tag</think>{\"triples\": []}";
        assert_eq!(sanitizer().clean(cut), r#"{"triples": []}"#);
    }

    #[test]
    fn test_direct_payload_with_stamped_chunk_id() {
        let raw = r#"{"triples": [
            {"subject": "焊接", "relation": "acts_on", "object": "钢板", "chunk_id": 99},
            {"subject": "龙骨", "predicate": "part_of", "object": "船体"}
        ]}"#;

        let (extraction, decoded) = accepted(sanitizer().sanitize(raw, &ChunkId::Index(4)));
        assert_eq!(decoded, DecodePath::Direct);
        assert_eq!(
            extraction.triples,
            vec![
                TripleRecord::new("焊接", "acts_on", "钢板", 4u64),
                TripleRecord::new("龙骨", "part_of", "船体", 4u64),
            ]
        );
    }

    #[test]
    fn test_invalid_elements_dropped_individually() {
        let raw = r#"{
            "entities": [
                {"entity_name": "龙骨", "type": "部件", "domain_relevance": "domain_specific", "summary": "纵向构件"},
                {"entity_name": "缺字段", "type": ["部件"]},
                {"entity_name": "", "type": ["部件"], "domain_relevance": [], "summary": ""},
                "not an object"
            ],
            "triples": [
                {"subject": "龙骨", "relation": "part_of"},
                {"subject": "龙骨", "relation": "part_of", "object": "船体"},
                {"subject": 3, "relation": "r", "object": "o"}
            ]
        }"#;

        let (extraction, _) = accepted(sanitizer().sanitize(raw, &ChunkId::from("c-1")));
        assert_eq!(extraction.entities.len(), 1);
        assert_eq!(extraction.entities[0].types, vec!["部件".to_string()]);
        assert_eq!(extraction.entities[0].chunk_ids, vec![ChunkId::from("c-1")]);
        assert_eq!(extraction.triples.len(), 1);
        assert_eq!(extraction.dropped, 5);
    }

    #[test]
    fn test_salvage_from_prose() {
        let raw = "Here is the result:\n{\"triples\": [{\"subject\": \"a\", \"relation\": \"r\", \"object\": \"b\"}]}\nHope this helps.";
        let (extraction, decoded) = accepted(sanitizer().sanitize(raw, &ChunkId::Index(0)));
        assert_eq!(decoded, DecodePath::Salvaged);
        assert_eq!(extraction.triples.len(), 1);
    }

    #[test]
    fn test_salvage_skips_bracketed_preamble() {
        let raw = "Result [JSON]:\n{\"triples\": [{\"subject\": \"a\", \"relation\": \"r\", \"object\": \"b\"}]}";
        let (extraction, decoded) = accepted(sanitizer().sanitize(raw, &ChunkId::Index(0)));
        assert_eq!(decoded, DecodePath::Salvaged);
        assert_eq!(extraction.triples, vec![TripleRecord::new("a", "r", "b", 0u64)]);
    }

    #[test]
    fn test_repair_after_bracketed_preamble() {
        let raw = r#"Output [v2]: {"triples": [{"subject": "\x41", "relation": "r", "object": "b"}]}"#;
        let (extraction, decoded) = accepted(sanitizer().sanitize(raw, &ChunkId::Index(3)));
        assert_eq!(decoded, DecodePath::Repaired);
        assert_eq!(extraction.triples[0].subject, "A");
    }

    #[test]
    fn test_top_level_array_resolved_per_element() {
        let raw = r#"[
            {"subject": "a", "relation": "r", "object": "b"},
            {"entity_name": "a", "type": ["t"], "domain_relevance": ["d"], "summary": "s"},
            {"other": 1}
        ]"#;
        let (extraction, _) = accepted(sanitizer().sanitize(raw, &ChunkId::Index(2)));
        assert_eq!(extraction.triples.len(), 1);
        assert_eq!(extraction.entities.len(), 1);
        assert_eq!(extraction.dropped, 1);
    }

    #[test]
    fn test_repair_rules() {
        assert_eq!(repair_json_text(r"caf\xe9"), "café");
        assert_eq!(repair_json_text(r"\x22"), r#"\""#);
        assert_eq!(repair_json_text(r"C:\path\to"), r"C:path\to");
        assert_eq!(repair_json_text(r"\u12g"), r"\\u12g");
        assert_eq!(repair_json_text(r"\u4e2d"), r"\u4e2d");
        assert_eq!(repair_json_text(r"\\x41"), r"\\x41");
    }

    #[test]
    fn test_repaired_payload_decodes() {
        let raw = r#"{"triples": [{"subject": "\x41\q", "relation": "r\u12", "object": "b"}]}"#;
        let (extraction, decoded) = accepted(sanitizer().sanitize(raw, &ChunkId::Index(1)));
        assert_eq!(decoded, DecodePath::Repaired);
        assert_eq!(extraction.triples[0].subject, "Aq");
        assert_eq!(extraction.triples[0].relation, r"r\u12");
    }

    #[test]
    fn test_unrepairable_payload_quarantined_raw() {
        let dir = TempDir::new().unwrap();
        let sanitizer = OutputSanitizer::new(Some(dir.path().join("debug"))).unwrap();
        let raw = "<think>x</think>{\"triples\": [ {\"subject\": ";

        let outcome = sanitizer.sanitize(raw, &ChunkId::from("doc/7"));
        let SanitizeOutcome::Quarantined { path, .. } = outcome.clone() else {
            panic!("expected quarantine");
        };
        let path = path.unwrap();
        assert_eq!(path.file_name().unwrap(), "chunk_doc_7_error.json");
        assert_eq!(fs::read_to_string(&path).unwrap(), raw);
        assert!(outcome.into_extraction().is_empty());
    }

    #[test]
    fn test_wrong_shape_quarantined() {
        for raw in [r#"{"answer": 42}"#, "42", "", "```json\n```"] {
            assert!(matches!(
                sanitizer().sanitize(raw, &ChunkId::Index(0)),
                SanitizeOutcome::Quarantined { path: None, .. }
            ));
        }
    }

    #[test]
    fn test_empty_lists_are_accepted() {
        let (extraction, _) = accepted(sanitizer().sanitize(r#"{"triples": []}"#, &ChunkId::Index(0)));
        assert!(extraction.is_empty());
        assert_eq!(extraction.dropped, 0);
    }

    proptest! {
        #[test]
        fn prop_repair_is_idempotent(text in r#"[a-f0-9ux\\"{} ]{0,32}"#) {
            let once = repair_json_text(&text);
            prop_assert_eq!(repair_json_text(&once), once);
        }

        #[test]
        fn prop_repair_keeps_valid_json(subject in "\\PC{0,16}", object in "\\PC{0,16}") {
            let valid = serde_json::json!({
                "triples": [{"subject": subject, "relation": "r", "object": object}]
            })
            .to_string();

            let repaired = repair_json_text(&valid);
            prop_assert_eq!(&repaired, &valid);

            let twice: Value = serde_json::from_str(&repair_json_text(&repaired)).unwrap();
            let original: Value = serde_json::from_str(&valid).unwrap();
            prop_assert_eq!(twice, original);
        }
    }
}
