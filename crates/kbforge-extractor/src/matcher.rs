//! Multi-pattern entity matcher
//!
//! An Aho-Corasick automaton over the names of known entities. Nodes live
//! in a single arena and refer to each other by index, so failure and
//! output links need no shared ownership. The automaton is built once from
//! a snapshot of entities and never mutated afterwards; adding entities
//! means building a new matcher.

use std::collections::{BTreeMap, HashMap, VecDeque};

use kbforge_core::EntityRecord;
use serde::Serialize;
use tracing::debug;

/// Rendered in place of a context list when nothing matched
pub const NO_ENTITY_FOUND: &str = "No related entities found";

/// Type tags shown per entity in a context list
const CONTEXT_MAX_TYPES: usize = 3;

/// Summary characters shown per entity in a context list
const CONTEXT_SUMMARY_CHARS: usize = 100;

type NodeId = usize;

const ROOT: NodeId = 0;

#[derive(Debug, Default)]
struct Node {
    children: HashMap<char, NodeId>,
    /// Longest proper suffix of this node's path that is also a trie path
    fail: NodeId,
    /// Entity whose name ends exactly at this node
    pattern: Option<usize>,
    /// Nearest node on the fail chain that ends a pattern
    output: Option<NodeId>,
}

/// One occurrence of an entity name in a text (byte offsets)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternMatch {
    /// Index into [`MultiPatternMatcher::entities`]
    pub entity: usize,
    pub start: usize,
    pub end: usize,
}

/// Summary of the entity snapshot behind a matcher
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MatcherStats {
    pub total_entities: usize,
    pub type_distribution: BTreeMap<String, usize>,
    pub total_chunk_references: usize,
}

/// Immutable multi-pattern search structure over entity names
#[derive(Debug)]
pub struct MultiPatternMatcher {
    nodes: Vec<Node>,
    entities: Vec<EntityRecord>,
}

impl MultiPatternMatcher {
    /// Build the automaton in time linear in the total name length.
    ///
    /// A repeated name keeps the last record seen; empty names are ignored.
    pub fn build(records: Vec<EntityRecord>) -> Self {
        let mut entities: Vec<EntityRecord> = Vec::with_capacity(records.len());
        let mut slots: HashMap<String, usize> = HashMap::with_capacity(records.len());
        let mut ignored = 0usize;

        for record in records {
            if record.name.is_empty() {
                ignored += 1;
                continue;
            }
            match slots.get(&record.name) {
                Some(&slot) => entities[slot] = record,
                None => {
                    slots.insert(record.name.clone(), entities.len());
                    entities.push(record);
                }
            }
        }

        let mut matcher = Self {
            nodes: vec![Node::default()],
            entities,
        };

        for index in 0..matcher.entities.len() {
            matcher.insert(index);
        }
        matcher.link();

        debug!(
            entities = matcher.entities.len(),
            nodes = matcher.nodes.len(),
            ignored,
            "Built entity automaton"
        );

        matcher
    }

    fn insert(&mut self, index: usize) {
        let mut node = ROOT;
        let name: Vec<char> = self.entities[index].name.chars().collect();

        for c in name {
            node = match self.nodes[node].children.get(&c) {
                Some(&next) => next,
                None => {
                    let next = self.nodes.len();
                    self.nodes.push(Node::default());
                    self.nodes[node].children.insert(c, next);
                    next
                }
            };
        }

        self.nodes[node].pattern = Some(index);
    }

    /// Compute failure and output links breadth-first
    fn link(&mut self) {
        let mut queue: VecDeque<NodeId> = self.nodes[ROOT].children.values().copied().collect();

        while let Some(node) = queue.pop_front() {
            let children: Vec<(char, NodeId)> = self.nodes[node]
                .children
                .iter()
                .map(|(&c, &child)| (c, child))
                .collect();

            for (c, child) in children {
                let mut fallback = self.nodes[node].fail;
                let fail = loop {
                    if let Some(&target) = self.nodes[fallback].children.get(&c) {
                        break target;
                    }
                    if fallback == ROOT {
                        break ROOT;
                    }
                    fallback = self.nodes[fallback].fail;
                };

                self.nodes[child].fail = fail;
                self.nodes[child].output = if self.nodes[fail].pattern.is_some() {
                    Some(fail)
                } else {
                    self.nodes[fail].output
                };
                queue.push_back(child);
            }
        }
    }

    /// Every occurrence of every entity name, in scan order.
    ///
    /// Occurrences are ordered by end offset; occurrences ending at the same
    /// offset come shortest first.
    pub fn find_all(&self, text: &str) -> Vec<PatternMatch> {
        let mut found = Vec::new();
        let mut state = ROOT;
        let mut at_end: Vec<usize> = Vec::new();

        for (offset, c) in text.char_indices() {
            state = self.step(state, c);
            let end = offset + c.len_utf8();

            // Longest first along the output chain, reversed below
            at_end.clear();
            let mut cursor = if self.nodes[state].pattern.is_some() {
                Some(state)
            } else {
                self.nodes[state].output
            };
            while let Some(node) = cursor {
                if let Some(entity) = self.nodes[node].pattern {
                    at_end.push(entity);
                }
                cursor = self.nodes[node].output;
            }

            found.extend(at_end.iter().rev().map(|&entity| PatternMatch {
                entity,
                start: end - self.entities[entity].name.len(),
                end,
            }));
        }

        found
    }

    fn step(&self, mut state: NodeId, c: char) -> NodeId {
        loop {
            if let Some(&next) = self.nodes[state].children.get(&c) {
                return next;
            }
            if state == ROOT {
                return ROOT;
            }
            state = self.nodes[state].fail;
        }
    }

    /// Entities whose exact name occurs in `text`, each at most once, ordered
    /// by the end of their first occurrence.
    pub fn match_entities(&self, text: &str) -> Vec<&EntityRecord> {
        let mut seen = vec![false; self.entities.len()];
        let mut matched = Vec::new();

        for hit in self.find_all(text) {
            if !seen[hit.entity] {
                seen[hit.entity] = true;
                matched.push(&self.entities[hit.entity]);
            }
        }

        matched
    }

    /// Render up to `max_entities` matches as a bullet list for a prompt
    pub fn match_entities_with_context(&self, text: &str, max_entities: usize) -> String {
        let matched = self.match_entities(text);
        render_context(matched.into_iter().take(max_entities))
    }

    /// Entity count, type histogram and provenance references of the snapshot
    pub fn stats(&self) -> MatcherStats {
        let mut stats = MatcherStats {
            total_entities: self.entities.len(),
            ..Default::default()
        };

        for entity in &self.entities {
            for entity_type in &entity.types {
                *stats
                    .type_distribution
                    .entry(entity_type.clone())
                    .or_insert(0) += 1;
            }
            stats.total_chunk_references += entity.chunk_ids.len();
        }

        stats
    }

    /// The deduplicated entity snapshot
    pub fn entities(&self) -> &[EntityRecord] {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Bullet list of `name (types): summary`, or [`NO_ENTITY_FOUND`]
pub fn render_context<'a>(entities: impl IntoIterator<Item = &'a EntityRecord>) -> String {
    let lines: Vec<String> = entities
        .into_iter()
        .map(|entity| {
            let types: Vec<&str> = entity
                .types
                .iter()
                .take(CONTEXT_MAX_TYPES)
                .map(String::as_str)
                .collect();
            format!(
                "- {} ({}): {}",
                entity.name,
                types.join(", "),
                truncate_chars(&entity.summary, CONTEXT_SUMMARY_CHARS)
            )
        })
        .collect();

    if lines.is_empty() {
        NO_ENTITY_FOUND.to_string()
    } else {
        lines.join("\n")
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
