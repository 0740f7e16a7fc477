//! Name-keyed entity store
//!
//! The only writer of accumulated entities, both inside an extraction run
//! and when merging run outputs. Records keep their first-insertion order.

use std::collections::HashMap;

use kbforge_core::{push_unique, ChunkId, EntityRecord};

/// Joins distinct summaries of one entity
pub const SUMMARY_SEPARATOR: &str = " | ";

/// Type tag of an entity synthesized from a triple
pub const PLACEHOLDER_TYPE: &str = "Unknown";

/// Domain-relevance tag of an entity synthesized from a triple
pub const PLACEHOLDER_RELEVANCE: &str = "unknown";

/// Summary of an entity synthesized from a triple
pub const PLACEHOLDER_SUMMARY: &str = "summary pending";

/// What a union did to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnionEffect {
    Inserted,
    Updated,
    Unchanged,
}

/// Entities keyed by exact name
#[derive(Debug, Clone, Default)]
pub struct KnowledgeBase {
    entities: Vec<EntityRecord>,
    index: HashMap<String, usize>,
}

impl KnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Union every record in order
    pub fn from_records(records: impl IntoIterator<Item = EntityRecord>) -> Self {
        let mut kb = Self::new();
        for record in records {
            kb.union(record);
        }
        kb
    }

    /// Insert `entity` if its name is new, otherwise fold it into the stored
    /// record: tag lists and provenance ids gain only unseen values, and a
    /// summary not already present is appended after the existing one.
    pub fn union(&mut self, entity: EntityRecord) -> UnionEffect {
        let Some(&slot) = self.index.get(&entity.name) else {
            self.insert(entity);
            return UnionEffect::Inserted;
        };

        let existing = &mut self.entities[slot];
        let mut changed = false;

        for entity_type in entity.types {
            changed |= push_unique(&mut existing.types, entity_type);
        }
        for relevance in entity.domain_relevance {
            changed |= push_unique(&mut existing.domain_relevance, relevance);
        }
        for chunk_id in entity.chunk_ids {
            changed |= push_unique(&mut existing.chunk_ids, chunk_id);
        }
        if let Some(references) = entity.relation_chunk_ids {
            let existing_references = existing.references_mut();
            for chunk_id in references {
                changed |= push_unique(existing_references, chunk_id);
            }
        }
        changed |= append_summary(&mut existing.summary, entity.summary.trim());

        if changed {
            UnionEffect::Updated
        } else {
            UnionEffect::Unchanged
        }
    }

    fn insert(&mut self, mut entity: EntityRecord) {
        dedup_in_place(&mut entity.types);
        dedup_in_place(&mut entity.domain_relevance);
        dedup_in_place(&mut entity.chunk_ids);
        if let Some(references) = entity.relation_chunk_ids.as_mut() {
            dedup_in_place(references);
        }

        self.index.insert(entity.name.clone(), self.entities.len());
        self.entities.push(entity);
    }

    /// Record that `name` is referenced by a triple from `chunk_id`.
    ///
    /// An unknown name gets a placeholder entity with no provenance.
    pub fn add_reference(&mut self, name: &str, chunk_id: &ChunkId) -> UnionEffect {
        match self.index.get(name) {
            Some(&slot) => {
                if push_unique(self.entities[slot].references_mut(), chunk_id.clone()) {
                    UnionEffect::Updated
                } else {
                    UnionEffect::Unchanged
                }
            }
            None => {
                let mut placeholder = EntityRecord::new(name)
                    .with_type(PLACEHOLDER_TYPE)
                    .with_domain_relevance(PLACEHOLDER_RELEVANCE)
                    .with_summary(PLACEHOLDER_SUMMARY);
                placeholder.references_mut().push(chunk_id.clone());
                self.insert(placeholder);
                UnionEffect::Inserted
            }
        }
    }

    /// Give every entity a reference set, so enriched output carries one
    /// even for entities no triple mentions
    pub fn track_references(&mut self) {
        for entity in &mut self.entities {
            entity.references_mut();
        }
    }

    pub fn get(&self, name: &str) -> Option<&EntityRecord> {
        self.index.get(name).map(|&slot| &self.entities[slot])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityRecord> {
        self.entities.iter()
    }

    /// Records in first-insertion order
    pub fn records(&self) -> &[EntityRecord] {
        &self.entities
    }

    pub fn into_records(self) -> Vec<EntityRecord> {
        self.entities
    }
}

fn append_summary(existing: &mut String, summary: &str) -> bool {
    if summary.is_empty() || existing.split(SUMMARY_SEPARATOR).any(|part| part == summary) {
        return false;
    }

    if existing.is_empty() {
        existing.push_str(summary);
    } else {
        existing.push_str(SUMMARY_SEPARATOR);
        existing.push_str(summary);
    }
    true
}

fn dedup_in_place<T: PartialEq>(items: &mut Vec<T>) {
    let mut unique = Vec::with_capacity(items.len());
    for item in items.drain(..) {
        push_unique(&mut unique, item);
    }
    *items = unique;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_merges_tags_and_ids() {
        let mut kb = KnowledgeBase::new();
        kb.union(EntityRecord::new("A").with_type("x").with_chunk_id(1u64));
        let effect = kb.union(
            EntityRecord::new("A")
                .with_type("y")
                .with_chunk_id(1u64)
                .with_chunk_id(2u64),
        );

        assert_eq!(effect, UnionEffect::Updated);
        let a = kb.get("A").unwrap();
        assert_eq!(a.types, vec!["x", "y"]);
        assert_eq!(a.chunk_ids, vec![ChunkId::Index(1), ChunkId::Index(2)]);
    }

    #[test]
    fn test_summaries_appended_in_order_once() {
        let mut kb = KnowledgeBase::new();
        kb.union(EntityRecord::new("龙骨").with_summary("纵向构件"));
        kb.union(EntityRecord::new("龙骨").with_summary("纵向构件"));
        kb.union(EntityRecord::new("龙骨").with_summary("船底中线"));
        assert_eq!(
            kb.union(EntityRecord::new("龙骨").with_summary("纵向构件")),
            UnionEffect::Unchanged
        );
        kb.union(EntityRecord::new("龙骨").with_summary(""));

        assert_eq!(kb.get("龙骨").unwrap().summary, "纵向构件 | 船底中线");
    }

    #[test]
    fn test_empty_summary_is_filled() {
        let mut kb = KnowledgeBase::new();
        kb.union(EntityRecord::new("A"));
        kb.union(EntityRecord::new("A").with_summary("s"));
        assert_eq!(kb.get("A").unwrap().summary, "s");
    }

    #[test]
    fn test_insert_dedups_incoming_lists() {
        let mut entity = EntityRecord::new("A");
        entity.types = vec!["x".into(), "x".into()];
        entity.chunk_ids = vec![ChunkId::Index(3), ChunkId::from("3")];

        let kb = KnowledgeBase::from_records([entity]);
        let a = kb.get("A").unwrap();
        assert_eq!(a.types, vec!["x"]);
        assert_eq!(a.chunk_ids, vec![ChunkId::Index(3)]);
    }

    #[test]
    fn test_add_reference() {
        let mut kb = KnowledgeBase::from_records([EntityRecord::new("焊接").with_chunk_id(1u64)]);

        assert_eq!(kb.add_reference("焊接", &ChunkId::Index(4)), UnionEffect::Updated);
        assert_eq!(kb.add_reference("焊接", &ChunkId::Index(4)), UnionEffect::Unchanged);
        assert_eq!(kb.add_reference("钢板", &ChunkId::Index(4)), UnionEffect::Inserted);

        let welding = kb.get("焊接").unwrap();
        assert_eq!(welding.chunk_ids, vec![ChunkId::Index(1)]);
        assert_eq!(welding.references(), [ChunkId::Index(4)]);

        let plate = kb.get("钢板").unwrap();
        assert_eq!(plate.types, vec![PLACEHOLDER_TYPE]);
        assert_eq!(plate.summary, PLACEHOLDER_SUMMARY);
        assert!(plate.chunk_ids.is_empty());
        assert_eq!(plate.references(), [ChunkId::Index(4)]);

        let names: Vec<&str> = kb.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["焊接", "钢板"]);
    }

    #[test]
    fn test_track_references() {
        let mut kb = KnowledgeBase::from_records([EntityRecord::new("龙骨")]);
        assert!(kb.get("龙骨").unwrap().relation_chunk_ids.is_none());

        kb.track_references();
        assert_eq!(kb.get("龙骨").unwrap().relation_chunk_ids, Some(Vec::new()));
    }
}
