//! Duplicate relationship planning.
//!
//! Turns a scan's pairs into the `similar_to` value every document should
//! carry. Planning is pure; the caller persists the returned documents with
//! a single `replace_documents` call.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};

use crate::models::{pair_key, Document, SimilarPair};

/// Symmetric adjacency map. Neighbour lists are sorted and deduplicated.
pub fn build_adjacency(pairs: &[SimilarPair]) -> BTreeMap<String, Vec<String>> {
    let mut sets: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for pair in pairs {
        if pair.doc_a == pair.doc_b {
            continue;
        }
        sets.entry(pair.doc_a.clone())
            .or_default()
            .insert(pair.doc_b.clone());
        sets.entry(pair.doc_b.clone())
            .or_default()
            .insert(pair.doc_a.clone());
    }
    sets.into_iter()
        .map(|(id, neighbours)| (id, neighbours.into_iter().collect()))
        .collect()
}

/// Result of planning a relationship rewrite.
#[derive(Debug, Clone, Default)]
pub struct RelationshipPlan {
    /// Documents to persist, already carrying their new `similar_to` and
    /// `last_scan_timestamp`.
    pub rewrites: Vec<Document>,
}

impl RelationshipPlan {
    pub fn updated_ids(&self) -> Vec<String> {
        self.rewrites.iter().map(|d| d.id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rewrites.is_empty()
    }
}

/// Plan the `similar_to` rewrite for the whole corpus.
///
/// Every document gets its adjacency list, or an empty list when it has no
/// neighbours, so stale edges are cleared. With `update_existing` every
/// document is rewritten; otherwise only documents whose list changed, plus
/// those named in `force`, which carry state the store has not seen yet
/// (fresh embeddings).
pub fn plan_relationship_update(
    documents: &[Document],
    pairs: &[SimilarPair],
    update_existing: bool,
    force: &HashSet<String>,
    now: DateTime<Utc>,
) -> RelationshipPlan {
    let adjacency = build_adjacency(pairs);
    let mut rewrites = Vec::new();

    for doc in documents {
        let new_list = adjacency.get(&doc.id).cloned().unwrap_or_default();
        let changed = normalized(&doc.metadata.similar_to) != new_list;
        if !(update_existing || changed || force.contains(&doc.id)) {
            continue;
        }
        let mut updated = doc.clone();
        updated.metadata.similar_to = new_list;
        updated.metadata.last_scan_timestamp = Some(now);
        rewrites.push(updated);
    }

    RelationshipPlan { rewrites }
}

/// Drop every edge pointing at `removed_id`.
///
/// Returns the neighbours that need rewriting; the removed document itself
/// is left to the caller to delete.
pub fn retire_document(documents: &[Document], removed_id: &str) -> Vec<Document> {
    documents
        .iter()
        .filter(|d| d.id != removed_id)
        .filter(|d| d.metadata.similar_to.iter().any(|n| n == removed_id))
        .map(|d| {
            let mut updated = d.clone();
            updated.metadata.similar_to.retain(|n| n != removed_id);
            updated
        })
        .collect()
}

/// Unordered pairs implied by stored `similar_to` lists.
///
/// Edges to documents that no longer exist are ignored. Sorted by key.
pub fn pairs_from_metadata(documents: &[Document]) -> Vec<(String, String)> {
    let known: HashSet<&str> = documents.iter().map(|d| d.id.as_str()).collect();
    let mut keys = BTreeSet::new();
    for doc in documents {
        for neighbour in &doc.metadata.similar_to {
            if neighbour == &doc.id || !known.contains(neighbour.as_str()) {
                continue;
            }
            keys.insert(pair_key(&doc.id, neighbour));
        }
    }
    keys.into_iter().collect()
}

/// Edges `(a, b)` where `b` does not list `a` back.
pub fn asymmetric_edges(documents: &[Document]) -> Vec<(String, String)> {
    let lists: BTreeMap<&str, &Vec<String>> = documents
        .iter()
        .map(|d| (d.id.as_str(), &d.metadata.similar_to))
        .collect();
    let mut out = Vec::new();
    for (id, neighbours) in &lists {
        for n in neighbours.iter() {
            let back = lists
                .get(n.as_str())
                .is_some_and(|l| l.iter().any(|x| x == id));
            if !back {
                out.push((id.to_string(), n.clone()));
            }
        }
    }
    out
}

fn normalized(list: &[String]) -> Vec<String> {
    let set: BTreeSet<&String> = list.iter().collect();
    set.into_iter().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentMetadata;

    fn doc(id: &str, similar_to: &[&str]) -> Document {
        Document {
            id: id.to_string(),
            content: String::new(),
            metadata: DocumentMetadata {
                similar_to: similar_to.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            embedding: None,
        }
    }

    fn pair(a: &str, b: &str) -> SimilarPair {
        SimilarPair {
            doc_a: a.into(),
            doc_b: b.into(),
            score: 0.9,
        }
    }

    #[test]
    fn adjacency_is_symmetric() {
        let adj = build_adjacency(&[pair("a", "b"), pair("a", "c")]);
        assert_eq!(adj["a"], vec!["b".to_string(), "c".to_string()]);
        assert_eq!(adj["b"], vec!["a".to_string()]);
        assert_eq!(adj["c"], vec!["a".to_string()]);
    }

    #[test]
    fn full_replace_clears_stale_edges() {
        let docs = vec![doc("a", &["b"]), doc("b", &["a"]), doc("c", &[])];
        let plan = plan_relationship_update(&docs, &[], true, &HashSet::new(), Utc::now());
        assert_eq!(plan.rewrites.len(), 3);
        assert!(plan.rewrites.iter().all(|d| d.metadata.similar_to.is_empty()));
        assert!(plan
            .rewrites
            .iter()
            .all(|d| d.metadata.last_scan_timestamp.is_some()));
    }

    #[test]
    fn only_changed_documents_without_update_existing() {
        let docs = vec![doc("a", &["b"]), doc("b", &["a"]), doc("c", &[])];
        let pairs = [pair("a", "b")];
        let plan = plan_relationship_update(&docs, &pairs, false, &HashSet::new(), Utc::now());
        assert!(plan.is_empty());

        let plan = plan_relationship_update(&docs, &[pair("b", "c")], false, &HashSet::new(), Utc::now());
        let mut ids = plan.updated_ids();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn forced_documents_are_rewritten() {
        let docs = vec![doc("a", &[]), doc("b", &[])];
        let force: HashSet<String> = ["b".to_string()].into_iter().collect();
        let plan = plan_relationship_update(&docs, &[], false, &force, Utc::now());
        assert_eq!(plan.updated_ids(), vec!["b"]);
    }

    #[test]
    fn retire_removes_back_edges() {
        let docs = vec![doc("a", &["b", "c"]), doc("b", &["a"]), doc("c", &["a"])];
        let updated = retire_document(&docs, "a");
        assert_eq!(updated.len(), 2);
        assert!(updated.iter().all(|d| d.metadata.similar_to.is_empty()));
    }

    #[test]
    fn metadata_pairs_are_deduplicated() {
        let docs = vec![doc("b", &["a", "ghost"]), doc("a", &["b"])];
        assert_eq!(
            pairs_from_metadata(&docs),
            vec![("a".to_string(), "b".to_string())]
        );
    }

    #[test]
    fn detects_asymmetry() {
        let docs = vec![doc("a", &["b"]), doc("b", &[])];
        assert_eq!(
            asymmetric_edges(&docs),
            vec![("a".to_string(), "b".to_string())]
        );
        assert!(asymmetric_edges(&[doc("a", &["b"]), doc("b", &["a"])]).is_empty());
    }
}
