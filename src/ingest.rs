//! Ingestion from the content source into the document store.
//!
//! Pages become documents keyed by [`document_id_for`] of their source id.
//! A page whose content changed loses its stored embedding so the next scan
//! embeds it again; an unchanged page keeps both its embedding and its
//! `similar_to` list.

use std::collections::HashMap;

use serde::Serialize;

use dedupe_harness_core::error::{DedupeError, DedupeResult, ExternalSystem};
use dedupe_harness_core::models::{document_id_for, validate_org_id, Document, DocumentMetadata};
use dedupe_harness_core::store::DocumentStore;

use crate::content_source::{ContentSource, Page};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub pages_seen: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// Build the document for `page`, carrying state over from `existing`.
///
/// Returns `None` when nothing the store cares about changed.
pub fn document_from_page(page: &Page, existing: Option<&Document>) -> Option<Document> {
    let id = document_id_for(&page.source_id);
    let metadata = |prev: Option<&DocumentMetadata>| DocumentMetadata {
        title: page.title.clone(),
        source_url: page.url.clone(),
        source_id: page.source_id.clone(),
        space: page.space.clone(),
        similar_to: prev.map(|m| m.similar_to.clone()).unwrap_or_default(),
        last_scan_timestamp: prev.and_then(|m| m.last_scan_timestamp),
        extra: prev.map(|m| m.extra.clone()).unwrap_or_default(),
    };

    match existing {
        None => Some(Document {
            id,
            content: page.content.clone(),
            metadata: metadata(None),
            embedding: None,
        }),
        Some(doc) => {
            let content_changed = doc.content != page.content;
            let next = Document {
                id,
                content: page.content.clone(),
                metadata: metadata(Some(&doc.metadata)),
                embedding: if content_changed {
                    None
                } else {
                    doc.embedding.clone()
                },
            };
            if &next == doc {
                None
            } else {
                Some(next)
            }
        }
    }
}

/// Pull every page from `source` into the organization's corpus.
pub async fn ingest(
    org: &str,
    source: &dyn ContentSource,
    store: &dyn DocumentStore,
) -> DedupeResult<IngestReport> {
    validate_org_id(org)?;

    let pages = source
        .list_pages()
        .await
        .map_err(|e| DedupeError::external(ExternalSystem::ContentSource, format!("{:#}", e)))?;
    let existing: HashMap<String, Document> = store
        .all_documents(org)
        .await
        .map_err(|e| DedupeError::external(ExternalSystem::DocumentStore, format!("{:#}", e)))?
        .into_iter()
        .map(|d| (d.id.clone(), d))
        .collect();

    let mut report = IngestReport {
        pages_seen: pages.len(),
        ..Default::default()
    };
    let mut upserts = Vec::new();
    for page in &pages {
        let prev = existing.get(&document_id_for(&page.source_id));
        match document_from_page(page, prev) {
            None => report.unchanged += 1,
            Some(doc) => {
                if prev.is_some() {
                    report.updated += 1;
                } else {
                    report.inserted += 1;
                }
                upserts.push(doc);
            }
        }
    }

    if !upserts.is_empty() {
        store
            .upsert_documents(org, &upserts)
            .await
            .map_err(|e| DedupeError::external(ExternalSystem::DocumentStore, format!("{:#}", e)))?;
    }

    tracing::info!(
        org,
        connector = source.name(),
        pages = report.pages_seen,
        inserted = report.inserted,
        updated = report.updated,
        "ingest finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dedupe_harness_core::models::VersionToken;

    fn page(source_id: &str, content: &str) -> Page {
        Page {
            source_id: source_id.into(),
            title: format!("Title {}", source_id),
            url: format!("https://wiki/{}", source_id),
            space: "ENG".into(),
            content: content.into(),
            version: VersionToken("1".into()),
        }
    }

    #[test]
    fn new_page_has_no_embedding() {
        let doc = document_from_page(&page("p1", "hello"), None).unwrap();
        assert_eq!(doc.id, document_id_for("p1"));
        assert_eq!(doc.metadata.source_id, "p1");
        assert!(doc.embedding.is_none());
    }

    #[test]
    fn unchanged_page_is_skipped() {
        let mut doc = document_from_page(&page("p1", "hello"), None).unwrap();
        doc.embedding = Some(vec![1.0]);
        doc.metadata.similar_to = vec!["x".into()];
        assert!(document_from_page(&page("p1", "hello"), Some(&doc)).is_none());
    }

    #[test]
    fn changed_content_clears_embedding_keeps_relationships() {
        let mut doc = document_from_page(&page("p1", "hello"), None).unwrap();
        doc.embedding = Some(vec![1.0]);
        doc.metadata.similar_to = vec!["x".into()];
        let next = document_from_page(&page("p1", "hello again"), Some(&doc)).unwrap();
        assert!(next.embedding.is_none());
        assert_eq!(next.metadata.similar_to, vec!["x".to_string()]);
    }

    #[test]
    fn title_change_keeps_embedding() {
        let mut doc = document_from_page(&page("p1", "hello"), None).unwrap();
        doc.embedding = Some(vec![1.0]);
        let mut renamed = page("p1", "hello");
        renamed.title = "Renamed".into();
        let next = document_from_page(&renamed, Some(&doc)).unwrap();
        assert_eq!(next.metadata.title, "Renamed");
        assert_eq!(next.embedding, Some(vec![1.0]));
    }
}
