//! Core data models for duplicate detection and merge tracking.
//!
//! Every entity here is scoped to one organization. The organization id is
//! carried explicitly by the caller (and by [`MergeOperation`]) rather than
//! by any ambient state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::DedupeError;

/// Typed document metadata.
///
/// The well-known keys are real fields; anything else a connector attaches
/// is preserved in `extra` and round-trips through every store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub source_url: String,
    /// Identity of the page in the external content source.
    #[serde(default)]
    pub source_id: String,
    #[serde(default)]
    pub space: String,
    /// Ids of documents currently considered near-duplicates of this one.
    #[serde(default)]
    pub similar_to: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scan_timestamp: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A document in an organization's corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable id derived from the source identity (see [`document_id_for`]).
    pub id: String,
    pub content: String,
    pub metadata: DocumentMetadata,
    /// Absent until the document has been embedded by a scan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Document {
    /// Point-in-time reference used by pair snapshots and merge records.
    pub fn to_ref(&self) -> DocumentRef {
        DocumentRef {
            document_id: self.id.clone(),
            source_id: self.metadata.source_id.clone(),
            title: self.metadata.title.clone(),
            url: self.metadata.source_url.clone(),
            space: self.metadata.space.clone(),
        }
    }
}

/// Derive a document id from its source identity (hex SHA-256).
pub fn document_id_for(source_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Snapshot of a document's identity, not a live join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub document_id: String,
    pub source_id: String,
    pub title: String,
    pub url: String,
    pub space: String,
}

/// An unordered pair discovered by the similarity engine.
///
/// `doc_a` is the document that appeared first in the scanned order.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarPair {
    pub doc_a: String,
    pub doc_b: String,
    pub score: f32,
}

impl SimilarPair {
    /// Order-independent key, used for deduplication.
    pub fn key(&self) -> (String, String) {
        pair_key(&self.doc_a, &self.doc_b)
    }
}

/// Order-independent key for a pair of document ids.
pub fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairStatus {
    Pending,
    Resolved,
}

/// A cached duplicate pair.
///
/// Ids are sequential per cache generation and are not stable across scans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicatePair {
    pub id: u64,
    pub doc_a: DocumentRef,
    pub doc_b: DocumentRef,
    pub similarity: f32,
    pub status: PairStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DuplicatePair {
    pub fn involves(&self, document_id: &str) -> bool {
        self.doc_a.document_id == document_id || self.doc_b.document_id == document_id
    }
}

/// Opaque version token from the content source.
///
/// The core never interprets it; it is captured before a mutation and
/// handed back on undo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(pub String);

impl std::fmt::Display for VersionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStatus {
    Completed,
    Undone,
}

impl std::fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeStatus::Completed => f.write_str("completed"),
            MergeStatus::Undone => f.write_str("undone"),
        }
    }
}

/// One merge event in an organization's append-only log.
///
/// Immutable except for `status`, `undo_timestamp`, and `updated_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeOperation {
    pub id: String,
    pub organization_id: String,
    pub kept: DocumentRef,
    pub removed: DocumentRef,
    pub kept_pre_merge_version: VersionToken,
    pub removed_pre_merge_version: VersionToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    pub timestamp: DateTime<Utc>,
    pub status: MergeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undo_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl MergeOperation {
    /// The external page this merge mutated in place.
    pub fn target_source_id(&self) -> &str {
        &self.kept.source_id
    }

    /// Whether the given source page took part in this merge on either side.
    pub fn touches(&self, source_id: &str) -> bool {
        self.kept.source_id == source_id || self.removed.source_id == source_id
    }
}

/// A merge about to be appended; the log fills in `id` and `timestamp`
/// when they are absent.
#[derive(Debug, Clone)]
pub struct NewMergeOperation {
    pub id: Option<String>,
    pub organization_id: String,
    pub kept: DocumentRef,
    pub removed: DocumentRef,
    pub kept_pre_merge_version: VersionToken,
    pub removed_pre_merge_version: VersionToken,
    pub similarity: Option<f32>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Fields that may change on a logged merge.
#[derive(Debug, Clone, Default)]
pub struct MergeUpdate {
    pub status: Option<MergeStatus>,
    pub undo_timestamp: Option<DateTime<Utc>>,
}

/// Validate an organization id before it is used in a storage key.
///
/// Accepts `[A-Za-z0-9_.-]+`, rejecting `.` and `..`.
pub fn validate_org_id(org: &str) -> Result<(), DedupeError> {
    let valid_chars = org
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if org.is_empty() || !valid_chars || org == "." || org == ".." {
        return Err(DedupeError::InvalidInput(format!(
            "invalid organization id: '{}'",
            org
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_key_is_order_independent() {
        assert_eq!(pair_key("b", "a"), pair_key("a", "b"));
        assert_eq!(pair_key("a", "b"), ("a".to_string(), "b".to_string()));
    }

    #[test]
    fn document_id_is_stable() {
        assert_eq!(document_id_for("page-1"), document_id_for("page-1"));
        assert_ne!(document_id_for("page-1"), document_id_for("page-2"));
        assert_eq!(document_id_for("page-1").len(), 64);
    }

    #[test]
    fn org_id_validation() {
        assert!(validate_org_id("acme").is_ok());
        assert!(validate_org_id("org_42-eu.prod").is_ok());
        assert!(validate_org_id("").is_err());
        assert!(validate_org_id("..").is_err());
        assert!(validate_org_id("a/b").is_err());
        assert!(validate_org_id("a b").is_err());
    }

    #[test]
    fn metadata_keeps_unknown_keys() {
        let json = r#"{"title":"T","space":"ENG","similar_to":["x"],"owner":"kim"}"#;
        let meta: DocumentMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.title, "T");
        assert_eq!(meta.similar_to, vec!["x".to_string()]);
        assert_eq!(meta.extra.get("owner"), Some(&serde_json::json!("kim")));

        let back = serde_json::to_value(&meta).unwrap();
        assert_eq!(back["owner"], "kim");
    }

    #[test]
    fn merge_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&MergeStatus::Undone).unwrap(),
            "\"undone\""
        );
        assert_eq!(
            serde_json::to_string(&PairStatus::Pending).unwrap(),
            "\"pending\""
        );
    }
}
