//! Append-only merge operation log.
//!
//! One JSON blob per organization (`{org}/merge_operations.json`) holding
//! every merge ever applied there. Writes are read-modify-write under a
//! per-organization lock. Entries never disappear; only `status`,
//! `undo_timestamp`, and `updated_at` change.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use dedupe_harness_core::error::{DedupeError, DedupeResult, ExternalSystem};
use dedupe_harness_core::models::{MergeOperation, MergeStatus, MergeUpdate, NewMergeOperation};
use dedupe_harness_core::store::BlobStore;

use crate::locks::KeyedLocks;
use crate::storage::merge_log_key;

const LOG_LOCK: &str = "merge_operations";

#[derive(Debug, Default, Serialize, Deserialize)]
struct MergeLogBlob {
    #[serde(default)]
    operations: Vec<MergeOperation>,
}

pub struct MergeLog {
    blobs: Arc<dyn BlobStore>,
    locks: KeyedLocks,
}

fn storage_err(e: anyhow::Error) -> DedupeError {
    DedupeError::external(ExternalSystem::StorageBackend, format!("{:#}", e))
}

impl MergeLog {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            locks: KeyedLocks::new(),
        }
    }

    /// Append a merge. Assigns an id and timestamp when absent.
    ///
    /// Stamped timestamps are strictly greater than every timestamp already
    /// in the organization's log.
    pub async fn append(&self, new: NewMergeOperation) -> DedupeResult<MergeOperation> {
        let org = new.organization_id.clone();
        let key = merge_log_key(&org)?;
        let _guard = self.locks.lock(&org, LOG_LOCK).await;

        let mut blob = self.read(&key).await?;
        let id = new
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if blob.operations.iter().any(|op| op.id == id) {
            return Err(DedupeError::InvalidInput(format!(
                "merge operation {} already exists",
                id
            )));
        }

        let latest = blob.operations.iter().map(|op| op.timestamp).max();
        let timestamp = new
            .timestamp
            .unwrap_or_else(|| next_timestamp(Utc::now(), latest));

        let op = MergeOperation {
            id,
            organization_id: org.clone(),
            kept: new.kept,
            removed: new.removed,
            kept_pre_merge_version: new.kept_pre_merge_version,
            removed_pre_merge_version: new.removed_pre_merge_version,
            similarity: new.similarity,
            timestamp,
            status: MergeStatus::Completed,
            undo_timestamp: None,
            updated_at: None,
        };
        blob.operations.push(op.clone());
        self.write(&key, &blob).await?;

        tracing::info!(org = %org, operation_id = %op.id, "merge operation logged");
        Ok(op)
    }

    pub async fn get(&self, org: &str, id: &str) -> DedupeResult<Option<MergeOperation>> {
        let key = merge_log_key(org)?;
        let blob = self.read(&key).await?;
        Ok(blob.operations.into_iter().find(|op| op.id == id))
    }

    /// Apply a status/undo-timestamp change. `NotFound` if the id is unknown.
    pub async fn update(&self, org: &str, id: &str, update: MergeUpdate) -> DedupeResult<MergeOperation> {
        let key = merge_log_key(org)?;
        let _guard = self.locks.lock(org, LOG_LOCK).await;

        let mut blob = self.read(&key).await?;
        let op = blob
            .operations
            .iter_mut()
            .find(|op| op.id == id)
            .ok_or_else(|| DedupeError::NotFound(format!("merge operation {}", id)))?;

        if let Some(status) = update.status {
            op.status = status;
        }
        if let Some(ts) = update.undo_timestamp {
            op.undo_timestamp = Some(ts);
        }
        op.updated_at = Some(Utc::now());
        let updated = op.clone();

        self.write(&key, &blob).await?;
        Ok(updated)
    }

    /// Flip a completed merge to undone. Fails closed on any other state.
    pub async fn mark_undone(&self, org: &str, id: &str) -> DedupeResult<MergeOperation> {
        let key = merge_log_key(org)?;
        let _guard = self.locks.lock(org, LOG_LOCK).await;

        let mut blob = self.read(&key).await?;
        let op = blob
            .operations
            .iter_mut()
            .find(|op| op.id == id)
            .ok_or_else(|| DedupeError::NotFound(format!("merge operation {}", id)))?;
        if op.status != MergeStatus::Completed {
            return Err(DedupeError::InvalidState(format!(
                "merge {} is already {}",
                id, op.status
            )));
        }

        let now = Utc::now();
        op.status = MergeStatus::Undone;
        op.undo_timestamp = Some(now);
        op.updated_at = Some(now);
        let updated = op.clone();

        self.write(&key, &blob).await?;
        tracing::info!(org, operation_id = %id, "merge operation marked undone");
        Ok(updated)
    }

    /// Every merge where the page was kept or removed, ascending by time.
    pub async fn chain_for_document(&self, org: &str, source_id: &str) -> DedupeResult<Vec<MergeOperation>> {
        let key = merge_log_key(org)?;
        let mut chain: Vec<MergeOperation> = self
            .read(&key)
            .await?
            .operations
            .into_iter()
            .filter(|op| op.touches(source_id))
            .collect();
        chain.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(chain)
    }

    /// All merges of the organization, newest first.
    pub async fn history(&self, org: &str) -> DedupeResult<Vec<MergeOperation>> {
        let key = merge_log_key(org)?;
        let mut ops = self.read(&key).await?.operations;
        ops.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        Ok(ops)
    }

    async fn read(&self, key: &str) -> DedupeResult<MergeLogBlob> {
        match self.blobs.get(key).await.map_err(storage_err)? {
            None => Ok(MergeLogBlob::default()),
            // An unreadable log is an error; treating it as empty would
            // lose undo history on the next write.
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                DedupeError::external(
                    ExternalSystem::StorageBackend,
                    format!("merge log {} is unreadable: {}", key, e),
                )
            }),
        }
    }

    async fn write(&self, key: &str, blob: &MergeLogBlob) -> DedupeResult<()> {
        let bytes = serde_json::to_vec_pretty(blob)
            .map_err(|e| DedupeError::external(ExternalSystem::StorageBackend, e))?;
        self.blobs.put(key, bytes).await.map_err(storage_err)
    }
}

/// `now`, bumped one microsecond past `latest` when the clock has not moved.
fn next_timestamp(now: DateTime<Utc>, latest: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match latest {
        Some(latest) if now <= latest => latest + Duration::microseconds(1),
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dedupe_harness_core::models::{DocumentRef, VersionToken};
    use dedupe_harness_core::store::memory::InMemoryBlobStore;

    fn dref(source_id: &str) -> DocumentRef {
        DocumentRef {
            document_id: format!("doc-{}", source_id),
            source_id: source_id.into(),
            title: source_id.into(),
            url: String::new(),
            space: String::new(),
        }
    }

    fn new_op(org: &str, kept: &str, removed: &str) -> NewMergeOperation {
        NewMergeOperation {
            id: None,
            organization_id: org.into(),
            kept: dref(kept),
            removed: dref(removed),
            kept_pre_merge_version: VersionToken("1".into()),
            removed_pre_merge_version: VersionToken("1".into()),
            similarity: Some(0.9),
            timestamp: None,
        }
    }

    fn log() -> MergeLog {
        MergeLog::new(Arc::new(InMemoryBlobStore::new()))
    }

    #[test]
    fn test_next_timestamp_bumps_ties() {
        let t = Utc::now();
        assert_eq!(next_timestamp(t, None), t);
        assert_eq!(next_timestamp(t, Some(t)), t + Duration::microseconds(1));
        assert!(next_timestamp(t, Some(t - Duration::seconds(1))) == t);
    }

    #[tokio::test]
    async fn test_append_assigns_id_and_increasing_timestamps() {
        let log = log();
        let m1 = log.append(new_op("acme", "p1", "p2")).await.unwrap();
        let m2 = log.append(new_op("acme", "p1", "p3")).await.unwrap();
        assert!(!m1.id.is_empty());
        assert_ne!(m1.id, m2.id);
        assert!(m2.timestamp > m1.timestamp);
        assert_eq!(m1.status, MergeStatus::Completed);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let log = log();
        let mut op = new_op("acme", "p1", "p2");
        op.id = Some("fixed".into());
        log.append(op.clone()).await.unwrap();
        assert!(matches!(
            log.append(op).await,
            Err(DedupeError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_chain_matches_kept_or_removed() {
        let log = log();
        let m1 = log.append(new_op("acme", "p1", "p2")).await.unwrap();
        let m2 = log.append(new_op("acme", "p3", "p1")).await.unwrap();
        log.append(new_op("acme", "p4", "p5")).await.unwrap();

        let chain = log.chain_for_document("acme", "p1").await.unwrap();
        let ids: Vec<_> = chain.iter().map(|op| op.id.clone()).collect();
        assert_eq!(ids, vec![m1.id, m2.id]);
    }

    #[tokio::test]
    async fn test_orgs_are_isolated() {
        let log = log();
        log.append(new_op("a", "p1", "p2")).await.unwrap();
        assert!(log.history("b").await.unwrap().is_empty());
        assert!(log.chain_for_document("b", "p1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_undone_is_terminal() {
        let log = log();
        let m1 = log.append(new_op("acme", "p1", "p2")).await.unwrap();
        let undone = log.mark_undone("acme", &m1.id).await.unwrap();
        assert_eq!(undone.status, MergeStatus::Undone);
        assert!(undone.undo_timestamp.is_some());
        assert!(matches!(
            log.mark_undone("acme", &m1.id).await,
            Err(DedupeError::InvalidState(_))
        ));
        assert!(matches!(
            log.mark_undone("acme", "nope").await,
            Err(DedupeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_unknown_is_not_found() {
        let log = log();
        let result = log
            .update(
                "acme",
                "missing",
                MergeUpdate {
                    status: Some(MergeStatus::Undone),
                    undo_timestamp: None,
                },
            )
            .await;
        assert!(matches!(result, Err(DedupeError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_history_newest_first() {
        let log = log();
        let m1 = log.append(new_op("acme", "p1", "p2")).await.unwrap();
        let m2 = log.append(new_op("acme", "p3", "p4")).await.unwrap();
        let history = log.history("acme").await.unwrap();
        assert_eq!(history[0].id, m2.id);
        assert_eq!(history[1].id, m1.id);
    }

    #[tokio::test]
    async fn test_corrupt_log_is_an_error() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        blobs
            .put("acme/merge_operations.json", b"{broken".to_vec())
            .await
            .unwrap();
        let log = MergeLog::new(blobs);
        assert!(matches!(
            log.history("acme").await,
            Err(DedupeError::ExternalSystemFailure { .. })
        ));
    }
}
