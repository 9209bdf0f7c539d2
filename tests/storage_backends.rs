//! The scan/merge/undo flow on the on-disk backends: SQLite documents and
//! filesystem blobs.

mod common;

use std::sync::Arc;

use common::{doc_id, harness_with};
use dedupe_harness::pair_cache::PairCache;
use dedupe_harness::scan::ScanOptions;
use dedupe_harness::sqlite_store::SqliteDocumentStore;
use dedupe_harness::storage_fs::FsBlobStore;
use dedupe_harness::{db, migrate};
use dedupe_harness_core::models::MergeStatus;
use dedupe_harness_core::store::DocumentStore;
use tempfile::TempDir;

async fn sqlite_store(dir: &TempDir) -> Arc<SqliteDocumentStore> {
    let pool = db::connect_path(&dir.path().join("data/dedupe.sqlite"))
        .await
        .unwrap();
    migrate::create_schema(&pool).await.unwrap();
    Arc::new(SqliteDocumentStore::new(pool))
}

#[tokio::test]
async fn flow_persists_to_disk() {
    let tmp = TempDir::new().unwrap();
    let blob_root = tmp.path().join("blobs");
    let docs = sqlite_store(&tmp).await;
    let h = harness_with(docs.clone(), Arc::new(FsBlobStore::new(&blob_root)));

    h.service.ingest("acme").await.unwrap();
    let report = h.service.scan("acme", ScanOptions::default()).await.unwrap();
    assert_eq!(report.pairs_found, 2);
    assert!(blob_root.join("acme/duplicate_pairs.json").is_file());

    let outcome = h
        .service
        .apply_merge("acme", &doc_id(4), &doc_id(5), "merged runbook")
        .await
        .unwrap();
    assert!(outcome.success);
    let op = outcome.operation.unwrap();
    assert!(blob_root.join("acme/merge_operations.json").is_file());

    // A fresh cache over the same directory sees the resolved pair.
    let cache = PairCache::new(Arc::new(FsBlobStore::new(&blob_root)));
    let summary = cache.summary("acme").await.unwrap().unwrap();
    assert_eq!(summary.resolved, 1);

    let undone = h.service.undo("acme", &op.id).await.unwrap();
    assert!(undone.success, "{}", undone.message);
    assert_eq!(docs.count("acme").await.unwrap(), 5);

    let history = h.service.merge_history("acme").await.unwrap();
    assert_eq!(history[0].status, MergeStatus::Undone);
}

#[tokio::test]
async fn embeddings_survive_the_sqlite_round_trip() {
    let tmp = TempDir::new().unwrap();
    let docs = sqlite_store(&tmp).await;
    let h = harness_with(
        docs.clone(),
        Arc::new(FsBlobStore::new(tmp.path().join("blobs"))),
    );

    h.service.ingest("acme").await.unwrap();
    h.service.scan("acme", ScanOptions::default()).await.unwrap();

    let d1 = docs.get_document("acme", &doc_id(1)).await.unwrap().unwrap();
    assert_eq!(d1.embedding.as_ref().map(Vec::len), Some(4));
    assert_eq!(d1.metadata.similar_to, vec![doc_id(2)]);
    assert!(d1.metadata.last_scan_timestamp.is_some());

    // Nothing changed, so the second scan reuses stored embeddings.
    let second = h.service.scan("acme", ScanOptions::default()).await.unwrap();
    assert_eq!(second.documents_embedded, 0);
    assert_eq!(second.documents_updated, 0);
    assert_eq!(second.pairs_found, 2);
}
