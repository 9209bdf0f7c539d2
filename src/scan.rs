//! Similarity scan pipeline.
//!
//! One scan: load the organization's corpus, embed documents that lack an
//! embedding, find pairs, rewrite `similar_to` lists, rebuild the pair
//! cache. The rewrite is persisted before the cache is rebuilt, so the
//! cache always reflects relationships already visible in the store.
//!
//! Scans of one organization are serialized by a per-organization queue
//! lock. Merge and undo take the same lock (see [`Scanner::lock_corpus`])
//! around their store writes, so a scan never persists a corpus snapshot
//! that a merge changed underneath it. A scan spawned with [`Scanner::spawn`] can be cancelled while it
//! is still queued; once it has started it runs to completion.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use dedupe_harness_core::embedding::EmbeddingProvider;
use dedupe_harness_core::error::{DedupeError, DedupeResult, ExternalSystem};
use dedupe_harness_core::models::validate_org_id;
use dedupe_harness_core::relationships::plan_relationship_update;
use dedupe_harness_core::similarity::find_similar_pairs;
use dedupe_harness_core::store::DocumentStore;

use crate::config::DetectionConfig;
use crate::locks::{KeyedLocks, PageGuard};
use crate::pair_cache::PairCache;
use crate::progress::{ScanPhase, ScanStatus};

const SCAN_QUEUE: &str = "scan";

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Overrides `[detection] similarity_threshold` for this scan.
    pub threshold: Option<f32>,
    /// Rewrite every document, not only those whose relationships changed.
    pub update_existing: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanReport {
    pub threshold: f32,
    pub documents_total: usize,
    pub documents_embedded: usize,
    pub embedding_failures: usize,
    pub pairs_found: usize,
    pub documents_updated: usize,
}

#[derive(Clone)]
pub struct Scanner {
    docs: Arc<dyn DocumentStore>,
    cache: Arc<PairCache>,
    embedder: Arc<dyn EmbeddingProvider>,
    detection: DetectionConfig,
    concurrency: usize,
    queue: Arc<KeyedLocks>,
}

fn store_err(e: anyhow::Error) -> DedupeError {
    DedupeError::external(ExternalSystem::DocumentStore, format!("{:#}", e))
}

/// Check a threshold override; `None` falls back to `default`.
pub fn effective_threshold(requested: Option<f32>, default: f32) -> DedupeResult<f32> {
    let threshold = requested.unwrap_or(default);
    if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
        return Err(DedupeError::InvalidInput(format!(
            "similarity threshold must be within [0, 1], got {}",
            threshold
        )));
    }
    Ok(threshold)
}

impl Scanner {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        cache: Arc<PairCache>,
        embedder: Arc<dyn EmbeddingProvider>,
        detection: DetectionConfig,
        concurrency: usize,
    ) -> Self {
        Self {
            docs,
            cache,
            embedder,
            detection,
            concurrency: concurrency.max(1),
            queue: Arc::new(KeyedLocks::new()),
        }
    }

    /// Hold the organization's scan queue. While the guard lives no scan of
    /// `org` is between loading and persisting its corpus.
    pub async fn lock_corpus(&self, org: &str) -> PageGuard {
        self.queue.lock(org, SCAN_QUEUE).await
    }

    /// Run a scan to completion on the current task.
    pub async fn run(&self, org: &str, options: ScanOptions) -> DedupeResult<ScanReport> {
        let (tx, _rx) = watch::channel(ScanStatus::default());
        let _queue = self.lock_corpus(org).await;
        self.run_started(org, &options, &tx).await
    }

    /// Start a scan in the background and return a handle to observe it.
    pub fn spawn(&self, org: &str, options: ScanOptions) -> ScanHandle {
        let (tx, rx) = watch::channel(ScanStatus::default());
        let state = Arc::new(AtomicU8::new(QUEUED));

        let scanner = self.clone();
        let org = org.to_string();
        let task_state = state.clone();
        let task = tokio::spawn(async move {
            let _queue = scanner.lock_corpus(&org).await;
            if task_state
                .compare_exchange(QUEUED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                tx.send_modify(|s| {
                    s.phase = ScanPhase::Cancelled;
                    s.message = Some("cancelled before start".into());
                });
                tracing::info!(org = %org, "queued scan cancelled");
                return Err(DedupeError::InvalidState(
                    "scan was cancelled before it started".into(),
                ));
            }
            scanner.run_started(&org, &options, &tx).await
        });

        ScanHandle {
            status: rx,
            state,
            task,
        }
    }

    async fn run_started(
        &self,
        org: &str,
        options: &ScanOptions,
        status: &watch::Sender<ScanStatus>,
    ) -> DedupeResult<ScanReport> {
        let result = self.scan_corpus(org, options, status).await;
        match &result {
            Ok(report) => {
                status.send_modify(|s| s.phase = ScanPhase::Done);
                tracing::info!(
                    org,
                    pairs_found = report.pairs_found,
                    documents_updated = report.documents_updated,
                    documents_embedded = report.documents_embedded,
                    "scan finished"
                );
            }
            Err(e) => {
                status.send_modify(|s| {
                    s.phase = ScanPhase::Failed;
                    s.message = Some(e.to_string());
                });
                tracing::warn!(org, error = %e, "scan failed");
            }
        }
        result
    }

    async fn scan_corpus(
        &self,
        org: &str,
        options: &ScanOptions,
        status: &watch::Sender<ScanStatus>,
    ) -> DedupeResult<ScanReport> {
        validate_org_id(org)?;
        let threshold = effective_threshold(options.threshold, self.detection.similarity_threshold)?;
        let min_chars = self.detection.min_content_chars;

        status.send_modify(|s| s.phase = ScanPhase::Loading);
        let mut documents = self.docs.all_documents(org).await.map_err(store_err)?;
        let mut report = ScanReport {
            threshold,
            documents_total: documents.len(),
            ..Default::default()
        };

        // Embed what is missing. Texts are copied out so results can be
        // written back while the stream is still running.
        let pending: Vec<(usize, String)> = documents
            .iter()
            .enumerate()
            .filter(|(_, d)| d.embedding.is_none() && d.content.chars().count() >= min_chars)
            .map(|(i, d)| (i, d.content.clone()))
            .collect();
        status.send_modify(|s| {
            s.phase = ScanPhase::Embedding;
            s.documents_total = documents.len() as u64;
        });

        let mut fresh = HashSet::new();
        if !pending.is_empty() {
            let embedder = self.embedder.clone();
            let mut results = stream::iter(pending.into_iter().map(|(i, text)| {
                let embedder = embedder.clone();
                async move { (i, embedder.embed(&text).await) }
            }))
            .buffer_unordered(self.concurrency);

            while let Some((i, result)) = results.next().await {
                let doc = &mut documents[i];
                match result {
                    Ok(vector) if !vector.is_empty() => {
                        doc.embedding = Some(vector);
                        fresh.insert(doc.id.clone());
                        report.documents_embedded += 1;
                        status.send_modify(|s| s.documents_embedded += 1);
                    }
                    Ok(_) => {
                        report.embedding_failures += 1;
                        tracing::warn!(org, document_id = %doc.id, "empty embedding, skipping document");
                    }
                    Err(e) => {
                        report.embedding_failures += 1;
                        tracing::warn!(org, document_id = %doc.id, error = %e, "embedding failed, skipping document");
                    }
                }
            }
        }

        status.send_modify(|s| s.phase = ScanPhase::Comparing);
        let pairs = find_similar_pairs(&documents, threshold, min_chars);
        report.pairs_found = pairs.len();
        status.send_modify(|s| s.pairs_found = pairs.len() as u64);
        tracing::debug!(org, pairs = pairs.len(), threshold, "pairs computed");

        status.send_modify(|s| s.phase = ScanPhase::Persisting);
        let plan = plan_relationship_update(
            &documents,
            &pairs,
            options.update_existing,
            &fresh,
            Utc::now(),
        );
        if !plan.is_empty() {
            self.docs
                .replace_documents(org, &plan.rewrites)
                .await
                .map_err(store_err)?;
        }
        report.documents_updated = plan.rewrites.len();
        status.send_modify(|s| s.documents_updated = plan.rewrites.len() as u64);

        status.send_modify(|s| s.phase = ScanPhase::Caching);
        self.cache.rebuild(org, &pairs, &documents).await?;

        Ok(report)
    }
}

/// Handle to a background scan.
pub struct ScanHandle {
    status: watch::Receiver<ScanStatus>,
    state: Arc<AtomicU8>,
    task: JoinHandle<DedupeResult<ScanReport>>,
}

impl ScanHandle {
    /// Latest status snapshot.
    pub fn status(&self) -> ScanStatus {
        self.status.borrow().clone()
    }

    /// A receiver that is notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<ScanStatus> {
        self.status.clone()
    }

    /// Cancel the scan if it has not started yet. Returns whether it was
    /// cancelled; a running or finished scan is left alone.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(QUEUED, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Wait for the scan to finish.
    pub async fn wait(self) -> DedupeResult<ScanReport> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(DedupeError::InvalidState(format!("scan task aborted: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dedupe_harness_core::models::{Document, DocumentMetadata};
    use dedupe_harness_core::store::memory::{InMemoryBlobStore, InMemoryDocumentStore};
    use std::collections::HashMap;

    struct TableEmbedder(HashMap<String, Vec<f32>>);

    #[async_trait::async_trait]
    impl EmbeddingProvider for TableEmbedder {
        fn model_name(&self) -> &str {
            "table"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            self.0
                .get(text)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no vector for text"))
        }
    }

    fn text(n: u32) -> String {
        format!("document body number {} with enough words to pass the floor", n)
    }

    fn doc(id: &str, n: u32) -> Document {
        Document {
            id: id.into(),
            content: text(n),
            metadata: DocumentMetadata {
                title: id.into(),
                source_id: id.into(),
                ..Default::default()
            },
            embedding: None,
        }
    }

    async fn scanner(vectors: Vec<(u32, Vec<f32>)>, docs: Vec<Document>) -> (Scanner, Arc<InMemoryDocumentStore>) {
        let store = Arc::new(InMemoryDocumentStore::new());
        store.upsert_documents("acme", &docs).await.unwrap();
        let embedder = TableEmbedder(vectors.into_iter().map(|(n, v)| (text(n), v)).collect());
        let scanner = Scanner::new(
            store.clone(),
            Arc::new(PairCache::new(Arc::new(InMemoryBlobStore::new()))),
            Arc::new(embedder),
            DetectionConfig::default(),
            2,
        );
        (scanner, store)
    }

    #[test]
    fn threshold_override_is_validated() {
        assert_eq!(effective_threshold(None, 0.65).unwrap(), 0.65);
        assert_eq!(effective_threshold(Some(0.9), 0.65).unwrap(), 0.9);
        assert!(effective_threshold(Some(1.5), 0.65).is_err());
        assert!(effective_threshold(Some(f32::NAN), 0.65).is_err());
    }

    #[tokio::test]
    async fn scan_embeds_and_links() {
        let (scanner, store) = scanner(
            vec![(1, vec![1.0, 0.0]), (2, vec![1.0, 0.1]), (3, vec![0.0, 1.0])],
            vec![doc("a", 1), doc("b", 2), doc("c", 3)],
        )
        .await;

        let report = scanner.run("acme", ScanOptions::default()).await.unwrap();
        assert_eq!(report.documents_embedded, 3);
        assert_eq!(report.pairs_found, 1);

        let a = store.get_document("acme", "a").await.unwrap().unwrap();
        assert_eq!(a.metadata.similar_to, vec!["b".to_string()]);
        assert!(a.embedding.is_some());
        let c = store.get_document("acme", "c").await.unwrap().unwrap();
        assert!(c.metadata.similar_to.is_empty());
        assert!(c.metadata.last_scan_timestamp.is_some());
    }

    #[tokio::test]
    async fn embedding_failure_skips_document() {
        let (scanner, store) = scanner(
            vec![(1, vec![1.0, 0.0]), (2, vec![1.0, 0.0])],
            vec![doc("a", 1), doc("b", 2), doc("c", 3)],
        )
        .await;

        let report = scanner.run("acme", ScanOptions::default()).await.unwrap();
        assert_eq!(report.embedding_failures, 1);
        assert_eq!(report.pairs_found, 1);
        let c = store.get_document("acme", "c").await.unwrap().unwrap();
        assert!(c.embedding.is_none());
    }

    #[tokio::test]
    async fn second_scan_rewrites_nothing() {
        let (scanner, _store) = scanner(
            vec![(1, vec![1.0, 0.0]), (2, vec![1.0, 0.0])],
            vec![doc("a", 1), doc("b", 2)],
        )
        .await;
        scanner.run("acme", ScanOptions::default()).await.unwrap();
        let second = scanner.run("acme", ScanOptions::default()).await.unwrap();
        assert_eq!(second.documents_updated, 0);
        assert_eq!(second.pairs_found, 1);
    }

    #[tokio::test]
    async fn spawned_scan_reports_done() {
        let (scanner, _store) = scanner(vec![(1, vec![1.0, 0.0])], vec![doc("a", 1)]).await;
        let handle = scanner.spawn("acme", ScanOptions::default());
        let mut rx = handle.subscribe();
        let report = handle.wait().await.unwrap();
        assert_eq!(report.documents_total, 1);
        assert_eq!(rx.borrow_and_update().phase, ScanPhase::Done);
    }

    #[tokio::test]
    async fn queued_scan_can_be_cancelled() {
        let (scanner, _store) = scanner(vec![], vec![]).await;
        let blocker = scanner.queue.lock("acme", SCAN_QUEUE).await;

        let handle = scanner.spawn("acme", ScanOptions::default());
        assert!(handle.cancel());
        drop(blocker);

        let mut rx = handle.subscribe();
        assert!(matches!(handle.wait().await, Err(DedupeError::InvalidState(_))));
        assert_eq!(rx.borrow_and_update().phase, ScanPhase::Cancelled);
    }

    #[tokio::test]
    async fn finished_scan_cannot_be_cancelled() {
        let (scanner, _store) = scanner(vec![], vec![]).await;
        let handle = scanner.spawn("acme", ScanOptions::default());
        let mut rx = handle.subscribe();
        while !rx.borrow_and_update().phase.is_finished() {
            rx.changed().await.unwrap();
        }
        assert!(!handle.cancel());
        handle.wait().await.unwrap();
    }
}
