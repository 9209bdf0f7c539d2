//! The dedupe service: the public surface the CLI and HTTP API call into.
//!
//! Wires the document store, pair cache, merge log, scanner, and content
//! source together and implements merge and undo on top of them.
//!
//! # Failure policy
//!
//! Expected outcomes (unknown ids, wrong state, an undo blocked by a later
//! merge) come back as `success = false` results. Critical external steps
//! (the content update of a merge, the restores of an undo) fail the whole
//! operation before any internal state changes. Bookkeeping after a
//! successful external mutation never fails the operation; it is reported
//! in `warnings` instead. A pair cache whose backend cannot be read is
//! treated like a missing one.
//!
//! # Locking
//!
//! Merge and undo lock the two pages involved, then take the scan queue
//! lock around their document store writes. Scans hold the queue lock for
//! their whole run, so store writes of a merge never interleave with a scan.

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;

use dedupe_harness_core::embedding::EmbeddingProvider;
use dedupe_harness_core::error::{DedupeError, DedupeResult, ExternalSystem};
use dedupe_harness_core::models::{
    document_id_for, validate_org_id, Document, DuplicatePair, MergeOperation, NewMergeOperation,
};
use dedupe_harness_core::relationships::retire_document;
use dedupe_harness_core::store::{BlobStore, DocumentStore};
use dedupe_harness_core::undo::{check_undo, UndoCheck};

use crate::config::{Config, DetectionConfig};
use crate::content_source::{create_content_source, ContentSource};
use crate::db;
use crate::embedding::create_provider;
use crate::ingest::{self, document_from_page, IngestReport};
use crate::locks::KeyedLocks;
use crate::merge_log::MergeLog;
use crate::migrate;
use crate::pair_cache::{pairs_from_documents, PairCache, PairSummary};
use crate::scan::{ScanHandle, ScanOptions, ScanReport, Scanner};
use crate::sqlite_store::SqliteDocumentStore;
use crate::storage::create_blob_store;

/// Result of a merge.
#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub success: bool,
    pub message: String,
    /// The logged operation; `None` when the merge was refused or logging failed.
    pub operation: Option<MergeOperation>,
    pub warnings: Vec<String>,
}

impl MergeOutcome {
    fn refused(err: &DedupeError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            operation: None,
            warnings: Vec::new(),
        }
    }

    /// Turn leftover warnings into [`DedupeError::PartialFailure`].
    pub fn ensure_complete(self) -> DedupeResult<Self> {
        if self.warnings.is_empty() {
            Ok(self)
        } else {
            Err(DedupeError::PartialFailure {
                warnings: self.warnings,
            })
        }
    }
}

/// Result of an undo.
#[derive(Debug, Clone, Serialize)]
pub struct UndoOutcome {
    pub success: bool,
    pub message: String,
    pub requires_sequential_undo: bool,
    pub next_required_undo: Option<MergeOperation>,
    pub required_undos: Vec<MergeOperation>,
    /// Pairs found by the rescan that follows a successful undo.
    pub pairs_found: Option<usize>,
    pub warnings: Vec<String>,
}

impl UndoOutcome {
    fn refused(err: &DedupeError) -> Self {
        let next = match err {
            DedupeError::SequentialUndoRequired { blocking } => Some((**blocking).clone()),
            _ => None,
        };
        Self {
            success: false,
            message: err.to_string(),
            requires_sequential_undo: next.is_some(),
            next_required_undo: next,
            required_undos: Vec::new(),
            pairs_found: None,
            warnings: Vec::new(),
        }
    }

    fn blocked(check: UndoCheck) -> Self {
        Self {
            success: false,
            message: check
                .reason
                .unwrap_or_else(|| "undo blocked by later merges".into()),
            requires_sequential_undo: check.requires_sequential_undo,
            next_required_undo: check.next_required_undo,
            required_undos: check.required_undos,
            pairs_found: None,
            warnings: Vec::new(),
        }
    }

    pub fn ensure_complete(self) -> DedupeResult<Self> {
        if self.warnings.is_empty() {
            Ok(self)
        } else {
            Err(DedupeError::PartialFailure {
                warnings: self.warnings,
            })
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearReport {
    pub documents_removed: usize,
}

pub struct DedupeService {
    docs: Arc<dyn DocumentStore>,
    cache: Arc<PairCache>,
    merge_log: MergeLog,
    locks: KeyedLocks,
    content: Option<Arc<dyn ContentSource>>,
    embedder: Arc<dyn EmbeddingProvider>,
    scanner: Scanner,
}

fn store_err(e: anyhow::Error) -> DedupeError {
    DedupeError::external(ExternalSystem::DocumentStore, format!("{:#}", e))
}

fn content_err(e: anyhow::Error) -> DedupeError {
    DedupeError::external(ExternalSystem::ContentSource, format!("{:#}", e))
}

/// A storage backend failure while reading the pair cache reads as "no
/// cache" so callers fall back to document metadata.
fn cache_or_fallback<T>(org: &str, read: DedupeResult<Option<T>>) -> DedupeResult<Option<T>> {
    match read {
        Err(DedupeError::ExternalSystemFailure {
            system: ExternalSystem::StorageBackend,
            message,
        }) => {
            tracing::warn!(org, error = %message, "pair cache backend unavailable");
            Ok(None)
        }
        other => other,
    }
}

impl DedupeService {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        content: Option<Arc<dyn ContentSource>>,
        detection: DetectionConfig,
        concurrency: usize,
    ) -> Self {
        let cache = Arc::new(PairCache::new(blobs.clone()));
        let scanner = Scanner::new(
            docs.clone(),
            cache.clone(),
            embedder.clone(),
            detection,
            concurrency,
        );
        Self {
            docs,
            cache,
            merge_log: MergeLog::new(blobs),
            locks: KeyedLocks::new(),
            content,
            embedder,
            scanner,
        }
    }

    /// Build the service from configuration: SQLite document store, the
    /// configured blob backend, embedding provider, and content source.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::create_schema(&pool).await?;
        let blobs = create_blob_store(&config.storage)?;
        let embedder: Arc<dyn EmbeddingProvider> = Arc::from(
            create_provider(&config.embedding).context("failed to create embedding provider")?,
        );
        let content = create_content_source(config)?;

        Ok(Self::new(
            Arc::new(SqliteDocumentStore::new(pool)),
            blobs,
            embedder,
            content,
            config.detection.clone(),
            config.embedding.concurrency,
        ))
    }

    fn content_source(&self) -> DedupeResult<&Arc<dyn ContentSource>> {
        self.content
            .as_ref()
            .ok_or_else(|| DedupeError::InvalidState("no content source configured".into()))
    }

    pub async fn ingest(&self, org: &str) -> DedupeResult<IngestReport> {
        let source = self.content_source()?;
        let _corpus = self.scanner.lock_corpus(org).await;
        ingest::ingest(org, source.as_ref(), self.docs.as_ref()).await
    }

    pub async fn scan(&self, org: &str, options: ScanOptions) -> DedupeResult<ScanReport> {
        self.scanner.run(org, options).await
    }

    pub fn spawn_scan(&self, org: &str, options: ScanOptions) -> ScanHandle {
        self.scanner.spawn(org, options)
    }

    /// Pending duplicate pairs.
    ///
    /// Served from the pair cache. Without a usable cache the pairs are
    /// rebuilt from stored `similar_to` lists and stored embeddings.
    pub async fn list_duplicates(&self, org: &str) -> DedupeResult<Vec<DuplicatePair>> {
        validate_org_id(org)?;
        if let Some(pending) = cache_or_fallback(org, self.cache.list_pending(org).await)? {
            return Ok(pending);
        }
        self.pairs_from_metadata(org).await
    }

    async fn pairs_from_metadata(&self, org: &str) -> DedupeResult<Vec<DuplicatePair>> {
        tracing::info!(org, "no usable pair cache, rebuilding pairs from document metadata");
        let documents = self.docs.all_documents(org).await.map_err(store_err)?;
        Ok(pairs_from_documents(&documents, self.embedder.as_ref()).await)
    }

    pub async fn resolve_pair(&self, org: &str, pair_id: u64) -> DedupeResult<bool> {
        self.cache.resolve(org, pair_id).await
    }

    pub async fn summary(&self, org: &str) -> DedupeResult<PairSummary> {
        validate_org_id(org)?;
        if let Some(summary) = cache_or_fallback(org, self.cache.summary(org).await)? {
            return Ok(summary);
        }
        let pending = self.pairs_from_metadata(org).await?.len();
        Ok(PairSummary {
            pending,
            resolved: 0,
            total: pending,
        })
    }

    /// Merge `removed_id` into `kept_id`, writing `merged_content` to the
    /// kept page. Both ids are document ids.
    pub async fn apply_merge(
        &self,
        org: &str,
        kept_id: &str,
        removed_id: &str,
        merged_content: &str,
    ) -> DedupeResult<MergeOutcome> {
        match self.merge_checked(org, kept_id, removed_id, merged_content).await {
            Err(e) if e.is_expected() => {
                tracing::info!(org, kept_id, removed_id, reason = %e, "merge refused");
                Ok(MergeOutcome::refused(&e))
            }
            other => other,
        }
    }

    async fn merge_checked(
        &self,
        org: &str,
        kept_id: &str,
        removed_id: &str,
        merged_content: &str,
    ) -> DedupeResult<MergeOutcome> {
        validate_org_id(org)?;
        if kept_id == removed_id {
            return Err(DedupeError::InvalidState(
                "cannot merge a document with itself".into(),
            ));
        }
        let source = self.content_source()?.clone();
        let kept = self.require_document(org, kept_id).await?;
        let removed = self.require_document(org, removed_id).await?;

        let pages = [
            kept.metadata.source_id.as_str(),
            removed.metadata.source_id.as_str(),
        ];
        let _guard = self.locks.lock_many(org, &pages).await;
        // Re-read under the lock; a concurrent merge may have retired either side.
        let kept_ref = self.require_document(org, kept_id).await?.to_ref();
        let removed_ref = self.require_document(org, removed_id).await?.to_ref();

        // Critical: capture versions, then update the kept page.
        let kept_version = source
            .get_version(&kept_ref.source_id)
            .await
            .map_err(content_err)?;
        let removed_version = source
            .get_version(&removed_ref.source_id)
            .await
            .map_err(content_err)?;
        source
            .update_page(&kept_ref.source_id, &kept_ref.title, merged_content)
            .await
            .map_err(content_err)?;
        tracing::info!(org, kept = %kept_ref.source_id, removed = %removed_ref.source_id, "kept page updated");

        // Bookkeeping from here on.
        let mut warnings = Vec::new();

        if let Err(e) = source.delete_page(&removed_ref.source_id).await {
            warnings.push(format!("failed to delete removed page: {:#}", e));
        }

        let similarity = match self.cache.load(org).await {
            Ok(Some(pairs)) => pairs
                .iter()
                .find(|p| p.involves(kept_id) && p.involves(removed_id))
                .map(|p| p.similarity),
            _ => None,
        };

        let operation = match self
            .merge_log
            .append(NewMergeOperation {
                id: None,
                organization_id: org.to_string(),
                kept: kept_ref.clone(),
                removed: removed_ref.clone(),
                kept_pre_merge_version: kept_version,
                removed_pre_merge_version: removed_version,
                similarity,
                timestamp: None,
            })
            .await
        {
            Ok(op) => Some(op),
            Err(e) => {
                warnings.push(format!("failed to log merge operation, it cannot be undone: {}", e));
                None
            }
        };

        {
            let _corpus = self.scanner.lock_corpus(org).await;
            if let Err(e) = self.retire_in_store(org, kept_id, removed_id, merged_content).await {
                warnings.push(format!("failed to update document store: {}", e));
            }
            if let Err(e) = self.cache.resolve_involving(org, removed_id).await {
                warnings.push(format!("failed to refresh duplicate pair cache: {}", e));
            }
        }

        for warning in &warnings {
            tracing::warn!(org, kept = %kept_ref.source_id, "{}", warning);
        }

        Ok(MergeOutcome {
            success: true,
            message: format!("merged '{}' into '{}'", removed_ref.title, kept_ref.title),
            operation,
            warnings,
        })
    }

    /// Replace the kept document's content, drop edges to the removed one,
    /// and delete it. Callers hold the corpus lock.
    async fn retire_in_store(
        &self,
        org: &str,
        kept_id: &str,
        removed_id: &str,
        merged_content: &str,
    ) -> DedupeResult<()> {
        let documents = self.docs.all_documents(org).await.map_err(store_err)?;
        let mut rewrites = retire_document(&documents, removed_id);

        if !rewrites.iter().any(|d| d.id == kept_id) {
            let kept = documents
                .iter()
                .find(|d| d.id == kept_id)
                .ok_or_else(|| DedupeError::NotFound(format!("document {}", kept_id)))?;
            rewrites.push(kept.clone());
        }
        for doc in rewrites.iter_mut().filter(|d| d.id == kept_id) {
            doc.content = merged_content.to_string();
            doc.embedding = None;
        }

        self.docs
            .replace_documents(org, &rewrites)
            .await
            .map_err(store_err)?;
        self.docs
            .delete_documents(org, &[removed_id.to_string()])
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn require_document(&self, org: &str, id: &str) -> DedupeResult<Document> {
        self.docs
            .get_document(org, id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| DedupeError::NotFound(format!("document {}", id)))
    }

    async fn require_operation(&self, org: &str, merge_id: &str) -> DedupeResult<MergeOperation> {
        self.merge_log
            .get(org, merge_id)
            .await?
            .ok_or_else(|| DedupeError::NotFound(format!("merge operation {}", merge_id)))
    }

    /// Check the undo chain for `op`. Callers hold the page locks.
    async fn check_locked(&self, org: &str, op: &MergeOperation) -> DedupeResult<UndoCheck> {
        let chain = self
            .merge_log
            .chain_for_document(org, op.target_source_id())
            .await?;
        check_undo(op, &chain)
    }

    /// Whether `merge_id` may be undone right now.
    pub async fn validate_undo(&self, org: &str, merge_id: &str) -> DedupeResult<UndoCheck> {
        validate_org_id(org)?;
        let op = self.require_operation(org, merge_id).await?;
        let _guard = self
            .locks
            .lock_many(org, &[op.kept.source_id.as_str(), op.removed.source_id.as_str()])
            .await;
        let op = self.require_operation(org, merge_id).await?;
        self.check_locked(org, &op).await
    }

    /// Undo a merge: restore both pages, mark the operation undone, re-admit
    /// the documents, and rescan.
    pub async fn undo(&self, org: &str, merge_id: &str) -> DedupeResult<UndoOutcome> {
        match self.undo_checked(org, merge_id).await {
            Err(e) if e.is_expected() => {
                tracing::info!(org, operation_id = merge_id, reason = %e, "undo refused");
                Ok(UndoOutcome::refused(&e))
            }
            other => other,
        }
    }

    async fn undo_checked(&self, org: &str, merge_id: &str) -> DedupeResult<UndoOutcome> {
        validate_org_id(org)?;
        let source = self.content_source()?.clone();
        let op = self.require_operation(org, merge_id).await?;

        let guard = self
            .locks
            .lock_many(org, &[op.kept.source_id.as_str(), op.removed.source_id.as_str()])
            .await;
        // Re-read under the lock; the status may have changed while waiting.
        let op = self.require_operation(org, merge_id).await?;
        let check = self.check_locked(org, &op).await?;
        if !check.can_undo {
            tracing::info!(org, operation_id = merge_id, "undo blocked by later merges");
            return Ok(UndoOutcome::blocked(check));
        }

        // Critical: both restores must succeed before anything is marked.
        source
            .restore(&op.kept.source_id, &op.kept_pre_merge_version)
            .await
            .map_err(content_err)?;
        source
            .restore(&op.removed.source_id, &op.removed_pre_merge_version)
            .await
            .map_err(content_err)?;
        tracing::info!(org, operation_id = merge_id, "pages restored");

        let mut warnings = Vec::new();
        if let Err(e) = self.merge_log.mark_undone(org, merge_id).await {
            warnings.push(format!("failed to mark merge undone: {}", e));
        }
        {
            let _corpus = self.scanner.lock_corpus(org).await;
            for source_id in [&op.kept.source_id, &op.removed.source_id] {
                if let Err(e) = self.readmit(org, source.as_ref(), source_id).await {
                    warnings.push(format!("failed to re-admit '{}': {}", source_id, e));
                }
            }
        }
        drop(guard);

        let pairs_found = match self.scanner.run(org, ScanOptions::default()).await {
            Ok(report) => Some(report.pairs_found),
            Err(e) => {
                warnings.push(format!("rescan after undo failed: {}", e));
                None
            }
        };

        for warning in &warnings {
            tracing::warn!(org, operation_id = merge_id, "{}", warning);
        }

        Ok(UndoOutcome {
            success: true,
            message: format!(
                "restored '{}' and '{}'",
                op.kept.title, op.removed.title
            ),
            requires_sequential_undo: false,
            next_required_undo: None,
            required_undos: Vec::new(),
            pairs_found,
            warnings,
        })
    }

    /// Pull one page back into the document store.
    async fn readmit(&self, org: &str, source: &dyn ContentSource, source_id: &str) -> DedupeResult<()> {
        let page = source
            .fetch_page(source_id)
            .await
            .map_err(content_err)?
            .ok_or_else(|| DedupeError::NotFound(format!("page {}", source_id)))?;
        let existing = self
            .docs
            .get_document(org, &document_id_for(source_id))
            .await
            .map_err(store_err)?;
        if let Some(doc) = document_from_page(&page, existing.as_ref()) {
            self.docs
                .upsert_documents(org, &[doc])
                .await
                .map_err(store_err)?;
        }
        Ok(())
    }

    /// All merges of the organization, newest first.
    pub async fn merge_history(&self, org: &str) -> DedupeResult<Vec<MergeOperation>> {
        self.merge_log.history(org).await
    }

    /// Drop the organization's corpus and pair cache. The merge log is kept.
    pub async fn clear(&self, org: &str) -> DedupeResult<ClearReport> {
        validate_org_id(org)?;
        let documents_removed = self.docs.clear(org).await.map_err(store_err)?;
        self.cache.clear(org).await?;
        tracing::info!(org, documents_removed, "corpus cleared");
        Ok(ClearReport { documents_removed })
    }
}
