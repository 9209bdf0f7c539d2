//! Duplicate pair cache.
//!
//! A point-in-time materialization of one scan's pairs, stored as a single
//! JSON blob per organization (`{org}/duplicate_pairs.json`). Reading it
//! never recomputes similarity. When the blob is missing or unreadable the
//! caller rebuilds pairs from document metadata with [`pairs_from_documents`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dedupe_harness_core::embedding::EmbeddingProvider;
use dedupe_harness_core::error::{DedupeError, DedupeResult, ExternalSystem};
use dedupe_harness_core::models::{Document, DuplicatePair, PairStatus, SimilarPair};
use dedupe_harness_core::relationships::pairs_from_metadata;
use dedupe_harness_core::similarity::pair_score;
use dedupe_harness_core::store::BlobStore;

use crate::locks::KeyedLocks;
use crate::storage::pair_cache_key;

const CACHE_LOCK: &str = "duplicate_pairs";

#[derive(Debug, Default, Serialize, Deserialize)]
struct PairCacheBlob {
    #[serde(default)]
    generated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pairs: Vec<DuplicatePair>,
}

/// Counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PairSummary {
    pub pending: usize,
    pub resolved: usize,
    pub total: usize,
}

pub struct PairCache {
    blobs: Arc<dyn BlobStore>,
    locks: KeyedLocks,
}

fn storage_err(e: anyhow::Error) -> DedupeError {
    DedupeError::external(ExternalSystem::StorageBackend, format!("{:#}", e))
}

impl PairCache {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            locks: KeyedLocks::new(),
        }
    }

    /// Replace the organization's cache with `pairs`, all `pending`.
    ///
    /// Returns the number of pairs written.
    pub async fn rebuild(
        &self,
        org: &str,
        pairs: &[SimilarPair],
        documents: &[Document],
    ) -> DedupeResult<usize> {
        let key = pair_cache_key(org)?;
        let cached = build_duplicate_pairs(pairs, documents);
        let count = cached.len();

        let _guard = self.locks.lock(org, CACHE_LOCK).await;
        self.write(
            &key,
            &PairCacheBlob {
                generated_at: Some(Utc::now()),
                pairs: cached,
            },
        )
        .await?;
        tracing::info!(org, pairs = count, "duplicate pair cache rebuilt");
        Ok(count)
    }

    /// All cached pairs, or `None` when there is no usable cache.
    pub async fn load(&self, org: &str) -> DedupeResult<Option<Vec<DuplicatePair>>> {
        let key = pair_cache_key(org)?;
        Ok(self.read(org, &key).await?.map(|blob| blob.pairs))
    }

    /// Pairs not yet resolved, or `None` when there is no usable cache.
    pub async fn list_pending(&self, org: &str) -> DedupeResult<Option<Vec<DuplicatePair>>> {
        Ok(self.load(org).await?.map(|pairs| {
            pairs
                .into_iter()
                .filter(|p| p.status != PairStatus::Resolved)
                .collect()
        }))
    }

    /// Mark a pair resolved.
    ///
    /// Returns `true` only when a pending pair flipped; unknown or already
    /// resolved ids return `false`.
    pub async fn resolve(&self, org: &str, pair_id: u64) -> DedupeResult<bool> {
        let key = pair_cache_key(org)?;
        let _guard = self.locks.lock(org, CACHE_LOCK).await;

        let Some(mut blob) = self.read(org, &key).await? else {
            return Ok(false);
        };
        let Some(pair) = blob.pairs.iter_mut().find(|p| p.id == pair_id) else {
            return Ok(false);
        };
        if pair.status == PairStatus::Resolved {
            return Ok(false);
        }
        pair.status = PairStatus::Resolved;
        pair.resolved_at = Some(Utc::now());
        self.write(&key, &blob).await?;
        tracing::info!(org, pair_id, "duplicate pair resolved");
        Ok(true)
    }

    /// Resolve every pending pair that involves `document_id`.
    pub async fn resolve_involving(&self, org: &str, document_id: &str) -> DedupeResult<usize> {
        let key = pair_cache_key(org)?;
        let _guard = self.locks.lock(org, CACHE_LOCK).await;

        let Some(mut blob) = self.read(org, &key).await? else {
            return Ok(0);
        };
        let now = Utc::now();
        let mut changed = 0;
        for pair in blob.pairs.iter_mut() {
            if pair.status == PairStatus::Pending && pair.involves(document_id) {
                pair.status = PairStatus::Resolved;
                pair.resolved_at = Some(now);
                changed += 1;
            }
        }
        if changed > 0 {
            self.write(&key, &blob).await?;
        }
        Ok(changed)
    }

    pub async fn summary(&self, org: &str) -> DedupeResult<Option<PairSummary>> {
        Ok(self.load(org).await?.map(|pairs| {
            let resolved = pairs
                .iter()
                .filter(|p| p.status == PairStatus::Resolved)
                .count();
            PairSummary {
                pending: pairs.len() - resolved,
                resolved,
                total: pairs.len(),
            }
        }))
    }

    pub async fn clear(&self, org: &str) -> DedupeResult<()> {
        let key = pair_cache_key(org)?;
        let _guard = self.locks.lock(org, CACHE_LOCK).await;
        self.blobs.delete(&key).await.map_err(storage_err)
    }

    async fn read(&self, org: &str, key: &str) -> DedupeResult<Option<PairCacheBlob>> {
        let Some(bytes) = self.blobs.get(key).await.map_err(storage_err)? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) => {
                tracing::warn!(org, error = %e, "duplicate pair cache is unreadable, ignoring it");
                Ok(None)
            }
        }
    }

    async fn write(&self, key: &str, blob: &PairCacheBlob) -> DedupeResult<()> {
        let bytes = serde_json::to_vec_pretty(blob)
            .map_err(|e| DedupeError::external(ExternalSystem::StorageBackend, e))?;
        self.blobs.put(key, bytes).await.map_err(storage_err)
    }
}

/// Turn engine output into cache entries.
///
/// Sorted by score descending, ties by document ids, then numbered from 1.
/// Pairs naming a document that is not in `documents` are dropped.
pub fn build_duplicate_pairs(pairs: &[SimilarPair], documents: &[Document]) -> Vec<DuplicatePair> {
    let by_id: HashMap<&str, &Document> = documents.iter().map(|d| (d.id.as_str(), d)).collect();

    let mut sorted: Vec<&SimilarPair> = pairs.iter().collect();
    sorted.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.key().cmp(&b.key()))
    });

    let mut out = Vec::with_capacity(sorted.len());
    for pair in sorted {
        let (Some(a), Some(b)) = (by_id.get(pair.doc_a.as_str()), by_id.get(pair.doc_b.as_str()))
        else {
            continue;
        };
        out.push(DuplicatePair {
            id: out.len() as u64 + 1,
            doc_a: a.to_ref(),
            doc_b: b.to_ref(),
            similarity: pair.score,
            status: PairStatus::Pending,
            resolved_at: None,
        });
    }
    out
}

/// Rebuild pairs from stored `similar_to` lists, without a scan.
///
/// Scores come from stored embeddings. A document missing its embedding is
/// embedded again; if that fails too the pair is kept with score `0.0`.
pub async fn pairs_from_documents(
    documents: &[Document],
    embedder: &dyn EmbeddingProvider,
) -> Vec<DuplicatePair> {
    let by_id: HashMap<&str, &Document> = documents.iter().map(|d| (d.id.as_str(), d)).collect();
    let mut fresh: HashMap<String, Option<Vec<f32>>> = HashMap::new();

    let mut scored = Vec::new();
    for (a, b) in pairs_from_metadata(documents) {
        let (Some(doc_a), Some(doc_b)) = (by_id.get(a.as_str()), by_id.get(b.as_str())) else {
            continue;
        };
        let emb_a = embedding_for(doc_a, embedder, &mut fresh).await;
        let emb_b = embedding_for(doc_b, embedder, &mut fresh).await;
        let score = match (emb_a, emb_b) {
            (Some(x), Some(y)) => pair_score(&x, &y),
            _ => {
                tracing::warn!(doc_a = %a, doc_b = %b, "no embedding for pair, using score 0.0");
                0.0
            }
        };
        scored.push(SimilarPair {
            doc_a: a,
            doc_b: b,
            score,
        });
    }

    build_duplicate_pairs(&scored, documents)
}

async fn embedding_for(
    doc: &Document,
    embedder: &dyn EmbeddingProvider,
    fresh: &mut HashMap<String, Option<Vec<f32>>>,
) -> Option<Vec<f32>> {
    if let Some(ref e) = doc.embedding {
        return Some(e.clone());
    }
    if let Some(cached) = fresh.get(&doc.id) {
        return cached.clone();
    }
    let result = match embedder.embed(&doc.content).await {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(document_id = %doc.id, error = %e, "re-embedding failed");
            None
        }
    };
    fresh.insert(doc.id.clone(), result.clone());
    result
}
