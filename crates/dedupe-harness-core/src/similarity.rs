//! Brute-force pairwise similarity.
//!
//! Every eligible document is compared against every other one, O(n²·d).
//! That is fine for corpora in the thousands; it is not an ANN index.

use crate::models::{Document, SimilarPair};

/// Default inclusion threshold for a pair.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.65;

/// Default minimum content length for a document to take part in a scan.
pub const DEFAULT_MIN_CONTENT_CHARS: usize = 50;

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors of
/// different lengths, or a zero-norm vector.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Similarity score used for pairs: cosine clamped to `[0, 1]`.
pub fn pair_score(a: &[f32], b: &[f32]) -> f32 {
    cosine_similarity(a, b).clamp(0.0, 1.0)
}

/// Whether a document takes part in comparisons at all.
pub fn is_eligible(doc: &Document, min_content_chars: usize) -> bool {
    doc.embedding.as_ref().is_some_and(|e| !e.is_empty())
        && doc.content.chars().count() >= min_content_chars
}

/// Find every unordered pair of eligible documents scoring `>= threshold`.
///
/// Documents without an embedding, or shorter than `min_content_chars`, are
/// neither a source nor a target of any pair. Each unordered pair appears at
/// most once, with `doc_a` the earlier document in input order. Output
/// order is unspecified; callers sort.
pub fn find_similar_pairs(
    documents: &[Document],
    threshold: f32,
    min_content_chars: usize,
) -> Vec<SimilarPair> {
    let eligible: Vec<(&str, &[f32])> = documents
        .iter()
        .filter(|d| is_eligible(d, min_content_chars))
        .filter_map(|d| d.embedding.as_deref().map(|e| (d.id.as_str(), e)))
        .collect();

    let mut pairs = Vec::new();
    for i in 0..eligible.len() {
        let (id_a, emb_a) = eligible[i];
        for &(id_b, emb_b) in &eligible[i + 1..] {
            if id_a == id_b {
                continue;
            }
            let score = pair_score(emb_a, emb_b);
            if score >= threshold {
                pairs.push(SimilarPair {
                    doc_a: id_a.to_string(),
                    doc_b: id_b.to_string(),
                    score,
                });
            }
        }
    }
    pairs
}
