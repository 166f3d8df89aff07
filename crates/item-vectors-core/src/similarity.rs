//! Cosine similarity and deterministic result ranking.
//!
//! Backends that score in-process (the in-memory store) call
//! [`rank_candidates`]; backends that score remotely (SQL, k-NN) feed their
//! hits through [`finalize`] so every backend applies the same threshold,
//! ordering and cut.
//!
//! # Ordering
//!
//! 1. similarity, descending
//! 2. chunk `index`, ascending
//! 3. `created_at`, ascending
//! 4. chunk id, ascending (total order for otherwise identical rows)

use std::cmp::Ordering;

use crate::chunk::check_dimension;
use crate::error::{Error, Result};
use crate::models::{ItemChunk, RankedChunk, SearchQuery};

/// Cosine similarity of two vectors, in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or a
/// zero-magnitude operand.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f64::EPSILON {
        return 0.0;
    }

    (dot / denom).clamp(-1.0, 1.0)
}

/// Cosine distance, `1 - cosine_similarity`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    1.0 - cosine_similarity(a, b)
}

pub fn compare_ranked(a: &RankedChunk, b: &RankedChunk) -> Ordering {
    b.similarity
        .partial_cmp(&a.similarity)
        .unwrap_or(Ordering::Equal)
        .then(a.chunk.index.cmp(&b.chunk.index))
        .then(a.chunk.created_at.cmp(&b.chunk.created_at))
        .then_with(|| a.chunk.id.cmp(&b.chunk.id))
}

/// Check a query against the dimension of the group it targets.
pub fn validate_query(group_dimension: usize, query: &SearchQuery) -> Result<()> {
    check_dimension(group_dimension, query.vector.len())?;
    if query.vector.iter().any(|v| !v.is_finite()) {
        return Err(Error::Configuration(
            "query vector has a non-finite component".to_string(),
        ));
    }
    if !query.threshold.is_finite() {
        return Err(Error::Configuration(format!(
            "score threshold must be finite, got {}",
            query.threshold
        )));
    }
    Ok(())
}

/// Score and rank stored chunks against `query`.
///
/// Group, item and metadata predicates are applied before scoring and
/// before the top-K cut, so excluded chunks never take a slot.
pub fn rank_candidates<'a, I>(candidates: I, query: &SearchQuery) -> Vec<RankedChunk>
where
    I: IntoIterator<Item = &'a ItemChunk>,
{
    let hits = candidates
        .into_iter()
        .filter(|c| c.group_id == query.group_id)
        .filter(|c| query.includes_item(&c.item_id))
        .filter(|c| query.filter.matches(c.metadata.as_ref()))
        .map(|c| RankedChunk {
            chunk: c.view(),
            similarity: cosine_similarity(&query.vector, &c.embedding),
        })
        .collect();
    finalize(hits, query)
}

/// Apply threshold, canonical ordering, and `top_k` to pre-scored hits.
pub fn finalize(mut hits: Vec<RankedChunk>, query: &SearchQuery) -> Vec<RankedChunk> {
    hits.retain(|h| h.similarity >= query.threshold);
    hits.sort_by(compare_ranked);
    hits.truncate(query.top_k);
    hits
}
