//! Result fusion across retrieval strategies.
//!
//! Each strategy (keyword, vector, HyDE) produces its own candidate list.
//! [`fuse`] merges them into one ranked list:
//!
//! 1. Walk batches in the order given (discovery precedence).
//! 2. Merge by chunk id: keep the highest score seen, keep the origin of
//!    the first batch that surfaced the chunk.
//! 3. Sort by score (desc), then chunk id (asc) for reproducible ties.
//! 4. Truncate to `top_k`.
//!
//! Callers pass keyword hits first so an exact keyword match keeps its
//! `keyword` tag even when vector search also found the same chunk.

use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::models::{Origin, RetrievedFragment};
use crate::store::ChunkCandidate;

/// Merge per-strategy candidate lists into one ranked, deduplicated list.
pub fn fuse(batches: Vec<(Origin, Vec<ChunkCandidate>)>, top_k: usize) -> Vec<RetrievedFragment> {
    let mut merged: HashMap<i64, (ChunkCandidate, Origin)> = HashMap::new();

    for (origin, candidates) in batches {
        for cand in candidates {
            match merged.entry(cand.chunk_id) {
                Entry::Occupied(mut e) => {
                    let (kept, _) = e.get_mut();
                    if cand.score > kept.score {
                        kept.score = cand.score;
                    }
                }
                Entry::Vacant(e) => {
                    e.insert((cand, origin));
                }
            }
        }
    }

    let mut ranked: Vec<(ChunkCandidate, Origin)> = merged.into_values().collect();
    ranked.sort_by(|a, b| {
        b.0.score
            .partial_cmp(&a.0.score)
            .unwrap_or(Ordering::Equal)
            .then(a.0.chunk_id.cmp(&b.0.chunk_id))
    });
    ranked.truncate(top_k);

    ranked
        .into_iter()
        .map(|(c, origin)| RetrievedFragment {
            chunk_id: Some(c.chunk_id),
            chunk_text: c.text,
            table_name: c.unit_name,
            row_id: c.row_id,
            similarity: clamp_unit(c.score),
            origin,
            rerank_score: None,
        })
        .collect()
}

/// Highest similarity in a fused list, `0.0` when empty.
pub fn max_similarity(fragments: &[RetrievedFragment]) -> f64 {
    fragments
        .iter()
        .map(|f| f.similarity)
        .fold(0.0, f64::max)
}

/// Clamp a raw score (cosine may be negative) into `[0, 1]`.
pub fn clamp_unit(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}
