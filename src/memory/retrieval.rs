//! Hybrid semantic + lexical ranking for memory retrieval.
//!
//! Each candidate is scored as
//! `(0.7 * semantic + 0.3 * lexical) * importance * recency * type_boost`
//! where `semantic` is the clamped cosine against the query vector,
//! `lexical` is the Jaccard overlap of lowercased token sets, recency
//! decays linearly over 30 days (floored at 0.1), and the type boost
//! favors working and semantic memory.

use super::embedding::cosine;
use super::MemoryItem;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Jaccard similarity of the lowercased whitespace token sets.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let ta: HashSet<String> = a.to_lowercase().split_whitespace().map(str::to_string).collect();
    let tb: HashSet<String> = b.to_lowercase().split_whitespace().map(str::to_string).collect();
    if ta.is_empty() && tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    intersection as f64 / union as f64
}

/// Recency boost: linear decay over 30 days, floored at 0.1.
pub fn recency_boost(created: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_days = (now - created).num_seconds().max(0) as f64 / 86_400.0;
    (1.0 - age_days / 30.0).max(0.1)
}

/// Full hybrid score for one candidate.
pub fn score(
    item: &MemoryItem,
    item_vector: &[f32],
    query_vector: &[f32],
    query_text: &str,
    now: DateTime<Utc>,
) -> f64 {
    let semantic = f64::from(cosine(query_vector, item_vector)).clamp(0.0, 1.0);
    let lexical = jaccard(query_text, &item.content);
    let combined = 0.7 * semantic + 0.3 * lexical;

    combined * item.importance * recency_boost(item.created, now) * item.kind.type_boost()
}
