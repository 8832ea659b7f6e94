//! Similarity Scorer: edit-distance confidence between two field names.

use rapidfuzz::distance::levenshtein;

use crate::data::normalize_field_name;

/// Match confidence in [0, 1] between two field names.
///
/// Names are case/underscore/hyphen/whitespace-normalized, then scored as
/// `1 - levenshtein(a, b) / max(len(a), len(b))`. Two empty strings score
/// 1.0. Symmetric and deterministic, which keeps mapping fixtures
/// reproducible.
pub fn similarity(a: &str, b: &str) -> f64 {
    let left = normalize_field_name(a);
    let right = normalize_field_name(b);
    levenshtein::normalized_similarity(left.chars(), right.chars())
}
