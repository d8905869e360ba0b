//! Merge suggestions from cluster centroid similarity.

use serde::Serialize;

use super::embedding::cosine_similarity;

/// Two clusters that probably show the same person.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeSuggestion {
    pub first: i64,
    pub second: i64,
    pub similarity: f32,
}

impl MergeSuggestion {
    pub fn distance(&self) -> f32 {
        1.0 - self.similarity
    }
}

/// Rank every centroid pair within `threshold` cosine distance, most similar
/// first, keeping at most `top_k`.
///
/// Pairs are formed in input order, so `first` always precedes `second` in
/// `centroids`.
pub fn suggest_merges(centroids: &[(i64, Vec<f32>)], threshold: f32, top_k: usize) -> Vec<MergeSuggestion> {
    let mut suggestions = Vec::new();

    for (i, (first, a)) in centroids.iter().enumerate() {
        for (second, b) in &centroids[i + 1..] {
            let similarity = cosine_similarity(a, b);
            if 1.0 - similarity <= threshold {
                suggestions.push(MergeSuggestion {
                    first: *first,
                    second: *second,
                    similarity,
                });
            }
        }
    }

    suggestions.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    suggestions.truncate(top_k);
    suggestions
}
