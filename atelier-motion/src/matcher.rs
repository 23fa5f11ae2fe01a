//! Nearest-neighbor lookup over the motion corpus.

use crate::corpus::{MotionCorpus, MotionEntry};
use crate::embeddings::EmbeddingProvider;
use std::sync::Arc;

/// Cosine similarity of two equal-length vectors.
///
/// Degenerate inputs (zero magnitude, length mismatch) score -1.0, a
/// guaranteed losing score that never wins the arg-max.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return -1.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return -1.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// A corpus entry paired with its similarity to a query.
#[derive(Debug, Clone)]
pub struct MotionMatch {
    pub entry: MotionEntry,
    pub score: f32,
}

/// Resolves free-text motion descriptions to the closest corpus entry.
pub struct SimilarityMatcher {
    corpus: Arc<MotionCorpus>,
    provider: Arc<dyn EmbeddingProvider>,
}

impl SimilarityMatcher {
    pub fn new(corpus: Arc<MotionCorpus>, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { corpus, provider }
    }

    /// Find the corpus entry closest to the query text.
    ///
    /// Returns `None` when the query is empty, the corpus is empty, or no
    /// row carries a valid vector. Rows without vectors never compete.
    pub async fn find_closest(&self, text: &str) -> anyhow::Result<Option<MotionMatch>> {
        let query = text.trim();
        if query.is_empty() {
            return Ok(None);
        }

        let candidates: Vec<MotionEntry> = self
            .corpus
            .entries()
            .await
            .into_iter()
            .filter(|e| e.has_valid_embedding())
            .collect();

        if candidates.is_empty() {
            return Ok(None);
        }

        let query_vector = self.provider.embed_one(query).await?;

        let mut best: Option<MotionMatch> = None;
        for entry in candidates {
            let score = match &entry.embedding {
                Some(vector) => cosine_similarity(&query_vector, vector),
                None => continue,
            };

            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(MotionMatch { entry, score });
            }
        }

        Ok(best)
    }
}
