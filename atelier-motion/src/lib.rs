//! Motion corpus and similarity matching for the Atelier installation.
//!
//! Loads a tabular corpus of motion descriptions with optional precomputed
//! embeddings, lazily embeds the rows that need it, and resolves free-text
//! motion summaries to the closest corpus entry by cosine similarity.

#![warn(clippy::all)]

pub mod corpus;
pub mod embeddings;
pub mod matcher;

pub use corpus::{EmbeddingSource, MotionCorpus, MotionEntry};
pub use embeddings::{EmbeddingProvider, OpenAiEmbedding};
pub use matcher::{cosine_similarity, MotionMatch, SimilarityMatcher};
