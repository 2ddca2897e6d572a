//! Embedding trait and the built-in local embedder.
//!
//! The router only needs [`Embedder`]; [`hash_embedder::HashEmbedder`] is a
//! deterministic SimHash implementation that needs no network or model
//! files. Remote embedders can be plugged in through the same trait.

pub mod hash_embedder;

use async_trait::async_trait;
use thiserror::Error;

pub use hash_embedder::HashEmbedder;

/// Errors that can occur during embedding generation.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// The input text could not be processed.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The embedder is unreachable or failed internally.
    #[error("embedder unavailable: {0}")]
    Unavailable(String),
}

/// Trait for generating vector embeddings from text.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate a vector embedding for the given text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Batch embed multiple texts.
    ///
    /// Default implementation calls [`embed`](Embedder::embed) sequentially.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// Dimensionality of the produced vectors.
    fn dimension(&self) -> usize;

    /// Identifier used in logs.
    fn name(&self) -> &str {
        "unknown"
    }
}

/// Cosine similarity of two vectors; 0.0 for mismatched lengths or zero
/// vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}
