//! SimHash-based local embedder.
//!
//! Each token is hashed once per 64-dimension block with
//! [`std::hash::DefaultHasher`]; every bit of that hash adds +1 or -1 to
//! its dimension. The sum over all tokens is normalized to unit length, so
//! cosine similarity tracks the share of tokens two texts have in common.

use std::hash::{DefaultHasher, Hash, Hasher};

use async_trait::async_trait;

use super::{Embedder, EmbeddingError};

/// Tokens shorter than this carry too little signal and are dropped.
const MIN_TOKEN_CHARS: usize = 3;

/// Deterministic embedder that needs no API calls.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    /// A `HashEmbedder` with 384 dimensions.
    pub fn default_dimension() -> Self {
        Self::new(384)
    }

    fn compute_embedding(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        let lower = text.to_lowercase();
        let tokens = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.chars().count() >= MIN_TOKEN_CHARS);

        for token in tokens {
            for (block, chunk) in vector.chunks_mut(64).enumerate() {
                let mut hasher = DefaultHasher::new();
                token.hash(&mut hasher);
                block.hash(&mut hasher);
                let hash = hasher.finish();
                for (bit, val) in chunk.iter_mut().enumerate() {
                    if (hash >> bit) & 1 == 1 {
                        *val += 1.0;
                    } else {
                        *val -= 1.0;
                    }
                }
            }
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for val in &mut vector {
                *val /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.compute_embedding(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.compute_embedding(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "hash"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::cosine_similarity;

    #[tokio::test]
    async fn deterministic_same_text_same_embedding() {
        let embedder = HashEmbedder::default_dimension();
        let e1 = embedder.embed("bitcoin blockchain").await.unwrap();
        let e2 = embedder.embed("bitcoin blockchain").await.unwrap();
        assert_eq!(e1, e2);
    }

    #[tokio::test]
    async fn correct_dimension() {
        let embedder = HashEmbedder::new(128);
        assert_eq!(embedder.embed("test text").await.unwrap().len(), 128);
        assert_eq!(embedder.dimension(), 128);
    }

    #[tokio::test]
    async fn unit_length_norm() {
        let embedder = HashEmbedder::default_dimension();
        let emb = embedder.embed("the quick brown fox").await.unwrap();
        let norm: f32 = emb.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn empty_and_short_tokens_give_zero_vector() {
        let embedder = HashEmbedder::default_dimension();
        let emb = embedder.embed("a b ?!").await.unwrap();
        assert!(emb.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn case_and_punctuation_insensitive() {
        let embedder = HashEmbedder::default_dimension();
        let a = embedder.embed("Bitcoin, Blockchain!").await.unwrap();
        let b = embedder.embed("bitcoin blockchain").await.unwrap();
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn shared_tokens_raise_similarity() {
        let embedder = HashEmbedder::default_dimension();
        let query = embedder.embed("bitcoin blockchain analysis").await.unwrap();
        let close = embedder
            .embed("bitcoin price and blockchain analysis")
            .await
            .unwrap();
        let far = embedder.embed("sleep quality and stress").await.unwrap();
        let sim_close = cosine_similarity(&query, &close);
        let sim_far = cosine_similarity(&query, &far);
        assert!(sim_close > 0.5, "close similarity {sim_close}");
        assert!(sim_far < 0.3, "far similarity {sim_far}");
    }

    #[tokio::test]
    async fn batch_matches_single() {
        let embedder = HashEmbedder::new(64);
        let batch = embedder
            .embed_batch(&["one two three".to_string(), "four five".to_string()])
            .await
            .unwrap();
        assert_eq!(batch[0], embedder.embed("one two three").await.unwrap());
        assert_eq!(embedder.name(), "hash");
    }
}
