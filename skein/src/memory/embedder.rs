//! Embedder seam for the memory surface.
//!
//! The store contract takes raw vectors; this trait produces them. The
//! provider adapter bridges any [`EmbeddingProvider`] into it, and
//! [`MockEmbedder`] gives tests deterministic vectors.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::provider::EmbeddingProvider;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, StoreError>;

    fn dimensions(&self) -> usize;
}

/// Bridges an [`EmbeddingProvider`] into the memory layer.
pub struct ProviderEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
}

impl ProviderEmbedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Embedder for ProviderEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, StoreError> {
        let mut vectors = self
            .provider
            .embed(&[text.to_string()])
            .await
            .map_err(|e| StoreError::Backend(format!("embedding provider: {}", e)))?;
        vectors
            .pop()
            .ok_or_else(|| StoreError::Backend("embedding provider returned no vector".into()))
    }

    fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }
}

/// Deterministic embedder for tests: identical text maps to identical
/// vectors, and fixtures can pin exact vectors per text.
#[derive(Default)]
pub struct MockEmbedder {
    fixed: HashMap<String, Vec<f32>>,
    dimensions: usize,
}

impl MockEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            fixed: HashMap::new(),
            dimensions,
        }
    }

    /// Pins the vector returned for an exact text.
    pub fn with_fixed(mut self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.fixed.insert(text.into(), vector);
        self
    }

    fn hash_embed(&self, text: &str) -> Vec<f32> {
        // FNV-style rolling hash spread over the dimensions, normalized.
        let mut v = vec![0.0f32; self.dimensions.max(1)];
        let mut h: u64 = 0xcbf29ce484222325;
        for (i, byte) in text.bytes().enumerate() {
            h ^= byte as u64;
            h = h.wrapping_mul(0x100000001b3);
            let slot = (h as usize + i) % v.len();
            v[slot] += ((h % 1000) as f32 / 500.0) - 1.0;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        } else {
            v[0] = 1.0;
        }
        v
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, StoreError> {
        if let Some(vector) = self.fixed.get(text) {
            return Ok(vector.clone());
        }
        Ok(self.hash_embed(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::cosine_similarity;

    #[tokio::test]
    async fn identical_text_embeds_identically() {
        let embedder = MockEmbedder::new(8);
        let a = embedder.embed("the same text").await.unwrap();
        let b = embedder.embed("the same text").await.unwrap();
        assert_eq!(a, b);
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn fixed_vectors_override_hashing() {
        let embedder = MockEmbedder::new(2).with_fixed("pinned", vec![0.0, 1.0]);
        assert_eq!(embedder.embed("pinned").await.unwrap(), vec![0.0, 1.0]);
    }
}
