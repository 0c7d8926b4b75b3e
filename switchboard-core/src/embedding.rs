//! Embedding contract and the built-in deterministic embedder.
//!
//! The embedding model is an external collaborator: the core consumes a
//! pure function `embed(text) -> unit vector of dimension 384`. The proxy
//! must not accept traffic until `ready()` has completed.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Fixed embedding dimension shared with the vector column in storage.
pub const EMBEDDING_DIM: usize = 384;

/// Produces unit vectors for prompt texts. Injected as `Arc<dyn Embedder>`.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `text` into a unit vector of [`EMBEDDING_DIM`] dimensions.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Complete any warm-up. Called once before the proxy starts serving.
    async fn ready(&self) -> Result<()> {
        Ok(())
    }
}

/// Deterministic signed feature-hashing embedder.
///
/// Lowercased word tokens are hashed into the 384-dimension space with a
/// sign bit, then the vector is L2-normalised. Identical prompts embed
/// identically and prompts sharing most tokens land close in cosine space,
/// which is what the semantic cache needs from a model-free default.
#[derive(Debug, Default, Clone)]
pub struct HashEmbedder;

impl HashEmbedder {
    pub fn new() -> Self {
        Self
    }

    fn embed_sync(text: &str) -> Vec<f32> {
        let mut acc = vec![0.0f32; EMBEDDING_DIM];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let hash = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
                digest[7],
            ]);
            let index = (hash % EMBEDDING_DIM as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            acc[index] += sign;
        }
        normalize(&mut acc);
        acc
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(Self::embed_sync(text))
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Cosine distance between two vectors: `1 - cos(a, b)`. Returns the
/// maximum distance for zero-norm inputs so empty prompts never match.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f32::EPSILON {
        return 1.0;
    }
    (1.0 - dot / denom).clamp(0.0, 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_embedding_is_unit_and_deterministic() {
        let embedder = HashEmbedder::new();
        let a = embedder.embed("fetch the weather report").await.unwrap();
        let b = embedder.embed("fetch the weather report").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIM);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_similar_prompts_are_close() {
        let embedder = HashEmbedder::new();
        let a = embedder
            .embed("please fetch the weather report for tomorrow")
            .await
            .unwrap();
        let b = embedder
            .embed("fetch the weather report for tomorrow please")
            .await
            .unwrap();
        let c = embedder
            .embed("compile the quarterly revenue spreadsheet")
            .await
            .unwrap();
        assert!(cosine_distance(&a, &b) < 0.10);
        assert!(cosine_distance(&a, &c) > 0.5);
    }

    #[tokio::test]
    async fn test_empty_text_never_matches() {
        let embedder = HashEmbedder::new();
        let empty = embedder.embed("").await.unwrap();
        let other = embedder.embed("anything").await.unwrap();
        assert_eq!(cosine_distance(&empty, &other), 1.0);
    }

    #[test]
    fn test_cosine_distance_bounds() {
        let a = [1.0, 0.0];
        let b = [0.0, 1.0];
        let c = [-1.0, 0.0];
        assert!((cosine_distance(&a, &a) - 0.0).abs() < 1e-6);
        assert!((cosine_distance(&a, &b) - 1.0).abs() < 1e-6);
        assert!((cosine_distance(&a, &c) - 2.0).abs() < 1e-6);
    }
}
