//! Deterministic content embeddings.
//!
//! The default [`HashEmbedder`] derives a unit vector from the SHA-256
//! of the lowercased, trimmed content: each digest byte maps to `[0,1]`
//! by division by 255, repeated to fill the configured dimension count.
//! It carries no semantics, but it is stable, cheap, and sufficient for
//! the retrieval contract; a real embedding model can be swapped in
//! behind [`Embedder`] as long as it stays deterministic within a
//! deployment and returns unit vectors.

use sha2::{Digest, Sha256};

/// Default vector dimension count.
pub const DEFAULT_DIMENSIONS: usize = 128;

/// Produces fixed-dimension unit vectors from text.
pub trait Embedder: Send + Sync {
    /// Embed `text` into a unit vector of [`dimensions`](Self::dimensions) length.
    fn embed(&self, text: &str) -> Vec<f32>;

    /// Vector length produced by this embedder.
    fn dimensions(&self) -> usize;
}

/// SHA-256 byte-expansion embedder.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    /// Create an embedder with the given dimension count.
    pub fn new(dimensions: usize) -> Self {
        assert!(dimensions > 0, "embedding dimensions must be positive");
        Self { dimensions }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSIONS)
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut hasher = Sha256::new();
        hasher.update(text.trim().to_lowercase().as_bytes());
        let digest = hasher.finalize();

        let mut vector: Vec<f32> = digest
            .iter()
            .cycle()
            .take(self.dimensions)
            .map(|b| f32::from(*b) / 255.0)
            .collect();
        normalize(&mut vector);
        vector
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Scale `vector` to unit length. A zero vector is left untouched.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity of two equal-length vectors, in `[-1,1]`.
///
/// Mismatched lengths or zero vectors score 0.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}
