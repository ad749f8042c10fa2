//! Text-to-vector embedding pipeline.
//!
//! [`encoder`] wraps the ONNX session and tokenizer, [`cache`] is the
//! two-tier (LRU + persistent) embed cache, and [`service`] glues them into
//! the [`Embedder`](service::Embedder) with background warm-up, idle unload,
//! and the deterministic fallback path.

pub mod cache;
pub mod encoder;
pub mod service;

use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use unicode_normalization::UnicodeNormalization;

use crate::error::EmbeddingError;
use crate::vector;

/// Number of dimensions in the embedding vectors (all-MiniLM-L6-v2).
pub const EMBEDDING_DIM: usize = 384;

/// Trait for embedding text into vectors.
///
/// Implementations produce L2-normalized vectors of exactly [`EMBEDDING_DIM`]
/// dimensions, deterministically: the same (NFC-normalized) text always maps
/// to the same vector. All methods are synchronous.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text string into a unit vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed a batch of text strings, results in input order.
    /// Implementations may override for batched inference.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Return the number of dimensions this provider produces.
    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }
}

/// NFC-normalize text. Applied before hashing and before storage so that
/// visually identical unicode sequences share one identity.
pub fn nfc(text: &str) -> String {
    text.nfc().collect()
}

/// Deterministic hash-derived embedding for the opt-in fallback mode.
///
/// Expands `blake2b(text ∥ block_index)` into 384 floats and L2-normalizes.
/// Fallback vectors carry no semantics; they exist so an engine with a
/// broken encoder still satisfies determinism and the unit-norm invariant.
/// They are never written to the persistent embed cache.
pub fn fallback_embedding(text: &str) -> Vec<f32> {
    const BLOCK_BYTES: usize = 64;
    const FLOATS_PER_BLOCK: usize = BLOCK_BYTES / 4;
    let blocks = EMBEDDING_DIM / FLOATS_PER_BLOCK;

    let mut v = Vec::with_capacity(EMBEDDING_DIM);
    for block in 0..blocks as u32 {
        let mut hasher = Blake2bVar::new(BLOCK_BYTES).expect("valid blake2b output size");
        hasher.update(text.as_bytes());
        hasher.update(&block.to_le_bytes());
        let mut out = [0u8; BLOCK_BYTES];
        hasher
            .finalize_variable(&mut out)
            .expect("output size matches");
        for chunk in out.chunks_exact(4) {
            let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            // Map to [-1, 1)
            v.push((raw as f64 / u32::MAX as f64 * 2.0 - 1.0) as f32);
        }
    }

    if !vector::l2_normalize_in_place(&mut v) {
        // 384 hash-derived floats summing to exactly zero cannot occur for
        // any real input; keep the invariant anyway.
        v[0] = 1.0;
    }
    v
}
