//! Core memory engine — storage, recall, filters, and backup.
//!
//! The write path lives in [`store`], the read path in [`recall`], filter
//! parsing in [`filters`], and snapshot/export in [`backup`]. Type
//! definitions live in [`types`].

pub mod backup;
pub mod filters;
pub mod recall;
pub mod store;
pub mod types;

use crate::embedding::EMBEDDING_DIM;

/// Convert an f32 embedding slice to raw little-endian bytes for storage.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode a stored embedding blob. Returns `None` when the blob is not
/// exactly 384 little-endian f32s.
pub fn bytes_to_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() != EMBEDDING_DIM * 4 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_bytes_round_trip() {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[0] = 1.5;
        v[383] = -0.25;
        let bytes = embedding_to_bytes(&v);
        assert_eq!(bytes.len(), 1536);
        assert_eq!(bytes_to_embedding(&bytes), Some(v));
    }

    #[test]
    fn wrong_length_blob_is_rejected() {
        assert!(bytes_to_embedding(&[0u8; 12]).is_none());
        assert!(bytes_to_embedding(&[]).is_none());
    }
}
