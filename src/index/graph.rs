//! Graph-based approximate nearest-neighbour backend.
//!
//! Wraps an HNSW graph over the same unit vectors the brute-force buffer
//! holds. Activated lazily by [`VectorIndex`](super::VectorIndex) once the
//! row count crosses the configured threshold, and only kept if it answers
//! sampled queries with recall@10 ≥ [`MIN_SELF_CHECK_RECALL`] against the
//! exhaustive scan.

use std::collections::HashMap;

use hnsw_rs::prelude::*;

use crate::embedding::EMBEDDING_DIM;
use crate::memory::types::MemoryId;
use crate::vector;

/// Minimum recall@10 a freshly built graph must reach on the self-check.
pub const MIN_SELF_CHECK_RECALL: f64 = 0.95;

/// Graph connectivity (`M` in HNSW terms).
const MAX_NB_CONNECTION: usize = 16;
const MAX_LAYER: usize = 16;
const EF_CONSTRUCTION: usize = 200;
/// Floor for the search beam width.
const MIN_EF_SEARCH: usize = 64;

/// An HNSW graph over unit vectors. Dot-product distance: for unit vectors
/// `DistDot` reports `1 − a·b`, so similarity is recovered as `1 − d`.
pub struct GraphIndex {
    hnsw: Hnsw<'static, f32, DistDot>,
    /// Graph data id → memory id.
    point_ids: Vec<MemoryId>,
}

impl GraphIndex {
    /// Build a graph over every row of the contiguous buffer.
    pub fn build(ids: &[MemoryId], buffer: &[f32]) -> Self {
        let capacity = (ids.len() * 2).max(1024);
        let hnsw = Hnsw::new(
            MAX_NB_CONNECTION,
            capacity,
            MAX_LAYER,
            EF_CONSTRUCTION,
            DistDot {},
        );

        let mut graph = Self {
            hnsw,
            point_ids: Vec::with_capacity(ids.len()),
        };
        for (slot, &id) in ids.iter().enumerate() {
            let start = slot * EMBEDDING_DIM;
            graph.insert(id, &buffer[start..start + EMBEDDING_DIM]);
        }
        graph
    }

    /// Add one vector. Re-inserts for an existing id add a duplicate point;
    /// search de-duplicates by memory id.
    pub fn insert(&mut self, id: MemoryId, embedding: &[f32]) {
        let data_id = self.point_ids.len();
        self.point_ids.push(id);
        self.hnsw.insert_data(embedding, data_id);
    }

    /// Approximate top-`k` by similarity. `live` filters out ids that no
    /// longer exist in the primary buffer; ordering matches the brute-force
    /// contract (non-increasing score, ties by ascending id).
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        live: &HashMap<MemoryId, usize>,
    ) -> Vec<(MemoryId, f32)> {
        if self.point_ids.is_empty() || k == 0 {
            return Vec::new();
        }

        let ef = (2 * k).max(MIN_EF_SEARCH);
        // Over-fetch to absorb duplicate points from re-inserts
        let fetch = (k + k / 2 + 4).min(self.point_ids.len());
        let neighbours = self.hnsw.search(query, fetch, ef);

        let mut best: HashMap<MemoryId, f32> = HashMap::with_capacity(neighbours.len());
        for n in neighbours {
            let Some(&id) = self.point_ids.get(n.d_id) else {
                continue;
            };
            if !live.contains_key(&id) {
                continue;
            }
            let score = 1.0 - n.distance;
            best.entry(id)
                .and_modify(|s| *s = s.max(score))
                .or_insert(score);
        }

        vector::top_k(best.into_iter().collect(), k)
    }

    pub fn len(&self) -> usize {
        self.point_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.point_ids.is_empty()
    }
}
