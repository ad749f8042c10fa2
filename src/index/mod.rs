//! In-memory vector index over stored embeddings.
//!
//! The default backend is an exhaustive dot-product scan over a contiguous
//! `N × 384` f32 buffer — correct by construction, deadline-checked every
//! 4096 candidates, supported up to N ≈ 10⁵. When the row count crosses the
//! configured threshold a graph backend ([`graph`]) is built lazily; it must
//! pass a recall self-check against the brute-force scan or it is discarded.
//!
//! Writers mutate the buffer only while holding the store's write path;
//! readers take the shared lock, copy their scores out, and release.

pub mod graph;

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::deadline::Deadline;
use crate::embedding::EMBEDDING_DIM;
use crate::error::{Error, Result};
use crate::memory::types::MemoryId;
use crate::vector;

/// Deadline check interval during brute-force scans, in candidates.
const SCAN_CHECK_INTERVAL: usize = 4096;

struct IndexInner {
    ids: Vec<MemoryId>,
    /// Contiguous row-major buffer, `ids.len() * EMBEDDING_DIM` floats.
    buffer: Vec<f32>,
    slots: HashMap<MemoryId, usize>,
    graph: Option<graph::GraphIndex>,
    /// Set when a built graph failed its recall self-check; brute force is
    /// retained for the life of this index.
    graph_rejected: bool,
}

/// Thread-safe vector index. One per store.
pub struct VectorIndex {
    inner: RwLock<IndexInner>,
    /// Row count at which the graph backend activates. `0` disables it.
    graph_threshold: usize,
}

impl VectorIndex {
    pub fn new(graph_threshold: usize) -> Self {
        Self {
            inner: RwLock::new(IndexInner {
                ids: Vec::new(),
                buffer: Vec::new(),
                slots: HashMap::new(),
                graph: None,
                graph_rejected: false,
            }),
            graph_threshold,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: MemoryId) -> bool {
        self.inner.read().slots.contains_key(&id)
    }

    /// Name of the backend a search would use right now.
    pub fn backend(&self) -> &'static str {
        if self.inner.read().graph.is_some() {
            "graph"
        } else {
            "brute-force"
        }
    }

    /// Insert or replace a unit vector. A non-unit vector is an invariant
    /// violation and is rejected with `Internal`.
    pub fn insert(&self, id: MemoryId, embedding: &[f32]) -> Result<()> {
        if embedding.len() != EMBEDDING_DIM {
            return Err(Error::Internal(format!(
                "embedding has {} dims, expected {EMBEDDING_DIM}",
                embedding.len()
            )));
        }
        if !vector::is_unit(embedding) {
            tracing::error!(id = %id, "non-unit embedding rejected by vector index");
            return Err(Error::Internal(format!(
                "embedding for {id} violates the unit-norm invariant"
            )));
        }

        let mut inner = self.inner.write();
        match inner.slots.get(&id).copied() {
            Some(slot) => {
                let start = slot * EMBEDDING_DIM;
                inner.buffer[start..start + EMBEDDING_DIM].copy_from_slice(embedding);
            }
            None => {
                let slot = inner.ids.len();
                inner.ids.push(id);
                inner.buffer.extend_from_slice(embedding);
                inner.slots.insert(id, slot);
            }
        }
        if let Some(ref mut g) = inner.graph {
            g.insert(id, embedding);
        }
        Ok(())
    }

    /// Remove a vector. Returns `false` when the id was not present. Any
    /// built graph is invalidated and rebuilt lazily.
    pub fn remove(&self, id: MemoryId) -> bool {
        let mut inner = self.inner.write();
        let Some(slot) = inner.slots.remove(&id) else {
            return false;
        };

        // Swap-remove: move the last row into the vacated slot.
        let last = inner.ids.len() - 1;
        inner.ids.swap_remove(slot);
        if slot != last {
            let moved_id = inner.ids[slot];
            let (src, dst) = (last * EMBEDDING_DIM, slot * EMBEDDING_DIM);
            let moved: Vec<f32> = inner.buffer[src..src + EMBEDDING_DIM].to_vec();
            inner.buffer[dst..dst + EMBEDDING_DIM].copy_from_slice(&moved);
            inner.slots.insert(moved_id, slot);
        }
        inner.buffer.truncate(last * EMBEDDING_DIM);

        // The graph cannot delete points; drop it and rebuild on demand.
        if inner.graph.take().is_some() {
            tracing::debug!(id = %id, "graph index invalidated by deletion");
        }
        true
    }

    /// Drop all vectors.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.ids.clear();
        inner.buffer.clear();
        inner.slots.clear();
        inner.graph = None;
    }

    /// Top-`k` ids by dot product against a unit query vector. Scores are
    /// cosine similarities in `[-1, 1]`; ordering is non-increasing score
    /// with ties broken by ascending id.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        deadline: &Deadline,
    ) -> Result<Vec<(MemoryId, f32)>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        self.maybe_build_graph(deadline)?;

        let inner = self.inner.read();
        if inner.ids.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(ref g) = inner.graph {
            return Ok(g.search(query, k, &inner.slots));
        }
        brute_force_scan(&inner, query, k, deadline)
    }

    /// Build the graph backend once the threshold is crossed, unless a
    /// previous build failed its recall self-check.
    fn maybe_build_graph(&self, deadline: &Deadline) -> Result<()> {
        if self.graph_threshold == 0 {
            return Ok(());
        }
        {
            let inner = self.inner.read();
            if inner.graph.is_some()
                || inner.graph_rejected
                || inner.ids.len() < self.graph_threshold
            {
                return Ok(());
            }
        }

        let mut inner = self.inner.write();
        // Re-check under the write lock
        if inner.graph.is_some() || inner.graph_rejected || inner.ids.len() < self.graph_threshold {
            return Ok(());
        }

        tracing::info!(rows = inner.ids.len(), "building graph index");
        let built = graph::GraphIndex::build(&inner.ids, &inner.buffer);

        let recall = self.graph_recall_check(&inner, &built, deadline)?;
        if recall >= graph::MIN_SELF_CHECK_RECALL {
            tracing::info!(recall, "graph index active");
            inner.graph = Some(built);
        } else {
            tracing::warn!(
                recall,
                "graph index failed recall self-check, keeping brute force"
            );
            inner.graph_rejected = true;
        }
        Ok(())
    }

    /// Average recall@10 of the candidate graph against brute force, probed
    /// with sampled stored vectors.
    fn graph_recall_check(
        &self,
        inner: &IndexInner,
        candidate: &graph::GraphIndex,
        deadline: &Deadline,
    ) -> Result<f64> {
        const PROBES: usize = 16;
        const K: usize = 10;

        let n = inner.ids.len();
        let stride = (n / PROBES).max(1);
        let mut total = 0.0;
        let mut probes = 0.0;

        for slot in (0..n).step_by(stride).take(PROBES) {
            deadline.check()?;
            let start = slot * EMBEDDING_DIM;
            let query = &inner.buffer[start..start + EMBEDDING_DIM];

            let exact = brute_force_scan(inner, query, K, deadline)?;
            let approx = candidate.search(query, K, &inner.slots);

            let exact_ids: std::collections::HashSet<MemoryId> =
                exact.iter().map(|(id, _)| *id).collect();
            let hits = approx.iter().filter(|(id, _)| exact_ids.contains(id)).count();
            total += hits as f64 / exact.len().max(1) as f64;
            probes += 1.0;
        }

        Ok(if probes > 0.0 { total / probes } else { 1.0 })
    }
}

/// Exhaustive scan with periodic deadline checks.
fn brute_force_scan(
    inner: &IndexInner,
    query: &[f32],
    k: usize,
    deadline: &Deadline,
) -> Result<Vec<(MemoryId, f32)>> {
    let mut scored = Vec::with_capacity(inner.ids.len());
    for (chunk_start, chunk) in inner
        .ids
        .chunks(SCAN_CHECK_INTERVAL)
        .enumerate()
        .map(|(i, c)| (i * SCAN_CHECK_INTERVAL, c))
    {
        deadline.check()?;
        for (offset, &id) in chunk.iter().enumerate() {
            let slot = chunk_start + offset;
            let start = slot * EMBEDDING_DIM;
            let score = vector::dot(query, &inner.buffer[start..start + EMBEDDING_DIM]);
            scored.push((id, score));
        }
    }
    Ok(vector::top_k(scored, k))
}
