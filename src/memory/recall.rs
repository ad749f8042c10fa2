//! Read path: the recall pipeline, batch recall, and keyword search.
//!
//! Recall composes the embedder, the vector index, and the metadata
//! predicate under one wall-clock deadline: parse filters → embed query →
//! fetch `k × F` candidates → hydrate → filter → rank → truncate. When a
//! restrictive filter starves the result set, the candidate factor expands
//! to 10 and the search retries once. A timed-out recall returns only the
//! error; partial results are never surfaced.

use std::collections::HashMap;

use rusqlite::params;

use super::filters::CompiledFilters;
use super::store::{row_to_memory, MemoryStore, MAX_QUERY_BYTES, MEMORY_COLUMNS};
use super::types::{Memory, MemoryId, RecallOptions, SearchResult};
use crate::deadline::Deadline;
use crate::error::{Error, Result, StorageError};

/// Hard ceiling on the candidate expansion factor.
const MAX_EXPANSION: usize = 20;
/// Factor used by the one retry after a starved filtered search.
const RETRY_EXPANSION: usize = 10;

impl MemoryStore {
    /// Semantic recall: top-`k` memories by cosine similarity, constrained
    /// by the composed metadata predicate, under a wall-clock deadline.
    pub fn recall(&self, query: &str, opts: &RecallOptions) -> Result<Vec<SearchResult>> {
        let deadline = self.recall_deadline(opts);
        validate_query(query)?;
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let filters = CompiledFilters::compile(opts)?;

        deadline.check()?;
        let embedding = self.provider.embed(query)?;
        let probe = MemoryId::derive(query, "query", "query", 0);
        self.check_unit(&probe, &embedding)?;

        self.recall_with_embedding(&embedding, &filters, opts.effective_topk(), &deadline)
    }

    /// Recall for several queries at once. Queries are embedded as a single
    /// encoder batch; results come back in input order, one list per query.
    pub fn batch_recall(
        &self,
        queries: &[&str],
        opts: &RecallOptions,
    ) -> Result<Vec<Vec<SearchResult>>> {
        let deadline = self.recall_deadline(opts);
        for query in queries {
            validate_query(query)?;
        }
        let filters = CompiledFilters::compile(opts)?;
        let topk = opts.effective_topk();

        // One encoder pass for every non-empty query
        let nonempty: Vec<&str> = queries
            .iter()
            .copied()
            .filter(|q| !q.trim().is_empty())
            .collect();
        deadline.check()?;
        let mut embeddings = self.provider.embed_batch(&nonempty)?.into_iter();

        let mut results = Vec::with_capacity(queries.len());
        for query in queries {
            if query.trim().is_empty() {
                results.push(Vec::new());
                continue;
            }
            let embedding = embeddings
                .next()
                .ok_or_else(|| Error::Internal("batch embed returned too few vectors".into()))?;
            let probe = MemoryId::derive(query, "query", "query", 0);
            self.check_unit(&probe, &embedding)?;
            results.push(self.recall_with_embedding(&embedding, &filters, topk, &deadline)?);
        }
        Ok(results)
    }

    /// BM25 keyword search over the full-text index. Results carry
    /// `keyword_score`; ordering follows the FTS rank.
    pub fn search_keyword(
        &self,
        query: &str,
        collection: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        validate_query(query)?;
        let escaped = escape_fts_query(query);
        if escaped.is_empty() {
            return Ok(Vec::new());
        }

        let ranked: Vec<(MemoryId, f64)> = {
            let guard = self.connection()?;
            let conn = guard.as_ref().expect("connection checked above");
            let mut stmt = conn
                .prepare(
                    "SELECT id, rank FROM memories_fts \
                     WHERE memories_fts MATCH ?1 ORDER BY rank LIMIT ?2",
                )
                .map_err(StorageError::from)?;
            let rows = stmt
                .query_map(params![escaped, limit as i64], |row| {
                    Ok((row.get::<_, MemoryId>(0)?, row.get::<_, f64>(1)?))
                })
                .map_err(StorageError::from)?;
            let result = rows
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(StorageError::from)?;
            result
        };

        let ids: Vec<MemoryId> = ranked.iter().map(|(id, _)| *id).collect();
        let rows = self.hydrate(&ids)?;

        let mut results = Vec::with_capacity(ranked.len());
        for (id, rank) in ranked {
            let Some(memory) = rows.get(&id) else {
                continue;
            };
            if let Some(collection) = collection {
                if memory.collection != collection {
                    continue;
                }
            }
            // FTS5 rank is negative (more negative = better); negate so
            // higher is better, matching the vector score convention.
            let keyword_score = -rank as f32;
            results.push(SearchResult {
                memory: memory.clone(),
                score: keyword_score,
                vector_score: 0.0,
                keyword_score: Some(keyword_score),
            });
        }
        Ok(results)
    }

    fn recall_deadline(&self, opts: &RecallOptions) -> Deadline {
        Deadline::after_ms(opts.timeout_ms.unwrap_or(self.query_cfg.default_timeout_ms))
    }

    /// Candidate fetch → hydrate → predicate → rank → truncate, with one
    /// expansion retry when filters starve the result set.
    pub(crate) fn recall_with_embedding(
        &self,
        embedding: &[f32],
        filters: &CompiledFilters,
        topk: usize,
        deadline: &Deadline,
    ) -> Result<Vec<SearchResult>> {
        let restrictive = filters.is_restrictive() || filters.collection.is_some();
        let configured = self.query_cfg.filter_expansion.clamp(1, MAX_EXPANSION);
        let mut factor = if restrictive { configured } else { 1 };

        loop {
            deadline.check()?;
            let candidates = self.index.search(embedding, topk * factor, deadline)?;
            let exhausted = candidates.len() < topk * factor;

            deadline.check()?;
            let ids: Vec<MemoryId> = candidates.iter().map(|(id, _)| *id).collect();
            let rows = self.hydrate(&ids)?;

            let mut kept: Vec<SearchResult> = Vec::new();
            for (id, score) in &candidates {
                let Some(memory) = rows.get(id) else {
                    // Committed deletes can race the index copy; hydration is
                    // the source of truth.
                    continue;
                };
                if !filters.matches(memory) {
                    continue;
                }
                kept.push(SearchResult {
                    memory: memory.clone(),
                    score: *score,
                    vector_score: *score,
                    keyword_score: None,
                });
            }

            if kept.len() < topk && restrictive && factor < RETRY_EXPANSION && !exhausted {
                factor = RETRY_EXPANSION;
                continue;
            }

            // Rank: non-increasing score, ties by descending timestamp then
            // ascending id.
            kept.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.memory.timestamp.cmp(&a.memory.timestamp))
                    .then_with(|| a.memory.id.cmp(&b.memory.id))
            });
            kept.truncate(topk);
            return Ok(kept);
        }
    }

    /// Batch-fetch memory rows by id.
    pub(crate) fn hydrate(&self, ids: &[MemoryId]) -> Result<HashMap<MemoryId, Memory>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let guard = self.connection()?;
        let conn = guard.as_ref().expect("connection checked above");

        let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories WHERE id IN ({})",
            placeholders.join(", ")
        );

        let mut stmt = conn.prepare(&sql).map_err(StorageError::from)?;
        let id_params: Vec<&dyn rusqlite::types::ToSql> =
            ids.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();

        let rows = stmt
            .query_map(id_params.as_slice(), row_to_memory)
            .map_err(StorageError::from)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;

        Ok(rows.into_iter().map(|m| (m.id, m)).collect())
    }
}

fn validate_query(query: &str) -> Result<()> {
    if query.len() > MAX_QUERY_BYTES {
        return Err(Error::Validation(format!(
            "query too long ({} > {MAX_QUERY_BYTES} bytes)",
            query.len()
        )));
    }
    Ok(())
}

/// Escape a user query for FTS5 MATCH syntax.
///
/// Wraps each whitespace-delimited word in double quotes and joins with
/// spaces so FTS5 treats them as individual terms (implicit AND). Strips
/// empty tokens.
fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| {
            let clean = word.replace('"', "");
            format!("\"{clean}\"")
        })
        .filter(|w| w != "\"\"")
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_fts_query_quotes_words() {
        assert_eq!(escape_fts_query("hello world"), "\"hello\" \"world\"");
        assert_eq!(
            escape_fts_query("rust OR python"),
            "\"rust\" \"OR\" \"python\""
        );
        assert_eq!(escape_fts_query("  spaces  "), "\"spaces\"");
        assert_eq!(escape_fts_query(""), "");
        assert_eq!(escape_fts_query("say \"hi\""), "\"say\" \"hi\"");
    }

    #[test]
    fn query_length_bound() {
        assert!(validate_query(&"q".repeat(1000)).is_ok());
        assert!(validate_query(&"q".repeat(1001)).is_err());
    }
}
