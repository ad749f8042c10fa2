//! Core record type definitions.
//!
//! Defines [`MemoryId`] (content-derived 128-bit identifier), [`Memory`]
//! (a full record), [`SearchResult`] (a scored record with all score
//! components as explicit fields), the option structs for `remember` and
//! `recall`, and [`StoreStats`].

use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 128-bit record identifier: `blake2b-128(text ∥ source ∥ session ∥ ts)`
/// over the NFC-normalized text, with `0x1f` field separators. Stored in
/// SQL as 32 lowercase hex chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemoryId(pub [u8; 16]);

impl MemoryId {
    /// Derive the id for a record. Identical inputs always produce the same
    /// id, which is what makes duplicate `remember` calls idempotent.
    pub fn derive(text_nfc: &str, source: &str, session_id: &str, timestamp: i64) -> Self {
        const SEP: &[u8] = &[0x1f];
        let mut hasher = Blake2bVar::new(16).expect("valid blake2b output size");
        hasher.update(text_nfc.as_bytes());
        hasher.update(SEP);
        hasher.update(source.as_bytes());
        hasher.update(SEP);
        hasher.update(session_id.as_bytes());
        hasher.update(SEP);
        hasher.update(&timestamp.to_le_bytes());
        let mut out = [0u8; 16];
        hasher.finalize_variable(&mut out).expect("output size matches");
        MemoryId(out)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(MemoryId(arr))
    }
}

impl std::fmt::Display for MemoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::str::FromStr for MemoryId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s).ok_or_else(|| format!("invalid memory id: {s}"))
    }
}

impl Serialize for MemoryId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for MemoryId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        MemoryId::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid memory id: {s}")))
    }
}

impl ToSql for MemoryId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_hex()))
    }
}

impl FromSql for MemoryId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        MemoryId::from_hex(s).ok_or(FromSqlError::InvalidType)
    }
}

/// A memory record, matching the `memories` table schema. The embedding is
/// not carried here; it lives in the vector index and the embedding column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    /// Content-derived 128-bit identifier.
    pub id: MemoryId,
    /// The full text, NFC-normalized.
    pub text: String,
    /// Seconds since epoch; non-decreasing per writer.
    pub timestamp: i64,
    /// Where this memory came from (e.g. a tool name). Default `"unknown"`.
    pub source: String,
    /// Session identifier. Default `"default"`.
    pub session_id: String,
    /// Relevance weight in `[0.0, 1.0]`; out-of-range input is clamped.
    pub importance: f64,
    /// Deduplicated, sorted tag tokens.
    pub tags: Vec<String>,
    /// Partition key. Default `"knowledge"`.
    pub collection: String,
}

/// A memory returned from search. A closed record: every score component
/// is a field, nothing is grafted on after the fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(flatten)]
    pub memory: Memory,
    /// The score results are ranked by. Equals `vector_score` for semantic
    /// recall and `keyword_score` for keyword search.
    pub score: f32,
    /// Cosine similarity against the query embedding, in `[-1, 1]`.
    pub vector_score: f32,
    /// BM25 rank from the full-text index, when keyword search produced
    /// this result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword_score: Option<f32>,
}

/// Options for `remember`.
#[derive(Debug, Clone)]
pub struct RememberOptions {
    pub collection: String,
    pub importance: f64,
    pub source: String,
    pub session_id: String,
    pub tags: Vec<String>,
    /// Explicit record timestamp (epoch seconds). `None` uses the writer's
    /// clock. Import sets this so restored records keep their ids.
    pub timestamp: Option<i64>,
}

impl Default for RememberOptions {
    fn default() -> Self {
        Self {
            collection: "knowledge".to_string(),
            importance: 0.5,
            source: "unknown".to_string(),
            session_id: "default".to_string(),
            tags: Vec::new(),
            timestamp: None,
        }
    }
}

/// Options for `recall` and `batch_recall`.
#[derive(Debug, Clone, Default)]
pub struct RecallOptions {
    /// Scope to one collection; `None` searches all collections.
    pub collection: Option<String>,
    /// Number of results to return. `0` falls back to 5.
    pub topk: usize,
    /// Metadata filters; recognised keys only (see `memory::filters`).
    pub filters: Option<serde_json::Map<String, serde_json::Value>>,
    /// Lower bound on importance.
    pub min_importance: Option<f64>,
    /// ISO-8601 or relative ("7d", "24h", "30m") lower time bound.
    pub since: Option<String>,
    /// ISO-8601 or relative upper time bound.
    pub before: Option<String>,
    /// Wall-clock budget. `None` uses the configured default; `Some(0)`
    /// disables the deadline.
    pub timeout_ms: Option<u64>,
}

impl RecallOptions {
    pub fn effective_topk(&self) -> usize {
        if self.topk == 0 {
            5
        } else {
            self.topk
        }
    }
}

/// Store-wide statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    /// Row counts per collection.
    pub collections: BTreeMap<String, u64>,
    /// Total rows across collections.
    pub total_memories: u64,
    /// Vectors currently resident in the in-memory index.
    pub total_vectors: u64,
    /// Active search backend (`"brute-force"` or `"graph"`).
    pub index_backend: &'static str,
    pub db_path: String,
    /// True when the store refused writes after a corruption check.
    pub read_only: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_deterministic() {
        let a = MemoryId::derive("hello", "unknown", "default", 1000);
        let b = MemoryId::derive("hello", "unknown", "default", 1000);
        assert_eq!(a, b);
    }

    #[test]
    fn id_differs_per_field() {
        let base = MemoryId::derive("hello", "unknown", "default", 1000);
        assert_ne!(base, MemoryId::derive("hello!", "unknown", "default", 1000));
        assert_ne!(base, MemoryId::derive("hello", "cli", "default", 1000));
        assert_ne!(base, MemoryId::derive("hello", "unknown", "other", 1000));
        assert_ne!(base, MemoryId::derive("hello", "unknown", "default", 1001));
    }

    #[test]
    fn id_separators_prevent_field_bleed() {
        // Without separators these two would hash identical byte streams
        let a = MemoryId::derive("ab", "c", "d", 0);
        let b = MemoryId::derive("a", "bc", "d", 0);
        assert_ne!(a, b);
    }

    #[test]
    fn id_hex_round_trip() {
        let id = MemoryId::derive("round trip", "unknown", "default", 42);
        let hex = id.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(MemoryId::from_hex(&hex), Some(id));
        assert_eq!(hex.parse::<MemoryId>().unwrap(), id);
    }

    #[test]
    fn id_rejects_bad_hex() {
        assert!(MemoryId::from_hex("zz").is_none());
        assert!(MemoryId::from_hex("abcd").is_none()); // wrong length
    }

    #[test]
    fn id_serde_as_hex_string() {
        let id = MemoryId::derive("serde", "unknown", "default", 7);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: MemoryId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn default_remember_options() {
        let opts = RememberOptions::default();
        assert_eq!(opts.collection, "knowledge");
        assert_eq!(opts.source, "unknown");
        assert_eq!(opts.session_id, "default");
        assert!((opts.importance - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_topk_falls_back_to_five() {
        assert_eq!(RecallOptions::default().effective_topk(), 5);
    }
}
