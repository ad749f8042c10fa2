//! Two-tier embed cache: in-memory LRU in front of a persistent table.
//!
//! Entries are keyed by `blake2b-256(nfc(text))`. The LRU absorbs repeated
//! lookups within a process; the `embeddings` table in `cache.db` survives
//! restarts. Writes are last-writer-wins — embedding is deterministic, so
//! concurrent writers agree on the value. Disk-tier failures degrade to
//! LRU-only with a warning; the cache is an optimisation, not a source of
//! truth.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use lru::LruCache;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::EMBEDDING_DIM;
use crate::error::{Result, StorageError};
use crate::memory::{bytes_to_embedding, embedding_to_bytes};

/// Content address of a cached embedding: blake2b-256 over NFC text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextHash(pub [u8; 32]);

impl TextHash {
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for TextHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Hash NFC-normalized text into its cache key.
pub fn text_hash(text_nfc: &str) -> TextHash {
    let mut hasher = Blake2bVar::new(32).expect("valid blake2b output size");
    hasher.update(text_nfc.as_bytes());
    let mut out = [0u8; 32];
    hasher.finalize_variable(&mut out).expect("output size matches");
    TextHash(out)
}

/// Cache hit/miss counters and identity, as reported by `stats()`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub lru_hits: u64,
    pub disk_hits: u64,
    pub hit_rate: f64,
    pub lru_len: usize,
    pub lru_capacity: usize,
    pub backend: &'static str,
}

/// The two-tier cache. LRU critical sections are short; the disk tier has
/// its own connection serialised by a mutex.
pub struct EmbedCache {
    lru: Mutex<LruCache<TextHash, Vec<f32>>>,
    disk: Option<Mutex<Connection>>,
    lru_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
}

const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS embeddings (
    hash TEXT PRIMARY KEY,
    vector BLOB NOT NULL,
    created_at INTEGER NOT NULL
)
"#;

impl EmbedCache {
    /// Open (or create) the persistent tier at `path` with an LRU front of
    /// `lru_size` entries.
    pub fn open(path: impl AsRef<Path>, lru_size: usize) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Io(format!("failed to create directory {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(path).map_err(StorageError::from)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(StorageError::from)?;
        conn.execute_batch(CACHE_SCHEMA).map_err(StorageError::from)?;

        tracing::debug!(path = %path.display(), "embed cache opened");
        Ok(Self::with_disk(Some(conn), lru_size))
    }

    /// LRU-only cache, nothing persisted. Used when no cache path is
    /// configured and by tests.
    pub fn in_memory(lru_size: usize) -> Self {
        Self::with_disk(None, lru_size)
    }

    fn with_disk(disk: Option<Connection>, lru_size: usize) -> Self {
        let cap = NonZeroUsize::new(lru_size)
            .unwrap_or_else(|| NonZeroUsize::new(1000).expect("nonzero"));
        Self {
            lru: Mutex::new(LruCache::new(cap)),
            disk: disk.map(Mutex::new),
            lru_hits: AtomicU64::new(0),
            disk_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Probe LRU then disk; disk hits are promoted into the LRU. Returns
    /// `None` on a full miss. `bypass` skips both tiers and counts nothing.
    pub fn get(&self, hash: TextHash, bypass: bool) -> Option<Vec<f32>> {
        if bypass {
            return None;
        }

        if let Some(v) = self.lru.lock().get(&hash).cloned() {
            self.lru_hits.fetch_add(1, Ordering::Relaxed);
            return Some(v);
        }

        if let Some(v) = self.disk_get(hash) {
            self.disk_hits.fetch_add(1, Ordering::Relaxed);
            self.lru.lock().put(hash, v.clone());
            return Some(v);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert into both tiers (last-writer-wins upsert on disk).
    pub fn put(&self, hash: TextHash, vector: &[f32], bypass: bool) {
        if bypass {
            return;
        }
        debug_assert_eq!(vector.len(), EMBEDDING_DIM);

        self.lru.lock().put(hash, vector.to_vec());

        if let Some(ref disk) = self.disk {
            let now = chrono::Utc::now().timestamp();
            let result = disk.lock().execute(
                "INSERT OR REPLACE INTO embeddings (hash, vector, created_at) VALUES (?1, ?2, ?3)",
                params![hash.to_hex(), embedding_to_bytes(vector), now],
            );
            if let Err(e) = result {
                tracing::warn!(error = %e, "embed cache disk write failed");
            }
        }
    }

    fn disk_get(&self, hash: TextHash) -> Option<Vec<f32>> {
        let disk = self.disk.as_ref()?;
        let row: Option<Vec<u8>> = disk
            .lock()
            .query_row(
                "SELECT vector FROM embeddings WHERE hash = ?1",
                params![hash.to_hex()],
                |row| row.get(0),
            )
            .optional()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "embed cache disk read failed");
                None
            })?;
        bytes_to_embedding(row.as_deref()?)
    }

    /// Drop everything from both tiers and reset counters.
    pub fn clear(&self) -> Result<()> {
        self.lru.lock().clear();
        if let Some(ref disk) = self.disk {
            disk.lock()
                .execute("DELETE FROM embeddings", [])
                .map_err(StorageError::from)?;
        }
        self.lru_hits.store(0, Ordering::Relaxed);
        self.disk_hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Number of rows in the persistent tier (0 when LRU-only).
    pub fn disk_len(&self) -> u64 {
        match self.disk {
            Some(ref disk) => disk
                .lock()
                .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))
                .unwrap_or(0u64),
            None => 0,
        }
    }

    pub fn stats(&self) -> CacheStats {
        let lru_hits = self.lru_hits.load(Ordering::Relaxed);
        let disk_hits = self.disk_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let hits = lru_hits + disk_hits;
        let total = hits + misses;
        let lru = self.lru.lock();

        CacheStats {
            hits,
            misses,
            lru_hits,
            disk_hits,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            lru_len: lru.len(),
            lru_capacity: lru.cap().get(),
            backend: if self.disk.is_some() {
                "lru+sqlite"
            } else {
                "lru"
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vec_of(val: f32) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[0] = val;
        v
    }

    #[test]
    fn text_hash_is_stable_and_distinct() {
        let a = text_hash("hello");
        let b = text_hash("hello");
        let c = text_hash("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_hex().len(), 64);
    }

    #[test]
    fn get_after_put_hits_lru() {
        let cache = EmbedCache::in_memory(10);
        let h = text_hash("hello");
        cache.put(h, &vec_of(1.0), false);

        assert_eq!(cache.get(h, false), Some(vec_of(1.0)));
        let stats = cache.stats();
        assert_eq!(stats.lru_hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn miss_is_counted() {
        let cache = EmbedCache::in_memory(10);
        assert!(cache.get(text_hash("absent"), false).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn bypass_skips_reads_and_writes() {
        let cache = EmbedCache::in_memory(10);
        let h = text_hash("hello");
        cache.put(h, &vec_of(1.0), true);
        assert!(cache.get(h, true).is_none());
        assert!(cache.get(h, false).is_none()); // nothing was stored

        let stats = cache.stats();
        assert_eq!(stats.lru_hits, 0);
        assert_eq!(stats.disk_hits, 0);
    }

    #[test]
    fn lru_evicts_under_pressure_but_disk_retains() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbedCache::open(dir.path().join("cache.db"), 2).unwrap();

        let h1 = text_hash("one");
        let h2 = text_hash("two");
        let h3 = text_hash("three");
        cache.put(h1, &vec_of(1.0), false);
        cache.put(h2, &vec_of(2.0), false);
        cache.put(h3, &vec_of(3.0), false); // evicts h1 from the LRU

        assert_eq!(cache.stats().lru_len, 2);

        // h1 is gone from the LRU but still on disk — a disk hit promotes it
        assert_eq!(cache.get(h1, false), Some(vec_of(1.0)));
        assert_eq!(cache.stats().disk_hits, 1);
        // Second read is now an LRU hit
        assert_eq!(cache.get(h1, false), Some(vec_of(1.0)));
        assert_eq!(cache.stats().lru_hits, 1);
    }

    #[test]
    fn disk_tier_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let h = text_hash("persisted");

        {
            let cache = EmbedCache::open(&path, 10).unwrap();
            cache.put(h, &vec_of(7.0), false);
        }

        let cache = EmbedCache::open(&path, 10).unwrap();
        assert_eq!(cache.get(h, false), Some(vec_of(7.0)));
        assert_eq!(cache.stats().disk_hits, 1);
        assert_eq!(cache.disk_len(), 1);
    }

    #[test]
    fn put_is_last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbedCache::open(dir.path().join("cache.db"), 10).unwrap();
        let h = text_hash("rewritten");

        cache.put(h, &vec_of(1.0), false);
        cache.put(h, &vec_of(2.0), false);
        assert_eq!(cache.get(h, false), Some(vec_of(2.0)));
        assert_eq!(cache.disk_len(), 1);
    }

    #[test]
    fn clear_empties_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbedCache::open(dir.path().join("cache.db"), 10).unwrap();
        let h = text_hash("cleared");
        cache.put(h, &vec_of(1.0), false);

        cache.clear().unwrap();
        assert!(cache.get(h, false).is_none());
        assert_eq!(cache.disk_len(), 0);
        assert_eq!(cache.stats().hits, 0);
    }

    #[test]
    fn hit_rate_reflects_counters() {
        let cache = EmbedCache::in_memory(10);
        let h = text_hash("rate");
        cache.put(h, &vec_of(1.0), false);
        cache.get(h, false); // hit
        cache.get(text_hash("nope"), false); // miss

        let stats = cache.stats();
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
        assert_eq!(stats.backend, "lru");
    }
}
