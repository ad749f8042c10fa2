#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use memento::config::MementoConfig;
use memento::embedding::{fallback_embedding, nfc, EmbeddingProvider};
use memento::error::EmbeddingError;
use memento::memory::store::MemoryStore;
use memento::memory::types::RememberOptions;
use memento::MemoryId;
use tempfile::TempDir;

/// Deterministic test provider: hash-derived unit vectors, no model files.
/// Identical texts embed identically, so recalling a stored text verbatim
/// scores ~1.0 against its row. Counts single and batch calls, and can
/// inject latency for deadline tests.
pub struct HashProvider {
    pub embed_calls: AtomicUsize,
    pub batch_calls: AtomicUsize,
    pub delay: Option<Duration>,
}

impl HashProvider {
    pub fn new() -> Self {
        Self {
            embed_calls: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new()
        }
    }
}

impl EmbeddingProvider for HashProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        Ok(fallback_embedding(&nfc(text)))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.batch_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        texts.iter().map(|t| Ok(fallback_embedding(&nfc(t)))).collect()
    }
}

/// Config rooted in a temp dir: isolated db, cache, and backups.
pub fn test_config(dir: &TempDir) -> MementoConfig {
    let mut config = MementoConfig::default();
    config.storage.db_path = dir
        .path()
        .join("memory.db")
        .to_string_lossy()
        .into_owned();
    config.cache.db_path = dir.path().join("cache.db").to_string_lossy().into_owned();
    config
}

/// Fresh store over a [`HashProvider`].
pub fn open_store(dir: &TempDir) -> MemoryStore {
    open_store_with(dir, Arc::new(HashProvider::new()))
}

pub fn open_store_with(dir: &TempDir, provider: Arc<HashProvider>) -> MemoryStore {
    MemoryStore::open(&test_config(dir), provider).unwrap()
}

/// Store a memory with defaults, returning its id.
pub fn remember(store: &MemoryStore, text: &str) -> MemoryId {
    store.remember(text, &RememberOptions::default()).unwrap()
}

/// Store a memory with tags.
pub fn remember_tagged(store: &MemoryStore, text: &str, tags: &[&str]) -> MemoryId {
    let opts = RememberOptions {
        tags: tags.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    };
    store.remember(text, &opts).unwrap()
}
