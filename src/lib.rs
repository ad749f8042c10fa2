//! Memento — an embedded semantic memory engine for AI agents.
//!
//! Short text "memories" are encoded to 384-dimensional unit vectors with a
//! local all-MiniLM-L6-v2 model, persisted with their metadata in a
//! single-file SQLite database, and recalled by similarity + metadata
//! filters under a wall-clock deadline.
//!
//! # Architecture
//!
//! - **Storage**: SQLite (WAL) with FTS5 for keyword search and
//!   [sqlite-vec](https://github.com/asg017/sqlite-vec) for the persisted
//!   vector table, one logical writer per database file
//! - **Embeddings**: local ONNX Runtime encoder behind a two-tier
//!   (LRU + persistent) content-addressed cache, with background warm-up
//!   and idle unload
//! - **Search**: brute-force dot product over an in-memory vector buffer,
//!   with an optional HNSW graph backend above a size threshold
//! - **Deadlines**: a wall-clock [`Deadline`] passed down the recall
//!   pipeline; valid from any thread
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use memento::{
//!     config::MementoConfig,
//!     embedding::{cache::EmbedCache, service::Embedder},
//!     memory::store::MemoryStore,
//!     memory::types::{RecallOptions, RememberOptions},
//! };
//!
//! # fn main() -> memento::Result<()> {
//! let config = MementoConfig::load()?;
//! let cache = EmbedCache::open(config.resolved_cache_path(), config.cache.lru_size)?;
//! let embedder = Arc::new(Embedder::new(&config.embedding, cache));
//! let store = MemoryStore::open(&config, embedder)?;
//!
//! store.remember("Fix the wifi driver", &RememberOptions::default())?;
//! let results = store.recall("network problems", &RecallOptions::default())?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`] — TOML configuration with environment overrides
//! - [`db`] — SQLite initialization, schema, migrations, health checks
//! - [`embedding`] — encoder, embed cache, and the embedder state machine
//! - [`index`] — in-memory vector index (brute force + optional graph)
//! - [`memory`] — the store: write path, recall pipeline, backup/export
//! - [`deadline`] — cross-thread wall-clock deadline primitive

pub mod config;
pub mod db;
pub mod deadline;
pub mod embedding;
pub mod error;
pub mod index;
pub mod memory;
pub mod vector;

pub use config::MementoConfig;
pub use deadline::Deadline;
pub use embedding::service::Embedder;
pub use embedding::EmbeddingProvider;
pub use error::{EmbeddingError, Error, Result, StorageError};
pub use memory::store::MemoryStore;
pub use memory::types::{Memory, MemoryId, RecallOptions, RememberOptions, SearchResult, StoreStats};
