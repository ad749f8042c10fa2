//! The memory store: write path, deletion, stats, and writer discipline.
//!
//! [`MemoryStore`] uniquely owns the database handle and every index
//! structure derived from it. Exactly one logical writer runs at a time;
//! readers share the same connection mutex and WAL keeps multi-process
//! readers consistent. Every write is one transaction covering the primary
//! row, the FTS index (explicit rowid), and the vector table; the in-memory
//! vector index is updated under the writer lock immediately after commit so
//! post-commit readers always observe index ⊇ committed rows.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection};

use super::types::{Memory, MemoryId, RememberOptions, StoreStats};
use super::{bytes_to_embedding, embedding_to_bytes};
use crate::config::{BackupConfig, MementoConfig, QueryConfig};
use crate::db;
use crate::embedding::{nfc, EmbeddingProvider};
use crate::error::{Error, Result, StorageError};
use crate::index::VectorIndex;
use crate::vector;

/// Maximum memory text size in bytes, after NFC normalisation.
pub const MAX_TEXT_BYTES: usize = 100_000;
/// Maximum recall query size in bytes.
pub const MAX_QUERY_BYTES: usize = 1000;
/// Maximum number of tags per record.
pub const MAX_TAGS: usize = 50;
/// Maximum tag length in bytes.
pub const MAX_TAG_BYTES: usize = 64;
/// Maximum source / session identifier length in bytes.
pub const MAX_IDENT_BYTES: usize = 128;

/// Bounded backoff for `Locked`: attempts × sleep ≈ 250 ms total.
const LOCKED_RETRIES: u32 = 10;
const LOCKED_BACKOFF: Duration = Duration::from_millis(25);

/// High-level interface for semantic memory over SQLite.
///
/// The caller owns the store and injects the embedding provider; nothing
/// here is process-global, so tests can run independent stores side by
/// side.
pub struct MemoryStore {
    conn: Mutex<Option<Connection>>,
    pub(crate) index: VectorIndex,
    pub(crate) provider: Arc<dyn EmbeddingProvider>,
    pub(crate) db_path: PathBuf,
    pub(crate) backup_dir: PathBuf,
    pub(crate) backup_cfg: BackupConfig,
    pub(crate) query_cfg: QueryConfig,
    limiter: Option<RateLimiter>,
    corrupt: AtomicBool,
    last_ts: AtomicI64,
}

impl MemoryStore {
    /// Open (or create) the store described by `config`.
    ///
    /// A corrupt database does not fail the open: the store comes up in
    /// read-refusing corrupt mode so the caller can run [`recover`]
    /// (see `memory::backup`) or replace the file.
    pub fn open(config: &MementoConfig, provider: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let db_path = config.resolved_db_path();
        let store = Self {
            conn: Mutex::new(None),
            index: VectorIndex::new(config.index.graph_threshold),
            provider,
            db_path: db_path.clone(),
            backup_dir: config.backup_dir(),
            backup_cfg: config.storage.backup.clone(),
            query_cfg: config.query.clone(),
            limiter: RateLimiter::new(config.storage.rate_limit_per_sec),
            corrupt: AtomicBool::new(false),
            last_ts: AtomicI64::new(0),
        };

        match db::open_database(&db_path) {
            Ok(conn) => {
                *store.conn.lock() = Some(conn);
                store.load_vectors()?;
            }
            Err(Error::Storage(StorageError::Corrupt(detail))) => {
                tracing::error!(path = %db_path.display(), detail = %detail,
                    "database corrupt, store is read-only until recovered");
                store.corrupt.store(true, Ordering::SeqCst);
            }
            Err(e) => return Err(e),
        }

        Ok(store)
    }

    /// True when the store refuses writes after a corruption check.
    pub fn is_corrupt(&self) -> bool {
        self.corrupt.load(Ordering::SeqCst)
    }

    pub(crate) fn set_corrupt(&self, value: bool) {
        self.corrupt.store(value, Ordering::SeqCst);
    }

    /// Drop the current connection (recovery closes the broken database
    /// before replacing the file).
    pub(crate) fn take_connection(&self) {
        *self.conn.lock() = None;
    }

    /// Swap in a fresh connection after recovery and rebuild the index.
    pub(crate) fn replace_connection(&self, conn: Connection) -> Result<()> {
        *self.conn.lock() = Some(conn);
        self.index.clear();
        self.load_vectors()
    }

    /// Take the connection guard, surfacing corrupt mode as an error.
    pub(crate) fn connection(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
        if self.is_corrupt() {
            return Err(Error::Storage(StorageError::Corrupt(
                "store is in corrupt read-only mode; run recover or replace the file".to_string(),
            )));
        }
        let guard = self.conn.lock();
        if guard.is_none() {
            return Err(Error::Storage(StorageError::Corrupt(
                "no usable database connection".to_string(),
            )));
        }
        Ok(guard)
    }

    /// Store a memory. Duplicate `(text, source, session, timestamp)` is
    /// idempotent: the existing id is returned and nothing is written.
    pub fn remember(&self, text: &str, opts: &RememberOptions) -> Result<MemoryId> {
        let timestamp = match opts.timestamp {
            Some(ts) => ts,
            None => self.next_timestamp(),
        };
        let text = nfc(text);
        validate_text(&text)?;
        validate_ident("source", &opts.source)?;
        validate_ident("session_id", &opts.session_id)?;
        let tags = normalize_tags(&opts.tags)?;
        let importance = clamp_importance(opts.importance)?;

        let id = MemoryId::derive(&text, &opts.source, &opts.session_id, timestamp);

        // Embed before taking the writer lock; the cache makes repeats cheap.
        let embedding = self.provider.embed(&text)?;
        self.check_unit(&id, &embedding)?;

        if let Some(ref limiter) = self.limiter {
            limiter.acquire();
        }

        let mut guard = self.connection()?;
        let conn = guard.as_mut().expect("connection checked above");

        let exists: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM memories WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map_err(StorageError::from)?;
        if exists {
            tracing::debug!(id = %id, "duplicate remember, returning existing id");
            return Ok(id);
        }

        let tags_json =
            serde_json::to_string(&tags).map_err(|e| Error::Internal(e.to_string()))?;
        let blob = embedding_to_bytes(&embedding);

        retry_on_locked(|| {
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT INTO memories \
                 (id, text, timestamp, source, session_id, importance, tags, collection, embedding) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id,
                    text,
                    timestamp,
                    opts.source,
                    opts.session_id,
                    importance,
                    tags_json,
                    opts.collection,
                    blob,
                ],
            )?;
            let rowid = tx.last_insert_rowid();

            // FTS and vector rows carry the same explicit id, in the same
            // transaction, so the indexes never drift from the table.
            tx.execute(
                "INSERT INTO memories_fts (rowid, text, id) VALUES (?1, ?2, ?3)",
                params![rowid, text, id],
            )?;
            tx.execute(
                "INSERT INTO memories_vec (id, embedding) VALUES (?1, ?2)",
                params![id, blob],
            )?;

            tx.commit()
        })?;

        // Still under the writer lock: readers that saw the commit also see
        // the index entry.
        self.index.insert(id, &embedding)?;

        tracing::debug!(id = %id, collection = %opts.collection, "memory stored");
        Ok(id)
    }

    /// Delete a memory by id, cascading to the FTS and vector indexes
    /// atomically. Returns `false` (not an error) for an unknown id.
    pub fn delete(&self, id: MemoryId) -> Result<bool> {
        let mut guard = self.connection()?;
        let conn = guard.as_mut().expect("connection checked above");

        let removed = retry_on_locked(|| {
            let tx = conn.transaction()?;

            let row: Option<(i64, String)> = {
                use rusqlite::OptionalExtension;
                tx.query_row(
                    "SELECT rowid, text FROM memories WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?
            };
            let Some((rowid, text)) = row else {
                return Ok(false);
            };

            // External-content FTS5 requires the delete command form
            tx.execute(
                "INSERT INTO memories_fts(memories_fts, rowid, text, id) \
                 VALUES('delete', ?1, ?2, ?3)",
                params![rowid, text, id],
            )?;
            tx.execute("DELETE FROM memories_vec WHERE id = ?1", params![id])?;
            tx.execute("DELETE FROM memories WHERE id = ?1", params![id])?;

            tx.commit()?;
            Ok(true)
        })?;

        if removed {
            self.index.remove(id);
            tracing::debug!(id = %id, "memory deleted");
        }
        Ok(removed)
    }

    /// Fetch a single memory by id.
    pub fn get_by_id(&self, id: MemoryId) -> Result<Memory> {
        let guard = self.connection()?;
        let conn = guard.as_ref().expect("connection checked above");

        use rusqlite::OptionalExtension;
        conn.query_row(
            &format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1"),
            params![id],
            row_to_memory,
        )
        .optional()
        .map_err(StorageError::from)?
        .ok_or_else(|| Error::NotFound(id.to_hex()))
    }

    /// The `n` most recent memories in a collection, newest first (ties by
    /// ascending id).
    pub fn get_recent(&self, collection: &str, n: usize) -> Result<Vec<Memory>> {
        let guard = self.connection()?;
        let conn = guard.as_ref().expect("connection checked above");

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MEMORY_COLUMNS} FROM memories \
                 WHERE collection = ?1 ORDER BY timestamp DESC, id ASC LIMIT ?2"
            ))
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map(params![collection, n as i64], row_to_memory)
            .map_err(StorageError::from)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;
        Ok(rows)
    }

    /// Per-collection counts plus index identity.
    pub fn stats(&self) -> Result<StoreStats> {
        let mut collections = std::collections::BTreeMap::new();
        let mut total = 0u64;

        if !self.is_corrupt() {
            let guard = self.connection()?;
            let conn = guard.as_ref().expect("connection checked above");
            let mut stmt = conn
                .prepare("SELECT collection, COUNT(*) FROM memories GROUP BY collection")
                .map_err(StorageError::from)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
                })
                .map_err(StorageError::from)?;
            for row in rows {
                let (collection, count) = row.map_err(StorageError::from)?;
                total += count;
                collections.insert(collection, count);
            }
        }

        Ok(StoreStats {
            collections,
            total_memories: total,
            total_vectors: self.index.len() as u64,
            index_backend: self.index.backend(),
            db_path: self.db_path.to_string_lossy().into_owned(),
            read_only: self.is_corrupt(),
        })
    }

    /// Full database health report (integrity, versions, index sync).
    pub fn health(&self) -> Result<db::HealthReport> {
        let guard = self.connection()?;
        let conn = guard.as_ref().expect("connection checked above");
        db::check_database_health(conn)
    }

    /// Non-decreasing wall-clock seconds; ties are broken by insertion
    /// order, which the id hash also encodes.
    fn next_timestamp(&self) -> i64 {
        let now = chrono::Utc::now().timestamp();
        self.last_ts.fetch_max(now, Ordering::SeqCst);
        self.last_ts.load(Ordering::SeqCst)
    }

    /// Non-unit embeddings indicate a broken provider; surface as
    /// `Internal` and trigger an integrity check.
    pub(crate) fn check_unit(&self, id: &MemoryId, embedding: &[f32]) -> Result<()> {
        if embedding.len() == crate::embedding::EMBEDDING_DIM && vector::is_unit(embedding) {
            return Ok(());
        }
        tracing::error!(id = %id, "embedding violates unit-norm invariant");
        if let Ok(guard) = self.connection() {
            if let Some(conn) = guard.as_ref() {
                let _ = db::check_database_health(conn);
            }
        }
        Err(Error::Internal(format!(
            "embedding for {id} violates the unit-norm invariant"
        )))
    }

    /// Load every stored embedding into the in-memory index.
    fn load_vectors(&self) -> Result<()> {
        let guard = self.connection()?;
        let conn = guard.as_ref().expect("connection checked above");

        let mut stmt = conn
            .prepare("SELECT id, embedding FROM memories")
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, MemoryId>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .map_err(StorageError::from)?;

        let mut loaded = 0usize;
        for row in rows {
            let (id, blob) = row.map_err(StorageError::from)?;
            match bytes_to_embedding(&blob) {
                Some(embedding) => {
                    self.index.insert(id, &embedding)?;
                    loaded += 1;
                }
                None => {
                    tracing::warn!(id = %id, len = blob.len(), "skipping malformed embedding blob");
                }
            }
        }

        tracing::info!(loaded, "vectors loaded into memory");
        Ok(())
    }
}

pub(crate) const MEMORY_COLUMNS: &str =
    "id, text, timestamp, source, session_id, importance, tags, collection";

/// Map a `SELECT MEMORY_COLUMNS` row into a [`Memory`].
pub(crate) fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<Memory> {
    let tags_json: String = row.get(6)?;
    Ok(Memory {
        id: row.get(0)?,
        text: row.get(1)?,
        timestamp: row.get(2)?,
        source: row.get(3)?,
        session_id: row.get(4)?,
        importance: row.get(5)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        collection: row.get(7)?,
    })
}

/// Retry a write closure on `Locked` with bounded backoff, then surface.
pub(crate) fn retry_on_locked<T>(
    mut f: impl FnMut() -> rusqlite::Result<T>,
) -> Result<T> {
    let mut attempt = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) => {
                let storage = StorageError::from(e);
                if storage.is_locked() && attempt < LOCKED_RETRIES {
                    attempt += 1;
                    tracing::debug!(attempt, "database locked, backing off");
                    std::thread::sleep(LOCKED_BACKOFF);
                    continue;
                }
                return Err(Error::Storage(storage));
            }
        }
    }
}

fn validate_text(text_nfc: &str) -> Result<()> {
    if text_nfc.trim().is_empty() {
        return Err(Error::Validation("memory text cannot be empty".to_string()));
    }
    if text_nfc.len() > MAX_TEXT_BYTES {
        return Err(Error::Validation(format!(
            "memory text too long ({} > {MAX_TEXT_BYTES} bytes)",
            text_nfc.len()
        )));
    }
    Ok(())
}

fn validate_ident(field: &str, value: &str) -> Result<()> {
    if value.len() > MAX_IDENT_BYTES {
        return Err(Error::Validation(format!(
            "{field} too long ({} > {MAX_IDENT_BYTES} bytes)",
            value.len()
        )));
    }
    Ok(())
}

/// Deduplicate, sort, and validate tags: ≤ 50 per record, ≤ 64 bytes each,
/// ASCII `[A-Za-z0-9_-]` only.
fn normalize_tags(tags: &[String]) -> Result<Vec<String>> {
    if tags.len() > MAX_TAGS {
        return Err(Error::Validation(format!(
            "too many tags ({} > {MAX_TAGS})",
            tags.len()
        )));
    }
    let mut set = std::collections::BTreeSet::new();
    for tag in tags {
        if tag.is_empty() || tag.len() > MAX_TAG_BYTES {
            return Err(Error::Validation(format!(
                "tag length must be 1..={MAX_TAG_BYTES} bytes: {tag:?}"
            )));
        }
        if !tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(Error::Validation(format!(
                "tag contains invalid characters: {tag:?}"
            )));
        }
        set.insert(tag.clone());
    }
    Ok(set.into_iter().collect())
}

fn clamp_importance(importance: f64) -> Result<f64> {
    if importance.is_nan() {
        return Err(Error::Validation("importance must be a number".to_string()));
    }
    Ok(importance.clamp(0.0, 1.0))
}

/// Per-store token bucket. Default is no throttle; when enabled, `acquire`
/// blocks until a token is available.
struct RateLimiter {
    rate: f64,
    state: Mutex<(f64, Instant)>,
}

impl RateLimiter {
    fn new(per_sec: u32) -> Option<Self> {
        if per_sec == 0 {
            return None;
        }
        let rate = per_sec as f64;
        Some(Self {
            rate,
            state: Mutex::new((rate, Instant::now())),
        })
    }

    fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let (ref mut tokens, ref mut last) = *state;
                *tokens = (*tokens + last.elapsed().as_secs_f64() * self.rate).min(self.rate);
                *last = Instant::now();
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - *tokens) / self.rate)
            };
            std::thread::sleep(wait);
        }
    }
}
