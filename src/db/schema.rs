//! SQL DDL for the primary database.
//!
//! Defines the `memories`, `memories_fts` (FTS5), `memories_vec` (vec0), and
//! `schema_meta` tables. All DDL uses `IF NOT EXISTS` for idempotent
//! initialization. The embed cache table lives in a separate `cache.db` and
//! is owned by the embedding layer.

use rusqlite::Connection;

/// All schema DDL statements for the core tables.
const SCHEMA_SQL: &str = r#"
-- Primary memory storage. `id` is 32 lowercase hex chars (blake2b-128 of
-- text/source/session/timestamp); `embedding` is 384 little-endian f32s.
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    text TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    source TEXT NOT NULL DEFAULT 'unknown',
    session_id TEXT NOT NULL DEFAULT 'default',
    importance REAL NOT NULL DEFAULT 0.5 CHECK(importance >= 0.0 AND importance <= 1.0),
    tags TEXT NOT NULL DEFAULT '[]',
    collection TEXT NOT NULL DEFAULT 'knowledge',
    embedding BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memories_collection ON memories(collection);
CREATE INDEX IF NOT EXISTS idx_memories_timestamp ON memories(timestamp);
CREATE INDEX IF NOT EXISTS idx_memories_source ON memories(source);
CREATE INDEX IF NOT EXISTS idx_memories_session ON memories(session_id);

-- Full-text search (BM25), kept in lock-step with `memories` by explicit
-- rowid inside the same transaction as every insert/delete.
CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    text,
    id UNINDEXED,
    content='memories',
    content_rowid='rowid'
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// vec0 virtual table must be created separately (sqlite-vec syntax).
const VEC_TABLE_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS memories_vec USING vec0(
    id TEXT PRIMARY KEY,
    embedding FLOAT[384]
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(VEC_TABLE_SQL)?;

    // Set initial schema version if not already present
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}
