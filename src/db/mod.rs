//! Database initialization, pragmas, integrity checks, and health reports.

pub mod migrations;
pub mod schema;

use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::Once;

use crate::error::{Error, Result, StorageError};

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Open (or create) the primary database at the given path, with the vec
/// extension loaded, WAL enabled, schema initialized, and migrations run.
///
/// A failed integrity check surfaces as `Storage(Corrupt)`; the caller
/// decides whether to refuse writes or attempt recovery.
pub fn open_database(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            StorageError::Io(format!("failed to create directory {}: {e}", parent.display()))
        })?;
    }

    load_sqlite_vec();

    let mut conn = Connection::open(path).map_err(StorageError::from)?;

    // WAL lets readers run concurrently with the single writer.
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(StorageError::from)?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(StorageError::from)?;
    // Wait up to 5 seconds for locks instead of failing immediately
    conn.pragma_update(None, "busy_timeout", "5000")
        .map_err(StorageError::from)?;

    schema::init_schema(&conn)
        .map_err(|e| StorageError::Schema(format!("failed to initialize schema: {e}")))?;
    migrations::run_migrations(&mut conn)
        .map_err(|e| StorageError::Schema(format!("failed to run migrations: {e}")))?;

    // Quick integrity check after schema init
    let integrity: String = conn
        .pragma_query_value(None, "quick_check", |row| row.get(0))
        .map_err(StorageError::from)?;
    if integrity != "ok" {
        return Err(Error::Storage(StorageError::Corrupt(integrity)));
    }

    tracing::info!(path = %path.display(), "database initialized");
    Ok(conn)
}

/// Result of a full database health check.
#[derive(Debug)]
pub struct HealthReport {
    pub schema_version: u32,
    pub embedding_model: Option<String>,
    pub integrity_ok: bool,
    pub integrity_details: String,
    pub sqlite_vec_version: String,
    pub memory_count: i64,
    pub vector_count: i64,
    pub fts_count: i64,
}

impl HealthReport {
    /// True when the memory table, vector table, and FTS index agree on
    /// row counts (necessary condition for index consistency).
    pub fn indexes_in_sync(&self) -> bool {
        self.memory_count == self.vector_count && self.memory_count == self.fts_count
    }
}

/// Run a comprehensive health check on the database.
pub fn check_database_health(conn: &Connection) -> Result<HealthReport> {
    let schema_version = migrations::get_schema_version(conn).map_err(StorageError::from)?;
    let embedding_model = migrations::get_embedding_model(conn).map_err(StorageError::from)?;

    let integrity_details: String = conn
        .pragma_query_value(None, "integrity_check", |row| row.get(0))
        .map_err(StorageError::from)?;
    let integrity_ok = integrity_details == "ok";

    let sqlite_vec_version: String = conn
        .query_row("SELECT vec_version()", [], |row| row.get(0))
        .map_err(StorageError::from)?;

    let memory_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))
        .unwrap_or(0);

    let vector_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM memories_vec", [], |row| row.get(0))
        .unwrap_or(0);

    let fts_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM memories_fts", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(HealthReport {
        schema_version,
        embedding_model,
        integrity_ok,
        integrity_details,
        sqlite_vec_version,
        memory_count,
        vector_count,
        fts_count,
    })
}

/// Open an in-memory database for testing.
#[cfg(test)]
pub fn open_memory_database() -> Result<Connection> {
    load_sqlite_vec();
    let mut conn = Connection::open_in_memory().map_err(StorageError::from)?;
    schema::init_schema(&conn)
        .map_err(|e| StorageError::Schema(format!("failed to initialize schema: {e}")))?;
    migrations::run_migrations(&mut conn)
        .map_err(|e| StorageError::Schema(format!("failed to run migrations: {e}")))?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        let conn = open_database(&path).unwrap();
        assert!(path.exists());

        let report = check_database_health(&conn).unwrap();
        assert!(report.integrity_ok);
        assert_eq!(report.schema_version, migrations::CURRENT_SCHEMA_VERSION);
        assert_eq!(report.memory_count, 0);
        assert!(report.indexes_in_sync());
    }

    #[test]
    fn open_garbage_file_reports_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        // 1024 bytes of zeroes is not a SQLite database
        std::fs::write(&path, vec![0u8; 1024]).unwrap();

        match open_database(&path) {
            Err(Error::Storage(StorageError::Corrupt(_))) => {}
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }
}
