//! Snapshots, rotation, JSON export/import, and corruption recovery.
//!
//! Backups use SQLite's online backup API, so a consistent snapshot is
//! taken while readers keep running. Rotated snapshots live in
//! `backups/<YYYYMMDD-HHMMSS>.db` next to the database; the newest `retain`
//! are kept. `recover` restores the newest backup younger than the
//! configured horizon and rebuilds the in-memory index.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use super::store::MemoryStore;
use super::types::{Memory, RememberOptions};
use crate::db;
use crate::error::{Error, Result, StorageError};

/// Envelope written by `export_json` and read by `import_json`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExportData {
    pub exported_at: String,
    pub total_memories: usize,
    pub memories: Vec<Memory>,
}

/// Outcome of an `import_json` call.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
}

impl MemoryStore {
    /// Take a consistent snapshot. With no explicit path the snapshot goes
    /// to the rotated `backups/` directory and old snapshots beyond the
    /// configured `retain` count are pruned.
    pub fn backup(&self, path: Option<&Path>) -> Result<PathBuf> {
        let rotated = path.is_none();
        let dest = match path {
            Some(p) => p.to_path_buf(),
            None => self.fresh_backup_path()?,
        };
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        {
            let guard = self.connection()?;
            let conn = guard.as_ref().expect("connection checked above");

            let mut target = Connection::open(&dest).map_err(StorageError::from)?;
            let backup = rusqlite::backup::Backup::new(conn, &mut target)
                .map_err(StorageError::from)?;
            backup
                .run_to_completion(100, Duration::from_millis(10), None)
                .map_err(StorageError::from)?;
        }

        tracing::info!(path = %dest.display(), "backup created");
        if rotated {
            self.rotate_backups()?;
        }
        Ok(dest)
    }

    /// Export every memory as JSON. Embeddings are not exported; import
    /// re-derives them, and embedding is deterministic for a given text.
    pub fn export_json(&self, path: Option<&Path>) -> Result<PathBuf> {
        let dest = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
                std::env::current_dir()?.join(format!("memory-export-{stamp}.json"))
            }
        };
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let memories: Vec<Memory> = {
            let guard = self.connection()?;
            let conn = guard.as_ref().expect("connection checked above");
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM memories ORDER BY timestamp ASC, id ASC",
                    super::store::MEMORY_COLUMNS
                ))
                .map_err(StorageError::from)?;
            let rows = stmt
                .query_map([], super::store::row_to_memory)
                .map_err(StorageError::from)?;
            let result = rows
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(StorageError::from)?;
            result
        };

        let data = ExportData {
            exported_at: chrono::Utc::now().to_rfc3339(),
            total_memories: memories.len(),
            memories,
        };

        let file = std::fs::File::create(&dest)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), &data)
            .map_err(|e| Error::Storage(StorageError::Io(e.to_string())))?;

        tracing::info!(path = %dest.display(), count = data.total_memories, "export written");
        Ok(dest)
    }

    /// Import memories from an `export_json` file through the full write
    /// path. Timestamps are preserved so restored records keep their ids;
    /// records whose id already exists are skipped.
    pub fn import_json(&self, path: &Path) -> Result<ImportSummary> {
        let json = std::fs::read_to_string(path)?;
        let data: ExportData = serde_json::from_str(&json)
            .map_err(|e| Error::Validation(format!("failed to parse import JSON: {e}")))?;

        let mut imported = 0usize;
        let mut skipped = 0usize;

        for memory in &data.memories {
            if self.index.contains(memory.id) {
                skipped += 1;
                continue;
            }
            let opts = RememberOptions {
                collection: memory.collection.clone(),
                importance: memory.importance,
                source: memory.source.clone(),
                session_id: memory.session_id.clone(),
                tags: memory.tags.clone(),
                timestamp: Some(memory.timestamp),
            };
            let id = self.remember(&memory.text, &opts)?;
            if id != memory.id {
                // Same text/source/session/ts must re-derive the same id;
                // anything else means the export was edited by hand.
                tracing::warn!(expected = %memory.id, actual = %id,
                    "imported record re-derived a different id");
            }
            imported += 1;
        }

        tracing::info!(imported, skipped, "import complete");
        Ok(ImportSummary { imported, skipped })
    }

    /// Restore the newest backup younger than the configured horizon and
    /// reopen the store. Clears corrupt mode on success.
    pub fn recover(&self) -> Result<PathBuf> {
        let horizon = Duration::from_secs(self.backup_cfg.restore_horizon_hours * 3600);
        let backup = self
            .usable_backups(horizon)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no backup younger than {}h in {}",
                    self.backup_cfg.restore_horizon_hours,
                    self.backup_dir.display()
                ))
            })?;

        tracing::info!(backup = %backup.display(), "restoring from backup");

        // Drop the broken database and its WAL sidecars before copying.
        self.take_connection();
        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{suffix}", self.db_path.display()));
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        std::fs::copy(&backup, &self.db_path)?;

        let conn = db::open_database(&self.db_path)?;
        self.set_corrupt(false);
        self.replace_connection(conn)?;

        tracing::info!(path = %self.db_path.display(), "recovery complete");
        Ok(backup)
    }

    /// Backups on disk, newest first, no older than `horizon`.
    fn usable_backups(&self, horizon: Duration) -> Result<Vec<PathBuf>> {
        let mut backups: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
        let entries = match std::fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(Vec::new()),
        };

        let now = std::time::SystemTime::now();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("db") {
                continue;
            }
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age <= horizon {
                backups.push((path, modified));
            }
        }

        backups.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(backups.into_iter().map(|(p, _)| p).collect())
    }

    /// Next rotated backup path; a `-N` suffix resolves same-second
    /// collisions.
    fn fresh_backup_path(&self) -> Result<PathBuf> {
        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let mut candidate = self.backup_dir.join(format!("{stamp}.db"));
        let mut n = 1;
        while candidate.exists() {
            candidate = self.backup_dir.join(format!("{stamp}-{n}.db"));
            n += 1;
        }
        Ok(candidate)
    }

    /// Delete rotated snapshots beyond the configured retain count, oldest
    /// first.
    fn rotate_backups(&self) -> Result<()> {
        let retain = self.backup_cfg.retain.max(1);
        let mut backups = self.usable_backups(Duration::MAX)?;
        while backups.len() > retain {
            let victim = backups.pop().expect("len checked above");
            tracing::debug!(path = %victim.display(), "pruning old backup");
            std::fs::remove_file(&victim)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_envelope_round_trips_serde() {
        let data = ExportData {
            exported_at: "2026-08-02T00:00:00Z".to_string(),
            total_memories: 0,
            memories: Vec::new(),
        };
        let json = serde_json::to_string(&data).unwrap();
        let back: ExportData = serde_json::from_str(&json).unwrap();
        assert_eq!(back.total_memories, 0);
        assert!(back.memories.is_empty());
    }
}
