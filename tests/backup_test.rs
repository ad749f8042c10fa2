//! Snapshot, rotation, export/import round-trip, and recovery tests.

mod helpers;

use helpers::*;
use memento::error::{Error, StorageError};
use memento::memory::types::{RecallOptions, RememberOptions};

#[test]
fn backup_produces_openable_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    remember(&store, "snapshot me");

    let path = store.backup(Some(&dir.path().join("snap.db"))).unwrap();
    assert!(path.exists());

    // The snapshot is a complete database
    let conn = memento::db::open_database(&path).unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn rotated_backups_respect_retain_count() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.storage.backup.retain = 3;
    let store = memento::MemoryStore::open(
        &config,
        std::sync::Arc::new(HashProvider::new()),
    )
    .unwrap();
    remember(&store, "rotating");

    for _ in 0..5 {
        store.backup(None).unwrap();
    }

    let backups: Vec<_> = std::fs::read_dir(config.backup_dir())
        .unwrap()
        .flatten()
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("db"))
        .collect();
    assert_eq!(backups.len(), 3);
}

#[test]
fn export_import_round_trip_preserves_everything() {
    let source_dir = tempfile::tempdir().unwrap();
    let store = open_store(&source_dir);

    let opts = RememberOptions {
        collection: "work".to_string(),
        importance: 0.9,
        source: "cli".to_string(),
        session_id: "s7".to_string(),
        tags: vec!["todo".to_string()],
        ..Default::default()
    };
    store.remember("Deploy new model", &opts).unwrap();
    remember(&store, "Team meeting at 3pm");
    remember(&store, "Fix wifi driver");

    let export = store.export_json(Some(&source_dir.path().join("export.json"))).unwrap();

    // Import into an empty store
    let target_dir = tempfile::tempdir().unwrap();
    let restored = open_store(&target_dir);
    let summary = restored.import_json(&export).unwrap();
    assert_eq!(summary.imported, 3);
    assert_eq!(summary.skipped, 0);

    // Identical stats
    let before = store.stats().unwrap();
    let after = restored.stats().unwrap();
    assert_eq!(before.collections, after.collections);
    assert_eq!(before.total_memories, after.total_memories);
    assert_eq!(before.total_vectors, after.total_vectors);

    // Identical recall results (ids, order, scores)
    for query in ["Deploy new model", "Team meeting at 3pm", "wifi"] {
        let a = store.recall(query, &RecallOptions::default()).unwrap();
        let b = restored.recall(query, &RecallOptions::default()).unwrap();
        assert_eq!(a.len(), b.len(), "query {query:?}");
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.memory.id, y.memory.id);
            assert_eq!(x.score, y.score);
        }
    }
}

#[test]
fn import_skips_existing_rows() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    remember(&store, "already here");

    let export = store.export_json(Some(&dir.path().join("export.json"))).unwrap();
    let summary = store.import_json(&export).unwrap();
    assert_eq!(summary.imported, 0);
    assert_eq!(summary.skipped, 1);
    assert_eq!(store.stats().unwrap().total_memories, 1);
}

#[test]
fn recover_restores_newest_backup() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    {
        let store = open_store(&dir);
        remember(&store, "survives via backup");
        store.backup(None).unwrap();
        remember(&store, "lost after corruption");
    }

    // Corrupt the primary database
    let db_path = config.resolved_db_path();
    let mut bytes = std::fs::read(&db_path).unwrap();
    for b in bytes.iter_mut().take(100) {
        *b = 0;
    }
    std::fs::write(&db_path, &bytes).unwrap();
    for suffix in ["-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", db_path.display()));
    }

    let store = open_store(&dir);
    assert!(store.is_corrupt());
    assert!(matches!(
        store.remember("refused", &RememberOptions::default()),
        Err(Error::Storage(StorageError::Corrupt(_)))
    ));

    let used = store.recover().unwrap();
    assert!(used.exists());
    assert!(!store.is_corrupt());

    // The backed-up row is live again and the indexes agree
    let results = store
        .recall("survives via backup", &RecallOptions::default())
        .unwrap();
    assert_eq!(results.len(), 1);
    let health = store.health().unwrap();
    assert!(health.integrity_ok);
    assert!(health.indexes_in_sync());

    // Writes are accepted again
    remember(&store, "fresh write after recovery");
    assert_eq!(store.stats().unwrap().total_memories, 2);
}

#[test]
fn recover_without_backups_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    remember(&store, "no backups yet");

    assert!(matches!(store.recover(), Err(Error::NotFound(_))));
}
