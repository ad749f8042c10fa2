//! End-to-end scenarios against the real ONNX encoder.
//!
//! These need `model.onnx` and `tokenizer.json` under the configured model
//! directory; run with `cargo test -- --ignored` after downloading them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use memento::config::MementoConfig;
use memento::embedding::cache::EmbedCache;
use memento::embedding::service::Embedder;
use memento::embedding::EmbeddingProvider;
use memento::memory::types::{RecallOptions, RememberOptions};
use memento::MemoryStore;
use serde_json::json;
use tempfile::TempDir;

fn model_config(dir: &TempDir) -> MementoConfig {
    let mut config = MementoConfig::default();
    config.storage.db_path = dir.path().join("memory.db").to_string_lossy().into_owned();
    config.cache.db_path = dir.path().join("cache.db").to_string_lossy().into_owned();
    config
}

fn open_model_store(dir: &TempDir) -> (MemoryStore, Arc<Embedder>) {
    let config = model_config(dir);
    let cache = EmbedCache::open(config.resolved_cache_path(), config.cache.lru_size).unwrap();
    let embedder = Arc::new(Embedder::new(&config.embedding, cache));
    assert!(
        embedder.wait_until_ready(Duration::from_secs(60)),
        "model files missing or encoder failed to warm up"
    );
    let store = MemoryStore::open(&config, embedder.clone()).unwrap();
    (store, embedder)
}

fn remember_tagged(store: &MemoryStore, text: &str, tags: &[&str]) {
    let opts = RememberOptions {
        tags: tags.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    };
    store.remember(text, &opts).unwrap();
}

#[test]
#[ignore]
fn semantic_recall_ranks_related_text_first() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _embedder) = open_model_store(&dir);

    remember_tagged(&store, "Deploy new model", &["todo", "deploy"]);
    remember_tagged(&store, "Team meeting at 3pm", &["work"]);
    remember_tagged(&store, "Fix wifi driver", &["todo", "bug"]);

    let opts = RecallOptions {
        topk: 2,
        ..Default::default()
    };
    let results = store.recall("deployment", &opts).unwrap();
    assert_eq!(results[0].memory.text, "Deploy new model");
    assert!(
        results[0].score >= 0.4,
        "expected score ≥ 0.4, got {}",
        results[0].score
    );

    let opts = RecallOptions {
        filters: Some(json!({"tags": ["work"]}).as_object().unwrap().clone()),
        ..Default::default()
    };
    let results = store.recall("meeting", &opts).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].memory.text, "Team meeting at 3pm");
}

#[test]
#[ignore]
fn batch_recall_amortizes_encoder_time() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _embedder) = open_model_store(&dir);

    for i in 0..1000 {
        store
            .remember(
                &format!("distinct short memory number {i}"),
                &RememberOptions::default(),
            )
            .unwrap();
    }

    let single_start = Instant::now();
    store
        .recall("short memory", &RecallOptions::default())
        .unwrap();
    let single = single_start.elapsed();

    let queries = ["first topic", "second different topic", "third topic"];
    let batch_start = Instant::now();
    let results = store.batch_recall(&queries, &RecallOptions::default()).unwrap();
    let batch = batch_start.elapsed();

    assert_eq!(results.len(), 3);
    for list in &results {
        assert_eq!(list.len(), 5);
    }
    assert!(
        batch < single * 3,
        "batch ({batch:?}) must beat 3× single recall ({single:?})"
    );
}

#[test]
#[ignore]
fn persistent_cache_survives_restart_without_encoder_calls() {
    let dir = tempfile::tempdir().unwrap();
    let config = model_config(&dir);

    {
        let cache =
            EmbedCache::open(config.resolved_cache_path(), config.cache.lru_size).unwrap();
        let embedder = Embedder::new(&config.embedding, cache);
        assert!(embedder.wait_until_ready(Duration::from_secs(60)));
        embedder.embed("hello").unwrap();
        assert_eq!(embedder.encoder_calls(), 1);
    }

    // "Restart": a fresh embedder over the same cache.db
    let cache = EmbedCache::open(config.resolved_cache_path(), config.cache.lru_size).unwrap();
    let embedder = Embedder::new(&config.embedding, cache);
    assert!(embedder.wait_until_ready(Duration::from_secs(60)));

    embedder.embed("hello").unwrap();
    assert_eq!(
        embedder.encoder_calls(),
        0,
        "persistent cache hit must not invoke the encoder"
    );
    assert_eq!(embedder.cache_stats().disk_hits, 1);
}

#[test]
#[ignore]
fn cold_and_warm_cache_embeds_are_bit_identical() {
    let dir = tempfile::tempdir().unwrap();
    let (_store, embedder) = open_model_store(&dir);

    let cold = embedder.embed("determinism check sentence").unwrap();
    let warm = embedder.embed("determinism check sentence").unwrap();
    assert_eq!(cold, warm, "warm-cache embed must be bit-identical");
}
