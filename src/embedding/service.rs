//! The embedding service: encoder lifecycle + cache glue.
//!
//! [`Embedder`] owns the ONNX encoder session and the two-tier cache. The
//! encoder moves through an explicit state machine:
//!
//! ```text
//! Cold ─construct/re-warm→ Loading ─ok→ Ready ─idle→ Unloading ─→ Cold
//!                              └─err→ Cold (error surfaced to waiters)
//! ```
//!
//! Construction spawns a background warm-up; `embed` blocks on readiness up
//! to the warm-up timeout. An idle monitor drops the session after a
//! configurable quiet period; the next `embed` re-warms. Concurrent misses
//! for the same text hash are de-duplicated so N callers cost one forward
//! pass. If the encoder cannot be loaded and fallback mode was enabled at
//! construction, deterministic hash-derived vectors are served instead (and
//! never persisted to the cache).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use super::cache::{text_hash, CacheStats, EmbedCache, TextHash};
use super::encoder::OnnxEncoder;
use super::{fallback_embedding, nfc, EmbeddingProvider};
use crate::config::EmbeddingConfig;
use crate::error::EmbeddingError;

type FlightResult = Result<Vec<f32>, EmbeddingError>;

enum EncoderSlot {
    Cold { last_error: Option<String> },
    Loading,
    Ready { encoder: Arc<OnnxEncoder>, last_used: Instant },
    Unloading,
}

impl EncoderSlot {
    fn name(&self) -> &'static str {
        match self {
            EncoderSlot::Cold { .. } => "cold",
            EncoderSlot::Loading => "loading",
            EncoderSlot::Ready { .. } => "ready",
            EncoderSlot::Unloading => "unloading",
        }
    }
}

struct Shared {
    slot: Mutex<EncoderSlot>,
    cond: Condvar,
    cache: EmbedCache,
    pending: Mutex<HashMap<TextHash, Arc<OnceLock<FlightResult>>>>,
    model_dir: PathBuf,
    warmup_timeout: Duration,
    idle_timeout: Duration,
    allow_fallback: bool,
    bypass_cache: bool,
    shutdown: AtomicBool,
    encoder_calls: AtomicU64,
    fallback_embeds: AtomicU64,
}

/// Snapshot of the embedding service, for `stats()`.
#[derive(Debug, Clone, Serialize)]
pub struct EmbedderStats {
    pub state: &'static str,
    pub encoder_calls: u64,
    pub fallback_embeds: u64,
    pub cache: CacheStats,
}

/// Encoder + cache glue. Cheap to clone-share via `Arc<Embedder>`; the
/// session and the LRU are uniquely owned here.
pub struct Embedder {
    shared: Arc<Shared>,
}

impl Embedder {
    /// Construct the embedder and start the background warm-up immediately.
    pub fn new(config: &EmbeddingConfig, cache: EmbedCache) -> Self {
        Self::build(config, cache, false)
    }

    /// As [`Embedder::new`] but with the cache bypassed for every call.
    pub fn with_cache_bypassed(config: &EmbeddingConfig, cache: EmbedCache) -> Self {
        Self::build(config, cache, true)
    }

    fn build(config: &EmbeddingConfig, cache: EmbedCache, bypass_cache: bool) -> Self {
        let shared = Arc::new(Shared {
            slot: Mutex::new(EncoderSlot::Loading),
            cond: Condvar::new(),
            cache,
            pending: Mutex::new(HashMap::new()),
            model_dir: crate::config::expand_tilde(&config.model_dir),
            warmup_timeout: Duration::from_millis(config.warmup_timeout_ms),
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            allow_fallback: config.allow_fallback,
            bypass_cache,
            shutdown: AtomicBool::new(false),
            encoder_calls: AtomicU64::new(0),
            fallback_embeds: AtomicU64::new(0),
        });

        Self::spawn_loader(shared.clone());
        if !shared.idle_timeout.is_zero() {
            Self::spawn_idle_monitor(shared.clone());
        }

        Self { shared }
    }

    /// True once the encoder has finished loading.
    pub fn ready(&self) -> bool {
        matches!(*self.shared.slot.lock(), EncoderSlot::Ready { .. })
    }

    /// Block until the encoder is ready or `timeout` elapses. Returns the
    /// readiness at exit. A load failure unblocks immediately with `false`.
    pub fn wait_until_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        loop {
            match &*slot {
                EncoderSlot::Ready { .. } => return true,
                EncoderSlot::Cold { .. } => return false,
                EncoderSlot::Loading | EncoderSlot::Unloading => {
                    if self.shared.cond.wait_until(&mut slot, deadline).timed_out() {
                        return matches!(*slot, EncoderSlot::Ready { .. });
                    }
                }
            }
        }
    }

    /// Total ONNX forward-pass batches issued. Survives unload/re-warm.
    pub fn encoder_calls(&self) -> u64 {
        self.shared.encoder_calls.load(Ordering::Relaxed)
    }

    /// Number of embeds served by the deterministic fallback.
    pub fn fallback_embeds(&self) -> u64 {
        self.shared.fallback_embeds.load(Ordering::Relaxed)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.shared.cache.stats()
    }

    pub fn clear_cache(&self) -> crate::error::Result<()> {
        self.shared.cache.clear()
    }

    pub fn stats(&self) -> EmbedderStats {
        EmbedderStats {
            state: self.shared.slot.lock().name(),
            encoder_calls: self.encoder_calls(),
            fallback_embeds: self.fallback_embeds(),
            cache: self.cache_stats(),
        }
    }

    /// Drop the encoder session now, regardless of idle state. The next
    /// `embed` re-warms.
    pub fn unload(&self) {
        Self::unload_slot(&self.shared);
    }

    fn spawn_loader(shared: Arc<Shared>) {
        std::thread::spawn(move || {
            let result = OnnxEncoder::load(&shared.model_dir);
            let mut slot = shared.slot.lock();
            match result {
                Ok(encoder) => {
                    tracing::info!("encoder warm-up complete");
                    *slot = EncoderSlot::Ready {
                        encoder: Arc::new(encoder),
                        last_used: Instant::now(),
                    };
                }
                Err(e) => {
                    tracing::warn!(error = %e, "encoder warm-up failed");
                    *slot = EncoderSlot::Cold {
                        last_error: Some(e.to_string()),
                    };
                }
            }
            shared.cond.notify_all();
        });
    }

    fn spawn_idle_monitor(shared: Arc<Shared>) {
        std::thread::spawn(move || loop {
            let mut slot = shared.slot.lock();
            if shared.shutdown.load(Ordering::Relaxed) {
                return;
            }

            let wait = match &*slot {
                EncoderSlot::Ready { last_used, .. } => shared
                    .idle_timeout
                    .saturating_sub(last_used.elapsed())
                    .max(Duration::from_millis(10)),
                _ => shared.idle_timeout,
            };
            shared.cond.wait_for(&mut slot, wait);

            if shared.shutdown.load(Ordering::Relaxed) {
                return;
            }
            let expired = matches!(
                &*slot,
                EncoderSlot::Ready { last_used, .. } if last_used.elapsed() >= shared.idle_timeout
            );
            drop(slot);
            if expired {
                tracing::info!("encoder idle timeout, unloading");
                Self::unload_slot(&shared);
            }
        });
    }

    /// Ready → Unloading → Cold. The session itself is dropped outside the
    /// lock; in-flight encodes holding a clone finish first.
    fn unload_slot(shared: &Shared) {
        let mut slot = shared.slot.lock();
        let encoder = match std::mem::replace(&mut *slot, EncoderSlot::Unloading) {
            EncoderSlot::Ready { encoder, .. } => encoder,
            other => {
                *slot = other;
                return;
            }
        };
        drop(slot);

        drop(encoder);

        let mut slot = shared.slot.lock();
        *slot = EncoderSlot::Cold { last_error: None };
        shared.cond.notify_all();
    }

    /// Wait for (or trigger) an encoder, bounded by the warm-up timeout.
    fn acquire_encoder(&self) -> Result<Arc<OnnxEncoder>, EmbeddingError> {
        let shared = &self.shared;
        let deadline = Instant::now() + shared.warmup_timeout;
        let mut slot = shared.slot.lock();
        let mut attempted = false;

        loop {
            match &mut *slot {
                EncoderSlot::Ready { encoder, last_used } => {
                    *last_used = Instant::now();
                    return Ok(encoder.clone());
                }
                EncoderSlot::Cold { last_error } => {
                    if attempted {
                        // A load already failed while this call was waiting.
                        let msg = last_error
                            .clone()
                            .unwrap_or_else(|| "encoder failed to load".to_string());
                        return Err(EmbeddingError::Unavailable(msg));
                    }
                    // Re-warm: one fresh attempt per call.
                    *slot = EncoderSlot::Loading;
                    attempted = true;
                    Self::spawn_loader(shared.clone());
                }
                EncoderSlot::Loading | EncoderSlot::Unloading => {
                    attempted = true;
                    if shared.cond.wait_until(&mut slot, deadline).timed_out() {
                        return Err(EmbeddingError::Unavailable(
                            "timed out waiting for encoder warm-up".to_string(),
                        ));
                    }
                }
            }
        }
    }

    /// Encode a cache miss, de-duplicated per text hash.
    fn encode_miss(&self, text_nfc: &str, hash: TextHash) -> FlightResult {
        match self.acquire_encoder() {
            Ok(encoder) => {
                self.shared.encoder_calls.fetch_add(1, Ordering::Relaxed);
                let v = encoder.encode(text_nfc)?;
                self.shared.cache.put(hash, &v, self.shared.bypass_cache);
                Ok(v)
            }
            Err(e) if self.shared.allow_fallback => {
                tracing::warn!(error = %e, "encoder unavailable, serving fallback embedding");
                self.shared.fallback_embeds.fetch_add(1, Ordering::Relaxed);
                // Fallback vectors are never cached.
                Ok(fallback_embedding(text_nfc))
            }
            Err(e) => Err(e),
        }
    }

    fn embed_nfc(&self, text_nfc: &str) -> FlightResult {
        let hash = text_hash(text_nfc);
        if let Some(v) = self.shared.cache.get(hash, self.shared.bypass_cache) {
            return Ok(v);
        }

        let flight = {
            let mut pending = self.shared.pending.lock();
            pending
                .entry(hash)
                .or_insert_with(|| Arc::new(OnceLock::new()))
                .clone()
        };
        // Exactly one caller runs the closure; the rest block until it
        // finishes and clone the shared outcome.
        let result = flight
            .get_or_init(|| self.encode_miss(text_nfc, hash))
            .clone();
        self.shared.pending.lock().remove(&hash);
        result
    }
}

impl EmbeddingProvider for Embedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_nfc(&nfc(text))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let nfc_texts: Vec<String> = texts.iter().map(|t| nfc(t)).collect();
        let hashes: Vec<TextHash> = nfc_texts.iter().map(|t| text_hash(t)).collect();

        let mut out: Vec<Option<Vec<f32>>> = hashes
            .iter()
            .map(|&h| self.shared.cache.get(h, self.shared.bypass_cache))
            .collect();

        let missing: Vec<usize> = (0..out.len()).filter(|&i| out[i].is_none()).collect();
        if !missing.is_empty() {
            match self.acquire_encoder() {
                Ok(encoder) => {
                    let inputs: Vec<&str> = missing.iter().map(|&i| nfc_texts[i].as_str()).collect();
                    self.shared.encoder_calls.fetch_add(1, Ordering::Relaxed);
                    let vectors = encoder.encode_batch(&inputs)?;
                    for (&i, v) in missing.iter().zip(vectors.into_iter()) {
                        self.shared.cache.put(hashes[i], &v, self.shared.bypass_cache);
                        out[i] = Some(v);
                    }
                }
                Err(e) if self.shared.allow_fallback => {
                    tracing::warn!(error = %e, count = missing.len(),
                        "encoder unavailable, serving fallback embeddings");
                    for &i in &missing {
                        self.shared.fallback_embeds.fetch_add(1, Ordering::Relaxed);
                        out[i] = Some(fallback_embedding(&nfc_texts[i]));
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Ok(out
            .into_iter()
            .map(|v| v.expect("every slot filled above"))
            .collect())
    }
}

impl Drop for Embedder {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        self.shared.cond.notify_all();
    }
}
