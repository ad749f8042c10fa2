//! ONNX encoder for all-MiniLM-L6-v2.
//!
//! Tokenization, inference, mean pooling, and L2 normalization. One code
//! path produces correctly-shaped tensors for any batch size ≥ 1; oversize
//! batches are chunked internally with order preserved.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use ort::session::Session;
use ort::value::Tensor;
use tokenizers::Tokenizer;

use super::EMBEDDING_DIM;
use crate::error::EmbeddingError;
use crate::vector;

/// Maximum sequence length for all-MiniLM-L6-v2 (trained at 256).
const MAX_SEQ_LEN: usize = 256;

/// Upper bound on tensors per forward pass; larger batches are chunked.
const MAX_BATCH_SIZE: usize = 32;

/// ONNX-backed text encoder. The session is shared behind a mutex; batch
/// calls amortise the lock cost.
pub struct OnnxEncoder {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    forward_passes: AtomicU64,
}

// Safety: Tokenizer is Send+Sync. Session is behind a Mutex, which
// guarantees exclusive access during run().
unsafe impl Send for OnnxEncoder {}
unsafe impl Sync for OnnxEncoder {}

impl OnnxEncoder {
    /// Load `model.onnx` and `tokenizer.json` from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, EmbeddingError> {
        let model_path = model_dir.join("model.onnx");
        let tokenizer_path = model_dir.join("tokenizer.json");

        if !model_path.exists() {
            return Err(EmbeddingError::Unavailable(format!(
                "ONNX model not found at {}",
                model_path.display()
            )));
        }
        if !tokenizer_path.exists() {
            return Err(EmbeddingError::Unavailable(format!(
                "tokenizer not found at {}",
                tokenizer_path.display()
            )));
        }

        let session = Session::builder()
            .and_then(|b| {
                b.with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
            })
            .and_then(|b| b.with_intra_threads(4))
            .and_then(|b| b.commit_from_file(&model_path))
            .map_err(|e| EmbeddingError::Encoder(format!("failed to load ONNX model: {e}")))?;

        tracing::info!(model = %model_path.display(), "ONNX model loaded");

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| EmbeddingError::Tokenizer(format!("failed to load tokenizer: {e}")))?;

        tokenizer
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: MAX_SEQ_LEN,
                ..Default::default()
            }))
            .map_err(|e| EmbeddingError::Tokenizer(format!("failed to set truncation: {e}")))?;

        tokenizer.with_padding(Some(tokenizers::PaddingParams {
            strategy: tokenizers::PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        tracing::info!(tokenizer = %tokenizer_path.display(), "tokenizer loaded");

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            forward_passes: AtomicU64::new(0),
        })
    }

    /// Number of ONNX forward passes run so far. Cache-hit tests rely on
    /// this counter not moving.
    pub fn forward_passes(&self) -> u64 {
        self.forward_passes.load(Ordering::Relaxed)
    }

    /// Encode a batch of texts into unit vectors, in input order.
    pub fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut results = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(MAX_BATCH_SIZE) {
            results.extend(self.encode_chunk(chunk)?);
        }
        Ok(results)
    }

    /// Encode a single text into a unit vector.
    pub fn encode(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut results = self.encode_chunk(&[text])?;
        results
            .pop()
            .ok_or_else(|| EmbeddingError::Encoder("empty result for single input".into()))
    }

    /// The single tokenise → pad → infer → pool path. Handles any chunk
    /// size ≥ 1 with identically-shaped tensors.
    fn encode_chunk(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        // Step 1: Tokenize with right-padding to the batch longest
        let inputs: Vec<String> = texts.iter().map(|t| t.to_string()).collect();
        let encodings = self
            .tokenizer
            .encode_batch(inputs, true)
            .map_err(|e| EmbeddingError::Tokenizer(format!("tokenization failed: {e}")))?;

        let batch_size = encodings.len();
        let seq_len = encodings[0].get_ids().len();

        // Step 2: Build flat input tensors as i64
        let mut input_ids_flat = Vec::with_capacity(batch_size * seq_len);
        let mut attention_mask_flat = Vec::with_capacity(batch_size * seq_len);

        for encoding in &encodings {
            for &id in encoding.get_ids() {
                input_ids_flat.push(id as i64);
            }
            for &mask in encoding.get_attention_mask() {
                attention_mask_flat.push(mask as i64);
            }
        }

        let shape = vec![batch_size as i64, seq_len as i64];
        let input_ids_tensor = Tensor::from_array((shape.clone(), input_ids_flat.into_boxed_slice()))
            .map_err(|e| EmbeddingError::Encoder(format!("input_ids tensor: {e}")))?;
        let attention_mask_tensor = Tensor::from_array((
            shape.clone(),
            attention_mask_flat.clone().into_boxed_slice(),
        ))
        .map_err(|e| EmbeddingError::Encoder(format!("attention_mask tensor: {e}")))?;
        // token_type_ids: all zeros (single sentence, no segment B)
        let token_type_ids = vec![0i64; batch_size * seq_len];
        let token_type_ids_tensor = Tensor::from_array((shape, token_type_ids.into_boxed_slice()))
            .map_err(|e| EmbeddingError::Encoder(format!("token_type_ids tensor: {e}")))?;

        // Step 3: Run ONNX inference
        let session = self
            .session
            .lock()
            .map_err(|e| EmbeddingError::Encoder(format!("session lock poisoned: {e}")))?;

        let inputs = ort::inputs! {
            "input_ids" => input_ids_tensor,
            "attention_mask" => attention_mask_tensor,
            "token_type_ids" => token_type_ids_tensor,
        }
        .map_err(|e| EmbeddingError::Encoder(format!("failed to build session inputs: {e}")))?;
        let outputs = session
            .run(inputs)
            .map_err(|e| EmbeddingError::Encoder(format!("forward pass failed: {e}")))?;
        self.forward_passes.fetch_add(1, Ordering::Relaxed);

        // Step 4: Extract token embeddings — shape [batch, seq_len, 384].
        // The output name varies by ONNX export; try common names, fall
        // back to index 0.
        let token_emb_value = outputs
            .get("token_embeddings")
            .or_else(|| outputs.get("last_hidden_state"))
            .unwrap_or_else(|| &outputs[0]);

        let token_emb_array = token_emb_value
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbeddingError::Encoder(format!("failed to extract output tensor: {e}")))?;

        let dims: Vec<i64> = token_emb_array.shape().iter().map(|&d| d as i64).collect();
        let dims: &[i64] = &dims;
        let data: Vec<f32> = token_emb_array.iter().copied().collect();
        if dims.len() != 3 || dims[2] != EMBEDDING_DIM as i64 {
            return Err(EmbeddingError::Encoder(format!(
                "unexpected output shape: {dims:?}, expected [batch, seq, {EMBEDDING_DIM}]"
            )));
        }
        let hidden_dim = dims[2] as usize;
        let actual_seq_len = dims[1] as usize;

        // Step 5: Mean pooling with attention mask
        let mut results = Vec::with_capacity(batch_size);
        for b in 0..batch_size {
            let mut sum = vec![0.0f32; hidden_dim];
            let mut count = 0.0f32;

            for s in 0..actual_seq_len {
                let mask = attention_mask_flat[b * seq_len + s] as f32;
                if mask > 0.0 {
                    let offset = (b * actual_seq_len + s) * hidden_dim;
                    for d in 0..hidden_dim {
                        sum[d] += data[offset + d] * mask;
                    }
                    count += mask;
                }
            }

            if count > 0.0 {
                for d in sum.iter_mut() {
                    *d /= count;
                }
            }

            // Step 6: L2 normalize
            vector::l2_normalize_in_place(&mut sum);
            results.push(sum);
        }

        Ok(results)
    }
}
