//! Batch embedding through a local ONNX model.

use std::sync::Mutex;

use async_trait::async_trait;
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;
use tokenizers::Tokenizer;
use tokenizers::{PaddingParams, PaddingStrategy, TruncationParams, TruncationStrategy};

use crate::error::ModelError;
use crate::models::EmbeddingConfig;

/// Turns a batch of chunk texts into same-length fixed-dimension vectors.
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Width of every vector this encoder produces.
    fn dimension(&self) -> usize;

    /// Encode one batch. The output length equals the input length. The
    /// encoder does not retry internally; failures surface to the caller.
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError>;
}

/// ONNX Runtime encoder: padded batch tokenization, one forward pass per
/// batch, mask-weighted mean pooling over the sequence axis.
pub struct OnnxEncoder {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    dimension: usize,
}

impl OnnxEncoder {
    pub fn load(config: &EmbeddingConfig) -> Result<Self, ModelError> {
        let model_path = config.model_dir.join("model.onnx");
        let tokenizer_path = config.model_dir.join("tokenizer.json");
        let max_tokens = config.max_tokens as usize;

        if !model_path.exists() {
            return Err(ModelError::NotFound(format!(
                "model not found: {}",
                model_path.display()
            )));
        }

        let session = Session::builder()
            .map_err(|e: ort::Error| ModelError::LoadError(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e: ort::Error| ModelError::LoadError(e.to_string()))?
            .with_intra_threads(num_cpus())
            .map_err(|e: ort::Error| ModelError::LoadError(e.to_string()))?
            .commit_from_file(&model_path)
            .map_err(|e: ort::Error| ModelError::LoadError(e.to_string()))?;

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| ModelError::TokenizerError(e.to_string()))?;

        // The chunker already bounds chunk length; truncation here is the
        // last line of defense against overflowing the context window.
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: max_tokens,
                strategy: TruncationStrategy::LongestFirst,
                ..Default::default()
            }))
            .map_err(|e| ModelError::TokenizerError(e.to_string()))?;

        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            dimension: config.dimension as usize,
        })
    }

    fn encode_sync(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| ModelError::TokenizerError(e.to_string()))?;

        let max_len = encodings
            .iter()
            .map(|e| e.get_ids().len())
            .max()
            .unwrap_or(0);
        let batch_size = encodings.len();

        let mut input_ids = vec![0i64; batch_size * max_len];
        let mut attention_mask = vec![0i64; batch_size * max_len];
        let mut token_type_ids = vec![0i64; batch_size * max_len];

        for (i, encoding) in encodings.iter().enumerate() {
            let ids = encoding.get_ids();
            let mask = encoding.get_attention_mask();
            let types = encoding.get_type_ids();
            for j in 0..ids.len() {
                input_ids[i * max_len + j] = ids[j] as i64;
                attention_mask[i * max_len + j] = mask[j] as i64;
                token_type_ids[i * max_len + j] = types[j] as i64;
            }
        }

        let input_ids_tensor = Tensor::from_array(([batch_size, max_len], input_ids))
            .map_err(|e: ort::Error| ModelError::InferenceError(e.to_string()))?;
        let attention_mask_tensor = Tensor::from_array(([batch_size, max_len], attention_mask))
            .map_err(|e: ort::Error| ModelError::InferenceError(e.to_string()))?;
        let token_type_ids_tensor = Tensor::from_array(([batch_size, max_len], token_type_ids))
            .map_err(|e: ort::Error| ModelError::InferenceError(e.to_string()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| ModelError::InferenceError("session lock poisoned".to_string()))?;

        let outputs = session
            .run(ort::inputs![
                input_ids_tensor,
                attention_mask_tensor,
                token_type_ids_tensor
            ])
            .map_err(|e: ort::Error| ModelError::InferenceError(e.to_string()))?;

        let output_array = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e: ort::Error| ModelError::InferenceError(e.to_string()))?;

        let shape = output_array.shape();
        if shape.len() != 3 {
            return Err(ModelError::InferenceError(format!(
                "expected [batch, seq, hidden] output, got shape {:?}",
                shape
            )));
        }
        if shape[2] != self.dimension {
            return Err(ModelError::InferenceError(format!(
                "model hidden size {} does not match configured dimension {}",
                shape[2], self.dimension
            )));
        }

        let embeddings = (0..batch_size)
            .map(|i| {
                let mask = encodings[i].get_attention_mask();
                let positions: Vec<Vec<f32>> = (0..max_len)
                    .map(|j| {
                        (0..self.dimension)
                            .map(|d| output_array[[i, j, d]])
                            .collect()
                    })
                    .collect();
                masked_mean(&positions, mask, self.dimension)
            })
            .collect();

        Ok(embeddings)
    }
}

#[async_trait]
impl Encoder for OnnxEncoder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        // One forward pass at a time; the Mutex serializes the session.
        tokio::task::block_in_place(|| self.encode_sync(texts))
    }
}

/// Average the per-position vectors where the attention mask is set. The
/// denominator floor guards against an all-padding row.
fn masked_mean(positions: &[Vec<f32>], mask: &[u32], dimension: usize) -> Vec<f32> {
    let mut sums = vec![0f32; dimension];
    let mut count = 0f32;
    for (position, m) in positions.iter().zip(mask.iter()) {
        if *m == 0 {
            continue;
        }
        count += 1.0;
        for (sum, value) in sums.iter_mut().zip(position.iter()) {
            *sum += value;
        }
    }
    let denom = count.max(1e-9);
    for sum in sums.iter_mut() {
        *sum /= denom;
    }
    sums
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_mean_ignores_padding() {
        let positions = vec![
            vec![2.0, 4.0],
            vec![4.0, 8.0],
            vec![100.0, 100.0], // padding, must not contribute
        ];
        let mask = [1, 1, 0];
        assert_eq!(masked_mean(&positions, &mask, 2), vec![3.0, 6.0]);
    }

    #[test]
    fn masked_mean_all_padding_is_finite() {
        let positions = vec![vec![1.0, 1.0]];
        let mask = [0];
        let pooled = masked_mean(&positions, &mask, 2);
        assert!(pooled.iter().all(|v| v.is_finite()));
        assert_eq!(pooled, vec![0.0, 0.0]);
    }

    #[test]
    fn masked_mean_single_position() {
        let positions = vec![vec![1.5, -2.5, 0.5]];
        let mask = [1];
        assert_eq!(masked_mean(&positions, &mask, 3), vec![1.5, -2.5, 0.5]);
    }
}
