//! Model capabilities consumed by the detection pipeline
//!
//! The pipeline never talks to a concrete model. It holds three kinds of
//! read-only services behind `Arc<dyn ...>`:
//!
//! - [`TextTokenizer`]: batch encoding with padding, decoding with or without
//!   special markers (one per model)
//! - [`CausalScorer`]: teacher-forced per-position logits
//! - [`InfillModel`]: span infilling with nucleus sampling and an explicit stop token
//!
//! Concrete implementations live in `tokenizer`, `gpt2` and `t5`; tests plug in
//! small deterministic mocks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::DetectError;

/// A padded batch of token sequences.
///
/// All rows of `ids` and `attention_mask` have the same length. Padding is
/// applied on the right, so the valid tokens of a row are always a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEncoding {
    pub ids: Vec<Vec<u32>>,
    pub attention_mask: Vec<Vec<u32>>,
    pub pad_id: u32,
}

impl BatchEncoding {
    /// Right-pad raw token sequences to the longest row.
    pub fn from_unpadded(rows: Vec<Vec<u32>>, pad_id: u32) -> Self {
        let max_len = rows.iter().map(Vec::len).max().unwrap_or(0);
        let mut ids = Vec::with_capacity(rows.len());
        let mut attention_mask = Vec::with_capacity(rows.len());

        for mut row in rows {
            let valid = row.len();
            row.resize(max_len, pad_id);
            let mut mask = vec![1u32; valid];
            mask.resize(max_len, 0);
            ids.push(row);
            attention_mask.push(mask);
        }

        Self {
            ids,
            attention_mask,
            pad_id,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.ids.len()
    }

    /// Padded sequence length (0 for an empty batch)
    pub fn seq_len(&self) -> usize {
        self.ids.first().map_or(0, Vec::len)
    }

    /// Number of non-padding tokens in each row
    pub fn valid_lengths(&self) -> Vec<usize> {
        self.attention_mask
            .iter()
            .map(|m| m.iter().filter(|&&v| v != 0).count())
            .collect()
    }

    /// Build `[batch, seq_len]` u32 tensors for ids and mask.
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let shape = (self.batch_size(), self.seq_len());
        let ids: Vec<u32> = self.ids.iter().flatten().copied().collect();
        let mask: Vec<u32> = self.attention_mask.iter().flatten().copied().collect();
        Ok((
            Tensor::from_vec(ids, shape, device)?,
            Tensor::from_vec(mask, shape, device)?,
        ))
    }
}

/// Tokenization capability (one instance per model).
pub trait TextTokenizer: Send + Sync {
    /// Encode a batch with right padding to the longest row.
    fn encode_batch(&self, texts: &[String]) -> Result<BatchEncoding>;

    /// Decode token ids. With `keep_special` the padding, end and
    /// placeholder markers stay in the output.
    fn decode(&self, ids: &[u32], keep_special: bool) -> Result<String>;

    fn token_id(&self, token: &str) -> Option<u32>;

    fn eos_token_id(&self) -> u32;

    fn pad_token_id(&self) -> u32;
}

/// Teacher-forced scoring capability.
pub trait CausalScorer: Send + Sync {
    /// Per-position logits `[batch, seq_len, vocab]` for `input_ids` `[batch, seq_len]`.
    ///
    /// Logits at position `t` predict the token at position `t + 1`.
    fn logits(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor>;

    fn device(&self) -> &Device;
}

/// Span-infill generation capability.
pub trait InfillModel: Send + Sync {
    /// Generate one sample per input row. Rows are returned as host token
    /// vectors, in input order.
    fn generate(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        stop: StopCondition,
        sampling: &SamplingParams,
    ) -> Result<Vec<Vec<u32>>>;

    fn device(&self) -> &Device;
}

/// Token that ends generation for a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCondition {
    /// Stop after emitting this placeholder marker id.
    Placeholder(u32),
    /// No placeholders in the chunk: stop on the model's end-of-sequence id.
    EndOfSequence(u32),
}

impl StopCondition {
    pub fn token_id(&self) -> u32 {
        match *self {
            StopCondition::Placeholder(id) | StopCondition::EndOfSequence(id) => id,
        }
    }
}

/// Nucleus sampling parameters for the infill model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub top_p: f64,
    pub temperature: f64,
    pub max_new_tokens: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            top_p: 0.9,
            temperature: 1.0,
            max_new_tokens: 150,
        }
    }
}

/// Cooperative abort flag, checked between sub-batches.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with `Aborted` if cancellation was requested.
    pub fn check(&self, completed: usize) -> Result<()> {
        if self.is_cancelled() {
            return Err(DetectError::Aborted { completed }.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_unpadded_right_pads() {
        let enc = BatchEncoding::from_unpadded(vec![vec![5, 6, 7], vec![8], vec![]], 0);

        assert_eq!(enc.seq_len(), 3);
        assert_eq!(enc.ids[1], vec![8, 0, 0]);
        assert_eq!(enc.attention_mask[1], vec![1, 0, 0]);
        assert_eq!(enc.attention_mask[2], vec![0, 0, 0]);
        assert_eq!(enc.valid_lengths(), vec![3, 1, 0]);
    }

    #[test]
    fn test_to_tensors_shape() {
        let enc = BatchEncoding::from_unpadded(vec![vec![1, 2], vec![3]], 9);
        let (ids, mask) = enc.to_tensors(&Device::Cpu).unwrap();

        assert_eq!(ids.dims(), &[2, 2]);
        assert_eq!(mask.to_vec2::<u32>().unwrap(), vec![vec![1, 1], vec![1, 0]]);
        assert_eq!(ids.to_vec2::<u32>().unwrap()[1], vec![3, 9]);
    }

    #[test]
    fn test_cancel_token_shared_between_clones() {
        let token = CancelToken::new();
        let observer = token.clone();
        assert!(observer.check(0).is_ok());

        token.cancel();
        let err = observer.check(4).unwrap_err();
        assert_eq!(
            err.downcast_ref::<DetectError>(),
            Some(&DetectError::Aborted { completed: 4 })
        );
    }

    #[test]
    fn test_stop_condition_token() {
        assert_eq!(StopCondition::Placeholder(32_090).token_id(), 32_090);
        assert_eq!(StopCondition::EndOfSequence(1).token_id(), 1);
    }
}
