//! Average per-token log-probability under the scoring model
//!
//! ## Alignment
//!
//! Logits at position `t` predict token `t + 1`, so the last logit row and the
//! first label are dropped before gathering. A label counts only if its
//! attention-mask entry is 1; masked positions add nothing to the sum and
//! nothing to the count.
//!
//! ## Degenerate rows
//!
//! A row with no valid label after the shift (empty text, or a single token)
//! scores `-inf`. The divisor is clamped to 1 only to keep the arithmetic
//! defined; the clamped value is never reported.

use std::sync::Arc;

use anyhow::Result;
use candle_core::{DType, Tensor, D};
use tracing::{debug, warn};

use crate::backend::{CancelToken, CausalScorer, TextTokenizer};

/// Token-averaged log-probability of each row of a batch.
///
/// Shapes: `logits` `[batch, seq, vocab]`, `input_ids` and `attention_mask` `[batch, seq]`.
pub fn masked_mean_log_probs(
    logits: &Tensor,
    input_ids: &Tensor,
    attention_mask: &Tensor,
) -> Result<Vec<f64>> {
    let (batch, seq_len, _vocab) = logits.dims3()?;
    anyhow::ensure!(
        input_ids.dims2()? == (batch, seq_len),
        "input_ids shape {:?} does not match logits {:?}",
        input_ids.dims(),
        logits.dims()
    );
    if seq_len < 2 {
        return Ok(vec![f64::NEG_INFINITY; batch]);
    }

    let shifted = logits.narrow(1, 0, seq_len - 1)?.to_dtype(DType::F32)?;
    let labels = input_ids.narrow(1, 1, seq_len - 1)?.contiguous()?;
    let label_mask: Vec<Vec<u32>> = attention_mask
        .narrow(1, 1, seq_len - 1)?
        .to_dtype(DType::U32)?
        .to_vec2()?;

    let log_probs = candle_nn::ops::log_softmax(&shifted.contiguous()?, D::Minus1)?;
    let token_log_probs: Vec<Vec<f32>> = log_probs
        .gather(&labels.unsqueeze(2)?, 2)?
        .squeeze(2)?
        .to_vec2()?;

    Ok(token_log_probs
        .iter()
        .zip(&label_mask)
        .map(|(row, mask)| {
            let mut nll_sum = 0.0f64;
            let mut valid = 0usize;
            for (&lp, &m) in row.iter().zip(mask) {
                if m != 0 {
                    nll_sum -= f64::from(lp);
                    valid += 1;
                }
            }
            let mean_nll = nll_sum / valid.max(1) as f64;
            if valid == 0 {
                f64::NEG_INFINITY
            } else {
                -mean_nll
            }
        })
        .collect())
}

/// Scores texts in fixed-size sub-batches, preserving input order.
pub struct LogProbScorer {
    model: Arc<dyn CausalScorer>,
    tokenizer: Arc<dyn TextTokenizer>,
    batch_size: usize,
    cancel: Option<CancelToken>,
}

impl LogProbScorer {
    pub fn new(
        model: Arc<dyn CausalScorer>,
        tokenizer: Arc<dyn TextTokenizer>,
        batch_size: usize,
    ) -> Self {
        Self {
            model,
            tokenizer,
            batch_size: batch_size.max(1),
            cancel: None,
        }
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// One average log-probability (or `-inf`) per text.
    pub fn score(&self, texts: &[String]) -> Result<Vec<f64>> {
        let mut scores = Vec::with_capacity(texts.len());

        for (chunk_idx, chunk) in texts.chunks(self.batch_size).enumerate() {
            let encoding = self.tokenizer.encode_batch(chunk)?;

            let chunk_scores = if encoding.seq_len() < 2 {
                vec![f64::NEG_INFINITY; chunk.len()]
            } else {
                let (ids, mask) = encoding.to_tensors(self.model.device())?;
                let logits = self.model.logits(&ids, &mask)?;
                masked_mean_log_probs(&logits, &ids, &mask)?
            };

            let degenerate = chunk_scores.iter().filter(|s| s.is_infinite()).count();
            if degenerate > 0 {
                warn!("Sub-batch {chunk_idx}: {degenerate} texts have no scorable tokens");
            }
            debug!(
                "Scored sub-batch {}: {} texts, seq_len {}",
                chunk_idx,
                chunk.len(),
                encoding.seq_len()
            );

            scores.extend(chunk_scores);

            if let Some(token) = &self.cancel {
                token.check(chunk_idx + 1)?;
            }
        }

        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tensor_u32(rows: &[&[u32]]) -> Tensor {
        let data: Vec<u32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_vec(data, (rows.len(), rows[0].len()), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_uniform_logits_give_log_inverse_vocab() {
        let logits = Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let ids = tensor_u32(&[&[1, 2, 3], &[1, 0, 0]]);
        let mask = tensor_u32(&[&[1, 1, 1], &[1, 0, 0]]);

        let scores = masked_mean_log_probs(&logits, &ids, &mask).unwrap();
        assert!((scores[0] + 4f64.ln()).abs() < 1e-6);
        // Single real token: nothing left after the shift
        assert_eq!(scores[1], f64::NEG_INFINITY);
    }

    #[test]
    fn test_shift_uses_logits_at_previous_position() {
        // Vocab 3, sequence [0, 2, 1]. Position 0 must predict 2, position 1 must predict 1.
        let mut data = vec![0f32; 3 * 3];
        data[2] = 5.0; // logits[0][2]
        data[3 + 1] = 5.0; // logits[1][1]
        data[6] = 100.0; // last row is dropped, must not matter
        let logits = Tensor::from_vec(data, (1, 3, 3), &Device::Cpu).unwrap();
        let ids = tensor_u32(&[&[0, 2, 1]]);
        let mask = tensor_u32(&[&[1, 1, 1]]);

        let scores = masked_mean_log_probs(&logits, &ids, &mask).unwrap();
        let expected = 5.0 - (5f64.exp() + 2.0).ln();
        assert!((scores[0] - expected).abs() < 1e-5, "{} vs {}", scores[0], expected);
    }

    #[test]
    fn test_padding_positions_do_not_count() {
        // Row 1 is row 0 plus padding with hostile logits at the padded slots
        let mut data = vec![0f32; 2 * 4 * 2];
        data[8 + 2 * 2] = -50.0; // row 1, position 2 predicts the padded label
        data[8 + 3 * 2 + 1] = 50.0;
        let logits = Tensor::from_vec(data, (2, 4, 2), &Device::Cpu).unwrap();
        let ids = tensor_u32(&[&[0, 1, 0, 1], &[0, 1, 0, 0]]);
        let mask = tensor_u32(&[&[1, 1, 1, 1], &[1, 1, 1, 0]]);

        let scores = masked_mean_log_probs(&logits, &ids, &mask).unwrap();
        assert!((scores[0] + 2f64.ln()).abs() < 1e-6);
        assert!((scores[1] + 2f64.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_too_short_sequence_is_degenerate() {
        let logits = Tensor::zeros((2, 1, 5), DType::F32, &Device::Cpu).unwrap();
        let ids = tensor_u32(&[&[3], &[0]]);
        let mask = tensor_u32(&[&[1], &[0]]);
        let scores = masked_mean_log_probs(&logits, &ids, &mask).unwrap();
        assert!(scores.iter().all(|s| *s == f64::NEG_INFINITY));
    }

    #[test]
    fn test_shape_mismatch_is_error() {
        let logits = Tensor::zeros((1, 3, 5), DType::F32, &Device::Cpu).unwrap();
        let ids = tensor_u32(&[&[1, 2]]);
        let mask = tensor_u32(&[&[1, 1]]);
        assert!(masked_mean_log_probs(&logits, &ids, &mask).is_err());
    }
}
