//! Infill requests: run the span-infill model over masked texts in sub-batches

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::backend::{CancelToken, InfillModel, SamplingParams, StopCondition, TextTokenizer};
use crate::error::DetectError;
use crate::masking::{count_placeholders, placeholder};

/// Sends masked texts to the infill model and returns the raw decoded output.
pub struct InfillRequester {
    model: Arc<dyn InfillModel>,
    tokenizer: Arc<dyn TextTokenizer>,
    batch_size: usize,
    sampling: SamplingParams,
    cancel: Option<CancelToken>,
}

impl InfillRequester {
    pub fn new(
        model: Arc<dyn InfillModel>,
        tokenizer: Arc<dyn TextTokenizer>,
        batch_size: usize,
        sampling: SamplingParams,
    ) -> Self {
        Self {
            model,
            tokenizer,
            batch_size: batch_size.max(1),
            sampling,
            cancel: None,
        }
    }

    /// Abort between sub-batches once `token` is cancelled.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Stop token for a chunk: the marker one past the largest placeholder
    /// count in the chunk, or EOS when no text holds a placeholder.
    pub fn stop_condition(&self, chunk: &[String]) -> Result<StopCondition> {
        let stop_index = chunk.iter().map(|t| count_placeholders(t)).max().unwrap_or(0);
        if stop_index == 0 {
            return Ok(StopCondition::EndOfSequence(self.tokenizer.eos_token_id()));
        }

        let marker = placeholder(stop_index);
        let id = self.tokenizer.token_id(&marker).ok_or_else(|| {
            DetectError::Tokenization(format!("infill tokenizer has no id for {marker}"))
        })?;
        Ok(StopCondition::Placeholder(id))
    }

    /// Raw decoded infill output per masked text, in input order.
    ///
    /// Special markers are kept in the decoded strings; fill extraction relies on them.
    pub fn request(&self, masked: &[String]) -> Result<Vec<String>> {
        let mut outputs = Vec::with_capacity(masked.len());

        for (chunk_idx, chunk) in masked.chunks(self.batch_size).enumerate() {
            let stop = self.stop_condition(chunk)?;
            let encoding = self.tokenizer.encode_batch(chunk)?;
            let (ids, mask) = encoding.to_tensors(self.model.device())?;

            debug!(
                "Infill sub-batch {}: {} texts, seq_len {}, stop {:?}",
                chunk_idx,
                chunk.len(),
                encoding.seq_len(),
                stop
            );

            let generated = self.model.generate(&ids, &mask, stop, &self.sampling)?;
            if generated.len() != chunk.len() {
                return Err(DetectError::Inference {
                    context: "infill generate",
                    message: format!(
                        "expected {} sequences, model returned {}",
                        chunk.len(),
                        generated.len()
                    ),
                }
                .into());
            }

            for row in &generated {
                outputs.push(self.tokenizer.decode(row, true)?);
            }

            if let Some(token) = &self.cancel {
                token.check(chunk_idx + 1)?;
            }
        }

        Ok(outputs)
    }
}
