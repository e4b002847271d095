//! Deterministic mock capabilities for pipeline tests

#![allow(dead_code)]

use std::collections::HashMap;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use detectgpt::{
    placeholder, BatchEncoding, CausalScorer, InfillModel, SamplingParams, StopCondition,
    TextTokenizer,
};

pub const PAD_ID: u32 = 0;
pub const EOS_ID: u32 = 1;
pub const UNK_ID: u32 = 2;
pub const N_PLACEHOLDERS: usize = 100;
const FIRST_PLACEHOLDER_ID: u32 = 3;

/// Whitespace tokenizer over a fixed vocabulary.
///
/// Layout: `<pad>`, `</s>`, `<unk>`, `<extra_id_0..99>`, then the given words.
pub struct WordTokenizer {
    vocab: HashMap<String, u32>,
    tokens: Vec<String>,
}

impl WordTokenizer {
    pub fn new(words: &[&str]) -> Self {
        let mut tokens: Vec<String> = vec!["<pad>".into(), "</s>".into(), "<unk>".into()];
        tokens.extend((0..N_PLACEHOLDERS).map(placeholder));
        for word in words {
            if !tokens.iter().any(|t| t == word) {
                tokens.push((*word).to_string());
            }
        }
        let vocab = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i as u32))
            .collect();
        Self { vocab, tokens }
    }

    /// Vocabulary seeded with every word of `sentences`
    pub fn from_sentences(sentences: &[&str]) -> Self {
        let words: Vec<&str> = sentences
            .iter()
            .flat_map(|s| s.split_whitespace())
            .collect();
        Self::new(&words)
    }

    pub fn vocab_size(&self) -> usize {
        self.tokens.len()
    }

    pub fn id(&self, token: &str) -> u32 {
        self.vocab.get(token).copied().unwrap_or(UNK_ID)
    }

    fn is_placeholder(id: u32) -> bool {
        (FIRST_PLACEHOLDER_ID..FIRST_PLACEHOLDER_ID + N_PLACEHOLDERS as u32).contains(&id)
    }
}

impl TextTokenizer for WordTokenizer {
    fn encode_batch(&self, texts: &[String]) -> Result<BatchEncoding> {
        let rows = texts
            .iter()
            .map(|t| t.split_whitespace().map(|w| self.id(w)).collect())
            .collect();
        Ok(BatchEncoding::from_unpadded(rows, PAD_ID))
    }

    fn decode(&self, ids: &[u32], keep_special: bool) -> Result<String> {
        let words: Vec<&str> = ids
            .iter()
            .filter(|&&id| keep_special || !(id <= UNK_ID || Self::is_placeholder(id)))
            .map(|&id| self.tokens[id as usize].as_str())
            .collect();
        Ok(words.join(" "))
    }

    fn token_id(&self, token: &str) -> Option<u32> {
        self.vocab.get(token).copied()
    }

    fn eos_token_id(&self) -> u32 {
        EOS_ID
    }

    fn pad_token_id(&self) -> u32 {
        PAD_ID
    }
}

/// Position-independent scorer: logit of token `j` is `-j` everywhere.
pub struct UnigramScorer {
    vocab_size: usize,
    device: Device,
}

impl UnigramScorer {
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            device: Device::Cpu,
        }
    }

    /// Exact log-probability the scorer assigns to `id`
    pub fn log_prob(&self, id: u32) -> f64 {
        let log_z = (0..self.vocab_size)
            .map(|k| (-(k as f64)).exp())
            .sum::<f64>()
            .ln();
        -f64::from(id) - log_z
    }
}

impl CausalScorer for UnigramScorer {
    fn logits(&self, input_ids: &Tensor, _attention_mask: &Tensor) -> Result<Tensor> {
        let (b, t) = input_ids.dims2()?;
        let row: Vec<f32> = (0..self.vocab_size).map(|j| -(j as f32)).collect();
        let data: Vec<f32> = row.iter().copied().cycle().take(b * t * self.vocab_size).collect();
        Ok(Tensor::from_vec(data, (b, t, self.vocab_size), &self.device)?)
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

/// Infill model that fills every placeholder with the same word.
///
/// Output per row: `<pad> <extra_id_0> w <extra_id_1> w ... <stop>`.
pub struct FixedInfill {
    fill_id: u32,
    device: Device,
}

impl FixedInfill {
    pub fn new(fill_id: u32) -> Self {
        Self {
            fill_id,
            device: Device::Cpu,
        }
    }
}

impl InfillModel for FixedInfill {
    fn generate(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        stop: StopCondition,
        _sampling: &SamplingParams,
    ) -> Result<Vec<Vec<u32>>> {
        let ids: Vec<Vec<u32>> = input_ids.to_vec2()?;
        let mask: Vec<Vec<u32>> = attention_mask.to_dtype(DType::U32)?.to_vec2()?;

        Ok(ids
            .iter()
            .zip(&mask)
            .map(|(row, row_mask)| {
                let n = row
                    .iter()
                    .zip(row_mask)
                    .filter(|&(&id, &m)| m != 0 && WordTokenizer::is_placeholder(id))
                    .count();
                let mut out = vec![PAD_ID];
                for i in 0..n {
                    out.push(FIRST_PLACEHOLDER_ID + i as u32);
                    out.push(self.fill_id);
                }
                out.push(stop.token_id());
                out
            })
            .collect())
    }

    fn device(&self) -> &Device {
        &self.device
    }
}
