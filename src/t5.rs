//! T5 span-infill model
//!
//! Wraps `candle_transformers`' T5 encoder-decoder. Each row is generated on
//! its own: padding is stripped using the attention mask, the encoder runs
//! once, and the decoder samples with nucleus sampling until it emits the
//! requested stop marker, the model's end-of-sequence id, or hits the token
//! budget.

use std::sync::Mutex;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::t5::{Config as T5Config, T5ForConditionalGeneration};
use hf_hub::{api::sync::Api, Repo, RepoType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::backend::{InfillModel, SamplingParams, StopCondition};
use crate::error::DetectError;
use crate::gpt2::select_device;

pub struct T5Infiller {
    model: Mutex<T5ForConditionalGeneration>,
    rng: Mutex<StdRng>,
    decoder_start_id: u32,
    eos_id: u32,
    use_cache: bool,
    device: Device,
}

impl T5Infiller {
    /// Download and load from HuggingFace.
    ///
    /// `seed` drives the sampling RNG; `None` seeds from entropy.
    pub fn from_hub(model_id: &str, force_cpu: bool, seed: Option<u64>) -> Result<Self> {
        let device = select_device(force_cpu);
        info!("Loading T5 infill model: {}", model_id);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config_path = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let weights_path = repo
            .get("model.safetensors")
            .context("Failed to download model.safetensors")?;

        let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
        let config: T5Config = serde_json::from_str(&config_str)?;
        info!(
            "Model config: {} layers, {} hidden, {} vocab",
            config.num_layers, config.d_model, config.vocab_size
        );

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, &device)?
        };
        let model = T5ForConditionalGeneration::load(vb, &config)
            .map_err(|e| DetectError::inference("t5 load", e))?;

        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            model: Mutex::new(model),
            rng: Mutex::new(rng),
            decoder_start_id: config.decoder_start_token_id.unwrap_or(config.pad_token_id) as u32,
            eos_id: config.eos_token_id as u32,
            use_cache: config.use_cache,
            device,
        })
    }

    fn generate_row(
        &self,
        model: &mut T5ForConditionalGeneration,
        input: &[u32],
        stop_id: u32,
        sampling: &SamplingParams,
        seed: u64,
    ) -> Result<Vec<u32>> {
        model.clear_kv_cache();
        let input = Tensor::new(input, &self.device)?.unsqueeze(0)?;
        let encoder_output = model
            .encode(&input)
            .map_err(|e| DetectError::inference("t5 encode", e))?;

        let mut processor =
            LogitsProcessor::new(seed, Some(sampling.temperature), Some(sampling.top_p));
        let mut output = vec![self.decoder_start_id];

        for step in 0..sampling.max_new_tokens {
            let decoder_ids = if step == 0 || !self.use_cache {
                Tensor::new(output.as_slice(), &self.device)?.unsqueeze(0)?
            } else {
                let last = output[output.len() - 1];
                Tensor::new(&[last], &self.device)?.unsqueeze(0)?
            };

            let logits = model
                .decode(&decoder_ids, &encoder_output)
                .map_err(|e| DetectError::inference("t5 decode", e))?
                .squeeze(0)?
                .to_dtype(DType::F32)?;
            let next = processor
                .sample(&logits)
                .map_err(|e| DetectError::inference("t5 sample", e))?;
            output.push(next);

            if next == stop_id || next == self.eos_id {
                break;
            }
        }

        Ok(output)
    }
}

impl InfillModel for T5Infiller {
    fn generate(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        stop: StopCondition,
        sampling: &SamplingParams,
    ) -> Result<Vec<Vec<u32>>> {
        let ids: Vec<Vec<u32>> = input_ids.to_vec2()?;
        let mask: Vec<Vec<u32>> = attention_mask.to_dtype(DType::U32)?.to_vec2()?;

        let mut model = self
            .model
            .lock()
            .map_err(|e| anyhow::anyhow!("Infill model lock poisoned: {e}"))?;

        let mut outputs = Vec::with_capacity(ids.len());
        for (row, row_mask) in ids.iter().zip(&mask) {
            let valid = row_mask.iter().filter(|&&m| m != 0).count();
            let seed = self
                .rng
                .lock()
                .map_err(|e| anyhow::anyhow!("Sampling RNG lock poisoned: {e}"))?
                .gen::<u64>();

            let generated =
                self.generate_row(&mut model, &row[..valid], stop.token_id(), sampling, seed)?;
            debug!("Generated {} tokens (stop {:?})", generated.len() - 1, stop);
            outputs.push(generated);
        }

        Ok(outputs)
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "requires model download"]
    fn test_t5_small_generates_until_stop() {
        let model = T5Infiller::from_hub("google-t5/t5-small", true, Some(0)).unwrap();
        let tokenizer =
            crate::tokenizer::HfTokenizer::from_hub("google-t5/t5-small", true).unwrap();
        use crate::backend::TextTokenizer;

        let texts = vec!["The <extra_id_0> walks in <extra_id_1> park".to_string()];
        let enc = tokenizer.encode_batch(&texts).unwrap();
        let (ids, mask) = enc.to_tensors(model.device()).unwrap();
        let stop_id = tokenizer.token_id("<extra_id_2>").unwrap();

        let out = model
            .generate(
                &ids,
                &mask,
                StopCondition::Placeholder(stop_id),
                &SamplingParams::default(),
            )
            .unwrap();

        assert_eq!(out.len(), 1);
        assert!(out[0].len() <= SamplingParams::default().max_new_tokens + 1);
    }
}
