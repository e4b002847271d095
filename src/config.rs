//! Run configuration
//!
//! Every field has a default, so a JSON config file only needs the values it
//! changes. CLI flags are applied on top of the file.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::SamplingParams;
use crate::error::DetectError;
use crate::masking::MaskingConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectConfig {
    /// HuggingFace id of the causal scoring model
    pub scoring_model: String,
    /// HuggingFace id of the span-infill model
    pub infill_model: String,
    pub masking: MaskingConfig,
    pub sampling: SamplingParams,
    /// Perturbations drawn per text
    pub n_perturbations: usize,
    /// Texts taken from each class (human, machine)
    pub n_samples: usize,
    /// Sub-batch size for both models
    pub batch_size: usize,
    /// Seed for span sampling and infill sampling; `None` = unseeded
    pub seed: Option<u64>,
    pub force_cpu: bool,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            scoring_model: "openai-community/gpt2".to_string(),
            infill_model: "google-t5/t5-large".to_string(),
            masking: MaskingConfig::default(),
            sampling: SamplingParams::default(),
            n_perturbations: 100,
            n_samples: 200,
            batch_size: 50,
            seed: None,
            force_cpu: false,
        }
    }
}

impl DetectConfig {
    /// Load from a JSON file and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let ratio = self.masking.mask_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(
                DetectError::config(format!("mask_ratio must be in (0, 1], got {ratio}")).into(),
            );
        }
        if self.masking.max_words == 0 {
            return Err(DetectError::config("max_words must be positive").into());
        }
        let top_p = self.sampling.top_p;
        if !(top_p > 0.0 && top_p <= 1.0) {
            return Err(
                DetectError::config(format!("top_p must be in (0, 1], got {top_p}")).into(),
            );
        }
        if self.sampling.temperature <= 0.0 {
            return Err(DetectError::config("temperature must be positive").into());
        }
        if self.sampling.max_new_tokens == 0 {
            return Err(DetectError::config("max_new_tokens must be positive").into());
        }
        if self.batch_size == 0 {
            return Err(DetectError::config("batch_size must be positive").into());
        }
        if self.n_perturbations == 0 {
            return Err(DetectError::config("n_perturbations must be positive").into());
        }
        Ok(())
    }
}
