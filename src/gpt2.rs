//! GPT-2 family causal scoring model
//!
//! Layer-by-layer forward pass over HF GPT-2 checkpoints (gpt2, gpt2-medium,
//! gpt2-large, gpt2-xl and fine-tunes with the same layout), returning logits
//! for every position so a whole sequence can be scored in one pass.
//!
//! HF GPT-2 stores its projections as `Conv1D` with weight shape
//! `[in, out]`, so they are applied as `x @ W + b` rather than through
//! `candle_nn::Linear`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, layer_norm, Embedding, LayerNorm, VarBuilder};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::info;

use crate::backend::CausalScorer;
use crate::error::DetectError;
use crate::masks::create_attention_bias;

/// Model configuration (matches HuggingFace config.json for GPT-2)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Gpt2Config {
    pub vocab_size: usize,
    pub n_positions: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

impl Gpt2Config {
    /// Read a HuggingFace config.json
    pub fn from_file(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Ok(serde_json::from_str(&config_str)?)
    }
}

struct Conv1D {
    weight: Tensor,
    bias: Tensor,
}

impl Conv1D {
    fn load(n_in: usize, n_out: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            weight: vb.get((n_in, n_out), "weight")?,
            bias: vb.get(n_out, "bias")?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.broadcast_matmul(&self.weight)?.broadcast_add(&self.bias)?)
    }
}

struct Attention {
    c_attn: Conv1D,
    c_proj: Conv1D,
    n_head: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let n_embd = config.n_embd;
        Ok(Self {
            c_attn: Conv1D::load(n_embd, 3 * n_embd, vb.pp("c_attn"))?,
            c_proj: Conv1D::load(n_embd, n_embd, vb.pp("c_proj"))?,
            n_head: config.n_head,
            head_dim: n_embd / config.n_head,
        })
    }

    /// `bias` is the additive causal + padding mask `[batch, 1, seq, seq]`
    fn forward(&self, x: &Tensor, bias: &Tensor) -> Result<Tensor> {
        let (b, seq_len, n_embd) = x.dims3()?;
        let qkv = self.c_attn.forward(x)?;

        let split = |i: usize| -> Result<Tensor> {
            Ok(qkv
                .narrow(2, i * n_embd, n_embd)?
                .reshape((b, seq_len, self.n_head, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split(0)?;
        let k = split(1)?;
        let v = split(2)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.t()?)? * scale)?;
        let attn_weights = attn_weights.broadcast_add(bias)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;

        let out = attn_weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, seq_len, n_embd))?;
        self.c_proj.forward(&out)
    }
}

struct Mlp {
    c_fc: Conv1D,
    c_proj: Conv1D,
}

impl Mlp {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let n_inner = 4 * config.n_embd;
        Ok(Self {
            c_fc: Conv1D::load(config.n_embd, n_inner, vb.pp("c_fc"))?,
            c_proj: Conv1D::load(n_inner, config.n_embd, vb.pp("c_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // gelu_new (tanh approximation)
        let h = self.c_fc.forward(x)?.gelu()?;
        self.c_proj.forward(&h)
    }
}

struct Block {
    ln_1: LayerNorm,
    attn: Attention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let eps = config.layer_norm_epsilon;
        Ok(Self {
            ln_1: layer_norm(config.n_embd, eps, vb.pp("ln_1"))?,
            attn: Attention::load(vb.pp("attn"), config)?,
            ln_2: layer_norm(config.n_embd, eps, vb.pp("ln_2"))?,
            mlp: Mlp::load(vb.pp("mlp"), config)?,
        })
    }

    fn forward(&self, x: &Tensor, bias: &Tensor) -> Result<Tensor> {
        let residual = x;
        let h = self.attn.forward(&self.ln_1.forward(x)?, bias)?;
        let x = (residual + h)?;

        let residual = &x;
        let h = self.mlp.forward(&self.ln_2.forward(&x)?)?;
        Ok((residual + h)?)
    }
}

/// GPT-2 scoring model with tied input/output embeddings
pub struct Gpt2Scorer {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    config: Gpt2Config,
    device: Device,
}

impl Gpt2Scorer {
    /// Download and load from HuggingFace (CUDA when available unless `force_cpu`)
    pub fn from_hub(model_id: &str, force_cpu: bool) -> Result<Self> {
        let device = select_device(force_cpu);
        info!("Loading GPT-2 scorer: {}", model_id);
        info!("Device: {:?}", device);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config_path = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let weights_path = repo
            .get("model.safetensors")
            .context("Failed to download model.safetensors")?;

        Self::load(&config_path, &[weights_path], &device)
    }

    /// Load from a local config.json and safetensors files
    pub fn load(config_path: &Path, weights: &[PathBuf], device: &Device) -> Result<Self> {
        let config = Gpt2Config::from_file(config_path)?;
        info!(
            "Model config: {} layers, {} hidden, {} vocab",
            config.n_layer, config.n_embd, config.vocab_size
        );

        // Scoring stays in F32 regardless of device: discrepancies are small
        // differences of averaged log-probabilities.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(weights, DType::F32, device)? };
        let vb = if vb.contains_tensor("transformer.wte.weight") {
            vb.pp("transformer")
        } else {
            vb
        };

        Self::from_var_builder(vb, config, device)
    }

    pub fn from_var_builder(vb: VarBuilder, config: Gpt2Config, device: &Device) -> Result<Self> {
        let wte = embedding(config.vocab_size, config.n_embd, vb.pp("wte"))?;
        let wpe = embedding(config.n_positions, config.n_embd, vb.pp("wpe"))?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            blocks.push(Block::load(vb.pp(format!("h.{i}")), &config)?);
        }
        let ln_f = layer_norm(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_f"))?;

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            config,
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &Gpt2Config {
        &self.config
    }
}

impl CausalScorer for Gpt2Scorer {
    fn logits(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let (_b, seq_len) = input_ids.dims2()?;
        if seq_len > self.config.n_positions {
            return Err(DetectError::Inference {
                context: "gpt2 forward",
                message: format!(
                    "sequence of {seq_len} tokens exceeds n_positions {}",
                    self.config.n_positions
                ),
            }
            .into());
        }

        let positions = Tensor::arange(0u32, seq_len as u32, &self.device)?;
        let tok = self.wte.forward(input_ids)?;
        let pos = self.wpe.forward(&positions)?;
        let mut hidden = tok.broadcast_add(&pos)?;

        let bias = create_attention_bias(attention_mask, hidden.dtype())?;
        for block in &self.blocks {
            hidden = block.forward(&hidden, &bias)?;
        }
        let hidden = self.ln_f.forward(&hidden)?;

        Ok(hidden.broadcast_matmul(&self.wte.embeddings().t()?)?)
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

/// CUDA if available and not forced off, otherwise CPU
pub(crate) fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        info!("Forcing CPU mode");
        return Device::Cpu;
    }
    match Device::cuda_if_available(0) {
        Ok(dev) if dev.is_cuda() => {
            info!("Using CUDA device");
            dev
        }
        _ => {
            info!("CUDA not available, using CPU");
            Device::Cpu
        }
    }
}
