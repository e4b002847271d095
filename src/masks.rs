//! Attention bias construction for the scoring model
//!
//! The causal part is cached by `(seq_len, device, dtype)` since every
//! sub-batch of the same padded length reuses it. The padding part depends
//! on the batch and is rebuilt per call.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

/// Bias added to attention scores for padded keys. Finite so that a row made
/// only of padding still produces a valid (uniform) softmax instead of NaN.
const PADDING_BIAS: f32 = -1.0e9;

type CausalMaskCache = LazyLock<Mutex<HashMap<(usize, usize, DType), Tensor>>>;

static CAUSAL_MASK_CACHE: CausalMaskCache = LazyLock::new(|| Mutex::new(HashMap::new()));

fn device_id(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

/// Causal mask of shape `[1, 1, seq_len, seq_len]`: `0.0` where `j <= i`, `-inf` above the diagonal.
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let key = (seq_len, device_id(device), dtype);

    if let Some(cached) = CAUSAL_MASK_CACHE
        .lock()
        .map_err(|_| anyhow::anyhow!("causal mask cache poisoned"))?
        .get(&key)
    {
        return Ok(cached.clone());
    }

    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    let mask = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;

    CAUSAL_MASK_CACHE
        .lock()
        .map_err(|_| anyhow::anyhow!("causal mask cache poisoned"))?
        .insert(key, mask.clone());

    Ok(mask)
}

/// Combined causal + key-padding bias of shape `[batch, 1, seq_len, seq_len]`.
///
/// `attention_mask` is `[batch, seq_len]` with 1 for real tokens and 0 for padding.
pub fn create_attention_bias(attention_mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let (batch, seq_len) = attention_mask.dims2()?;
    let device = attention_mask.device();

    let causal = create_causal_mask(seq_len, device, DType::F32)?;

    let keep = attention_mask.to_dtype(DType::F32)?;
    // 1 -> 0.0, 0 -> PADDING_BIAS
    let bias = f64::from(PADDING_BIAS);
    let padding = keep.affine(-bias, bias)?.reshape((batch, 1, 1, seq_len))?;

    Ok(causal.broadcast_add(&padding)?.to_dtype(dtype)?)
}

/// Drop every cached causal mask
pub fn clear_mask_cache() {
    if let Ok(mut cache) = CAUSAL_MASK_CACHE.lock() {
        cache.clear();
    }
}
