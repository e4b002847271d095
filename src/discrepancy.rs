//! Perturbation discrepancy: how much more probable a text is than its rewrites
//!
//! `d = base - mean(perturbed)`, optionally divided by the sample standard
//! deviation (ddof = 1) of the perturbed scores. Higher means more likely
//! machine-generated.
//!
//! Both statistics accumulate in f64 through `ndarray`. The mean is a plain
//! sum over the count, so a `-inf` perturbed score gives a `-inf` mean (and a
//! `+inf` raw discrepancy) wherever it sits in the list. The variance uses a
//! running update, which keeps `P ≈ 100` scores of large negative magnitude
//! from cancelling; any non-finite score makes it NaN. Nothing is filtered.

use anyhow::Result;
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

use crate::error::DetectError;

/// Per-text summary of one base score against its perturbed scores
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiscrepancyStats {
    pub base: f64,
    pub perturbed_mean: f64,
    /// Sample standard deviation, ddof = 1
    pub perturbed_std: f64,
}

impl DiscrepancyStats {
    pub fn new(base: f64, perturbed: &[f64]) -> Self {
        let scores = ArrayView1::from(perturbed);
        let perturbed_std = if perturbed.len() > 1 {
            scores.std(1.0)
        } else {
            f64::NAN
        };
        Self {
            base,
            perturbed_mean: scores.mean().unwrap_or(f64::NAN),
            perturbed_std,
        }
    }

    pub fn raw(&self) -> f64 {
        self.base - self.perturbed_mean
    }

    /// Raw discrepancy over the perturbed std; exactly 0 when the std is 0.
    pub fn normalized(&self) -> f64 {
        if self.perturbed_std == 0.0 {
            0.0
        } else {
            self.raw() / self.perturbed_std
        }
    }

    pub fn score(&self, normalize: bool) -> f64 {
        if normalize {
            self.normalized()
        } else {
            self.raw()
        }
    }
}

/// Discrepancy for a single text.
pub fn discrepancy(base: f64, perturbed: &[f64], normalize: bool) -> f64 {
    DiscrepancyStats::new(base, perturbed).score(normalize)
}

/// Discrepancy for every text. `perturbed[i]` holds the scores of text `i`'s perturbations.
pub fn discrepancy_scores(
    base: &[f64],
    perturbed: &[Vec<f64>],
    normalize: bool,
) -> Result<Vec<f64>> {
    if base.len() != perturbed.len() {
        return Err(DetectError::config(format!(
            "{} base scores but {} perturbed score lists",
            base.len(),
            perturbed.len()
        ))
        .into());
    }
    Ok(base
        .iter()
        .zip(perturbed)
        .map(|(&b, p)| discrepancy(b, p, normalize))
        .collect())
}
