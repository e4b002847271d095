//! Detection quality: ROC AUC and a fitted decision threshold
//!
//! Machine-generated text is the positive class throughout. The threshold is
//! found with a one-feature logistic regression (linfa) on the detection
//! score; it is the score where the fitted probability crosses 0.5.

use anyhow::{Context, Result};
use linfa::prelude::*;
use linfa_logistic::LogisticRegression;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Area under the ROC curve, with ties counted as one half.
///
/// NaN scores are dropped. Returns NaN if either class ends up empty.
pub fn roc_auc(human: &[f64], machine: &[f64]) -> f64 {
    let human = drop_nan(human, "human");
    let machine = drop_nan(machine, "machine");
    if human.is_empty() || machine.is_empty() {
        return f64::NAN;
    }

    let mut wins = 0.0;
    for &m in &machine {
        for &h in &human {
            if m > h {
                wins += 1.0;
            } else if m == h {
                wins += 0.5;
            }
        }
    }
    wins / (human.len() * machine.len()) as f64
}

/// ROC points `(fpr, tpr)` from the strictest threshold to the loosest.
pub fn roc_curve(human: &[f64], machine: &[f64]) -> Vec<(f64, f64)> {
    let human = drop_nan(human, "human");
    let machine = drop_nan(machine, "machine");
    if human.is_empty() || machine.is_empty() {
        return Vec::new();
    }

    let mut thresholds: Vec<f64> = human.iter().chain(&machine).copied().collect();
    thresholds.sort_by(|a, b| b.total_cmp(a));
    thresholds.dedup();

    let rate = |scores: &[f64], t: f64| {
        scores.iter().filter(|&&s| s >= t).count() as f64 / scores.len() as f64
    };

    let mut points = vec![(0.0, 0.0)];
    points.extend(thresholds.iter().map(|&t| (rate(&human, t), rate(&machine, t))));
    points
}

fn drop_nan(scores: &[f64], label: &str) -> Vec<f64> {
    let kept: Vec<f64> = scores.iter().copied().filter(|s| !s.is_nan()).collect();
    if kept.len() < scores.len() {
        warn!("Dropped {} NaN {label} scores", scores.len() - kept.len());
    }
    kept
}

/// Classification outcome of a fitted threshold on the scored texts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdFit {
    /// Score above which text is called machine-generated (None if the fit is flat)
    pub threshold: Option<f64>,
    pub accuracy: f64,
    pub true_positives: usize,
    pub true_negatives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
}

impl ThresholdFit {
    pub fn precision(&self) -> f64 {
        let denom = self.true_positives + self.false_positives;
        if denom == 0 {
            0.0
        } else {
            self.true_positives as f64 / denom as f64
        }
    }

    pub fn recall(&self) -> f64 {
        let denom = self.true_positives + self.false_negatives;
        if denom == 0 {
            0.0
        } else {
            self.true_positives as f64 / denom as f64
        }
    }

    pub fn f1(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }
}

/// Logistic-regression threshold fitting on a single score
pub struct ThresholdFitter {
    max_iterations: u64,
}

impl ThresholdFitter {
    pub fn new() -> Self {
        Self {
            max_iterations: 100,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Fit on all finite scores and report in-sample metrics.
    pub fn fit(&self, human: &[f64], machine: &[f64]) -> Result<ThresholdFit> {
        let (x, y) = prepare_data(human, machine)?;
        debug!("Fitting threshold on {} scores", x.nrows());

        let dataset = Dataset::new(x.clone(), y.clone());
        let model = LogisticRegression::default()
            .max_iterations(self.max_iterations)
            .fit(&dataset)
            .context("Failed to fit logistic regression")?;

        let weight = model.params()[0];
        let threshold = if weight.abs() > f64::EPSILON {
            Some(-model.intercept() / weight)
        } else {
            None
        };

        let predictions = model.predict(&x);
        Ok(compute_metrics(&predictions, &y, threshold))
    }
}

impl Default for ThresholdFitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-column feature matrix and labels (1 = machine)
fn prepare_data(human: &[f64], machine: &[f64]) -> Result<(Array2<f64>, Array1<usize>)> {
    let labelled: Vec<(f64, usize)> = human
        .iter()
        .map(|&s| (s, 0))
        .chain(machine.iter().map(|&s| (s, 1)))
        .filter(|(s, _)| s.is_finite())
        .collect();

    let dropped = human.len() + machine.len() - labelled.len();
    if dropped > 0 {
        warn!("Threshold fit ignores {dropped} non-finite scores");
    }
    if labelled.is_empty() {
        anyhow::bail!("No finite scores to fit a threshold on");
    }

    let x = Array2::from_shape_vec(
        (labelled.len(), 1),
        labelled.iter().map(|(s, _)| *s).collect(),
    )
    .context("Failed to create feature matrix")?;
    let y: Array1<usize> = labelled.iter().map(|(_, l)| *l).collect();
    Ok((x, y))
}

fn compute_metrics(
    predictions: &Array1<usize>,
    labels: &Array1<usize>,
    threshold: Option<f64>,
) -> ThresholdFit {
    let mut tp = 0;
    let mut tn = 0;
    let mut fp = 0;
    let mut r#fn = 0;

    for (pred, label) in predictions.iter().zip(labels.iter()) {
        match (*pred, *label) {
            (1, 1) => tp += 1,
            (0, 0) => tn += 1,
            (1, 0) => fp += 1,
            (0, 1) => r#fn += 1,
            _ => {}
        }
    }

    let total = predictions.len();
    let accuracy = if total == 0 {
        0.0
    } else {
        (tp + tn) as f64 / total as f64
    };

    ThresholdFit {
        threshold,
        accuracy,
        true_positives: tp,
        true_negatives: tn,
        false_positives: fp,
        false_negatives: r#fn,
    }
}

/// ROC AUC plus, when a fit succeeds, a threshold for one detection score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionMetrics {
    pub roc_auc: f64,
    pub threshold: Option<ThresholdFit>,
    pub n_human: usize,
    pub n_machine: usize,
}

impl DetectionMetrics {
    pub fn evaluate(human: &[f64], machine: &[f64]) -> Self {
        let threshold = match ThresholdFitter::new().fit(human, machine) {
            Ok(fit) => Some(fit),
            Err(e) => {
                warn!("Threshold fit failed: {e:#}");
                None
            }
        };
        Self {
            roc_auc: roc_auc(human, machine),
            threshold,
            n_human: human.len(),
            n_machine: machine.len(),
        }
    }
}
