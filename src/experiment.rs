//! Experiment runner for DetectGPT
//!
//! Scores the original texts once, then runs `n_perturbations` rounds of
//! perturb-and-score over the whole text list, and finally aggregates each
//! text's scores into discrepancies. Human and machine texts go through the
//! same pipeline and are evaluated against each other.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::backend::{CancelToken, CausalScorer, InfillModel, TextTokenizer};
use crate::config::DetectConfig;
use crate::corpus::Corpus;
use crate::discrepancy::DiscrepancyStats;
use crate::error::DetectError;
use crate::evaluation::DetectionMetrics;
use crate::gpt2::Gpt2Scorer;
use crate::infill::InfillRequester;
use crate::masking::SpanMasker;
use crate::perturb::Perturber;
use crate::scoring::LogProbScorer;
use crate::t5::T5Infiller;
use crate::tokenizer::HfTokenizer;

/// Everything computed for one list of texts
#[derive(Debug, Clone, Serialize)]
pub struct PerturbationRecord {
    pub texts: Vec<String>,
    /// `perturbed_texts[i]` holds the perturbations of `texts[i]`, one per round
    pub perturbed_texts: Vec<Vec<String>>,
    pub base_log_probs: Vec<f64>,
    pub perturbed_log_probs: Vec<Vec<f64>>,
    pub discrepancies: Vec<f64>,
    pub normalized_discrepancies: Vec<f64>,
}

impl PerturbationRecord {
    pub fn new(
        texts: Vec<String>,
        perturbed_texts: Vec<Vec<String>>,
        base_log_probs: Vec<f64>,
        perturbed_log_probs: Vec<Vec<f64>>,
    ) -> Result<Self> {
        if texts.len() != base_log_probs.len() || texts.len() != perturbed_log_probs.len() {
            return Err(DetectError::config(format!(
                "{} texts, {} base scores, {} perturbed score lists",
                texts.len(),
                base_log_probs.len(),
                perturbed_log_probs.len()
            ))
            .into());
        }

        let stats: Vec<DiscrepancyStats> = base_log_probs
            .iter()
            .zip(&perturbed_log_probs)
            .map(|(&base, perturbed)| DiscrepancyStats::new(base, perturbed))
            .collect();

        Ok(Self {
            texts,
            perturbed_texts,
            base_log_probs,
            perturbed_log_probs,
            discrepancies: stats.iter().map(DiscrepancyStats::raw).collect(),
            normalized_discrepancies: stats.iter().map(DiscrepancyStats::normalized).collect(),
        })
    }

    /// Re-derive the discrepancy scores from the stored log-probabilities.
    pub fn rescore(&self, normalize: bool) -> Result<Vec<f64>> {
        crate::discrepancy::discrepancy_scores(
            &self.base_log_probs,
            &self.perturbed_log_probs,
            normalize,
        )
    }

    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }
}

/// Results from a full DetectGPT run
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentResults {
    pub config: DetectConfig,
    pub human: PerturbationRecord,
    pub machine: PerturbationRecord,
    pub detectgpt: DetectionMetrics,
    pub detectgpt_normalized: DetectionMetrics,
    /// Base log-probability alone as the detection score
    pub likelihood_baseline: DetectionMetrics,
}

/// Main experiment runner
pub struct Experiment {
    config: DetectConfig,
    scorer: LogProbScorer,
    perturber: Perturber,
    cancel: CancelToken,
}

impl Experiment {
    /// Build from already loaded capabilities. The config is validated.
    pub fn new(
        config: DetectConfig,
        scoring_model: Arc<dyn CausalScorer>,
        scoring_tokenizer: Arc<dyn TextTokenizer>,
        infill_model: Arc<dyn InfillModel>,
        infill_tokenizer: Arc<dyn TextTokenizer>,
    ) -> Result<Self> {
        config.validate()?;
        let cancel = CancelToken::new();

        let scorer = LogProbScorer::new(scoring_model, scoring_tokenizer, config.batch_size)
            .with_cancel_token(cancel.clone());
        let requester = InfillRequester::new(
            infill_model,
            infill_tokenizer,
            config.batch_size,
            config.sampling.clone(),
        )
        .with_cancel_token(cancel.clone());
        let masker = SpanMasker::new(config.masking.clone(), config.seed);

        Ok(Self {
            config,
            scorer,
            perturber: Perturber::new(masker, requester),
            cancel,
        })
    }

    /// Download and load the scoring and infill models named in `config`.
    pub fn from_pretrained(config: DetectConfig) -> Result<Self> {
        config.validate()?;

        let scoring_tokenizer = Arc::new(HfTokenizer::from_hub(&config.scoring_model, true)?);
        let scoring_model =
            Arc::new(Gpt2Scorer::from_hub(&config.scoring_model, config.force_cpu)?);

        let infill_tokenizer = Arc::new(HfTokenizer::from_hub(&config.infill_model, true)?);
        let infill_model = Arc::new(T5Infiller::from_hub(
            &config.infill_model,
            config.force_cpu,
            config.seed,
        )?);

        Self::new(
            config,
            scoring_model,
            scoring_tokenizer,
            infill_model,
            infill_tokenizer,
        )
    }

    pub fn config(&self) -> &DetectConfig {
        &self.config
    }

    /// Token that aborts the run between sub-batches once cancelled
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn scorer(&self) -> &LogProbScorer {
        &self.scorer
    }

    /// Base scores, `n_perturbations` perturb-and-score rounds, discrepancies.
    pub fn score_texts(&mut self, texts: &[String]) -> Result<PerturbationRecord> {
        let n_rounds = self.config.n_perturbations;
        let base = self.scorer.score(texts)?;
        info!("Scored {} original texts", texts.len());

        let mut perturbed_texts = vec![Vec::with_capacity(n_rounds); texts.len()];
        let mut perturbed_scores = vec![Vec::with_capacity(n_rounds); texts.len()];

        for round in 0..n_rounds {
            let perturbed = self.perturber.perturb_batch(texts)?;
            let scores = self.scorer.score(&perturbed)?;

            for (i, (text, score)) in perturbed.into_iter().zip(scores).enumerate() {
                perturbed_texts[i].push(text);
                perturbed_scores[i].push(score);
            }

            info!("Perturbation round {}/{}", round + 1, n_rounds);
            self.cancel.check(round + 1)?;
        }

        let record =
            PerturbationRecord::new(texts.to_vec(), perturbed_texts, base, perturbed_scores)?;
        let degenerate = record
            .discrepancies
            .iter()
            .filter(|d| !d.is_finite())
            .count();
        if degenerate > 0 {
            warn!("{degenerate}/{} texts have a non-finite discrepancy", record.len());
        }
        Ok(record)
    }

    /// Run the full experiment
    pub fn run(&mut self, corpus: &Corpus) -> Result<ExperimentResults> {
        info!("Starting DetectGPT experiment");
        info!("Config: {:?}", self.config);

        let corpus = match self.config.seed {
            Some(seed) => corpus.shuffled(seed),
            None => corpus.clone(),
        };

        let n = self.config.n_samples;
        let max_words = self.config.masking.max_words;
        let human_texts = corpus.human_texts(n, max_words);
        let machine_texts = corpus.machine_texts(n, max_words);
        if human_texts.is_empty() && machine_texts.is_empty() {
            return Err(DetectError::config("corpus has no texts to score").into());
        }
        info!(
            "Selected {} human, {} machine texts",
            human_texts.len(),
            machine_texts.len()
        );

        info!("Scoring human texts");
        let human = self.score_texts(&human_texts)?;
        info!("Scoring machine texts");
        let machine = self.score_texts(&machine_texts)?;

        let detectgpt = DetectionMetrics::evaluate(&human.discrepancies, &machine.discrepancies);
        let detectgpt_normalized = DetectionMetrics::evaluate(
            &human.normalized_discrepancies,
            &machine.normalized_discrepancies,
        );
        let likelihood_baseline =
            DetectionMetrics::evaluate(&human.base_log_probs, &machine.base_log_probs);

        info!(
            "ROC AUC: detectgpt {:.4}, normalized {:.4}, likelihood {:.4}",
            detectgpt.roc_auc, detectgpt_normalized.roc_auc, likelihood_baseline.roc_auc
        );

        Ok(ExperimentResults {
            config: self.config.clone(),
            human,
            machine,
            detectgpt,
            detectgpt_normalized,
            likelihood_baseline,
        })
    }
}
