// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `base`/`bias`
#![allow(clippy::module_name_repetitions)] // Gpt2Config in gpt2.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility

//! DetectGPT: zero-shot machine-generated text detection
//!
//! A text is scored by how much more probable it is under a causal language
//! model than minor rewrites of itself. Rewrites come from masking random
//! two-word spans and letting a T5-style model fill them back in.
//!
//! ## Architecture
//!
//! - `backend`: Capability traits (tokenizer, causal scorer, infill model), batch encoding, cancellation
//! - `tokenizer`: HuggingFace tokenizers adapter with guaranteed pad token
//! - `gpt2`: GPT-2 forward pass returning per-position logits
//! - `t5`: T5 span-infill generation with nucleus sampling
//! - `masks`: Causal + padding attention masks
//! - `masking`: Span masker producing `<extra_id_N>` placeholders
//! - `infill`: Sub-batched infill requests with per-chunk stop markers
//! - `fills`: Fill extraction from raw infill output and re-insertion
//! - `perturb`: Perturbation rounds (mask → infill → extract → apply)
//! - `scoring`: Token-averaged log-probability with shifted, masked reduction
//! - `discrepancy`: Raw and normalized perturbation discrepancy
//! - `evaluation`: ROC AUC and logistic-regression thresholds with linfa
//! - `corpus`: JSON-lines dataset of human and machine texts
//! - `config`: Run configuration
//! - `experiment`: Experiment runner coordinating the full pipeline
//! - `error`: Error taxonomy

pub mod backend;
pub mod config;
pub mod corpus;
pub mod discrepancy;
pub mod error;
pub mod evaluation;
pub mod experiment;
pub mod fills;
pub mod gpt2;
pub mod infill;
pub mod masking;
pub mod masks;
pub mod perturb;
pub mod scoring;
pub mod t5;
pub mod tokenizer;

pub use backend::{
    BatchEncoding, CancelToken, CausalScorer, InfillModel, SamplingParams, StopCondition,
    TextTokenizer,
};
pub use config::DetectConfig;
pub use corpus::{Corpus, Record, HUMAN_LABEL};
pub use discrepancy::{discrepancy, discrepancy_scores, DiscrepancyStats};
pub use error::DetectError;
pub use evaluation::{roc_auc, roc_curve, DetectionMetrics, ThresholdFit, ThresholdFitter};
pub use experiment::{Experiment, ExperimentResults, PerturbationRecord};
pub use fills::{apply_fills, apply_fills_batch, extract_fills, extract_fills_batch};
pub use gpt2::{Gpt2Config, Gpt2Scorer};
pub use infill::InfillRequester;
pub use masking::{
    count_placeholders, placeholder, truncate_words, MaskedText, MaskingConfig, MinGap,
    SpanMasker,
};
pub use masks::{clear_mask_cache, create_attention_bias, create_causal_mask};
pub use perturb::Perturber;
pub use scoring::{masked_mean_log_probs, LogProbScorer};
pub use t5::T5Infiller;
pub use tokenizer::HfTokenizer;
