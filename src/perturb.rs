//! Perturbation rounds: mask → infill → extract → apply

use anyhow::Result;
use tracing::{debug, warn};

use crate::fills::{apply_fills_batch, extract_fills_batch};
use crate::infill::InfillRequester;
use crate::masking::SpanMasker;

/// Produces one perturbed variant of every input text per call.
///
/// Successive calls draw fresh masks, so two calls on the same batch give
/// independent perturbations unless the seeds are reset.
pub struct Perturber {
    masker: SpanMasker,
    requester: InfillRequester,
}

impl Perturber {
    pub fn new(masker: SpanMasker, requester: InfillRequester) -> Self {
        Self { masker, requester }
    }

    pub fn masker(&self) -> &SpanMasker {
        &self.masker
    }

    /// One perturbation per text, same order and count as `texts`.
    pub fn perturb_batch(&mut self, texts: &[String]) -> Result<Vec<String>> {
        let masked = self.masker.mask_batch(texts)?;
        let masked_texts: Vec<String> = masked.into_iter().map(|m| m.text).collect();

        let raw = self.requester.request(&masked_texts)?;
        let fills = extract_fills_batch(&raw);

        let empty = fills.iter().filter(|f| f.is_empty()).count();
        if empty > 0 {
            warn!(
                "{empty}/{} texts got no usable fills; their placeholders stay in place",
                texts.len()
            );
        }
        debug!("Perturbed {} texts", texts.len());

        apply_fills_batch(&masked_texts, &fills)
    }
}
