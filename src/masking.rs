//! Span masking: replace random two-word spans with indexed placeholders
//!
//! Each chosen start position is overwritten with `<extra_id_i>` and the word
//! after it is deleted, so one placeholder stands for a two-word span. Chosen
//! positions are processed in descending order and numbered in that order:
//! placeholder 0 sits at the right-most masked position.
//!
//! Instead of mutating the word list while walking it, the masker marks every
//! original word as kept, placeholder or deleted and then filters once.

use std::sync::LazyLock;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DetectError;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<extra_id_\d+>").expect("valid placeholder regex"));

/// Placeholder marker for index `i`, e.g. `<extra_id_3>`
pub fn placeholder(index: usize) -> String {
    format!("<extra_id_{index}>")
}

/// Regex matching any placeholder marker
pub fn placeholder_pattern() -> &'static Regex {
    &PLACEHOLDER_RE
}

/// Number of placeholder markers occurring in `text`
pub fn count_placeholders(text: &str) -> usize {
    PLACEHOLDER_RE.find_iter(text).count()
}

/// Keep the first `max_words` whitespace-delimited words, joined by single spaces.
pub fn truncate_words(text: &str, max_words: usize) -> String {
    text.split_whitespace()
        .take(max_words)
        .collect::<Vec<_>>()
        .join(" ")
}

/// How close two chosen span starts may be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinGap {
    /// Any distinct starts in `[0, L-2]`, adjacent ones included. When two
    /// starts are adjacent the right span's placeholder is never deleted by
    /// the left span; that left span then removes no successor word.
    #[default]
    Adjacent,
    /// Starts differ by at least 2, so every span deletes exactly one word.
    NonAdjacent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskingConfig {
    /// Fraction of words used as span starts, in (0, 1]
    pub mask_ratio: f64,
    /// Texts are truncated to this many words before masking
    pub max_words: usize,
    pub min_gap: MinGap,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self {
            mask_ratio: 0.15,
            max_words: 370,
            min_gap: MinGap::Adjacent,
        }
    }
}

/// A text with placeholders in place of masked spans.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedText {
    pub text: String,
    pub num_masks: usize,
    /// Original words covered by each placeholder, indexed by placeholder number
    pub spans: Vec<String>,
    /// Number of words after truncation
    pub word_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Kept,
    Placeholder(usize),
    Deleted,
}

pub struct SpanMasker {
    config: MaskingConfig,
    rng: StdRng,
}

impl SpanMasker {
    /// `seed = None` draws the sampling seed from the OS.
    pub fn new(config: MaskingConfig, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { config, rng }
    }

    pub fn config(&self) -> &MaskingConfig {
        &self.config
    }

    /// Mask every text of a batch, in order.
    pub fn mask_batch(&mut self, texts: &[String]) -> Result<Vec<MaskedText>> {
        texts.iter().map(|t| self.mask(t)).collect()
    }

    pub fn mask(&mut self, text: &str) -> Result<MaskedText> {
        let words: Vec<&str> = text
            .split_whitespace()
            .take(self.config.max_words)
            .collect();
        let len = words.len();

        let num_masks = if len < 2 {
            0
        } else {
            (len as f64 * self.config.mask_ratio).floor() as usize
        };

        let available = self.capacity(len);
        if num_masks > available {
            return Err(DetectError::InvalidMaskRatio {
                num_masks,
                available,
            }
            .into());
        }

        let mut starts = self.sample_starts(len, num_masks);
        starts.sort_unstable_by(|a, b| b.cmp(a));

        let mut slots = vec![Slot::Kept; len];
        let mut spans = Vec::with_capacity(num_masks);
        for (index, &pos) in starts.iter().enumerate() {
            slots[pos] = Slot::Placeholder(index);
            let mut span = words[pos].to_string();
            if pos + 1 < len && !matches!(slots[pos + 1], Slot::Placeholder(_)) {
                slots[pos + 1] = Slot::Deleted;
                span.push(' ');
                span.push_str(words[pos + 1]);
            }
            spans.push(span);
        }

        let out: Vec<String> = slots
            .iter()
            .zip(&words)
            .filter_map(|(slot, word)| match *slot {
                Slot::Kept => Some((*word).to_string()),
                Slot::Placeholder(i) => Some(placeholder(i)),
                Slot::Deleted => None,
            })
            .collect();

        debug!("Masked {num_masks} spans in {len} words");

        Ok(MaskedText {
            text: out.join(" "),
            num_masks,
            spans,
            word_count: len,
        })
    }

    /// Largest mask count the gap policy can place in `len` words
    fn capacity(&self, len: usize) -> usize {
        let starts = len.saturating_sub(1);
        match self.config.min_gap {
            MinGap::Adjacent => starts,
            MinGap::NonAdjacent => starts.div_ceil(2),
        }
    }

    /// Distinct span starts in `[0, len-2]`, uniformly at random.
    fn sample_starts(&mut self, len: usize, num_masks: usize) -> Vec<usize> {
        if num_masks == 0 {
            return Vec::new();
        }
        let candidates = len - 1;
        match self.config.min_gap {
            MinGap::Adjacent => {
                rand::seq::index::sample(&mut self.rng, candidates, num_masks).into_vec()
            }
            MinGap::NonAdjacent => {
                // Choose k sorted values from a range shrunk by k-1, then
                // spread them out by their rank: x_j = y_j + j.
                let shrunk = candidates - (num_masks - 1);
                let mut picks =
                    rand::seq::index::sample(&mut self.rng, shrunk, num_masks).into_vec();
                picks.sort_unstable();
                picks.iter().enumerate().map(|(j, y)| y + j).collect()
            }
        }
    }
}
