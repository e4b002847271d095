//! Parse raw infill output into per-placeholder fills and substitute them back

use anyhow::Result;

use crate::masking::{placeholder, placeholder_pattern};

/// Padding marker emitted by T5-style decoders
pub const PAD_MARKER: &str = "<pad>";
/// End-of-sequence marker emitted by T5-style decoders
pub const EOS_MARKER: &str = "</s>";

/// Split decoded infill output into fills, in order of appearance.
///
/// Each fill is the text between a placeholder marker and the next marker (or
/// the end of the string), trimmed. Text before the first marker is ignored.
pub fn extract_fills(raw: &str) -> Vec<String> {
    let cleaned = raw.replace(PAD_MARKER, "").replace(EOS_MARKER, "");
    let cleaned = cleaned.trim();

    let markers: Vec<_> = placeholder_pattern().find_iter(cleaned).collect();
    markers
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let end = markers.get(i + 1).map_or(cleaned.len(), |next| next.start());
            cleaned[m.end()..end].trim().to_string()
        })
        .collect()
}

pub fn extract_fills_batch(raw: &[String]) -> Vec<Vec<String>> {
    raw.iter().map(|r| extract_fills(r)).collect()
}

/// Replace placeholder `i` with `fills[i]` for every available fill.
///
/// An empty fill set returns the masked text unchanged; placeholders without a
/// fill stay literally in the output and surplus fills are ignored.
pub fn apply_fills(masked: &str, fills: &[String]) -> String {
    let mut text = masked.to_string();
    for (i, fill) in fills.iter().enumerate() {
        text = text.replacen(&placeholder(i), fill, 1);
    }
    text
}

/// Apply fills pairwise; one output per masked text, in order.
pub fn apply_fills_batch(masked: &[String], fills: &[Vec<String>]) -> Result<Vec<String>> {
    anyhow::ensure!(
        masked.len() == fills.len(),
        "{} masked texts but {} fill sets",
        masked.len(),
        fills.len()
    );
    Ok(masked
        .iter()
        .zip(fills)
        .map(|(text, fill)| apply_fills(text, fill))
        .collect())
}
