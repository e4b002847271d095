//! Dataset loading: newline-delimited JSON records of human and machine text

use std::path::Path;

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::DetectError;
use crate::masking::truncate_words;

/// Label used for human-written records
pub const HUMAN_LABEL: &str = "human";

/// One dataset entry. `text` and `model` are required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub text: String,
    /// `"human"` or the name of the generating model
    pub model: String,
    #[serde(default)]
    pub source: String,
}

impl Record {
    pub fn is_human(&self) -> bool {
        self.model == HUMAN_LABEL
    }
}

#[derive(Debug, Clone, Default)]
pub struct Corpus {
    records: Vec<Record>,
}

impl Corpus {
    pub fn from_records(records: Vec<Record>) -> Self {
        Self { records }
    }

    /// Load a JSON-lines file. Blank lines are skipped; a malformed line or a
    /// record without `text` fails the whole load.
    pub fn load_jsonl(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read dataset {}", path.display()))?;
        Self::parse_jsonl(&content)
    }

    pub fn parse_jsonl(content: &str) -> Result<Self> {
        let mut records = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: Record = serde_json::from_str(line).map_err(|e| DetectError::Dataset {
                line: idx + 1,
                message: e.to_string(),
            })?;
            records.push(record);
        }
        Ok(Self { records })
    }

    /// Human texts, first `n`, truncated to `max_words`
    pub fn human_texts(&self, n: usize, max_words: usize) -> Vec<String> {
        self.texts_where(true, n, max_words)
    }

    /// Machine texts, first `n`, truncated to `max_words`
    pub fn machine_texts(&self, n: usize, max_words: usize) -> Vec<String> {
        self.texts_where(false, n, max_words)
    }

    fn texts_where(&self, human: bool, n: usize, max_words: usize) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| r.is_human() == human)
            .take(n)
            .map(|r| truncate_words(&r.text, max_words))
            .collect()
    }

    pub fn human_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_human()).count()
    }

    pub fn machine_count(&self) -> usize {
        self.records.iter().filter(|r| !r.is_human()).count()
    }

    /// Copy with records in a seeded random order
    pub fn shuffled(&self, seed: u64) -> Self {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut records = self.records.clone();
        records.shuffle(&mut rng);
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{"text": "a b  c d", "model": "human", "source": "xsum"}
{"text": "e f g", "model": "gpt2-xl", "source": "xsum"}

{"text": "h i", "model": "human"}
"#;

    #[test]
    fn test_parse_and_counts() {
        let corpus = Corpus::parse_jsonl(SAMPLE).unwrap();
        assert_eq!(corpus.len(), 3);
        assert_eq!(corpus.human_count(), 2);
        assert_eq!(corpus.machine_count(), 1);
        assert_eq!(corpus.records()[2].source, "");
    }

    #[test]
    fn test_texts_are_truncated_and_limited() {
        let corpus = Corpus::parse_jsonl(SAMPLE).unwrap();
        assert_eq!(corpus.human_texts(1, 3), vec!["a b c".to_string()]);
        assert_eq!(corpus.human_texts(10, 100).len(), 2);
        assert_eq!(corpus.machine_texts(10, 2), vec!["e f".to_string()]);
    }

    #[test]
    fn test_missing_text_fails_with_line_number() {
        let err = Corpus::parse_jsonl("{\"text\": \"ok\", \"model\": \"human\"}\n{\"model\": \"human\"}")
            .unwrap_err();
        match err.downcast_ref::<DetectError>() {
            Some(DetectError::Dataset { line, message }) => {
                assert_eq!(*line, 2);
                assert!(message.contains("text"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_shuffle_is_deterministic() {
        let records: Vec<Record> = (0..20)
            .map(|i| Record {
                text: format!("t{i}"),
                model: HUMAN_LABEL.to_string(),
                source: String::new(),
            })
            .collect();
        let corpus = Corpus::from_records(records);
        let a = corpus.shuffled(42);
        let b = corpus.shuffled(42);
        assert_eq!(a.records(), b.records());
        assert_eq!(a.len(), 20);
    }
}
