//! HuggingFace `tokenizers` adapter implementing [`TextTokenizer`]

use std::path::Path;

use anyhow::{Context, Result};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::backend::{BatchEncoding, TextTokenizer};
use crate::error::DetectError;

/// End-of-sequence spellings tried in order when resolving the EOS id
const EOS_CANDIDATES: [&str; 4] = ["</s>", "<|endoftext|>", "<|im_end|>", "<end_of_turn>"];

/// Tokenizer wrapper with a guaranteed pad token.
///
/// Tokenizers that ship without a pad token (GPT-2) get the end-of-sequence
/// token assigned as pad at construction time.
pub struct HfTokenizer {
    tokenizer: Tokenizer,
    add_special_tokens: bool,
    eos_id: u32,
    pad_id: u32,
}

impl HfTokenizer {
    /// Wrap an already loaded tokenizer.
    pub fn new(tokenizer: Tokenizer, add_special_tokens: bool) -> Result<Self> {
        let vocab = tokenizer.get_vocab(true);
        let eos_id = EOS_CANDIDATES
            .iter()
            .find_map(|tok| vocab.get(*tok).copied())
            .ok_or_else(|| DetectError::tokenization("tokenizer has no end-of-sequence token"))?;

        let pad_id = match tokenizer.get_padding().map(|p| p.pad_id) {
            Some(id) => id,
            None => match vocab.get("<pad>").copied() {
                Some(id) => id,
                None => {
                    info!("Tokenizer has no pad token, using EOS ({eos_id}) as pad");
                    eos_id
                }
            },
        };

        debug!("Tokenizer ready: eos={eos_id}, pad={pad_id}");

        Ok(Self {
            tokenizer,
            add_special_tokens,
            eos_id,
            pad_id,
        })
    }

    /// Load from a local `tokenizer.json`
    pub fn from_file(path: impl AsRef<Path>, add_special_tokens: bool) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;
        Self::new(tokenizer, add_special_tokens)
    }

    /// Download `tokenizer.json` for a model on the HuggingFace hub
    pub fn from_hub(model_id: &str, add_special_tokens: bool) -> Result<Self> {
        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        let tokenizer_path = repo
            .get("tokenizer.json")
            .with_context(|| format!("Failed to download tokenizer.json for {model_id}"))?;
        Self::from_file(tokenizer_path, add_special_tokens)
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode_batch(&self, texts: &[String]) -> Result<BatchEncoding> {
        let mut rows = Vec::with_capacity(texts.len());
        for text in texts {
            let encoding = self
                .tokenizer
                .encode(text.as_str(), self.add_special_tokens)
                .map_err(DetectError::tokenization)?;
            rows.push(encoding.get_ids().to_vec());
        }
        Ok(BatchEncoding::from_unpadded(rows, self.pad_id))
    }

    fn decode(&self, ids: &[u32], keep_special: bool) -> Result<String> {
        Ok(self
            .tokenizer
            .decode(ids, !keep_special)
            .map_err(DetectError::tokenization)?)
    }

    fn token_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_id
    }

    fn pad_token_id(&self) -> u32 {
        self.pad_id
    }
}
