//! Error taxonomy for the detection pipeline
//!
//! Library functions return `anyhow::Result`; the conditions a caller may
//! want to match on are raised as [`DetectError`] and can be recovered with
//! `err.downcast_ref::<DetectError>()`.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DetectError {
    /// More masks were requested than there are maskable word positions.
    #[error("cannot place {num_masks} masks: only {available} maskable positions")]
    InvalidMaskRatio { num_masks: usize, available: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("tokenization failed: {0}")]
    Tokenization(String),

    #[error("{context}: {message}")]
    Inference {
        context: &'static str,
        message: String,
    },

    /// A cancel token fired between sub-batches.
    #[error("run aborted after {completed} completed sub-batches")]
    Aborted { completed: usize },

    #[error("dataset line {line}: {message}")]
    Dataset { line: usize, message: String },
}

impl DetectError {
    pub(crate) fn inference(context: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Inference {
            context,
            message: err.to_string(),
        }
    }

    pub(crate) fn tokenization(err: impl std::fmt::Display) -> Self {
        Self::Tokenization(err.to_string())
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}
