//! Token estimation for model payloads
//!
//! [`TokenEstimator`] is an explicitly constructed service: callers create one,
//! optionally warm it up with [`TokenEstimator::initialize`], share it by
//! reference and drop or [`TokenEstimator::teardown`] it when done. Tokenizers
//! are built lazily per model and cached for the lifetime of the estimator.
//!
//! When no tokenizer exists for a model (or the estimator runs in
//! [`TokenizerMode::Heuristic`]) the count falls back to one token per four
//! characters, rounded up.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tiktoken_rs::CoreBPE;
use tracing::{debug, warn};

/// How the estimator counts tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerMode {
    /// Use the model's BPE tokenizer when one is known, otherwise the heuristic
    Auto,
    /// Always use the four-characters-per-token heuristic
    Heuristic,
}

pub struct TokenEstimator {
    mode: TokenizerMode,
    encoders: Mutex<HashMap<String, Option<Arc<CoreBPE>>>>,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenEstimator {
    pub fn new() -> Self {
        Self::with_mode(TokenizerMode::Auto)
    }

    /// Estimator that never loads a tokenizer. Counts are a pure function of
    /// the character length, which keeps budgets reproducible in tests.
    pub fn heuristic() -> Self {
        Self::with_mode(TokenizerMode::Heuristic)
    }

    pub fn with_mode(mode: TokenizerMode) -> Self {
        Self {
            mode,
            encoders: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> TokenizerMode {
        self.mode
    }

    /// Loads the tokenizer for `model` ahead of first use. Returns whether a
    /// model-specific tokenizer is available.
    pub fn initialize(&self, model: &str) -> bool {
        self.encoder(model).is_some()
    }

    /// Drops every cached tokenizer.
    pub fn teardown(&self) {
        self.lock().clear();
    }

    pub fn estimate_text(&self, text: &str, model: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        match self.encoder(model) {
            Some(bpe) => bpe.encode_ordinary(text).len(),
            None => heuristic_tokens(text),
        }
    }

    /// Serializes `value` to compact JSON and estimates its token count.
    /// A value that cannot be serialized counts as zero tokens.
    pub fn estimate_json<T: Serialize + ?Sized>(&self, value: &T, model: &str) -> usize {
        match serde_json::to_string(value) {
            Ok(text) => self.estimate_text(&text, model),
            Err(e) => {
                warn!("Failed to serialize payload for token estimation: {}", e);
                0
            }
        }
    }

    fn encoder(&self, model: &str) -> Option<Arc<CoreBPE>> {
        if self.mode == TokenizerMode::Heuristic {
            return None;
        }

        let mut encoders = self.lock();
        encoders
            .entry(model.to_string())
            .or_insert_with(|| match tiktoken_rs::get_bpe_from_model(model) {
                Ok(bpe) => {
                    debug!("Loaded tokenizer for model {}", model);
                    Some(Arc::new(bpe))
                }
                Err(e) => {
                    debug!("No tokenizer for model {}, using heuristic: {}", model, e);
                    None
                }
            })
            .clone()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Option<Arc<CoreBPE>>>> {
        self.encoders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One token per four characters, rounded up.
pub fn heuristic_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}
