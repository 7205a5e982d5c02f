//! Token encoding and tail-preserving truncation.
//!
//! Token ids are recomputed on every call from the text and the tokenizer
//! bound at that moment, so swapping a list's tokenizer never leaves stale
//! counts behind.

use std::sync::Arc;

use tiktoken_rs::CoreBPE;

use crate::error::{CoreError, Result};

/// Trait for tokenizer implementations.
pub trait Tokenizer: Send + Sync {
    /// Identifier used in logs.
    fn name(&self) -> &str;

    /// Encode text into an ordered sequence of token ids.
    fn encode(&self, text: &str) -> Vec<u32>;

    /// Decode token ids back into text.
    fn decode(&self, tokens: &[u32]) -> String;

    /// Count tokens in a plain text string.
    fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.encode(text).len()
    }
}

/// Arc-wrapped tokenizer for easy sharing.
pub type SharedTokenizer = Arc<dyn Tokenizer>;

/// One token per Unicode scalar value.
///
/// Exact and reversible, which makes budgets in tests easy to reason about.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharTokenizer;

impl CharTokenizer {
    pub fn shared() -> SharedTokenizer {
        Arc::new(Self)
    }
}

impl Tokenizer for CharTokenizer {
    fn name(&self) -> &str {
        "char"
    }

    fn encode(&self, text: &str) -> Vec<u32> {
        text.chars().map(|c| c as u32).collect()
    }

    fn decode(&self, tokens: &[u32]) -> String {
        tokens.iter().filter_map(|t| char::from_u32(*t)).collect()
    }

    fn count(&self, text: &str) -> usize {
        text.chars().count()
    }
}

/// Leading tokens dropped at most when a tail slice starts inside a
/// multi-byte character.
const MAX_PARTIAL_TOKENS: usize = 4;

/// Byte-pair encoding backed by `tiktoken-rs`.
///
/// The encoder tables are immutable after construction, so a single
/// instance can be shared between requests without accumulating state.
#[derive(Clone)]
pub struct BpeTokenizer {
    name: &'static str,
    bpe: Arc<CoreBPE>,
}

impl std::fmt::Debug for BpeTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BpeTokenizer").field("name", &self.name).finish()
    }
}

impl BpeTokenizer {
    /// The `o200k_base` encoding used by the gpt-4o and o-series models.
    pub fn o200k() -> Result<Self> {
        let bpe = tiktoken_rs::o200k_base().map_err(|e| CoreError::Tokenizer(e.to_string()))?;
        Ok(Self {
            name: "o200k_base",
            bpe: Arc::new(bpe),
        })
    }

    /// The `cl100k_base` encoding used by gpt-4 and gpt-3.5.
    pub fn cl100k() -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base().map_err(|e| CoreError::Tokenizer(e.to_string()))?;
        Ok(Self {
            name: "cl100k_base",
            bpe: Arc::new(bpe),
        })
    }

    /// `o200k_base`, or [`CharTokenizer`] when the encoding cannot be built.
    pub fn shared() -> SharedTokenizer {
        match Self::o200k() {
            Ok(tokenizer) => Arc::new(tokenizer),
            Err(e) => {
                log::warn!("Falling back to character tokenizer: {}", e);
                CharTokenizer::shared()
            }
        }
    }
}

impl Tokenizer for BpeTokenizer {
    fn name(&self) -> &str {
        self.name
    }

    fn encode(&self, text: &str) -> Vec<u32> {
        self.bpe.encode_ordinary(text)
    }

    fn decode(&self, tokens: &[u32]) -> String {
        // A slice may begin in the middle of a character's byte sequence.
        for skip in 0..=MAX_PARTIAL_TOKENS.min(tokens.len()) {
            if let Ok(text) = self.bpe.decode(tokens[skip..].to_vec()) {
                return text;
            }
        }
        String::new()
    }
}

/// Shorten `text` to at most `budget` tokens, keeping the trailing tokens.
pub fn truncate_text(text: &str, budget: usize, tokenizer: &dyn Tokenizer) -> String {
    let tokens = tokenizer.encode(text);
    if tokens.len() <= budget {
        return text.to_string();
    }
    tokenizer.decode(&tokens[tokens.len() - budget..])
}
