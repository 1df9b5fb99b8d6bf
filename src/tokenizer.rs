// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tokenization for building prompt datasets.
//!
//! [`TokenEncoder`] is the only thing dataset construction needs from a
//! tokenizer. [`PatchTokenizer`] implements it on top of the
//! `HuggingFace` `tokenizers` crate.

use crate::error::{PatchError, Result};

/// Text to token ids.
pub trait TokenEncoder {
    /// Encode `text`, optionally adding the tokenizer's special tokens
    /// (e.g. BOS).
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Tokenizer`] if encoding fails.
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>>;

    /// Id of the beginning-of-sequence token, if the vocabulary has one.
    fn bos_token_id(&self) -> Option<u32>;
}

/// Special tokens tried, in order, when looking up a BOS id.
const BOS_CANDIDATES: [&str; 4] = ["<|endoftext|>", "<|begin_of_text|>", "<s>", "<bos>"];

/// `HuggingFace` tokenizer wrapper.
///
/// # Example
///
/// ```no_run
/// use path_patching::{PatchTokenizer, TokenEncoder};
///
/// # fn main() -> path_patching::Result<()> {
/// let tok = PatchTokenizer::from_file("tokenizer.json")?;
/// let ids = tok.encode("When Mary and John went to the store", false)?;
/// assert!(!ids.is_empty());
/// # Ok(())
/// # }
/// ```
pub struct PatchTokenizer {
    /// The wrapped tokenizer.
    inner: Box<tokenizers::Tokenizer>,
    /// BOS id inserted by [`PromptPairs::from_prompts`](crate::PromptPairs::from_prompts).
    bos_token_id: Option<u32>,
}

impl PatchTokenizer {
    /// Load a tokenizer from a `tokenizer.json` file.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Tokenizer`] if the file cannot be loaded or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let tok = tokenizers::Tokenizer::from_file(path.as_ref()).map_err(|e| {
            PatchError::Tokenizer(format!(
                "failed to load tokenizer from {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self::from_hf(tok))
    }

    /// Wrap an already-loaded tokenizer.
    ///
    /// The BOS id is the first of `<|endoftext|>`, `<|begin_of_text|>`,
    /// `<s>` and `<bos>` present in the vocabulary.
    #[must_use]
    pub fn from_hf(tokenizer: tokenizers::Tokenizer) -> Self {
        let bos_token_id = BOS_CANDIDATES
            .iter()
            .find_map(|token| tokenizer.token_to_id(token));
        Self {
            inner: Box::new(tokenizer),
            bos_token_id,
        }
    }

    /// Override the detected BOS id.
    #[must_use]
    pub const fn with_bos_token_id(mut self, bos_token_id: Option<u32>) -> Self {
        self.bos_token_id = bos_token_id;
        self
    }

    /// Decode token ids back to text.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Tokenizer`] if decoding fails.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| PatchError::Tokenizer(format!("decode failed: {e}")))
    }

    /// Vocabulary size including added tokens.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl TokenEncoder for PatchTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| PatchError::Tokenizer(format!("encode failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn bos_token_id(&self) -> Option<u32> {
        self.bos_token_id
    }
}

impl std::fmt::Debug for PatchTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchTokenizer")
            .field("vocab_size", &self.vocab_size())
            .field("bos_token_id", &self.bos_token_id)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
    use super::*;

    /// Word-level `tokenizer.json` with GPT-2's `<|endoftext|>` and no
    /// post-processor, so `add_special_tokens` inserts nothing.
    pub(crate) const WORD_LEVEL_JSON: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [
            {"id": 0, "content": "<|endoftext|>", "single_word": false, "lstrip": false,
             "rstrip": false, "normalized": false, "special": true}
        ],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"<|endoftext|>": 0, "[UNK]": 1, "John": 2, "gave": 3, "to": 4, "Mary": 5},
            "unk_token": "[UNK]"
        }
    }"#;

    /// [`PatchTokenizer`] over [`WORD_LEVEL_JSON`].
    pub(crate) fn word_level() -> PatchTokenizer {
        let tok: tokenizers::Tokenizer = WORD_LEVEL_JSON.parse().unwrap();
        PatchTokenizer::from_hf(tok)
    }

    #[test]
    fn special_tokens_do_not_add_bos_without_post_processor() {
        let tok = word_level();
        assert_eq!(tok.encode("John gave to", true).unwrap(), vec![2, 3, 4]);
        assert_eq!(tok.encode("John gave to", false).unwrap(), vec![2, 3, 4]);
    }

    #[test]
    fn bos_is_detected_and_overridable() {
        let tok = word_level();
        assert_eq!(tok.bos_token_id(), Some(0));
        assert_eq!(tok.with_bos_token_id(None).bos_token_id(), None);
    }
}
