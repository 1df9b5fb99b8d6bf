// SPDX-License-Identifier: MIT OR Apache-2.0

//! Clean/corrupted prompt datasets.
//!
//! A patching experiment needs two batches of prompts with identical
//! shape: a clean batch where the model answers correctly and a
//! corrupted batch where the information needed to answer is destroyed.
//! [`PromptDataset`] is what the experiment reads from a batch;
//! [`DatasetGenerator`] is the seam for external template samplers.
//! [`PromptPairs`] is a ready-made in-memory dataset.

use std::collections::HashMap;

use candle_core::{Device, Tensor};

use crate::config::PatchingConfig;
use crate::error::{PatchError, Result};
use crate::metric::AnswerTokens;
use crate::tokenizer::TokenEncoder;

/// Word-position key holding each prompt's answer read-out position.
pub const END: &str = "end";

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A tokenized batch of prompts with answers.
pub trait PromptDataset {
    /// Token ids, `[batch, seq]`.
    fn tokens(&self) -> &Tensor;

    /// Per-prompt token position of a named word (e.g. `"IO"`, `"S2"`,
    /// [`END`]).
    fn word_positions(&self, word: &str) -> Option<&[usize]>;

    /// Correct answer token per prompt.
    fn correct_token_ids(&self) -> &[u32];

    /// Incorrect answer token per prompt.
    fn incorrect_token_ids(&self) -> &[u32];

    /// Number of prompts.
    fn len(&self) -> usize {
        self.correct_token_ids().len()
    }

    /// Whether the dataset has no prompts.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Answer read-out positions ([`END`]).
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Dataset`] if the dataset has no `"end"` positions.
    fn end_positions(&self) -> Result<&[usize]> {
        self.word_positions(END)
            .ok_or_else(|| PatchError::Dataset(format!("dataset has no '{END}' positions")))
    }

    /// Read-out positions and answer ids bundled for the metric.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Dataset`] if `"end"` positions are missing, or
    /// [`PatchError::Metric`] if the lists disagree in length.
    fn answers(&self) -> Result<AnswerTokens> {
        AnswerTokens::new(
            self.end_positions()?.to_vec(),
            self.correct_token_ids().to_vec(),
            self.incorrect_token_ids().to_vec(),
        )
    }
}

/// Produces clean datasets and their corrupted counterparts.
pub trait DatasetGenerator {
    /// Dataset type produced.
    type Dataset: PromptDataset;

    /// Sample a clean dataset of `config.n_prompts` prompts.
    ///
    /// # Errors
    ///
    /// Generator-specific.
    fn generate(&self, config: &PatchingConfig) -> Result<Self::Dataset>;

    /// Build the corrupted counterpart of `clean`, same shape, following
    /// the corruption spec `flip` (e.g. `"ABB->XYZ, BAB->XYZ"`).
    ///
    /// # Errors
    ///
    /// Generator-specific.
    fn corrupt(&self, clean: &Self::Dataset, flip: &str) -> Result<Self::Dataset>;
}

// ---------------------------------------------------------------------------
// PromptPairs
// ---------------------------------------------------------------------------

/// In-memory prompt dataset.
///
/// ```
/// use candle_core::{Device, Tensor};
/// use path_patching::{PromptDataset, PromptPairs};
///
/// let tokens = Tensor::new(&[[5u32, 6, 7], [5, 7, 6]], &Device::Cpu).unwrap();
/// let clean = PromptPairs::new(tokens, vec![2, 2], vec![7, 6], vec![6, 7]).unwrap();
/// let corrupted = clean.flip_adjacent().unwrap();
///
/// assert_eq!(corrupted.tokens().to_vec2::<u32>().unwrap(), vec![vec![5, 7, 6], vec![5, 6, 7]]);
/// // Answers stay with the original rows.
/// assert_eq!(corrupted.correct_token_ids(), &[7, 6]);
/// ```
#[derive(Debug, Clone)]
pub struct PromptPairs {
    /// Prompt strings, when built from text.
    prompts: Vec<String>,
    /// Token ids, `[batch, seq]`.
    tokens: Tensor,
    /// Named per-prompt token positions; always contains [`END`].
    word_idx: HashMap<String, Vec<usize>>,
    /// Correct answer ids.
    correct: Vec<u32>,
    /// Incorrect answer ids.
    incorrect: Vec<u32>,
}

impl PromptPairs {
    /// Build a dataset from a token batch and its answers.
    ///
    /// # Shapes
    /// - `tokens`: `[batch, seq]`
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Dataset`] if `tokens` is not 2D, the answer
    /// lists are not `batch` long, or an end position is `>= seq`.
    pub fn new(
        tokens: Tensor,
        end_positions: Vec<usize>,
        correct: Vec<u32>,
        incorrect: Vec<u32>,
    ) -> Result<Self> {
        let &[batch, _seq] = tokens.dims() else {
            return Err(PatchError::Dataset(format!(
                "expected [batch, seq] tokens, got shape {:?}",
                tokens.dims()
            )));
        };
        if correct.len() != batch || incorrect.len() != batch {
            return Err(PatchError::Dataset(format!(
                "{batch} prompts but {} correct and {} incorrect answers",
                correct.len(),
                incorrect.len()
            )));
        }
        let dataset = Self {
            prompts: Vec::new(),
            tokens,
            word_idx: HashMap::new(),
            correct,
            incorrect,
        };
        dataset.with_word_positions(END, end_positions)
    }

    /// Tokenize `prompts` and their `(correct, incorrect)` answers.
    ///
    /// Text is encoded without special tokens. With `prepend_bos` the
    /// encoder's [`bos_token_id`](TokenEncoder::bos_token_id) is inserted
    /// in front of every prompt. Prompts are right-padded with
    /// `pad_token_id` to a common length; each prompt's [`END`] position is
    /// its own last token. Answers must be a single token each.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Dataset`] if the lists differ in length, a
    /// prompt encodes to nothing, or an answer is not a single token;
    /// [`PatchError::Tokenizer`] if encoding fails or `prepend_bos` is set
    /// and the encoder has no BOS token.
    pub fn from_prompts<E, P, A>(
        encoder: &E,
        prompts: &[P],
        answers: &[(A, A)],
        prepend_bos: bool,
        pad_token_id: u32,
        device: &Device,
    ) -> Result<Self>
    where
        E: TokenEncoder,
        P: AsRef<str>,
        A: AsRef<str>,
    {
        if prompts.len() != answers.len() {
            return Err(PatchError::Dataset(format!(
                "{} prompts but {} answer pairs",
                prompts.len(),
                answers.len()
            )));
        }
        if prompts.is_empty() {
            return Err(PatchError::Dataset("no prompts".into()));
        }

        let bos = if prepend_bos {
            let id = encoder.bos_token_id().ok_or_else(|| {
                PatchError::Tokenizer("prepend_bos is set but the tokenizer has no BOS token".into())
            })?;
            Some(id)
        } else {
            None
        };

        let encoded = prompts
            .iter()
            .map(|p| {
                let ids: Vec<u32> = bos
                    .into_iter()
                    .chain(encoder.encode(p.as_ref(), false)?)
                    .collect();
                if ids.is_empty() {
                    return Err(PatchError::Dataset(format!(
                        "prompt {:?} encodes to no tokens",
                        p.as_ref()
                    )));
                }
                Ok(ids)
            })
            .collect::<Result<Vec<_>>>()?;

        let seq_len = encoded.iter().map(Vec::len).max().unwrap_or(0);
        let end_positions: Vec<usize> = encoded.iter().map(|ids| ids.len() - 1).collect();
        let flat: Vec<u32> = encoded
            .iter()
            .flat_map(|ids| {
                ids.iter()
                    .copied()
                    .chain(std::iter::repeat_n(pad_token_id, seq_len - ids.len()))
            })
            .collect();
        let tokens = Tensor::from_vec(flat, (encoded.len(), seq_len), device)?;

        let mut correct = Vec::with_capacity(answers.len());
        let mut incorrect = Vec::with_capacity(answers.len());
        for (good, bad) in answers {
            correct.push(single_token(encoder, good.as_ref())?);
            incorrect.push(single_token(encoder, bad.as_ref())?);
        }

        let mut dataset = Self::new(tokens, end_positions, correct, incorrect)?;
        dataset.prompts = prompts.iter().map(|p| p.as_ref().to_string()).collect();
        Ok(dataset)
    }

    /// Record the per-prompt position of a named word.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Dataset`] if `positions` is not one per prompt
    /// or a position is `>= seq`.
    pub fn with_word_positions(
        mut self,
        word: impl Into<String>,
        positions: Vec<usize>,
    ) -> Result<Self> {
        let word = word.into();
        let seq_len = self.seq_len();
        if positions.len() != self.correct.len() {
            return Err(PatchError::Dataset(format!(
                "'{word}' has {} positions for {} prompts",
                positions.len(),
                self.correct.len()
            )));
        }
        if let Some(&pos) = positions.iter().find(|&&p| p >= seq_len) {
            return Err(PatchError::Dataset(format!(
                "'{word}' position {pos} out of range (seq_len is {seq_len})"
            )));
        }
        self.word_idx.insert(word, positions);
        Ok(self)
    }

    /// Prompt strings (empty unless built with [`from_prompts`](Self::from_prompts)).
    #[must_use]
    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }

    /// Padded sequence length.
    #[must_use]
    pub fn seq_len(&self) -> usize {
        self.tokens.dims().get(1).copied().unwrap_or(0)
    }

    /// Reorder the prompts by `order`, keeping answers on their original
    /// rows.
    ///
    /// Row `i` of the result holds prompt `order[i]` (tokens, text and word
    /// positions) but is still scored against answer `i`.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Dataset`] if `order` is not a permutation of
    /// the batch.
    pub fn permuted(&self, order: &[usize]) -> Result<Self> {
        let n = self.len();
        let mut seen = vec![false; n];
        for &i in order {
            match seen.get_mut(i) {
                Some(slot) if !*slot => *slot = true,
                _ => {
                    return Err(PatchError::Dataset(format!(
                        "order {order:?} is not a permutation of 0..{n}"
                    )));
                }
            }
        }
        if order.len() != n {
            return Err(PatchError::Dataset(format!(
                "order has {} entries for {n} prompts",
                order.len()
            )));
        }

        let ids = order
            .iter()
            .map(|&i| {
                u32::try_from(i)
                    .map_err(|_| PatchError::Dataset(format!("row {i} does not fit in u32")))
            })
            .collect::<Result<Vec<u32>>>()?;
        let tokens = self
            .tokens
            .index_select(&Tensor::from_vec(ids, n, self.tokens.device())?, 0)?;

        let reorder = |values: &[usize]| -> Vec<usize> {
            order.iter().filter_map(|&i| values.get(i).copied()).collect()
        };
        let word_idx = self
            .word_idx
            .iter()
            .map(|(word, positions)| (word.clone(), reorder(positions)))
            .collect();
        let prompts = order
            .iter()
            .filter_map(|&i| self.prompts.get(i).cloned())
            .collect();

        Ok(Self {
            prompts,
            tokens,
            word_idx,
            correct: self.correct.clone(),
            incorrect: self.incorrect.clone(),
        })
    }

    /// Swap each even-indexed prompt with its successor (`[1, 0, 3, 2, ...]`).
    ///
    /// With prompts laid out in pairs that differ only in which answer is
    /// correct, this yields the corrupted batch.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Dataset`] if the batch size is odd.
    pub fn flip_adjacent(&self) -> Result<Self> {
        let n = self.len();
        if n % 2 != 0 {
            return Err(PatchError::Dataset(format!(
                "cannot flip adjacent pairs of an odd batch ({n} prompts)"
            )));
        }
        let order: Vec<usize> = (0..n).map(|i| i ^ 1).collect();
        self.permuted(&order)
    }
}

impl PromptDataset for PromptPairs {
    fn tokens(&self) -> &Tensor {
        &self.tokens
    }

    fn word_positions(&self, word: &str) -> Option<&[usize]> {
        self.word_idx.get(word).map(Vec::as_slice)
    }

    fn correct_token_ids(&self) -> &[u32] {
        &self.correct
    }

    fn incorrect_token_ids(&self) -> &[u32] {
        &self.incorrect
    }
}

/// Encode `text` and require exactly one token.
fn single_token<E: TokenEncoder>(encoder: &E, text: &str) -> Result<u32> {
    match encoder.encode(text, false)?.as_slice() {
        &[id] => Ok(id),
        ids => Err(PatchError::Dataset(format!(
            "answer {text:?} encodes to {} tokens, expected 1",
            ids.len()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
