// SPDX-License-Identifier: MIT OR Apache-2.0

//! Logit-difference metric for scoring interventions.
//!
//! The logit difference of a prompt is the logit of its correct answer
//! minus the logit of its incorrect answer, read at the prompt's answer
//! position. [`LogitDiffMetric`] rescales the batch-mean logit difference
//! of a patched run against the clean and corrupted baselines:
//!
//! | direction | clean run | corrupted run |
//! |-----------|-----------|---------------|
//! | [`Noising`](MetricDirection::Noising) | `0.0` | `-1.0` |
//! | [`Denoising`](MetricDirection::Denoising) | `1.0` | `0.0` |

use candle_core::{DType, Tensor};
use serde::Deserialize;

use crate::error::{PatchError, Result};

// ---------------------------------------------------------------------------
// AnswerTokens
// ---------------------------------------------------------------------------

/// Per-prompt read-out position and answer token pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerTokens {
    /// Sequence position whose logits are read, one per prompt.
    positions: Vec<usize>,
    /// Correct answer token ids.
    correct: Vec<u32>,
    /// Incorrect answer token ids.
    incorrect: Vec<u32>,
}

impl AnswerTokens {
    /// Bundle read-out positions with correct and incorrect answer ids.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Metric`] if the three lists differ in length
    /// or are empty.
    pub fn new(positions: Vec<usize>, correct: Vec<u32>, incorrect: Vec<u32>) -> Result<Self> {
        if positions.len() != correct.len() || positions.len() != incorrect.len() {
            return Err(PatchError::Metric(format!(
                "answer lists differ in length: {} positions, {} correct, {} incorrect",
                positions.len(),
                correct.len(),
                incorrect.len()
            )));
        }
        if positions.is_empty() {
            return Err(PatchError::Metric("no prompts to score".into()));
        }
        Ok(Self {
            positions,
            correct,
            incorrect,
        })
    }

    /// Number of prompts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Always `false`; construction rejects empty answer sets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Read-out positions.
    #[must_use]
    pub fn positions(&self) -> &[usize] {
        &self.positions
    }

    /// Correct answer ids.
    #[must_use]
    pub fn correct(&self) -> &[u32] {
        &self.correct
    }

    /// Incorrect answer ids.
    #[must_use]
    pub fn incorrect(&self) -> &[u32] {
        &self.incorrect
    }
}

// ---------------------------------------------------------------------------
// Logit difference
// ---------------------------------------------------------------------------

/// Logit difference of every prompt.
///
/// # Shapes
/// - `logits`: `[batch, seq, vocab]`
/// - returns: `batch` values
///
/// # Errors
///
/// Returns [`PatchError::Metric`] if `logits` is not 3D, its batch size
/// differs from `answers`, or a position or token id is out of range.
pub fn per_prompt_logit_diff(logits: &Tensor, answers: &AnswerTokens) -> Result<Vec<f32>> {
    let &[batch, seq, vocab] = logits.dims() else {
        return Err(PatchError::Metric(format!(
            "expected [batch, seq, vocab] logits, got shape {:?}",
            logits.dims()
        )));
    };
    if batch != answers.len() {
        return Err(PatchError::Metric(format!(
            "logits batch size {batch} does not match {} answers",
            answers.len()
        )));
    }
    if let Some(&pos) = answers.positions.iter().find(|&&p| p >= seq) {
        return Err(PatchError::Metric(format!(
            "answer position {pos} out of range (seq_len is {seq})"
        )));
    }
    if let Some(&id) = answers
        .correct
        .iter()
        .chain(&answers.incorrect)
        .find(|&&id| usize::try_from(id).map_or(true, |id| id >= vocab))
    {
        return Err(PatchError::Metric(format!(
            "answer token {id} out of range (vocab size is {vocab})"
        )));
    }

    let device = logits.device();
    let rows = answers
        .positions
        .iter()
        .enumerate()
        .map(|(i, &p)| {
            u32::try_from(i * seq + p)
                .map_err(|_| PatchError::Metric(format!("row {i} offset does not fit in u32")))
        })
        .collect::<Result<Vec<u32>>>()?;

    // PROMOTE: read-out in f32 regardless of model dtype
    let flat = logits.to_dtype(DType::F32)?.reshape((batch * seq, vocab))?;
    let final_logits = flat.index_select(&Tensor::from_vec(rows, batch, device)?, 0)?;

    let correct = Tensor::from_vec(answers.correct.clone(), (batch, 1), device)?;
    let incorrect = Tensor::from_vec(answers.incorrect.clone(), (batch, 1), device)?;
    let correct_logits = final_logits.gather(&correct, 1)?.squeeze(1)?;
    let incorrect_logits = final_logits.gather(&incorrect, 1)?.squeeze(1)?;

    Ok((correct_logits - incorrect_logits)?.to_vec1()?)
}

/// Mean logit difference over the batch.
///
/// # Errors
///
/// Same as [`per_prompt_logit_diff`].
#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
pub fn logits_to_ave_logit_diff(logits: &Tensor, answers: &AnswerTokens) -> Result<f32> {
    let diffs = per_prompt_logit_diff(logits, answers)?;
    Ok(diffs.iter().sum::<f32>() / diffs.len() as f32)
}

// ---------------------------------------------------------------------------
// LogitDiffMetric
// ---------------------------------------------------------------------------

/// Which baseline a patched run is compared against.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricDirection {
    /// Corrupted activations patched into a clean run:
    /// `(patched - clean) / (clean - corrupted)`.
    #[default]
    Noising,
    /// Clean activations patched into a corrupted run:
    /// `(patched - corrupted) / (clean - corrupted)`.
    Denoising,
}

/// Logit difference calibrated against clean and corrupted baselines.
///
/// ```
/// use path_patching::{AnswerTokens, LogitDiffMetric, MetricDirection};
///
/// let answers = AnswerTokens::new(vec![4], vec![1], vec![2]).unwrap();
/// let metric = LogitDiffMetric::new(3.0, -1.0, answers, MetricDirection::Noising).unwrap();
/// assert_eq!(metric.calibrate(3.0), 0.0);
/// assert_eq!(metric.calibrate(-1.0), -1.0);
/// ```
#[derive(Debug, Clone)]
pub struct LogitDiffMetric {
    /// Mean logit difference of the clean run.
    clean_logit_diff: f32,
    /// Mean logit difference of the corrupted run.
    corrupted_logit_diff: f32,
    /// Answers every run is read out against.
    answers: AnswerTokens,
    /// Calibration direction.
    direction: MetricDirection,
}

impl LogitDiffMetric {
    /// Build a metric from the two baseline logit differences.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Metric`] if either baseline is not finite or
    /// the two are equal (the calibration would divide by zero).
    pub fn new(
        clean_logit_diff: f32,
        corrupted_logit_diff: f32,
        answers: AnswerTokens,
        direction: MetricDirection,
    ) -> Result<Self> {
        if !clean_logit_diff.is_finite() || !corrupted_logit_diff.is_finite() {
            return Err(PatchError::Metric(format!(
                "baseline logit diffs must be finite (clean {clean_logit_diff}, corrupted {corrupted_logit_diff})"
            )));
        }
        if (clean_logit_diff - corrupted_logit_diff).abs() <= f32::EPSILON {
            return Err(PatchError::Metric(format!(
                "clean and corrupted logit diffs are equal ({clean_logit_diff}); \
                 the corruption does not change the answer"
            )));
        }
        Ok(Self {
            clean_logit_diff,
            corrupted_logit_diff,
            answers,
            direction,
        })
    }

    /// Rescale a patched mean logit difference.
    #[must_use]
    pub fn calibrate(&self, patched_logit_diff: f32) -> f32 {
        let span = self.clean_logit_diff - self.corrupted_logit_diff;
        match self.direction {
            MetricDirection::Noising => (patched_logit_diff - self.clean_logit_diff) / span,
            MetricDirection::Denoising => (patched_logit_diff - self.corrupted_logit_diff) / span,
        }
    }

    /// Score the logits of a patched run.
    ///
    /// # Shapes
    /// - `logits`: `[batch, seq, vocab]`
    ///
    /// # Errors
    ///
    /// Same as [`logits_to_ave_logit_diff`].
    pub fn score(&self, logits: &Tensor) -> Result<f32> {
        Ok(self.calibrate(logits_to_ave_logit_diff(logits, &self.answers)?))
    }

    /// Mean logit difference of the clean run.
    #[must_use]
    pub const fn clean_logit_diff(&self) -> f32 {
        self.clean_logit_diff
    }

    /// Mean logit difference of the corrupted run.
    #[must_use]
    pub const fn corrupted_logit_diff(&self) -> f32 {
        self.corrupted_logit_diff
    }

    /// Calibration direction.
    #[must_use]
    pub const fn direction(&self) -> MetricDirection {
        self.direction
    }

    /// Answers the metric reads out.
    #[must_use]
    pub const fn answers(&self) -> &AnswerTokens {
        &self.answers
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
