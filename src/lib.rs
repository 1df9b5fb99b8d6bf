// SPDX-License-Identifier: MIT OR Apache-2.0

//! # path-patching
//!
//! Activation patching helpers for language models in Rust, built on
//! [candle](https://github.com/huggingface/candle).
//!
//! A path-patching experiment runs a model on clean prompts and on
//! corrupted prompts, then re-runs one of them with some activations
//! copied over from the other and measures how much of the behaviour
//! moves. This crate provides the pieces around the model:
//!
//! - **Sweeps**: [`SweepAxes`] and [`product_with_args_kwargs`] expand
//!   per-parameter value lists into every combination.
//! - **Positions**: [`batch_and_seq_pos_indices`] turns a [`SeqPos`] into
//!   validated batch/position index grids ([`PatchIndices`]).
//! - **Hooks**: [`HookPoint`], [`HookSpec`], [`HookCache`] and
//!   [`Intervention::Patch`] describe what a [`PatchingBackend`] captures
//!   and rewrites.
//! - **Metric**: [`LogitDiffMetric`] calibrates logit differences against
//!   the clean and corrupted baselines.
//! - **Experiments**: [`generate_data_and_caches`], [`patch_and_score`]
//!   and [`patch_sweep`] tie datasets, backend and metric together.
//!
//! ```
//! use path_patching::{batch_and_seq_pos_indices, SeqPos};
//!
//! let indices = batch_and_seq_pos_indices(&SeqPos::PerBatch(vec![3, 1]), 2, 5).unwrap();
//! assert_eq!(indices.batch_indices(), Some(&[vec![0], vec![1]][..]));
//! assert_eq!(indices.seq_pos_indices(), Some(&[vec![3], vec![1]][..]));
//! ```

#![deny(warnings)]
#![warn(missing_docs)]

pub mod backend;
pub mod config;
pub mod dataset;
pub mod error;
pub mod experiment;
pub mod hooks;
pub mod metric;
pub mod positions;
pub mod sweep;
pub mod tokenizer;

pub use backend::PatchingBackend;
pub use config::PatchingConfig;
pub use dataset::{DatasetGenerator, END, PromptDataset, PromptPairs};
pub use error::{PatchError, Result};
pub use experiment::{
    PatchScore, PatchingSetup, generate_data_and_caches, patch_and_score, patch_sweep,
};
pub use hooks::{HookCache, HookPoint, HookSpec, Intervention, apply_intervention};
pub use metric::{
    AnswerTokens, LogitDiffMetric, MetricDirection, logits_to_ave_logit_diff,
    per_prompt_logit_diff,
};
pub use positions::{PatchIndices, SeqPos, batch_and_seq_pos_indices};
pub use sweep::{Combination, Combinations, SweepAxes, product_with_args_kwargs};
pub use tokenizer::{PatchTokenizer, TokenEncoder};
