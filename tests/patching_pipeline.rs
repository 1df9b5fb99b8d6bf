// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end patching on a one-hot toy model.
//!
//! The toy model's residual stream is the one-hot encoding of each token
//! and its logits are the residual stream, so every patched score can be
//! worked out by hand.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use candle_core::{DType, Device, Tensor};
use path_patching::{
    DatasetGenerator, HookCache, HookPoint, HookSpec, MetricDirection, PatchError,
    PatchingBackend, PatchingConfig, PatchingSetup, PromptDataset, PromptPairs, Result, SeqPos,
    generate_data_and_caches, patch_and_score, patch_sweep,
};

const VOCAB: usize = 8;

// ---------------------------------------------------------------------------
// Toy backend and generator
// ---------------------------------------------------------------------------

struct OneHotModel;

impl PatchingBackend for OneHotModel {
    fn num_layers(&self) -> usize {
        1
    }

    fn vocab_size(&self) -> usize {
        VOCAB
    }

    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        let device = input_ids.device();
        let (batch, seq) = input_ids.dims2()?;
        let eye: Vec<f32> = (0..VOCAB * VOCAB)
            .map(|i| if i / VOCAB == i % VOCAB { 1.0 } else { 0.0 })
            .collect();
        let embed = Tensor::from_vec(eye, (VOCAB, VOCAB), device)?;

        let mut cache = HookCache::new(Tensor::zeros(1, DType::F32, device)?);
        let hidden = embed
            .index_select(&input_ids.flatten_all()?, 0)?
            .reshape((batch, seq, VOCAB))?;
        let hidden = hooks.process(&HookPoint::ResidPre(0), hidden, &mut cache)?;
        let hidden = hooks.process(&HookPoint::ResidPost(0), hidden, &mut cache)?;
        cache.set_output(hidden);
        Ok(cache)
    }
}

/// Two prompts ending in their correct answer token; corruption swaps them.
struct FixedPairs;

impl DatasetGenerator for FixedPairs {
    type Dataset = PromptPairs;

    fn generate(&self, config: &PatchingConfig) -> Result<PromptPairs> {
        if config.n_prompts != 2 {
            return Err(PatchError::Dataset("FixedPairs only has 2 prompts".into()));
        }
        let tokens = Tensor::new(&[[6u32, 2, 3], [6, 4, 5]], &Device::Cpu)?;
        PromptPairs::new(tokens, vec![2, 2], vec![3, 5], vec![5, 3])?
            .with_word_positions("IO", vec![2, 2])
    }

    fn corrupt(&self, clean: &PromptPairs, flip: &str) -> Result<PromptPairs> {
        if flip != "IO<->S" {
            return Err(PatchError::Dataset(format!("unsupported flip {flip}")));
        }
        let tokens = Tensor::new(&[[6u32, 2, 5], [6, 4, 3]], &Device::Cpu)?;
        PromptPairs::new(
            tokens,
            clean.end_positions()?.to_vec(),
            clean.correct_token_ids().to_vec(),
            clean.incorrect_token_ids().to_vec(),
        )
    }
}

fn config(direction: MetricDirection) -> PatchingConfig {
    PatchingConfig {
        n_prompts: 2,
        flip: "IO<->S".to_string(),
        direction,
        ..PatchingConfig::default()
    }
}

fn setup(direction: MetricDirection) -> PatchingSetup<PromptPairs> {
    let mut hooks = HookSpec::new();
    hooks.capture(HookPoint::ResidPre(0)).capture("blocks.0.hook_resid_post");
    generate_data_and_caches(&OneHotModel, &FixedPairs, &config(direction), &hooks).unwrap()
}

fn assert_close(actual: f32, expected: f32) {
    assert!(
        (actual - expected).abs() < 1e-6,
        "expected {expected}, got {actual}"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn baselines_are_cached_and_calibrated() {
    let setup = setup(MetricDirection::Noising);
    assert_close(setup.metric.clean_logit_diff(), 1.0);
    assert_close(setup.metric.corrupted_logit_diff(), -1.0);
    assert_eq!(setup.clean_cache.num_captures(), 2);
    assert_eq!(setup.corrupted_cache.output().dims(), &[2, 3, VOCAB]);
    assert_close(setup.metric.score(setup.clean_cache.output()).unwrap(), 0.0);
    assert_close(setup.metric.score(setup.corrupted_cache.output()).unwrap(), -1.0);
}

#[test]
fn noising_scores_follow_the_patched_positions() {
    let setup = setup(MetricDirection::Noising);
    let hook = HookPoint::ResidPre(0);
    let score = |seq_pos: SeqPos| patch_and_score(&OneHotModel, &setup, &hook, &seq_pos).unwrap();

    // Answer position carries the whole effect.
    assert_close(score(SeqPos::Single(2)), -1.0);
    // Shared prefix token: nothing changes.
    assert_close(score(SeqPos::Single(0)), 0.0);
    assert_close(score(SeqPos::All), -1.0);
    // Only the first prompt is corrupted.
    assert_close(score(SeqPos::PerBatch(vec![2, 0])), -0.5);
    assert_close(score(SeqPos::PerBatchMulti(vec![vec![0, 2], vec![1, 2]])), -1.0);
}

#[test]
fn denoising_restores_the_clean_answer() {
    let setup = setup(MetricDirection::Denoising);
    let hook = HookPoint::ResidPost(0);
    let score = |seq_pos: SeqPos| patch_and_score(&OneHotModel, &setup, &hook, &seq_pos).unwrap();

    assert_close(score(SeqPos::Single(2)), 1.0);
    assert_close(score(SeqPos::Single(1)), 0.0);
    assert_close(score(SeqPos::PerBatch(vec![0, 2])), 0.5);
}

#[test]
fn sweep_covers_every_hook_and_position() {
    let setup = setup(MetricDirection::Noising);
    let hooks = [HookPoint::ResidPre(0), HookPoint::ResidPost(0)];
    let positions = [SeqPos::Single(0), SeqPos::Single(1), SeqPos::Single(2)];

    let scores = patch_sweep(&OneHotModel, &setup, &hooks, &positions).unwrap();
    assert_eq!(scores.len(), 6);

    let order: Vec<(HookPoint, SeqPos)> = scores
        .iter()
        .map(|s| (s.hook.clone(), s.seq_pos.clone()))
        .collect();
    assert_eq!(order[0], (HookPoint::ResidPre(0), SeqPos::Single(0)));
    assert_eq!(order[2], (HookPoint::ResidPre(0), SeqPos::Single(2)));
    assert_eq!(order[3], (HookPoint::ResidPost(0), SeqPos::Single(0)));

    let values: Vec<f32> = scores.iter().map(|s| s.score).collect();
    for (actual, expected) in values.iter().zip([0.0, 0.0, -1.0, 0.0, 0.0, -1.0]) {
        assert_close(*actual, expected);
    }
}

#[test]
fn invalid_requests_surface_typed_errors() {
    let setup = setup(MetricDirection::Noising);

    let err = patch_and_score(&OneHotModel, &setup, &HookPoint::AttnOut(0), &SeqPos::All)
        .unwrap_err();
    assert!(matches!(err, PatchError::Hook(_)));

    let err = patch_and_score(
        &OneHotModel,
        &setup,
        &HookPoint::ResidPre(0),
        &SeqPos::PerBatch(vec![0, 1, 2]),
    )
    .unwrap_err();
    assert!(matches!(err, PatchError::Position(_)));

    let bad_flip = PatchingConfig {
        flip: "ABB->XYZ".to_string(),
        ..config(MetricDirection::Noising)
    };
    let err =
        generate_data_and_caches(&OneHotModel, &FixedPairs, &bad_flip, &HookSpec::new()).unwrap_err();
    assert!(matches!(err, PatchError::Dataset(_)));
}
