// SPDX-License-Identifier: MIT OR Apache-2.0

//! Clean/corrupted patching experiments.
//!
//! [`generate_data_and_caches`] builds both datasets, caches their
//! activations and calibrates the metric. [`patch_and_score`] patches one
//! hook point at a set of positions and scores the result;
//! [`patch_sweep`] does that for every hook × position combination.
//!
//! Direction decides which run is patched: with
//! [`MetricDirection::Noising`] corrupted activations are written into the
//! clean run, with [`MetricDirection::Denoising`] clean activations are
//! written into the corrupted run.

use candle_core::Tensor;
use tracing::{debug, info};

use crate::backend::PatchingBackend;
use crate::config::PatchingConfig;
use crate::dataset::{DatasetGenerator, PromptDataset};
use crate::error::{PatchError, Result};
use crate::hooks::{HookCache, HookPoint, HookSpec, Intervention};
use crate::metric::{LogitDiffMetric, MetricDirection, logits_to_ave_logit_diff};
use crate::positions::{SeqPos, batch_and_seq_pos_indices};
use crate::sweep::SweepAxes;

// ---------------------------------------------------------------------------
// PatchingSetup
// ---------------------------------------------------------------------------

/// Datasets, activation caches and calibrated metric of an experiment.
#[derive(Debug)]
pub struct PatchingSetup<D> {
    /// Clean prompts.
    pub clean: D,
    /// Corrupted prompts, same shape as `clean`.
    pub corrupted: D,
    /// Activations of the clean run.
    pub clean_cache: HookCache,
    /// Activations of the corrupted run.
    pub corrupted_cache: HookCache,
    /// Metric calibrated on the two runs.
    pub metric: LogitDiffMetric,
}

impl<D: PromptDataset> PatchingSetup<D> {
    /// Run both datasets through `backend`, capturing `hooks`, and
    /// calibrate the metric.
    ///
    /// Both runs are read out against the clean dataset's answers.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Dataset`] if the token batches differ in
    /// shape or the clean dataset has no answers, [`PatchError::Metric`] if
    /// the two runs give the same logit difference, and propagates backend
    /// errors.
    pub fn from_datasets<B: PatchingBackend + ?Sized>(
        backend: &B,
        clean: D,
        corrupted: D,
        hooks: &HookSpec,
        direction: MetricDirection,
        verbose: bool,
    ) -> Result<Self> {
        if clean.tokens().dims() != corrupted.tokens().dims() {
            return Err(PatchError::Dataset(format!(
                "clean tokens {:?} and corrupted tokens {:?} differ in shape",
                clean.tokens().dims(),
                corrupted.tokens().dims()
            )));
        }
        let answers = clean.answers()?;

        let clean_cache = backend.run_with_cache(clean.tokens(), hooks)?;
        let corrupted_cache = backend.run_with_cache(corrupted.tokens(), hooks)?;

        let clean_logit_diff = logits_to_ave_logit_diff(clean_cache.output(), &answers)?;
        let corrupted_logit_diff = logits_to_ave_logit_diff(corrupted_cache.output(), &answers)?;
        if verbose {
            info!("Clean logit diff: {clean_logit_diff:.4}");
            info!("Corrupted logit diff: {corrupted_logit_diff:.4}");
        } else {
            debug!(clean_logit_diff, corrupted_logit_diff, "baseline logit diffs");
        }

        let metric = LogitDiffMetric::new(clean_logit_diff, corrupted_logit_diff, answers, direction)?;
        Ok(Self {
            clean,
            corrupted,
            clean_cache,
            corrupted_cache,
            metric,
        })
    }

    /// Tokens of the run that gets patched.
    fn target_tokens(&self) -> &Tensor {
        match self.metric.direction() {
            MetricDirection::Noising => self.clean.tokens(),
            MetricDirection::Denoising => self.corrupted.tokens(),
        }
    }

    /// Cache the patched activations come from.
    fn source_cache(&self) -> &HookCache {
        match self.metric.direction() {
            MetricDirection::Noising => &self.corrupted_cache,
            MetricDirection::Denoising => &self.clean_cache,
        }
    }
}

/// Generate clean and corrupted datasets, cache their activations and
/// calibrate the metric.
///
/// `hooks` must capture every hook point later passed to
/// [`patch_and_score`].
///
/// # Errors
///
/// Propagates generator, backend and metric errors; see
/// [`PatchingSetup::from_datasets`].
pub fn generate_data_and_caches<B, G>(
    backend: &B,
    generator: &G,
    config: &PatchingConfig,
    hooks: &HookSpec,
) -> Result<PatchingSetup<G::Dataset>>
where
    B: PatchingBackend + ?Sized,
    G: DatasetGenerator,
{
    config.validate()?;
    let clean = generator.generate(config)?;
    let corrupted = generator.corrupt(&clean, &config.flip)?;
    debug!(
        n_prompts = clean.len(),
        prompt_type = %config.prompt_type,
        flip = %config.flip,
        "generated datasets"
    );
    PatchingSetup::from_datasets(
        backend,
        clean,
        corrupted,
        hooks,
        config.direction,
        config.verbose,
    )
}

// ---------------------------------------------------------------------------
// Patching
// ---------------------------------------------------------------------------

/// Patch the cached activation at `hook` into the target run at
/// `seq_pos` and return the calibrated score.
///
/// # Errors
///
/// Returns [`PatchError::Position`] if `seq_pos` does not fit the token
/// batch, [`PatchError::Hook`] if `hook` was not captured, and propagates
/// backend and metric errors.
pub fn patch_and_score<B, D>(
    backend: &B,
    setup: &PatchingSetup<D>,
    hook: &HookPoint,
    seq_pos: &SeqPos,
) -> Result<f32>
where
    B: PatchingBackend + ?Sized,
    D: PromptDataset,
{
    let target = setup.target_tokens();
    let (batch, seq_len) = target.dims2()?;
    let indices = batch_and_seq_pos_indices(seq_pos, batch, seq_len)?;
    let source = setup.source_cache().require(hook)?.clone();

    let mut hooks = HookSpec::new();
    hooks.intervene(
        hook.clone(),
        Intervention::Patch {
            indices,
            source,
            seq_axis: hook.seq_axis(),
        },
    );
    let patched = backend.run_with_cache(target, &hooks)?;
    setup.metric.score(patched.output())
}

/// Score of one patched run.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchScore {
    /// Patched hook point.
    pub hook: HookPoint,
    /// Patched positions.
    pub seq_pos: SeqPos,
    /// Calibrated metric.
    pub score: f32,
}

/// Score every combination of `hooks` × `positions`.
///
/// Results come hook-major: all positions of `hooks[0]`, then all of
/// `hooks[1]`, and so on. Either list being empty yields no scores.
///
/// # Errors
///
/// Stops at the first failing run; see [`patch_and_score`].
pub fn patch_sweep<B, D>(
    backend: &B,
    setup: &PatchingSetup<D>,
    hooks: &[HookPoint],
    positions: &[SeqPos],
) -> Result<Vec<PatchScore>>
where
    B: PatchingBackend + ?Sized,
    D: PromptDataset,
{
    let axes = SweepAxes::new()
        .kwarg("hook", 0..hooks.len())
        .kwarg("seq_pos", 0..positions.len());

    let mut scores = Vec::with_capacity(axes.len());
    for combination in &axes {
        let hook = combination.get("hook").and_then(|&i| hooks.get(i));
        let seq_pos = combination.get("seq_pos").and_then(|&i| positions.get(i));
        let (Some(hook), Some(seq_pos)) = (hook, seq_pos) else {
            continue;
        };
        let score = patch_and_score(backend, setup, hook, seq_pos)?;
        debug!(%hook, ?seq_pos, score, "patched");
        scores.push(PatchScore {
            hook: hook.clone(),
            seq_pos: seq_pos.clone(),
            score,
        });
    }
    Ok(scores)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::dataset::PromptPairs;
    use candle_core::{DType, Device};

    const VOCAB: usize = 4;

    /// Residual stream is the one-hot token; logits are the residual.
    struct OneHot;

    impl PatchingBackend for OneHot {
        fn num_layers(&self) -> usize {
            1
        }

        fn vocab_size(&self) -> usize {
            VOCAB
        }

        fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
            let (batch, seq) = input_ids.dims2()?;
            let eye: Vec<f32> = (0..VOCAB * VOCAB)
                .map(|i| if i / VOCAB == i % VOCAB { 1.0 } else { 0.0 })
                .collect();
            let eye = Tensor::from_vec(eye, (VOCAB, VOCAB), input_ids.device())?;
            let resid = eye
                .index_select(&input_ids.flatten_all()?, 0)?
                .reshape((batch, seq, VOCAB))?;

            let mut cache = HookCache::new(Tensor::zeros(1, DType::F32, input_ids.device())?);
            let resid = hooks.process(&HookPoint::ResidPre(0), resid, &mut cache)?;
            cache.set_output(resid);
            Ok(cache)
        }
    }

    fn pairs(rows: &[[u32; 2]; 2]) -> PromptPairs {
        let tokens = Tensor::new(rows, &Device::Cpu).unwrap();
        PromptPairs::new(tokens, vec![1, 1], vec![1, 2], vec![2, 1]).unwrap()
    }

    fn capture_resid() -> HookSpec {
        let mut hooks = HookSpec::new();
        hooks.capture(HookPoint::ResidPre(0));
        hooks
    }

    #[test]
    fn setup_calibrates_on_both_runs() {
        let setup = PatchingSetup::from_datasets(
            &OneHot,
            pairs(&[[0, 1], [0, 2]]),
            pairs(&[[0, 2], [0, 1]]),
            &capture_resid(),
            MetricDirection::Noising,
            false,
        )
        .unwrap();
        assert_eq!(setup.metric.clean_logit_diff(), 1.0);
        assert_eq!(setup.metric.corrupted_logit_diff(), -1.0);
        assert!(setup.clean_cache.get(&HookPoint::ResidPre(0)).is_some());

        let score = patch_and_score(&OneHot, &setup, &HookPoint::ResidPre(0), &SeqPos::Single(1)).unwrap();
        assert!((score + 1.0).abs() < 1e-6);
    }

    #[test]
    fn uncaptured_hook_is_an_error() {
        let setup = PatchingSetup::from_datasets(
            &OneHot,
            pairs(&[[0, 1], [0, 2]]),
            pairs(&[[0, 2], [0, 1]]),
            &HookSpec::new(),
            MetricDirection::Noising,
            true,
        )
        .unwrap();
        let err = patch_and_score(&OneHot, &setup, &HookPoint::ResidPre(0), &SeqPos::All).unwrap_err();
        assert!(matches!(err, PatchError::Hook(_)));

        let err = patch_and_score(&OneHot, &setup, &HookPoint::ResidPre(0), &SeqPos::Single(2)).unwrap_err();
        assert!(matches!(err, PatchError::Position(_)));
    }

    #[test]
    fn mismatched_or_uninformative_datasets_are_rejected() {
        let short = PromptPairs::new(
            Tensor::new(&[[1u32], [2]], &Device::Cpu).unwrap(),
            vec![0, 0],
            vec![1, 2],
            vec![2, 1],
        )
        .unwrap();
        let err = PatchingSetup::from_datasets(
            &OneHot,
            pairs(&[[0, 1], [0, 2]]),
            short,
            &HookSpec::new(),
            MetricDirection::Noising,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, PatchError::Dataset(_)));

        // Identical runs leave nothing to calibrate against.
        let err = PatchingSetup::from_datasets(
            &OneHot,
            pairs(&[[0, 1], [0, 2]]),
            pairs(&[[0, 1], [0, 2]]),
            &HookSpec::new(),
            MetricDirection::Noising,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, PatchError::Metric(_)));
    }

    #[test]
    fn sweep_with_no_positions_is_empty() {
        let setup = PatchingSetup::from_datasets(
            &OneHot,
            pairs(&[[0, 1], [0, 2]]),
            pairs(&[[0, 2], [0, 1]]),
            &capture_resid(),
            MetricDirection::Noising,
            false,
        )
        .unwrap();
        let scores = patch_sweep(&OneHot, &setup, &[HookPoint::ResidPre(0)], &[]).unwrap();
        assert!(scores.is_empty());
    }
}
