// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook vocabulary shared between experiments and model backends.
//!
//! Provides [`HookPoint`] (named activation sites, `TransformerLens`
//! naming), [`Intervention`] (how to rewrite an activation, including
//! position-indexed patching), [`HookSpec`] (what a forward pass should
//! capture and rewrite), and [`HookCache`] (what it captured).

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;

use crate::error::{PatchError, Result};
use crate::positions::PatchIndices;

// ---------------------------------------------------------------------------
// HookPoint
// ---------------------------------------------------------------------------

/// Named activation site in a forward pass.
///
/// Converts to and from `TransformerLens` hook names:
///
/// ```
/// use path_patching::HookPoint;
///
/// let hook = HookPoint::AttnZ(9);
/// assert_eq!(hook.to_string(), "blocks.9.attn.hook_z");
/// assert_eq!("blocks.9.attn.hook_z".parse::<HookPoint>().unwrap(), hook);
/// ```
///
/// Unknown names parse as [`HookPoint::Custom`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Token embedding (`hook_embed`).
    Embed,
    /// Positional embedding (`hook_pos_embed`).
    PosEmbed,
    /// Residual stream entering layer `i` (`blocks.{i}.hook_resid_pre`).
    ResidPre(usize),
    /// Queries, `[batch, seq, heads, d_head]` (`blocks.{i}.attn.hook_q`).
    AttnQ(usize),
    /// Keys (`blocks.{i}.attn.hook_k`).
    AttnK(usize),
    /// Values (`blocks.{i}.attn.hook_v`).
    AttnV(usize),
    /// Pre-softmax scores (`blocks.{i}.attn.hook_attn_scores`).
    AttnScores(usize),
    /// Post-softmax pattern (`blocks.{i}.attn.hook_pattern`).
    AttnPattern(usize),
    /// Per-head attention output before `W_O`, `[batch, seq, heads, d_head]`
    /// (`blocks.{i}.attn.hook_z`).
    AttnZ(usize),
    /// Attention block output (`blocks.{i}.hook_attn_out`).
    AttnOut(usize),
    /// Residual stream between attention and MLP (`blocks.{i}.hook_resid_mid`).
    ResidMid(usize),
    /// MLP pre-activation (`blocks.{i}.mlp.hook_pre`).
    MlpPre(usize),
    /// MLP post-activation (`blocks.{i}.mlp.hook_post`).
    MlpPost(usize),
    /// MLP block output (`blocks.{i}.hook_mlp_out`).
    MlpOut(usize),
    /// Residual stream leaving layer `i` (`blocks.{i}.hook_resid_post`).
    ResidPost(usize),
    /// Final layer norm output (`ln_final.hook_normalized`).
    FinalNorm,
    /// Backend-specific hook point.
    Custom(String),
}

impl HookPoint {
    /// Layer index for per-layer hook points.
    #[must_use]
    pub const fn layer(&self) -> Option<usize> {
        match self {
            Self::ResidPre(i)
            | Self::AttnQ(i)
            | Self::AttnK(i)
            | Self::AttnV(i)
            | Self::AttnScores(i)
            | Self::AttnPattern(i)
            | Self::AttnZ(i)
            | Self::AttnOut(i)
            | Self::ResidMid(i)
            | Self::MlpPre(i)
            | Self::MlpPost(i)
            | Self::MlpOut(i)
            | Self::ResidPost(i) => Some(*i),
            Self::Embed | Self::PosEmbed | Self::FinalNorm | Self::Custom(_) => None,
        }
    }

    /// Dimension holding sequence positions in this hook's activation.
    ///
    /// 2 (the query axis) for the `[batch, heads, query, key]` attention
    /// scores and pattern, 1 for every `[batch, seq, ...]` activation.
    #[must_use]
    pub const fn seq_axis(&self) -> usize {
        match self {
            Self::AttnScores(_) | Self::AttnPattern(_) => 2,
            _ => 1,
        }
    }

    /// Every standard hook point of layer `layer`, in forward order.
    #[must_use]
    pub fn layer_points(layer: usize) -> Vec<Self> {
        vec![
            Self::ResidPre(layer),
            Self::AttnQ(layer),
            Self::AttnK(layer),
            Self::AttnV(layer),
            Self::AttnScores(layer),
            Self::AttnPattern(layer),
            Self::AttnZ(layer),
            Self::AttnOut(layer),
            Self::ResidMid(layer),
            Self::MlpPre(layer),
            Self::MlpPost(layer),
            Self::MlpOut(layer),
            Self::ResidPost(layer),
        ]
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed => write!(f, "hook_embed"),
            Self::PosEmbed => write!(f, "hook_pos_embed"),
            Self::ResidPre(i) => write!(f, "blocks.{i}.hook_resid_pre"),
            Self::AttnQ(i) => write!(f, "blocks.{i}.attn.hook_q"),
            Self::AttnK(i) => write!(f, "blocks.{i}.attn.hook_k"),
            Self::AttnV(i) => write!(f, "blocks.{i}.attn.hook_v"),
            Self::AttnScores(i) => write!(f, "blocks.{i}.attn.hook_attn_scores"),
            Self::AttnPattern(i) => write!(f, "blocks.{i}.attn.hook_pattern"),
            Self::AttnZ(i) => write!(f, "blocks.{i}.attn.hook_z"),
            Self::AttnOut(i) => write!(f, "blocks.{i}.hook_attn_out"),
            Self::ResidMid(i) => write!(f, "blocks.{i}.hook_resid_mid"),
            Self::MlpPre(i) => write!(f, "blocks.{i}.mlp.hook_pre"),
            Self::MlpPost(i) => write!(f, "blocks.{i}.mlp.hook_post"),
            Self::MlpOut(i) => write!(f, "blocks.{i}.hook_mlp_out"),
            Self::ResidPost(i) => write!(f, "blocks.{i}.hook_resid_post"),
            Self::FinalNorm => write!(f, "ln_final.hook_normalized"),
            Self::Custom(s) => write!(f, "{s}"),
        }
    }
}

impl FromStr for HookPoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(parse_hook_name(s))
    }
}

impl From<&str> for HookPoint {
    fn from(s: &str) -> Self {
        parse_hook_name(s)
    }
}

/// Parse a hook name, falling back to [`HookPoint::Custom`].
fn parse_hook_name(s: &str) -> HookPoint {
    match s {
        "hook_embed" => return HookPoint::Embed,
        "hook_pos_embed" => return HookPoint::PosEmbed,
        "ln_final.hook_normalized" => return HookPoint::FinalNorm,
        _ => {}
    }

    let parsed = s
        .strip_prefix("blocks.")
        .and_then(|rest| rest.split_once('.'))
        .and_then(|(layer, suffix)| Some((layer.parse::<usize>().ok()?, suffix)))
        .and_then(|(layer, suffix)| {
            let hook = match suffix {
                "hook_resid_pre" => HookPoint::ResidPre(layer),
                "attn.hook_q" => HookPoint::AttnQ(layer),
                "attn.hook_k" => HookPoint::AttnK(layer),
                "attn.hook_v" => HookPoint::AttnV(layer),
                "attn.hook_attn_scores" => HookPoint::AttnScores(layer),
                "attn.hook_pattern" => HookPoint::AttnPattern(layer),
                "attn.hook_z" => HookPoint::AttnZ(layer),
                "hook_attn_out" => HookPoint::AttnOut(layer),
                "hook_resid_mid" => HookPoint::ResidMid(layer),
                "mlp.hook_pre" => HookPoint::MlpPre(layer),
                "mlp.hook_post" => HookPoint::MlpPost(layer),
                "hook_mlp_out" => HookPoint::MlpOut(layer),
                "hook_resid_post" => HookPoint::ResidPost(layer),
                _ => return None,
            };
            Some(hook)
        });

    parsed.unwrap_or_else(|| HookPoint::Custom(s.to_string()))
}

// ---------------------------------------------------------------------------
// Intervention
// ---------------------------------------------------------------------------

/// A rewrite applied to the activation at a hook point.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Intervention {
    /// Replace the activation entirely.
    Replace(Tensor),
    /// Add a (broadcastable) tensor.
    Add(Tensor),
    /// Multiply by a constant.
    Scale(f64),
    /// Zero the activation.
    Zero,
    /// Overwrite the cells selected by `indices` with the same cells of
    /// `source`, typically the activation cached from a corrupted run.
    ///
    /// Dimension 0 of the activation is the batch and dimension `seq_axis`
    /// the sequence; use [`HookPoint::seq_axis`] for the hook being
    /// patched. For attention scores and patterns this selects query
    /// positions.
    Patch {
        /// Which `(batch, position)` cells to overwrite.
        indices: PatchIndices,
        /// Replacement activations, same shape as the hooked tensor.
        source: Tensor,
        /// Dimension holding sequence positions.
        seq_axis: usize,
    },
}

/// Apply `intervention` to the activation `tensor`.
///
/// Backends call this at every hook point that carries interventions.
///
/// # Shapes
/// - `tensor`: any shape; `[batch, ...]` with positions at `seq_axis` for
///   [`Intervention::Patch`]
/// - returns: same shape as `tensor`
///
/// # Errors
///
/// Returns [`PatchError::Model`] if the tensor operation fails, or
/// [`PatchError::Position`] if a patch does not fit the activation.
pub fn apply_intervention(tensor: &Tensor, intervention: &Intervention) -> Result<Tensor> {
    match intervention {
        Intervention::Replace(replacement) => Ok(replacement.clone()),
        Intervention::Add(delta) => Ok(tensor.broadcast_add(delta)?),
        Intervention::Scale(factor) => Ok((tensor * *factor)?),
        Intervention::Zero => Ok(tensor.zeros_like()?),
        Intervention::Patch {
            indices,
            source,
            seq_axis,
        } => indices.patch_along(tensor, source, *seq_axis),
    }
}

// ---------------------------------------------------------------------------
// HookSpec
// ---------------------------------------------------------------------------

/// Which activations a forward pass should capture and rewrite.
///
/// ```
/// use path_patching::{HookPoint, HookSpec, Intervention};
///
/// let mut hooks = HookSpec::new();
/// hooks
///     .capture(HookPoint::AttnZ(9))
///     .capture("blocks.10.hook_resid_pre")
///     .intervene(HookPoint::MlpOut(3), Intervention::Zero);
/// assert_eq!(hooks.num_captures(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    /// Hook points to capture.
    captures: HashSet<HookPoint>,
    /// Interventions in registration order.
    interventions: Vec<(HookPoint, Intervention)>,
}

impl HookSpec {
    /// Create an empty spec.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request capture of `hook`.
    pub fn capture<H: Into<HookPoint>>(&mut self, hook: H) -> &mut Self {
        self.captures.insert(hook.into());
        self
    }

    /// Request capture of every standard hook point of an `n_layers` model.
    pub fn capture_layers(&mut self, n_layers: usize) -> &mut Self {
        self.captures.insert(HookPoint::Embed);
        self.captures.insert(HookPoint::PosEmbed);
        for layer in 0..n_layers {
            self.captures.extend(HookPoint::layer_points(layer));
        }
        self.captures.insert(HookPoint::FinalNorm);
        self
    }

    /// Register an intervention at `hook`.
    pub fn intervene<H: Into<HookPoint>>(
        &mut self,
        hook: H,
        intervention: Intervention,
    ) -> &mut Self {
        self.interventions.push((hook.into(), intervention));
        self
    }

    /// Whether `hook` should be captured.
    #[must_use]
    pub fn is_captured(&self, hook: &HookPoint) -> bool {
        self.captures.contains(hook)
    }

    /// Whether nothing is captured or rewritten.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.captures.is_empty() && self.interventions.is_empty()
    }

    /// Number of requested captures.
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }

    /// Number of registered interventions.
    #[must_use]
    pub const fn num_interventions(&self) -> usize {
        self.interventions.len()
    }

    /// Interventions registered at `hook`, in registration order.
    pub fn interventions_at(&self, hook: &HookPoint) -> impl Iterator<Item = &Intervention> {
        self.interventions
            .iter()
            .filter(move |(h, _)| h == hook)
            .map(|(_, intervention)| intervention)
    }

    /// Whether any intervention targets `hook`.
    #[must_use]
    pub fn has_intervention_at(&self, hook: &HookPoint) -> bool {
        self.interventions.iter().any(|(h, _)| h == hook)
    }

    /// Capture `tensor` into `cache` if requested, then apply every
    /// intervention registered at `hook`.
    ///
    /// Convenience for backends: call once per hook point with the
    /// activation flowing through it and continue with the returned tensor.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`apply_intervention`].
    pub fn process(&self, hook: &HookPoint, tensor: Tensor, cache: &mut HookCache) -> Result<Tensor> {
        if self.is_captured(hook) {
            cache.store(hook.clone(), tensor.clone());
        }
        self.interventions_at(hook)
            .try_fold(tensor, |acc, intervention| apply_intervention(&acc, intervention))
    }
}

// ---------------------------------------------------------------------------
// HookCache
// ---------------------------------------------------------------------------

/// Output logits of a forward pass plus the activations it captured.
///
/// ```
/// use path_patching::{HookCache, HookPoint};
/// use candle_core::{DType, Device, Tensor};
///
/// let logits = Tensor::zeros((2, 7, 50257), DType::F32, &Device::Cpu).unwrap();
/// let mut cache = HookCache::new(logits);
/// cache.store(HookPoint::AttnZ(0), Tensor::zeros((2, 7, 12, 64), DType::F32, &Device::Cpu).unwrap());
///
/// assert!(cache.get(&HookPoint::AttnZ(0)).is_some());
/// assert!(cache.require(&HookPoint::AttnZ(1)).is_err());
/// ```
#[derive(Debug)]
pub struct HookCache {
    /// Forward-pass output, typically `[batch, seq, vocab]` logits.
    output: Tensor,
    /// Captured activations.
    captures: HashMap<HookPoint, Tensor>,
}

impl HookCache {
    /// Create a cache holding `output` and no captures.
    #[must_use]
    pub fn new(output: Tensor) -> Self {
        Self {
            output,
            captures: HashMap::new(),
        }
    }

    /// The forward-pass output.
    #[must_use]
    pub const fn output(&self) -> &Tensor {
        &self.output
    }

    /// Consume the cache, returning the output.
    #[must_use]
    pub fn into_output(self) -> Tensor {
        self.output
    }

    /// Replace the output (backends fill captures first, logits last).
    pub fn set_output(&mut self, output: Tensor) {
        self.output = output;
    }

    /// Captured activation at `hook`, if any.
    #[must_use]
    pub fn get(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.captures.get(hook)
    }

    /// Captured activation at `hook`.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Hook`] if `hook` was not captured.
    pub fn require(&self, hook: &HookPoint) -> Result<&Tensor> {
        self.captures
            .get(hook)
            .ok_or_else(|| PatchError::Hook(format!("hook point `{hook}` was not captured")))
    }

    /// Store a captured activation.
    pub fn store(&mut self, hook: HookPoint, tensor: Tensor) {
        self.captures.insert(hook, tensor);
    }

    /// Number of captured activations (excluding the output).
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }

    /// Hook points present in the cache, in no particular order.
    pub fn hook_points(&self) -> impl Iterator<Item = &HookPoint> {
        self.captures.keys()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
