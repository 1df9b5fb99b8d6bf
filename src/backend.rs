// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model execution seam.
//!
//! Path patching never runs a model itself. Anything that can execute a
//! forward pass with [`HookSpec`] captures and interventions implements
//! [`PatchingBackend`]; the experiment helpers in
//! [`experiment`](crate::experiment) drive it.

use candle_core::Tensor;

use crate::error::Result;
use crate::hooks::{HookCache, HookSpec};

/// A model that runs hook-aware forward passes.
///
/// Implementations apply interventions with
/// [`apply_intervention`](crate::apply_intervention) (or
/// [`HookSpec::process`]) at every hook point they expose.
pub trait PatchingBackend: Send + Sync {
    /// Number of transformer blocks.
    fn num_layers(&self) -> usize;

    /// Vocabulary size.
    fn vocab_size(&self) -> usize;

    /// Forward pass with captures and interventions.
    ///
    /// With an empty `hooks` this must behave like a plain forward pass.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]` token ids
    /// - returns: [`HookCache`] with logits at `[batch, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Backend-specific; tensor failures surface as
    /// [`PatchError::Model`](crate::PatchError::Model).
    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache>;

    /// Forward pass that records the activations requested in `hooks`.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`forward`](Self::forward).
    fn run_with_cache(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        tracing::debug!(
            shape = ?input_ids.dims(),
            captures = hooks.num_captures(),
            interventions = hooks.num_interventions(),
            "forward pass",
        );
        let cache = self.forward(input_ids, hooks)?;
        tracing::debug!(captured = cache.num_captures(), "forward pass done");
        Ok(cache)
    }
}
