// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sequence-position selection for activation patching.
//!
//! A [`SeqPos`] says which token positions to patch for each sequence in
//! a batch. [`batch_and_seq_pos_indices`] validates it against the batch
//! size and sequence length of the activations and returns a
//! [`PatchIndices`]: either the select-everything marker or a pair of
//! `[batch, k]` index grids where entry `(i, j)` of both grids names the
//! cell `(batch_indices[i][j], seq_pos_indices[i][j])`.
//!
//! The batch grid repeats row index `i` across its `k` columns, so paired
//! indexing never crosses a batch row with another row's positions.
//!
//! ```
//! use path_patching::{SeqPos, batch_and_seq_pos_indices};
//!
//! let seq_pos = SeqPos::PerBatchMulti(vec![vec![0, 4], vec![1, 2]]);
//! let indices = batch_and_seq_pos_indices(&seq_pos, 2, 5).unwrap();
//! assert_eq!(indices.seq_pos_indices(), Some(&[vec![0, 4], vec![1, 2]][..]));
//! assert_eq!(indices.batch_indices(), Some(&[vec![0, 0], vec![1, 1]][..]));
//! ```

use candle_core::{Device, Tensor};

use crate::error::{PatchError, Result};

// ---------------------------------------------------------------------------
// SeqPos
// ---------------------------------------------------------------------------

/// Which sequence positions to patch.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SeqPos {
    /// Patch every position of every sequence.
    #[default]
    All,
    /// Patch the same position in every sequence.
    Single(usize),
    /// One position per sequence; length must equal the batch size.
    PerBatch(Vec<usize>),
    /// `k` positions per sequence; shape `[batch, k]`.
    PerBatchMulti(Vec<Vec<usize>>),
}

impl From<usize> for SeqPos {
    fn from(pos: usize) -> Self {
        Self::Single(pos)
    }
}

impl From<Vec<usize>> for SeqPos {
    fn from(positions: Vec<usize>) -> Self {
        Self::PerBatch(positions)
    }
}

impl From<&[usize]> for SeqPos {
    fn from(positions: &[usize]) -> Self {
        Self::PerBatch(positions.to_vec())
    }
}

impl From<Vec<Vec<usize>>> for SeqPos {
    fn from(grid: Vec<Vec<usize>>) -> Self {
        Self::PerBatchMulti(grid)
    }
}

impl From<Option<usize>> for SeqPos {
    fn from(pos: Option<usize>) -> Self {
        pos.map_or(Self::All, Self::Single)
    }
}

impl SeqPos {
    /// Normalize to a `[batch, k]` grid; `None` for [`SeqPos::All`].
    ///
    /// No validation happens here beyond broadcasting `Single`.
    fn to_grid(&self, batch_size: usize) -> Option<Vec<Vec<usize>>> {
        match self {
            Self::All => None,
            Self::Single(pos) => Some(vec![vec![*pos]; batch_size]),
            Self::PerBatch(positions) => Some(positions.iter().map(|&p| vec![p]).collect()),
            Self::PerBatchMulti(grid) => Some(grid.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// PatchIndices
// ---------------------------------------------------------------------------

/// Validated batch/position index pair for a `[batch, seq, ...]` tensor.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchIndices {
    /// Select every batch row and every position.
    All {
        /// Sequence length of the indexed activations.
        seq_len: usize,
    },
    /// Select `(batch_indices[i][j], seq_pos_indices[i][j])` for all `i, j`.
    Select {
        /// `[batch, k]`, row `i` filled with `i`.
        batch_indices: Vec<Vec<usize>>,
        /// `[batch, k]`, the positions to patch per row.
        seq_pos_indices: Vec<Vec<usize>>,
        /// Sequence length of the indexed activations.
        seq_len: usize,
    },
}

/// Build the batch and position index grids for `seq_pos`.
///
/// # Errors
///
/// Returns [`PatchError::Position`] if the normalized grid does not have
/// `batch_size` rows, rows differ in length, a row is longer than
/// `seq_len`, any position is `>= seq_len`, or no position is selected.
pub fn batch_and_seq_pos_indices(
    seq_pos: &SeqPos,
    batch_size: usize,
    seq_len: usize,
) -> Result<PatchIndices> {
    let Some(grid) = seq_pos.to_grid(batch_size) else {
        return Ok(PatchIndices::All { seq_len });
    };

    if grid.len() != batch_size {
        return Err(PatchError::Position(format!(
            "expected {batch_size} rows (one per batch element), got {}",
            grid.len()
        )));
    }
    let sub_pos_len = grid.first().map_or(0, Vec::len);
    if let Some((row, bad)) = grid.iter().enumerate().find(|(_, r)| r.len() != sub_pos_len) {
        return Err(PatchError::Position(format!(
            "ragged positions: row {row} has {} entries, row 0 has {sub_pos_len}",
            bad.len()
        )));
    }
    if sub_pos_len == 0 {
        return Err(PatchError::Position("no positions selected".into()));
    }
    if sub_pos_len > seq_len {
        return Err(PatchError::Position(format!(
            "{sub_pos_len} positions per row exceeds seq_len {seq_len}"
        )));
    }
    if let Some(max) = grid.iter().flatten().copied().max() {
        if max >= seq_len {
            return Err(PatchError::Position(format!(
                "position {max} out of range (seq_len is {seq_len})"
            )));
        }
    }

    let batch_indices = (0..batch_size).map(|b| vec![b; sub_pos_len]).collect();
    Ok(PatchIndices::Select {
        batch_indices,
        seq_pos_indices: grid,
        seq_len,
    })
}

impl PatchIndices {
    /// Number of positions selected per batch row (`seq_len` for `All`).
    #[must_use]
    pub fn sub_pos_len(&self) -> usize {
        match self {
            Self::All { seq_len } => *seq_len,
            Self::Select {
                seq_pos_indices, ..
            } => seq_pos_indices.first().map_or(0, Vec::len),
        }
    }

    /// Whether these indices select the full tensor.
    #[must_use]
    pub const fn is_all(&self) -> bool {
        matches!(self, Self::All { .. })
    }

    /// Sequence length the indices were validated against.
    #[must_use]
    pub const fn seq_len(&self) -> usize {
        match self {
            Self::All { seq_len } | Self::Select { seq_len, .. } => *seq_len,
        }
    }

    /// The `[batch, k]` batch-index grid, or `None` for `All`.
    #[must_use]
    pub fn batch_indices(&self) -> Option<&[Vec<usize>]> {
        match self {
            Self::All { .. } => None,
            Self::Select { batch_indices, .. } => Some(batch_indices),
        }
    }

    /// The `[batch, k]` position-index grid, or `None` for `All`.
    #[must_use]
    pub fn seq_pos_indices(&self) -> Option<&[Vec<usize>]> {
        match self {
            Self::All { .. } => None,
            Self::Select {
                seq_pos_indices, ..
            } => Some(seq_pos_indices),
        }
    }

    /// Selected `(batch, position)` cells in row-major order.
    ///
    /// Empty for `All`, which carries no index data.
    pub fn cells(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.batch_indices()
            .unwrap_or_default()
            .iter()
            .flatten()
            .zip(self.seq_pos_indices().unwrap_or_default().iter().flatten())
            .map(|(&b, &p)| (b, p))
    }

    /// Convert the grids to `u32` tensors of shape `[batch, k]`.
    ///
    /// Returns `None` for `All`.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Position`] if an index does not fit in `u32`,
    /// or [`PatchError::Model`] on tensor creation failure.
    pub fn to_tensors(&self, device: &Device) -> Result<Option<(Tensor, Tensor)>> {
        let (Some(batch), Some(pos)) = (self.batch_indices(), self.seq_pos_indices()) else {
            return Ok(None);
        };
        let shape = (batch.len(), self.sub_pos_len());
        let batch = Tensor::from_vec(to_u32(batch.iter().flatten().copied())?, shape, device)?;
        let pos = Tensor::from_vec(to_u32(pos.iter().flatten().copied())?, shape, device)?;
        Ok(Some((batch, pos)))
    }

    /// Gather the selected cells of `activations`.
    ///
    /// # Shapes
    /// - `activations`: `[batch, seq, ...]`
    /// - returns: `[batch, k, ...]` (the full tensor for `All`)
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Position`] if `activations` does not match the
    /// batch size and sequence length the indices were built for.
    pub fn gather(&self, activations: &Tensor) -> Result<Tensor> {
        self.check_shape(activations)?;
        match self {
            Self::All { .. } => Ok(activations.clone()),
            Self::Select { .. } => {
                let flat = flatten_batch_seq(activations)?;
                let ids = to_u32(self.flat_cells())?;
                let n = ids.len();
                let gathered = flat.index_select(&Tensor::from_vec(ids, n, activations.device())?, 0)?;

                let mut shape = vec![self.num_rows(), self.sub_pos_len()];
                shape.extend_from_slice(activations.dims().get(2..).unwrap_or_default());
                Ok(gathered.reshape(shape)?)
            }
        }
    }

    /// Replace the selected cells of `target` with the matching cells of
    /// `source`.
    ///
    /// # Shapes
    /// - `target`: `[batch, seq, ...]`
    /// - `source`: same shape as `target`
    /// - returns: same shape as `target`
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Position`] if the shapes disagree with each
    /// other or with the indices.
    pub fn patch(&self, target: &Tensor, source: &Tensor) -> Result<Tensor> {
        self.check_shape(target)?;
        if source.dims() != target.dims() {
            return Err(PatchError::Position(format!(
                "patch source shape {:?} does not match target shape {:?}",
                source.dims(),
                target.dims()
            )));
        }
        let source = source.to_dtype(target.dtype())?;
        match self {
            Self::All { .. } => Ok(source),
            Self::Select { .. } => {
                // Rows [0, n) of the stacked tensor come from `target`,
                // rows [n, 2n) from `source`.
                let n = self.num_rows() * self.seq_len();
                let mut row_map: Vec<usize> = (0..n).collect();
                for flat in self.flat_cells() {
                    if let Some(slot) = row_map.get_mut(flat) {
                        *slot = n + flat;
                    }
                }
                let stacked = Tensor::cat(
                    &[&flatten_batch_seq(target)?, &flatten_batch_seq(&source)?],
                    0,
                )?;
                let ids = Tensor::from_vec(to_u32(row_map)?, n, target.device())?;
                Ok(stacked.index_select(&ids, 0)?.reshape(target.dims())?)
            }
        }
    }

    /// Like [`patch`](Self::patch), with the sequence dimension at
    /// `seq_axis` instead of 1.
    ///
    /// Attention scores and patterns are `[batch, heads, query, key]`; they
    /// are patched along the query axis (`seq_axis = 2`).
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Position`] if `seq_axis` is 0 or not a
    /// dimension of `target`, or as [`patch`](Self::patch).
    pub fn patch_along(&self, target: &Tensor, source: &Tensor, seq_axis: usize) -> Result<Tensor> {
        if source.dims() != target.dims() {
            return Err(PatchError::Position(format!(
                "patch source shape {:?} does not match target shape {:?}",
                source.dims(),
                target.dims()
            )));
        }
        match seq_axis {
            0 => Err(PatchError::Position(
                "sequence axis cannot be the batch axis".into(),
            )),
            1 => self.patch(target, source),
            axis if axis >= target.rank() => Err(PatchError::Position(format!(
                "sequence axis {axis} out of range for shape {:?}",
                target.dims()
            ))),
            axis => {
                let target_t = target.transpose(1, axis)?.contiguous()?;
                let source_t = source.transpose(1, axis)?.contiguous()?;
                let patched = self.patch(&target_t, &source_t)?;
                Ok(patched.transpose(1, axis)?.contiguous()?)
            }
        }
    }

    /// Set the selected cells of `target` to `value`.
    ///
    /// # Errors
    ///
    /// Same as [`patch`](Self::patch).
    pub fn fill(&self, target: &Tensor, value: f64) -> Result<Tensor> {
        let marker = (target.zeros_like()? + value)?;
        self.patch(target, &marker)
    }

    /// Number of batch rows (0 for `All`, which is not tied to a batch size).
    fn num_rows(&self) -> usize {
        self.batch_indices().map_or(0, <[Vec<usize>]>::len)
    }

    /// Selected cells as offsets into a `[batch * seq_len]` flattening.
    fn flat_cells(&self) -> impl Iterator<Item = usize> + '_ {
        let seq_len = self.seq_len();
        self.cells().map(move |(b, p)| b * seq_len + p)
    }

    /// Check that `tensor` is `[batch, seq_len, ...]` for these indices.
    fn check_shape(&self, tensor: &Tensor) -> Result<()> {
        let dims = tensor.dims();
        let (Some(&batch), Some(&seq)) = (dims.first(), dims.get(1)) else {
            return Err(PatchError::Position(format!(
                "expected a [batch, seq, ...] tensor, got shape {dims:?}"
            )));
        };
        if seq != self.seq_len() {
            return Err(PatchError::Position(format!(
                "tensor seq_len {seq} does not match indices seq_len {}",
                self.seq_len()
            )));
        }
        if !self.is_all() && batch != self.num_rows() {
            return Err(PatchError::Position(format!(
                "tensor batch size {batch} does not match indices batch size {}",
                self.num_rows()
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Merge the leading `[batch, seq]` dims into one.
///
/// # Shapes
/// - `tensor`: `[batch, seq, ...]`
/// - returns: `[batch * seq, ...]`
fn flatten_batch_seq(tensor: &Tensor) -> Result<Tensor> {
    let dims = tensor.dims();
    let mut shape = vec![dims.iter().take(2).product::<usize>()];
    shape.extend_from_slice(dims.get(2..).unwrap_or_default());
    Ok(tensor.reshape(shape)?)
}

/// Convert indices to `u32` for `index_select`.
fn to_u32(indices: impl IntoIterator<Item = usize>) -> Result<Vec<u32>> {
    indices
        .into_iter()
        .map(|i| {
            u32::try_from(i)
                .map_err(|_| PatchError::Position(format!("index {i} does not fit in u32")))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
