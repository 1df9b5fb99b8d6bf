// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cartesian expansion of experiment configurations.
//!
//! A [`SweepAxes`] holds positional axes and named axes, each a list of
//! candidate values. Iterating it yields one [`Combination`] per element
//! of the full cross product, in nested-loop order: positional axes are
//! the outer loops, named axes the inner loops, and within each group the
//! last axis varies fastest.
//!
//! ```
//! use path_patching::SweepAxes;
//!
//! let axes = SweepAxes::new()
//!     .arg([1, 2])
//!     .kwarg("layer", [0, 5, 10]);
//! assert_eq!(axes.len(), 6);
//!
//! let first = axes.iter().next().unwrap();
//! assert_eq!(first.args, vec![1]);
//! assert_eq!(first.get("layer"), Some(&0));
//! ```

use std::iter::FusedIterator;

use serde_json::Value;

use crate::error::{PatchError, Result};

// ---------------------------------------------------------------------------
// Combination
// ---------------------------------------------------------------------------

/// One element of the cross product: positional values plus named values.
///
/// Named values keep the order in which their axes were declared.
#[derive(Debug, Clone, PartialEq)]
pub struct Combination<V> {
    /// One value per positional axis.
    pub args: Vec<V>,
    /// One `(name, value)` pair per named axis; names are unique.
    pub kwargs: Vec<(String, V)>,
}

impl<V> Combination<V> {
    /// Value of the named axis `name`, if present.
    pub fn get(&self, name: &str) -> Option<&V> {
        self.kwargs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Value of the positional axis at `index`, if present.
    pub fn arg(&self, index: usize) -> Option<&V> {
        self.args.get(index)
    }
}

// ---------------------------------------------------------------------------
// SweepAxes
// ---------------------------------------------------------------------------

/// Ordered positional and named candidate lists for a configuration sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepAxes<V> {
    /// Positional axes, in declaration order.
    args: Vec<Vec<V>>,
    /// Named axes, in declaration order.
    kwargs: Vec<(String, Vec<V>)>,
}

impl<V> Default for SweepAxes<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> SweepAxes<V> {
    /// Create an axis set with no axes.
    ///
    /// Iterating it yields exactly one empty combination.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            args: Vec::new(),
            kwargs: Vec::new(),
        }
    }

    /// Append a positional axis.
    #[must_use]
    pub fn arg<I: IntoIterator<Item = V>>(mut self, values: I) -> Self {
        self.args.push(values.into_iter().collect());
        self
    }

    /// Append a named axis.
    ///
    /// Declaring a name twice replaces the earlier candidates but keeps the
    /// axis in its original position.
    #[must_use]
    pub fn kwarg<I: IntoIterator<Item = V>>(mut self, name: impl Into<String>, values: I) -> Self {
        let name = name.into();
        let values: Vec<V> = values.into_iter().collect();
        match self.kwargs.iter_mut().find(|(key, _)| *key == name) {
            Some(slot) => slot.1 = values,
            None => self.kwargs.push((name, values)),
        }
        self
    }

    /// Number of positional axes.
    #[must_use]
    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    /// Names of the named axes, in declaration order.
    pub fn kwarg_names(&self) -> impl Iterator<Item = &str> {
        self.kwargs.iter().map(|(name, _)| name.as_str())
    }

    /// Number of combinations the sweep expands to.
    ///
    /// Saturates at `usize::MAX` for sweeps too large to count; see
    /// [`checked_len`](Self::checked_len).
    #[must_use]
    pub fn len(&self) -> usize {
        self.checked_len().unwrap_or(usize::MAX)
    }

    /// Number of combinations, or `None` if it overflows `usize`.
    #[must_use]
    pub fn checked_len(&self) -> Option<usize> {
        self.axis_lens()
            .try_fold(1_usize, |acc, n| acc.checked_mul(n))
            .or_else(|| self.is_empty().then_some(0))
    }

    /// Whether the sweep expands to zero combinations (some axis is empty).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.axis_lens().any(|n| n == 0)
    }

    /// Candidate counts for every axis: positional first, then named.
    fn axis_lens(&self) -> impl Iterator<Item = usize> + '_ {
        self.args
            .iter()
            .map(Vec::len)
            .chain(self.kwargs.iter().map(|(_, values)| values.len()))
    }
}

impl<V: Clone> SweepAxes<V> {
    /// Lazily iterate every combination.
    ///
    /// The iterator borrows the axes, so calling `iter()` again restarts
    /// the sweep from the first combination.
    pub fn iter(&self) -> Combinations<'_, V> {
        let lens: Vec<usize> = self.axis_lens().collect();
        let cursor = if self.is_empty() {
            None
        } else {
            Some(vec![0; lens.len()])
        };
        Combinations {
            axes: self,
            lens,
            cursor,
            remaining: self.checked_len(),
        }
    }

    /// Materialize every combination.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Combination<V>> {
        self.iter().collect()
    }
}

impl<'a, V: Clone> IntoIterator for &'a SweepAxes<V> {
    type Item = Combination<V>;
    type IntoIter = Combinations<'a, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl SweepAxes<Value> {
    /// Parse a sweep from JSON of the form
    /// `{"args": [[...], ...], "kwargs": {"name": [...], ...}}`.
    ///
    /// Both keys are optional. Named axes keep the key order of the
    /// document.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Config`] if the document is not an object,
    /// contains unknown keys, or any axis is not an array.
    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| PatchError::Config("sweep must be a JSON object".into()))?;

        if let Some(unknown) = obj.keys().find(|k| *k != "args" && *k != "kwargs") {
            return Err(PatchError::Config(format!(
                "unknown sweep key '{unknown}' (expected 'args' or 'kwargs')"
            )));
        }

        let mut axes = Self::new();

        if let Some(args) = obj.get("args") {
            let args = args
                .as_array()
                .ok_or_else(|| PatchError::Config("'args' must be an array of arrays".into()))?;
            for (i, axis) in args.iter().enumerate() {
                let values = axis
                    .as_array()
                    .ok_or_else(|| PatchError::Config(format!("args[{i}] must be an array")))?;
                axes = axes.arg(values.iter().cloned());
            }
        }

        if let Some(kwargs) = obj.get("kwargs") {
            let kwargs = kwargs
                .as_object()
                .ok_or_else(|| PatchError::Config("'kwargs' must be an object".into()))?;
            for (name, axis) in kwargs {
                let values = axis
                    .as_array()
                    .ok_or_else(|| PatchError::Config(format!("kwargs.{name} must be an array")))?;
                axes = axes.kwarg(name.clone(), values.iter().cloned());
            }
        }

        Ok(axes)
    }
}

/// Expand positional and named candidate lists into every combination.
///
/// Eager counterpart of [`SweepAxes::iter`].
///
/// ```
/// use path_patching::product_with_args_kwargs;
///
/// let combos = product_with_args_kwargs(
///     vec![vec![1, 2], vec![10, 20]],
///     vec![("scale".to_string(), vec![0, 1])],
/// );
/// assert_eq!(combos.len(), 8);
/// assert_eq!(combos[1].args, vec![1, 10]);
/// assert_eq!(combos[1].get("scale"), Some(&1));
/// ```
pub fn product_with_args_kwargs<V: Clone>(
    args: Vec<Vec<V>>,
    kwargs: Vec<(String, Vec<V>)>,
) -> Vec<Combination<V>> {
    let axes = args.into_iter().fold(SweepAxes::new(), SweepAxes::arg);
    let axes = kwargs
        .into_iter()
        .fold(axes, |axes, (name, values)| axes.kwarg(name, values));
    axes.to_vec()
}

// ---------------------------------------------------------------------------
// Combinations iterator
// ---------------------------------------------------------------------------

/// Lazy iterator over the combinations of a [`SweepAxes`].
#[derive(Debug, Clone)]
pub struct Combinations<'a, V> {
    /// The axes being expanded.
    axes: &'a SweepAxes<V>,
    /// Candidate count per axis (positional first, then named).
    lens: Vec<usize>,
    /// Odometer over axis indices; `None` once exhausted.
    cursor: Option<Vec<usize>>,
    /// Combinations not yet yielded; `None` when the count overflows `usize`.
    remaining: Option<usize>,
}

impl<V: Clone> Iterator for Combinations<'_, V> {
    type Item = Combination<V>;

    fn next(&mut self) -> Option<Self::Item> {
        let axes = self.axes;
        let cursor = self.cursor.as_mut()?;
        let n_args = axes.args.len();

        let args: Vec<V> = axes
            .args
            .iter()
            .zip(cursor.iter())
            .filter_map(|(values, &i)| values.get(i).cloned())
            .collect();
        let kwargs: Vec<(String, V)> = axes
            .kwargs
            .iter()
            .zip(cursor.iter().skip(n_args))
            .filter_map(|((name, values), &i)| values.get(i).map(|v| (name.clone(), v.clone())))
            .collect();

        // Advance the odometer; the last axis turns fastest.
        let mut exhausted = true;
        for (slot, &len) in cursor.iter_mut().zip(&self.lens).rev() {
            *slot += 1;
            if *slot < len {
                exhausted = false;
                break;
            }
            *slot = 0;
        }
        if exhausted {
            self.cursor = None;
        }
        self.remaining = self.remaining.map(|n| n.saturating_sub(1));

        Some(Combination { args, kwargs })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.remaining {
            Some(n) => (n, Some(n)),
            None => (usize::MAX, None),
        }
    }
}

/// Exact whenever [`SweepAxes::checked_len`] is `Some`. Sweeps whose size
/// overflows `usize` report `(usize::MAX, None)` from `size_hint`, and
/// `len()` must not be called on them.
impl<V: Clone> ExactSizeIterator for Combinations<'_, V> {}

impl<V: Clone> FusedIterator for Combinations<'_, V> {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docstring_axes() -> SweepAxes<Value> {
        SweepAxes::new()
            .arg([json!(1), json!(2)])
            .arg([json!("a"), json!("b")])
            .kwarg("key1", [json!(true), json!(false)])
            .kwarg("key2", [json!("q"), json!("k")])
    }

    #[test]
    fn positional_outer_keyword_inner() {
        let combos = docstring_axes().to_vec();
        assert_eq!(combos.len(), 16);

        assert_eq!(combos[0].args, vec![json!(1), json!("a")]);
        assert_eq!(
            combos[0].kwargs,
            vec![
                ("key1".to_string(), json!(true)),
                ("key2".to_string(), json!("q"))
            ]
        );
        // Keyword axes cycle before the positional tuple moves on.
        assert_eq!(combos[1].args, vec![json!(1), json!("a")]);
        assert_eq!(combos[1].get("key1"), Some(&json!(true)));
        assert_eq!(combos[1].get("key2"), Some(&json!("k")));
        assert_eq!(combos[3].get("key1"), Some(&json!(false)));
        assert_eq!(combos[4].args, vec![json!(1), json!("b")]);

        let last = combos.last().unwrap();
        assert_eq!(last.args, vec![json!(2), json!("b")]);
        assert_eq!(last.get("key1"), Some(&json!(false)));
        assert_eq!(last.get("key2"), Some(&json!("k")));
    }

    #[test]
    fn length_is_product_of_axis_lengths() {
        let axes = SweepAxes::new()
            .arg(0..3)
            .arg(0..4)
            .kwarg("a", 0..2)
            .kwarg("b", 0..5);
        assert_eq!(axes.len(), 3 * 4 * 2 * 5);
        assert_eq!(axes.iter().count(), 120);
        assert_eq!(axes.iter().len(), 120);
    }

    #[test]
    fn empty_axis_yields_nothing() {
        let positional = SweepAxes::new().arg([1, 2]).arg(Vec::<i32>::new());
        assert!(positional.is_empty());
        assert_eq!(positional.len(), 0);
        assert_eq!(positional.iter().next(), None);

        let named = SweepAxes::new().arg([1, 2]).kwarg("k", Vec::<i32>::new());
        assert!(named.to_vec().is_empty());
    }

    #[test]
    fn no_axes_yields_one_empty_combination() {
        let axes: SweepAxes<u8> = SweepAxes::new();
        let combos = axes.to_vec();
        assert_eq!(combos.len(), 1);
        assert!(combos[0].args.is_empty());
        assert!(combos[0].kwargs.is_empty());
    }

    #[test]
    fn iteration_is_restartable_and_deterministic() {
        let axes = docstring_axes();
        let first: Vec<_> = axes.iter().collect();
        let second: Vec<_> = (&axes).into_iter().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn exact_size_counts_down() {
        let axes = SweepAxes::new().arg([1, 2, 3]);
        let mut iter = axes.iter();
        assert_eq!(iter.len(), 3);
        iter.next();
        assert_eq!(iter.len(), 2);
        iter.next();
        iter.next();
        assert_eq!(iter.len(), 0);
        assert_eq!(iter.next(), None);
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn redeclared_kwarg_keeps_position() {
        let axes = SweepAxes::new()
            .kwarg("a", [1])
            .kwarg("b", [2])
            .kwarg("a", [3, 4]);
        assert_eq!(axes.kwarg_names().collect::<Vec<_>>(), vec!["a", "b"]);
        let combos = axes.to_vec();
        assert_eq!(combos.len(), 2);
        assert_eq!(combos[1].kwargs[0], ("a".to_string(), 4));
    }

    #[test]
    fn eager_helper_matches_lazy_iteration() {
        let eager = product_with_args_kwargs(
            vec![vec!['x', 'y'], vec!['z']],
            vec![("m".to_string(), vec!['p', 'q'])],
        );
        let lazy = SweepAxes::new()
            .arg(['x', 'y'])
            .arg(['z'])
            .kwarg("m", ['p', 'q'])
            .to_vec();
        assert_eq!(eager, lazy);
        assert_eq!(eager[2].arg(0), Some(&'y'));
    }

    #[test]
    fn from_json_preserves_kwarg_order() {
        let doc = json!({
            "args": [[0, 1]],
            "kwargs": {"zeta": [true], "alpha": ["x", "y"]}
        });
        let axes = SweepAxes::from_json(&doc).unwrap();
        assert_eq!(axes.num_args(), 1);
        assert_eq!(axes.kwarg_names().collect::<Vec<_>>(), vec!["zeta", "alpha"]);
        assert_eq!(axes.len(), 4);
    }

    #[test]
    fn from_json_rejects_malformed_documents() {
        assert!(SweepAxes::from_json(&json!([1, 2])).is_err());
        assert!(SweepAxes::from_json(&json!({"args": [1, 2]})).is_err());
        assert!(SweepAxes::from_json(&json!({"kwargs": {"k": 3}})).is_err());
        assert!(SweepAxes::from_json(&json!({"argz": []})).is_err());
    }

    #[test]
    fn oversized_sweep_has_no_exact_size() {
        let axes = (0..65).fold(SweepAxes::new(), |axes, _| axes.arg([0_u8, 1]));
        assert_eq!(axes.checked_len(), None);
        assert_eq!(axes.len(), usize::MAX);

        let mut iter = axes.iter();
        assert_eq!(iter.size_hint(), (usize::MAX, None));
        assert_eq!(iter.next().unwrap().args, vec![0; 65]);
        assert_eq!(iter.next().unwrap().args.last(), Some(&1));
        assert_eq!(iter.size_hint(), (usize::MAX, None));

        let small = SweepAxes::new().arg([1, 2]).kwarg("k", [1, 2, 3]);
        assert_eq!(small.checked_len(), Some(6));
        assert_eq!(SweepAxes::<u8>::new().arg([]).checked_len(), Some(0));
    }
}
