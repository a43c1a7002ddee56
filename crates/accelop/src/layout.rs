//! Tensor layout helpers.
//!
//! Extents and strides are kept as `i64` because that is what vendor tensor
//! descriptors consume. Strides are always row-major element offsets.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::spec::{DimSymbol, Dimension, OpError, OpResult, Shape};

/// Ranks up to this size keep permutation scratch on the stack.
pub const INLINE_RANK: usize = 8;

/// Per-axis mode labels, inline for common ranks.
pub type Modes = SmallVec<[i32; INLINE_RANK]>;

/// Returns static dimensions or maps the first dynamic dimension to caller-defined error type.
pub fn static_dims_or_error<E, F>(shape: &Shape, mut on_dynamic: F) -> Result<Vec<usize>, E>
where
    F: FnMut(&DimSymbol) -> E,
{
    let mut dims = Vec::with_capacity(shape.rank());
    for dim in shape.dims() {
        match dim {
            Dimension::Static(value) => dims.push(*value),
            Dimension::Dynamic(symbol) => return Err(on_dynamic(symbol)),
        }
    }
    Ok(dims)
}

/// Multiplies dims into an element count, mapping overflow to a caller-defined error.
pub fn checked_element_count_or_error<E, F>(dims: &[usize], mut on_overflow: F) -> Result<usize, E>
where
    F: FnMut() -> E,
{
    let mut count = 1usize;
    for dim in dims {
        count = count.checked_mul(*dim).ok_or_else(&mut on_overflow)?;
    }
    Ok(count)
}

/// Builds row-major contiguous strides with overflow checking.
pub fn contiguous_strides_or_error<E, F>(
    dims: &[usize],
    mut on_overflow: F,
) -> Result<Vec<usize>, E>
where
    F: FnMut() -> E,
{
    let mut strides = vec![0usize; dims.len()];
    let mut stride = 1usize;
    for axis in (0..dims.len()).rev() {
        strides[axis] = stride;
        stride = stride
            .checked_mul(dims[axis])
            .ok_or_else(&mut on_overflow)?;
    }
    Ok(strides)
}

/// Extents plus row-major strides of a dense tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorLayout {
    extents: Vec<i64>,
    strides: Vec<i64>,
    element_count: i64,
}

impl TensorLayout {
    /// Derives the row-major layout of a fully static shape.
    pub fn row_major(shape: &Shape) -> OpResult<Self> {
        let dims = static_dims_or_error(shape, |symbol| {
            OpError::invalid_graph(format!(
                "dimension ?{} of shape {shape} is not static",
                symbol.as_str()
            ))
        })?;
        Self::from_extents(&dims)
    }

    pub fn from_extents(dims: &[usize]) -> OpResult<Self> {
        let overflow = || OpError::invalid_graph(format!("extents {dims:?} overflow i64"));
        let strides = contiguous_strides_or_error(dims, overflow)?;
        let element_count = checked_element_count_or_error(dims, overflow)
            .and_then(|count| i64::try_from(count).map_err(|_| overflow()))?;
        let extents = dims
            .iter()
            .map(|&d| i64::try_from(d).map_err(|_| overflow()))
            .collect::<OpResult<Vec<_>>>()?;
        let strides = strides
            .iter()
            .map(|&s| i64::try_from(s).map_err(|_| overflow()))
            .collect::<OpResult<Vec<_>>>()?;
        Ok(Self {
            extents,
            strides,
            element_count,
        })
    }

    pub fn rank(&self) -> usize {
        self.extents.len()
    }

    pub fn extents(&self) -> &[i64] {
        &self.extents
    }

    pub fn strides(&self) -> &[i64] {
        &self.strides
    }

    /// Total elements; always fits in `i64`.
    pub fn element_count(&self) -> i64 {
        self.element_count
    }
}

/// Output-axis permutation: output axis `i` reads input axis `perm[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AxisPermutation(Modes);

impl AxisPermutation {
    pub fn identity(rank: usize) -> Self {
        Self((0..rank).map(axis_label).collect())
    }

    /// The default transpose: reverse all axes.
    pub fn reversed(rank: usize) -> Self {
        Self((0..rank).rev().map(axis_label).collect())
    }

    /// Validates `indices` as a permutation of `0..rank`.
    pub fn from_indices(indices: &[i64], rank: usize) -> OpResult<Self> {
        if indices.len() != rank {
            return Err(OpError::invalid_permutation(
                indices,
                format!("expected {rank} axes, got {}", indices.len()),
            ));
        }
        let mut seen: SmallVec<[bool; INLINE_RANK]> = SmallVec::from_elem(false, rank);
        let mut modes = Modes::with_capacity(rank);
        for &index in indices {
            let axis = usize::try_from(index)
                .ok()
                .filter(|&axis| axis < rank)
                .ok_or_else(|| {
                    OpError::invalid_permutation(indices, format!("axis {index} out of 0..{rank}"))
                })?;
            if std::mem::replace(&mut seen[axis], true) {
                return Err(OpError::invalid_permutation(
                    indices,
                    format!("axis {axis} repeated"),
                ));
            }
            modes.push(axis_label(axis));
        }
        Ok(Self(modes))
    }

    pub fn into_modes(self) -> Modes {
        self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn as_modes(&self) -> &[i32] {
        &self.0
    }

    pub fn axes(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().map(|&mode| mode as usize)
    }

    /// Permutes `extents` into output order.
    pub fn apply<T: Copy>(&self, extents: &[T]) -> Vec<T> {
        self.axes().map(|axis| extents[axis]).collect()
    }
}

impl fmt::Display for AxisPermutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0.as_slice())
    }
}

fn axis_label(axis: usize) -> i32 {
    // Ranks are bounded by the extent vectors, far below i32::MAX.
    axis as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_major_strides_match_suffix_products() {
        let layout = TensorLayout::from_extents(&[2, 3, 4, 5]).unwrap();
        assert_eq!(layout.extents(), &[2, 3, 4, 5]);
        assert_eq!(layout.strides(), &[60, 20, 5, 1]);
        assert_eq!(layout.element_count(), 120);
    }

    #[test]
    fn scalar_layout_is_empty() {
        let layout = TensorLayout::from_extents(&[]).unwrap();
        assert_eq!(layout.rank(), 0);
        assert!(layout.strides().is_empty());
        assert_eq!(layout.element_count(), 1);
    }

    #[test]
    fn dynamic_shapes_are_rejected() {
        let shape = Shape::new(vec![
            Dimension::Static(4),
            Dimension::Dynamic(DimSymbol::new("T")),
        ]);
        let err = TensorLayout::row_major(&shape).expect_err("dynamic dim");
        assert!(matches!(err, OpError::InvalidGraph(_)));
    }

    #[test]
    fn overflowing_strides_are_rejected() {
        let err = TensorLayout::from_extents(&[usize::MAX, 2]).expect_err("overflow");
        assert!(matches!(err, OpError::InvalidGraph(_)));
    }

    #[test]
    fn element_counts_beyond_i64_are_rejected() {
        // Fits in usize, not in i64.
        let err = TensorLayout::from_extents(&[3, 1 << 62]).expect_err("i64 overflow");
        assert!(matches!(err, OpError::InvalidGraph(_)));

        let layout = TensorLayout::from_extents(&[1 << 31, 1 << 31]).unwrap();
        assert_eq!(layout.element_count(), 1i64 << 62);
    }

    #[test]
    fn reversed_permutation_covers_small_ranks() {
        assert!(AxisPermutation::reversed(0).as_modes().is_empty());
        assert_eq!(AxisPermutation::reversed(1).as_modes(), &[0]);
        assert_eq!(AxisPermutation::reversed(4).as_modes(), &[3, 2, 1, 0]);
    }

    #[test]
    fn from_indices_rejects_duplicates_and_out_of_range() {
        assert!(AxisPermutation::from_indices(&[0, 0, 1], 3).is_err());
        assert!(AxisPermutation::from_indices(&[0, 3, 1], 3).is_err());
        assert!(AxisPermutation::from_indices(&[-1, 0, 1], 3).is_err());
        assert!(AxisPermutation::from_indices(&[0, 1], 3).is_err());
        let perm = AxisPermutation::from_indices(&[2, 0, 1], 3).unwrap();
        assert_eq!(perm.apply(&[1i64, 2, 3]), vec![3, 1, 2]);
    }
}
