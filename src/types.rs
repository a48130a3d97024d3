//! Shared index types, tensor shapes and construction macros.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of an operator node within its graph.
pub type NodeIndex = usize;

/// Identifier of an independently optimized subgraph.
pub type SubgraphId = usize;

/// The logical shape of a tensor; every dimension is positive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TensorShape {
    dims: Vec<usize>,
}

impl TensorShape {
    /// Constructs a shape from its dimension sizes.
    ///
    /// # Panics
    /// Panics if any dimension is zero.
    ///
    /// # Examples
    /// ```
    /// # use shardplan::types::TensorShape;
    /// let shape = TensorShape::new(vec![8, 8, 8, 8]);
    /// assert_eq!(shape.rank(), 4);
    /// assert_eq!(shape.elements(), 4096.0);
    /// ```
    #[must_use]
    pub fn new(dims: Vec<usize>) -> Self {
        assert!(
            dims.iter().all(|&d| d > 0),
            "tensor dimensions must be positive, got {dims:?}"
        );
        Self { dims }
    }

    /// Returns the dimension sizes.
    #[inline]
    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Returns the number of dimensions.
    #[inline]
    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Returns the number of elements.
    #[inline]
    #[must_use]
    pub fn elements(&self) -> f64 {
        self.dims.iter().map(|&d| d as f64).product()
    }

    /// Returns the shape with `axis` removed, as produced by a reduction
    /// that does not keep the reduced dimension.
    #[must_use]
    pub fn without_axis(&self, axis: usize) -> Self {
        let mut dims = self.dims.clone();
        dims.remove(axis);
        Self { dims }
    }

    /// Elementwise broadcast of two equal-rank shapes. Returns `None` when a
    /// dimension pair is neither equal nor broadcast (size 1).
    #[must_use]
    pub fn broadcast(&self, other: &Self) -> Option<Self> {
        if self.rank() != other.rank() {
            return None;
        }
        let mut dims = Vec::with_capacity(self.rank());
        for (&a, &b) in self.dims.iter().zip(&other.dims) {
            if a == b || b == 1 {
                dims.push(a);
            } else if a == 1 {
                dims.push(b);
            } else {
                return None;
            }
        }
        Some(Self { dims })
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.dims)
    }
}

/// Resolves a possibly negative reduction/normalization axis against a rank.
/// Returns `None` when the axis is out of bounds.
#[must_use]
pub fn resolve_axis(axis: isize, rank: usize) -> Option<usize> {
    let rank = rank as isize;
    let resolved = if axis < 0 { axis + rank } else { axis };
    (0..rank).contains(&resolved).then_some(resolved as usize)
}

/// Builds a [`TensorShape`] from a dimension list.
#[macro_export]
macro_rules! shape {
    ($($d:expr),* $(,)?) => {
        $crate::types::TensorShape::new(vec![$($d),*])
    };
}

/// Builds a [`Strategy`](crate::strategy::Strategy) from a split-factor list.
#[macro_export]
macro_rules! strategy {
    ($($s:expr),* $(,)?) => {
        $crate::strategy::Strategy::new(vec![$($s),*])
    };
}
