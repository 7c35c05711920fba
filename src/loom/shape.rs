use std::{str::FromStr, sync::Arc};

use derive_more::{Deref, Display, From, Into};
use itertools::Itertools;
use thiserror::Error;

/// The maximum rank of a compacted shape handed to fixed-rank kernels.
pub const MAX_NDIM: usize = 5;

#[derive(Debug, Error)]
pub enum ShapeError {
    #[error("operands could not be broadcast together with shapes {0} {1}")]
    Incompatible(Shape, Shape),
    #[error("reduction axis {axis} exceeds input dimensions {shape}")]
    AxisOutOfRange { axis: usize, shape: Shape },
    #[error("reduction axes must be sorted and unique, got {0}")]
    AxesUnsorted(Shape),
    #[error("broadcasting axis {axis} of {shape} must have size 1")]
    BroadcastAxis { axis: usize, shape: Shape },
    #[error("broadcast axes {0} and sizes {1} differ in length")]
    BroadcastParam(Shape, Shape),
    #[error("array cannot be broadcasted from {0} to {1}")]
    BroadcastTo(Shape, Shape),
    #[error("too many axes after compacting {0} against {1}")]
    TooManyAxes(Shape, Shape),
    #[error("shape inconsistent at slot {index}: expected {expected}, got {got}")]
    Assign {
        index: usize,
        expected: Shape,
        got: Shape,
    },
    #[error("expecting {expected} shapes, got {got}")]
    Count { expected: usize, got: usize },
    #[error("invalid shape literal: {0}")]
    Parse(String),
}

/// A tensor shape. A shape with no axes is treated as "not yet known".
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, From, Into, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[display("({})", _0.iter().format(","))]
pub struct Shape(Arc<[usize]>);

impl From<Vec<usize>> for Shape {
    #[inline]
    fn from(value: Vec<usize>) -> Self {
        Self(value.into())
    }
}

impl From<&[usize]> for Shape {
    #[inline]
    fn from(value: &[usize]) -> Self {
        Self(value.into())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    #[inline]
    fn from(value: [usize; N]) -> Self {
        Self(value.into())
    }
}

impl Shape {
    /// A shape of `ndim` axes, all of the given size.
    #[inline]
    pub fn filled(ndim: usize, size: usize) -> Self {
        Self::from(vec![size; ndim])
    }

    /// The "not yet known" shape.
    #[inline]
    pub fn unknown() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_unknown(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.iter().product()
    }

    /// Converts the shape into a fixed-rank array.
    ///
    /// # Panics
    /// If the rank of the shape is not `N`.
    #[inline]
    pub fn to_array<const N: usize>(&self) -> [usize; N] {
        let mut array = [0; N];
        array.copy_from_slice(&self.0);
        array
    }
}

impl FromStr for Shape {
    type Err = ShapeError;

    /// Parses `(2,3)`, `[2, 3]`, `(4,)`, `()` or a bare `5`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let inner = trimmed
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .or_else(|| trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')))
            .unwrap_or(trimmed);
        inner
            .split(',')
            .map(str::trim)
            .filter(|x| !x.is_empty())
            .map(|x| x.parse::<usize>())
            .collect::<Result<Vec<_>, _>>()
            .map(Self::from)
            .map_err(|_| ShapeError::Parse(s.to_string()))
    }
}
