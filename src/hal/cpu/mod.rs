//! Host kernels of the built-in operators.
//!
//! Kernels run on compacted shapes. They copy their inputs out before writing outputs, so an
//! output may alias an input.

use itertools::Itertools;

use crate::loom::{num::Element, ops::{OpError, OpReq}, tensor::TBlob};

pub mod broadcast;
pub mod init;
pub mod reduce;

/// Maps flat indices over `dims` to element offsets.
#[derive(Debug, Clone)]
pub(crate) struct Indexer {
    dims: Vec<usize>,
    strides: Vec<usize>,
}

impl Indexer {
    /// Walks `dims` over a buffer laid out with `strides`.
    pub fn new(dims: &[usize], strides: Vec<usize>) -> Self {
        Self {
            dims: dims.to_vec(),
            strides,
        }
    }

    /// Walks `out` over a buffer of shape `src`, which broadcasts to `out`.
    pub fn broadcast(src: &[usize], out: &[usize]) -> Self {
        let strides = strides(src)
            .into_iter()
            .zip_eq(src)
            .map(|(stride, &dim)| if dim == 1 { 0 } else { stride })
            .collect();
        Self::new(out, strides)
    }

    /// Number of indices walked.
    #[inline]
    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    #[inline]
    pub fn offset(&self, mut index: usize) -> usize {
        let mut offset = 0;
        for (&dim, &stride) in self.dims.iter().zip(&self.strides).rev() {
            offset += (index % dim) * stride;
            index /= dim;
        }
        offset
    }
}

/// Row-major strides of a shape.
pub(crate) fn strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; dims.len()];
    for index in (0..dims.len().saturating_sub(1)).rev() {
        strides[index] = strides[index + 1] * dims[index + 1];
    }
    strides
}

/// Evaluates `f` at every index of `0..len`.
pub(crate) fn generate<T: Element>(len: usize, f: impl Fn(usize) -> T + Send + Sync) -> Vec<T> {
    #[cfg(not(feature = "rayon"))]
    let output = (0..len).map(f).collect();
    #[cfg(feature = "rayon")]
    let output = {
        use rayon::prelude::*;
        (0..len).into_par_iter().map(f).collect()
    };
    output
}

/// Stores `values` into `output` as `req` asks.
pub(crate) fn store<T: Element>(output: &TBlob, req: OpReq, values: Vec<T>) -> Result<(), OpError> {
    output.write(|y: &mut [T]| match req {
        OpReq::Null => {}
        OpReq::WriteTo | OpReq::WriteInplace => y.copy_from_slice(&values),
        OpReq::AddTo => y
            .iter_mut()
            .zip_eq(values)
            .for_each(|(y, x)| *y = *y + x),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Indexer, strides};

    #[test]
    fn test_indexer() {
        assert_eq!(strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(strides(&[]), Vec::<usize>::new());

        let indexer = Indexer::broadcast(&[3, 1], &[3, 2]);
        let offsets = (0..indexer.len()).map(|index| indexer.offset(index)).collect::<Vec<_>>();
        assert_eq!(offsets, vec![0, 0, 1, 1, 2, 2]);

        let indexer = Indexer::broadcast(&[1, 2], &[3, 2]);
        let offsets = (0..indexer.len()).map(|index| indexer.offset(index)).collect::<Vec<_>>();
        assert_eq!(offsets, vec![0, 1, 0, 1, 0, 1]);
    }
}
