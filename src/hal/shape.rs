//! Shape algebra of reductions and broadcasts.
//!
//! The inference functions compute output shapes from user-facing shapes of any rank. The
//! compaction functions merge runs of axes that behave alike, so that kernels only ever see
//! shapes of rank 2 or [`MAX_NDIM`].

use itertools::Itertools;

use crate::loom::shape::{MAX_NDIM, Shape, ShapeError};

/// Size of axis `index` of `shape` after left-padding it with `pad` axes of size 1.
#[inline]
fn padded(shape: &Shape, pad: usize, index: usize) -> usize {
    match index.checked_sub(pad) {
        Some(index) => shape[index],
        None => 1,
    }
}

/// Output shape of reducing `shape` over `axes`.
///
/// `axes` must be sorted and unique. With `exclude`, `axes` names the axes to keep instead.
/// An empty axis set reduces every axis, or none of them with `exclude`.
pub fn reduce_axes_shape(
    shape: &Shape,
    axes: &[usize],
    keepdims: bool,
    exclude: bool,
) -> Result<Shape, ShapeError> {
    if axes.iter().tuple_windows().any(|(x, y)| x >= y) {
        return Err(ShapeError::AxesUnsorted(axes.into()));
    }
    if let Some(&axis) = axes.iter().find(|&&axis| axis >= shape.ndim()) {
        return Err(ShapeError::AxisOutOfRange {
            axis,
            shape: shape.clone(),
        });
    }

    let reduced = |axis: usize| match axes.is_empty() {
        true => !exclude,
        false => axes.binary_search(&axis).is_ok() != exclude,
    };
    let dims = shape.iter().enumerate();
    let dims = match keepdims {
        true => dims
            .map(|(axis, &dim)| if reduced(axis) { 1 } else { dim })
            .collect_vec(),
        false => dims
            .filter(|&(axis, _)| !reduced(axis))
            .map(|(_, &dim)| dim)
            .collect_vec(),
    };
    match dims.is_empty() {
        true => Ok(Shape::from([1])),
        false => Ok(Shape::from(dims)),
    }
}

/// Output shape of reducing `shape` over a single axis, or over all axes if `axis` is `None`.
pub fn reduce_axis_shape(
    shape: &Shape,
    axis: Option<usize>,
    keepdims: bool,
) -> Result<Shape, ShapeError> {
    match axis {
        Some(axis) => reduce_axes_shape(shape, &[axis], keepdims, false),
        None => reduce_axes_shape(shape, &[], keepdims, false),
    }
}

/// Output shape of expanding the size-1 `axes` of `shape` to `sizes`.
pub fn broadcast_axes_shape(
    shape: &Shape,
    axes: &[usize],
    sizes: &[usize],
) -> Result<Shape, ShapeError> {
    if axes.len() != sizes.len() {
        return Err(ShapeError::BroadcastParam(axes.into(), sizes.into()));
    }
    let mut dims = shape.to_vec();
    for (&axis, &size) in axes.iter().zip_eq(sizes) {
        match dims.get_mut(axis) {
            Some(dim) if *dim == 1 => *dim = size,
            Some(_) => {
                return Err(ShapeError::BroadcastAxis {
                    axis,
                    shape: shape.clone(),
                });
            }
            None => {
                return Err(ShapeError::AxisOutOfRange {
                    axis,
                    shape: shape.clone(),
                });
            }
        }
    }
    Ok(dims.into())
}

/// Output shape of broadcasting `shape` to `target`. A target size of 0 keeps the source size.
pub fn broadcast_to_shape(shape: &Shape, target: &Shape) -> Result<Shape, ShapeError> {
    let err = || ShapeError::BroadcastTo(shape.clone(), target.clone());
    if shape.ndim() != target.ndim() {
        return Err(err());
    }
    shape
        .iter()
        .zip_eq(target.iter())
        .map(|(&dim, &size)| match (dim, size) {
            (dim, 0) => Ok(dim),
            (dim, size) if dim == size || dim == 1 => Ok(size),
            _ => Err(err()),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Shape::from)
}

/// Output shape of an elementwise op broadcasting `lhs` against `rhs`.
///
/// Shapes are aligned on their trailing axes. An axis of size 1 stretches to the other side;
/// in particular a size-0 axis only broadcasts against 1 or 0.
pub fn binary_broadcast_shape(lhs: &Shape, rhs: &Shape) -> Result<Shape, ShapeError> {
    if lhs == rhs {
        return Ok(lhs.clone());
    }
    let ndim = lhs.ndim().max(rhs.ndim());
    let (bl, br) = (ndim - lhs.ndim(), ndim - rhs.ndim());
    (0..ndim)
        .map(|index| {
            let l = padded(lhs, bl, index);
            let r = padded(rhs, br, index);
            match (l, r) {
                (l, r) if l == r => Ok(l),
                (1, r) => Ok(r),
                (l, 1) => Ok(l),
                _ => Err(ShapeError::Incompatible(lhs.clone(), rhs.clone())),
            }
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Shape::from)
}

/// Pads every merged shape with 1s to rank 2 or [`MAX_NDIM`].
fn pad_compact<const N: usize>(
    dims: [Vec<usize>; N],
    err: impl FnOnce() -> ShapeError,
) -> Result<[Shape; N], ShapeError> {
    let ndim = match dims[0].len() {
        0..=2 => 2,
        3..=MAX_NDIM => MAX_NDIM,
        _ => return Err(err()),
    };
    Ok(dims.map(|mut dims| {
        dims.resize(ndim, 1);
        Shape::from(dims)
    }))
}

/// Compacts a reduction from `big` into `small`, or a broadcast from `small` into `big`.
///
/// Both shapes have the same rank, and every axis of `small` either equals the one of `big` or
/// is 1. Returns the merged `(big, small)` pair, which has the same sizes and describes the same
/// reduction.
pub fn broadcast_reduce_shape_compact(
    big: &Shape,
    small: &Shape,
) -> Result<(Shape, Shape), ShapeError> {
    if big.ndim() != small.ndim() {
        return Err(ShapeError::Incompatible(big.clone(), small.clone()));
    }

    let mut new_big = vec![];
    let mut new_small = vec![];
    if small.size() == 1 {
        new_big.push(big.size());
        new_small.push(1);
    } else if big.size() == 0 {
        // nothing to read: reduce an empty axis into each element of `small`
        new_big.extend([small.size(), 0]);
        new_small.extend([small.size(), 1]);
    } else {
        let (mut bprod, mut sprod) = (1, 1);
        for (&b, &s) in big.iter().zip_eq(small.iter()) {
            let reduced = b != s;
            if (reduced && sprod > 1) || (!reduced && bprod != sprod) {
                new_big.push(bprod);
                new_small.push(sprod);
                (bprod, sprod) = (1, 1);
            }
            bprod *= b;
            if !reduced {
                sprod *= b;
            }
        }
        if bprod > 1 || sprod > 1 {
            new_big.push(bprod);
            new_small.push(sprod);
        }
    }

    let err = || ShapeError::TooManyAxes(big.clone(), small.clone());
    let [big, small] = pad_compact([new_big, new_small], err)?;
    Ok((big, small))
}

/// Compacts an elementwise op broadcasting `lhs` and `rhs` into `out`.
///
/// Returns `None` if both operands have the same shape and no broadcast is needed. Otherwise
/// returns the merged `(lhs, rhs, out)` triple, all of the same rank.
pub fn binary_broadcast_shape_compact(
    lhs: &Shape,
    rhs: &Shape,
    out: &Shape,
) -> Result<Option<(Shape, Shape, Shape)>, ShapeError> {
    if lhs == rhs {
        return Ok(None);
    }
    if out.ndim() < lhs.ndim().max(rhs.ndim()) {
        return Err(ShapeError::Incompatible(lhs.clone(), rhs.clone()));
    }
    if out.size() == 0 {
        let empty = |shape: &Shape| match shape.size() {
            0 => Shape::from([0, 1]),
            _ => Shape::from([1, 1]),
        };
        return Ok(Some((empty(lhs), empty(rhs), Shape::from([0, 1]))));
    }

    let ndim = out.ndim();
    let (bl, br) = (ndim - lhs.ndim(), ndim - rhs.ndim());
    let mut new_lhs = vec![];
    let mut new_rhs = vec![];
    let mut new_out = vec![];
    let (mut lprod, mut rprod, mut oprod) = (1, 1, 1);
    for (index, &o) in out.iter().enumerate() {
        let l = padded(lhs, bl, index);
        let r = padded(rhs, br, index);
        if (lprod != rprod || l != r) && lprod * l > 1 && rprod * r > 1 {
            new_lhs.push(lprod);
            new_rhs.push(rprod);
            new_out.push(oprod);
            (lprod, rprod, oprod) = (1, 1, 1);
        }
        lprod *= l;
        rprod *= r;
        oprod *= o;
    }
    if lprod > 1 || rprod > 1 {
        new_lhs.push(lprod);
        new_rhs.push(rprod);
        new_out.push(oprod);
    }

    let err = || ShapeError::TooManyAxes(lhs.clone(), rhs.clone());
    let [lhs, rhs, out] = pad_compact([new_lhs, new_rhs, new_out], err)?;
    Ok(Some((lhs, rhs, out)))
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use super::{
        binary_broadcast_shape, binary_broadcast_shape_compact, broadcast_axes_shape,
        broadcast_reduce_shape_compact, broadcast_to_shape, reduce_axes_shape, reduce_axis_shape,
    };
    use crate::loom::shape::{MAX_NDIM, Shape, ShapeError};

    #[test]
    fn test_binary_broadcast_shape() -> Result<(), Box<dyn Error>> {
        let shape = binary_broadcast_shape(&[3, 1, 5].into(), &[1, 4, 5].into())?;
        assert_eq!(shape, Shape::from([3, 4, 5]));

        let err = binary_broadcast_shape(&[3, 4].into(), &[5].into()).unwrap_err();
        assert!(matches!(err, ShapeError::Incompatible(..)));

        let shape = binary_broadcast_shape(&[2, 3, 4].into(), &[4].into())?;
        assert_eq!(shape, Shape::from([2, 3, 4]));

        // size 0 only broadcasts against 1 or 0
        let shape = binary_broadcast_shape(&[0, 3].into(), &[1, 3].into())?;
        assert_eq!(shape, Shape::from([0, 3]));
        let shape = binary_broadcast_shape(&[0].into(), &[2, 1].into())?;
        assert_eq!(shape, Shape::from([2, 0]));
        assert!(binary_broadcast_shape(&[0, 3].into(), &[2, 3].into()).is_err());
        Ok(())
    }

    #[test]
    fn test_reduce_shape() -> Result<(), Box<dyn Error>> {
        let shape = Shape::from([2, 3, 4]);
        assert_eq!(reduce_axes_shape(&shape, &[1], false, false)?, Shape::from([2, 4]));
        assert_eq!(reduce_axes_shape(&shape, &[1], true, false)?, Shape::from([2, 1, 4]));
        assert_eq!(reduce_axes_shape(&shape, &[], false, false)?, Shape::from([1]));
        assert_eq!(reduce_axes_shape(&shape, &[], true, false)?, Shape::from([1, 1, 1]));
        assert_eq!(reduce_axes_shape(&shape, &[0, 2], false, false)?, Shape::from([3]));
        assert_eq!(reduce_axes_shape(&shape, &[0, 1, 2], false, false)?, Shape::from([1]));
        assert_eq!(reduce_axes_shape(&shape, &[1], false, true)?, Shape::from([3]));
        assert_eq!(reduce_axes_shape(&shape, &[], false, true)?, shape);

        let err = reduce_axes_shape(&shape, &[3], false, false).unwrap_err();
        assert!(matches!(err, ShapeError::AxisOutOfRange { axis: 3, .. }));
        let err = reduce_axes_shape(&shape, &[2, 1], false, false).unwrap_err();
        assert!(matches!(err, ShapeError::AxesUnsorted(..)));
        let err = reduce_axes_shape(&shape, &[1, 1], true, false).unwrap_err();
        assert!(matches!(err, ShapeError::AxesUnsorted(..)));

        assert_eq!(reduce_axis_shape(&shape, Some(2), false)?, Shape::from([2, 3]));
        assert_eq!(reduce_axis_shape(&shape, None, true)?, Shape::from([1, 1, 1]));
        assert_eq!(reduce_axis_shape(&[5].into(), Some(0), false)?, Shape::from([1]));
        Ok(())
    }

    #[test]
    fn test_broadcast_shape() -> Result<(), Box<dyn Error>> {
        let shape = Shape::from([2, 1, 1]);
        assert_eq!(broadcast_axes_shape(&shape, &[1, 2], &[3, 4])?, Shape::from([2, 3, 4]));
        assert_eq!(broadcast_axes_shape(&shape, &[], &[])?, shape);
        assert!(matches!(
            broadcast_axes_shape(&shape, &[0], &[3]),
            Err(ShapeError::BroadcastAxis { axis: 0, .. })
        ));
        assert!(matches!(
            broadcast_axes_shape(&shape, &[1], &[3, 4]),
            Err(ShapeError::BroadcastParam(..))
        ));
        assert!(matches!(
            broadcast_axes_shape(&shape, &[3], &[3]),
            Err(ShapeError::AxisOutOfRange { axis: 3, .. })
        ));

        assert_eq!(broadcast_to_shape(&shape, &[2, 3, 4].into())?, Shape::from([2, 3, 4]));
        assert_eq!(broadcast_to_shape(&shape, &[0, 3, 0].into())?, Shape::from([2, 3, 1]));
        assert!(matches!(
            broadcast_to_shape(&shape, &[3, 3, 4].into()),
            Err(ShapeError::BroadcastTo(..))
        ));
        assert!(matches!(
            broadcast_to_shape(&shape, &[3, 4].into()),
            Err(ShapeError::BroadcastTo(..))
        ));
        Ok(())
    }

    #[test]
    fn test_reduce_compact() -> Result<(), Box<dyn Error>> {
        let (big, small) = broadcast_reduce_shape_compact(&[2, 3, 4].into(), &[2, 1, 4].into())?;
        assert_eq!(big, Shape::from([2, 3, 4, 1, 1]));
        assert_eq!(small, Shape::from([2, 1, 4, 1, 1]));

        let (big, small) = broadcast_reduce_shape_compact(&[2, 3, 4].into(), &[1, 1, 4].into())?;
        assert_eq!(big, Shape::from([6, 4]));
        assert_eq!(small, Shape::from([1, 4]));

        let (big, small) = broadcast_reduce_shape_compact(&[2, 3, 4].into(), &[1, 1, 1].into())?;
        assert_eq!(big, Shape::from([24, 1]));
        assert_eq!(small, Shape::from([1, 1]));

        let (big, small) = broadcast_reduce_shape_compact(&[2, 3, 4].into(), &[2, 3, 4].into())?;
        assert_eq!(big, Shape::from([24, 1]));
        assert_eq!(small, Shape::from([24, 1]));

        let big = Shape::from([2, 2, 2, 2, 2, 2]);
        let small = Shape::from([2, 1, 2, 1, 2, 1]);
        let err = broadcast_reduce_shape_compact(&big, &small).unwrap_err();
        assert!(matches!(err, ShapeError::TooManyAxes(..)));
        Ok(())
    }

    #[test]
    fn test_reduce_compact_empty() -> Result<(), Box<dyn Error>> {
        let (big, small) = broadcast_reduce_shape_compact(&[3, 0].into(), &[3, 1].into())?;
        assert_eq!(big, Shape::from([3, 0]));
        assert_eq!(small, Shape::from([3, 1]));

        let (big, small) = broadcast_reduce_shape_compact(&[0, 4].into(), &[1, 1].into())?;
        assert_eq!(big, Shape::from([0, 1]));
        assert_eq!(small, Shape::from([1, 1]));

        let (big, small) = broadcast_reduce_shape_compact(&[2, 0, 3].into(), &[2, 1, 3].into())?;
        assert_eq!(big.size(), 0);
        assert_eq!(small.size(), 6);
        Ok(())
    }

    /// Checks that compacting random reductions keeps every size and the broadcast invariant.
    #[test]
    fn test_reduce_compact_random() -> Result<(), Box<dyn Error>> {
        let mut rng = fastrand::Rng::with_seed(42);
        for _ in 0..500 {
            let ndim = rng.usize(1..=MAX_NDIM);
            let big = (0..ndim).map(|_| rng.usize(1..=4)).collect_vec();
            let small = big
                .iter()
                .map(|&dim| if rng.bool() { 1 } else { dim })
                .collect_vec();
            let (big, small) = (Shape::from(big), Shape::from(small));

            let (new_big, new_small) = broadcast_reduce_shape_compact(&big, &small)?;
            assert!(new_big.ndim() == 2 || new_big.ndim() == MAX_NDIM);
            assert_eq!(new_big.ndim(), new_small.ndim());
            assert_eq!(new_big.size(), big.size());
            assert_eq!(new_small.size(), small.size());
            for (&b, &s) in new_big.iter().zip(new_small.iter()) {
                assert!(b == s || s == 1, "{big} {small} -> {new_big} {new_small}");
            }
        }
        Ok(())
    }

    #[test]
    fn test_binary_compact() -> Result<(), Box<dyn Error>> {
        let lhs = Shape::from([3, 1, 5]);
        let rhs = Shape::from([1, 4, 5]);
        let out = Shape::from([3, 4, 5]);
        let (l, r, o) = binary_broadcast_shape_compact(&lhs, &rhs, &out)?.ok_or("no broadcast")?;
        assert_eq!(l, Shape::from([3, 1, 5, 1, 1]));
        assert_eq!(r, Shape::from([1, 4, 5, 1, 1]));
        assert_eq!(o, Shape::from([3, 4, 5, 1, 1]));

        let lhs = Shape::from([2, 3, 4]);
        let rhs = Shape::from([4]);
        let (l, r, o) = binary_broadcast_shape_compact(&lhs, &rhs, &lhs)?.ok_or("no broadcast")?;
        assert_eq!(l, Shape::from([6, 4]));
        assert_eq!(r, Shape::from([1, 4]));
        assert_eq!(o, Shape::from([6, 4]));

        assert!(binary_broadcast_shape_compact(&lhs, &lhs, &lhs)?.is_none());

        let lhs = Shape::from([0, 3]);
        let rhs = Shape::from([1, 3]);
        let (l, r, o) = binary_broadcast_shape_compact(&lhs, &rhs, &lhs)?.ok_or("no broadcast")?;
        assert_eq!(l, Shape::from([0, 1]));
        assert_eq!(r, Shape::from([1, 1]));
        assert_eq!(o, Shape::from([0, 1]));

        let lhs = Shape::from([2, 1, 2, 1, 2, 1]);
        let rhs = Shape::from([1, 2, 1, 2, 1, 2]);
        let out = Shape::filled(6, 2);
        let err = binary_broadcast_shape_compact(&lhs, &rhs, &out).unwrap_err();
        assert!(matches!(err, ShapeError::TooManyAxes(..)));
        Ok(())
    }

    /// Checks that compacting random binary broadcasts keeps sizes and stays broadcastable.
    #[test]
    fn test_binary_compact_random() -> Result<(), Box<dyn Error>> {
        let mut rng = fastrand::Rng::with_seed(7);
        for _ in 0..500 {
            let ndim = rng.usize(1..=MAX_NDIM);
            let out = (0..ndim).map(|_| rng.usize(1..=3)).collect_vec();
            let mut operand = || {
                let skip = rng.usize(0..ndim);
                out[skip..]
                    .iter()
                    .map(|&dim| if rng.bool() { 1 } else { dim })
                    .collect_vec()
            };
            let (lhs, rhs) = (Shape::from(operand()), Shape::from(operand()));
            let out = binary_broadcast_shape(&lhs, &rhs)?;

            let Some((l, r, o)) = binary_broadcast_shape_compact(&lhs, &rhs, &out)? else {
                assert_eq!(lhs, rhs);
                continue;
            };
            assert!(o.ndim() == 2 || o.ndim() == MAX_NDIM);
            assert_eq!((l.size(), r.size(), o.size()), (lhs.size(), rhs.size(), out.size()));
            for ((&l, &r), &o) in l.iter().zip(r.iter()).zip(o.iter()) {
                assert!(l == o || l == 1, "{lhs} {rhs} -> {l} {o}");
                assert!(r == o || r == 1, "{lhs} {rhs} -> {r} {o}");
            }
        }
        Ok(())
    }
}
