use itertools::Itertools;

use super::{Indexer, generate, store, strides};
use crate::{
    hal::{
        ops::{ReduceAxesParam, ReduceAxisParam},
        shape::{broadcast_reduce_shape_compact, reduce_axes_shape},
    },
    loom::{
        num::{Element, dispatch_type},
        ops::{OpAttrs, OpContext, OpError, OpReq},
        shape::Shape,
        tensor::TBlob,
    },
};

/// Folds the elements of one reduced run into a single value.
pub trait Reducer: 'static {
    fn identity<T: Element>() -> T;

    fn reduce<T: Element>(acc: T, x: T) -> T;

    /// Post-processes the folded value of `count` elements.
    #[inline]
    fn finalize<T: Element>(acc: T, _count: usize) -> T {
        acc
    }
}

pub struct Sum;
pub struct Mean;
pub struct Max;
pub struct Min;
pub struct Prod;

impl Reducer for Sum {
    #[inline]
    fn identity<T: Element>() -> T {
        T::ZERO
    }

    #[inline]
    fn reduce<T: Element>(acc: T, x: T) -> T {
        acc + x
    }
}

impl Reducer for Mean {
    #[inline]
    fn identity<T: Element>() -> T {
        T::ZERO
    }

    #[inline]
    fn reduce<T: Element>(acc: T, x: T) -> T {
        acc + x
    }

    #[inline]
    fn finalize<T: Element>(acc: T, count: usize) -> T {
        T::from_f64(acc.to_f64() / count as f64)
    }
}

impl Reducer for Max {
    #[inline]
    fn identity<T: Element>() -> T {
        T::MIN
    }

    #[inline]
    fn reduce<T: Element>(acc: T, x: T) -> T {
        if x > acc { x } else { acc }
    }
}

impl Reducer for Min {
    #[inline]
    fn identity<T: Element>() -> T {
        T::MAX
    }

    #[inline]
    fn reduce<T: Element>(acc: T, x: T) -> T {
        if x < acc { x } else { acc }
    }
}

impl Reducer for Prod {
    #[inline]
    fn identity<T: Element>() -> T {
        T::ONE
    }

    #[inline]
    fn reduce<T: Element>(acc: T, x: T) -> T {
        acc * x
    }
}

/// Reduces `input` into `output`, whose shape with reduced axes kept is `small`.
pub fn reduce<R: Reducer, T: Element>(
    input: &TBlob,
    small: &Shape,
    req: OpReq,
    output: &TBlob,
) -> Result<(), OpError> {
    if req == OpReq::Null || output.shape().size() == 0 {
        return Ok(());
    }
    let (src, dst) = broadcast_reduce_shape_compact(input.shape(), small)?;
    let x = input.to_vec::<T>()?;

    let src_strides = strides(&src);
    let kept = Indexer::new(&dst, src_strides.clone());
    let reduced = src
        .iter()
        .zip_eq(dst.iter())
        .map(|(&s, &d)| if s == d { 1 } else { s })
        .collect_vec();
    let reduced = Indexer::new(&reduced, src_strides);
    let count = reduced.len();

    let values = generate(kept.len(), |index| {
        let base = kept.offset(index);
        let acc = (0..count)
            .map(|index| x[base + reduced.offset(index)])
            .fold(R::identity::<T>(), R::reduce::<T>);
        R::finalize(acc, count)
    });
    store(output, req, values)
}

/// Reduces the input over the axes of [`ReduceAxesParam`].
pub fn reduce_axes<R: Reducer>(
    attrs: &OpAttrs,
    _ctx: &OpContext,
    inputs: &[TBlob],
    req: &[OpReq],
    outputs: &[TBlob],
) -> Result<(), OpError> {
    let param = attrs.params::<ReduceAxesParam>()?;
    let small = reduce_axes_shape(inputs[0].shape(), &param.axis, true, param.exclude)?;
    dispatch_type!(inputs[0].dtype(), T => reduce::<R, T>(&inputs[0], &small, req[0], &outputs[0]))
}

/// Global L2 norm of the input.
pub fn l2_norm(
    _attrs: &OpAttrs,
    _ctx: &OpContext,
    inputs: &[TBlob],
    req: &[OpReq],
    outputs: &[TBlob],
) -> Result<(), OpError> {
    fn norm<T: Element>(input: &TBlob, req: OpReq, output: &TBlob) -> Result<(), OpError> {
        let x = input.to_vec::<T>()?;
        let sum: f64 = x.iter().map(|x| x.to_f64() * x.to_f64()).sum();
        store(output, req, vec![T::from_f64(sum.sqrt())])
    }
    dispatch_type!(inputs[0].dtype(), T => norm::<T>(&inputs[0], req[0], &outputs[0]))
}

/// Picks the index of the best element along an axis.
pub trait Search: 'static {
    /// Returns `true` if `x` beats `best`.
    fn better<T: Element>(x: T, best: T) -> bool;
}

pub struct ArgMax;
pub struct ArgMin;

impl Search for ArgMax {
    #[inline]
    fn better<T: Element>(x: T, best: T) -> bool {
        x > best
    }
}

impl Search for ArgMin {
    #[inline]
    fn better<T: Element>(x: T, best: T) -> bool {
        x < best
    }
}

/// Writes the index of the first best element of every `(outer, axis, inner)` lane.
///
/// An empty lane yields index 0.
pub fn search<S: Search, T: Element>(
    input: &TBlob,
    (outer, len, inner): (usize, usize, usize),
    req: OpReq,
    output: &TBlob,
) -> Result<(), OpError> {
    if req == OpReq::Null {
        return Ok(());
    }
    let x = input.to_vec::<T>()?;
    let values = generate(outer * inner, |index| {
        let (o, i) = (index / inner, index % inner);
        let lane = |k: usize| x[(o * len + k) * inner + i];
        let best = (1..len).fold(0, |best, k| match S::better(lane(k), lane(best)) {
            true => k,
            false => best,
        });
        T::from_f64(best as f64)
    });
    store(output, req, values)
}

/// Searches the input along the axis of [`ReduceAxisParam`], or over the flattened input.
pub fn search_axis<S: Search>(
    attrs: &OpAttrs,
    _ctx: &OpContext,
    inputs: &[TBlob],
    req: &[OpReq],
    outputs: &[TBlob],
) -> Result<(), OpError> {
    let param = attrs.params::<ReduceAxisParam>()?;
    let shape = inputs[0].shape();
    let lanes = match param.axis {
        Some(axis) => {
            let outer = shape[..axis].iter().product();
            let inner = shape[axis + 1..].iter().product();
            (outer, shape[axis], inner)
        }
        None => (1, shape.size(), 1),
    };
    dispatch_type!(inputs[0].dtype(), T => search::<S, T>(&inputs[0], lanes, req[0], &outputs[0]))
}
