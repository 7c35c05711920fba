use itertools::Itertools;

use super::{Indexer, generate, store};
use crate::{
    hal::shape::{binary_broadcast_shape_compact, broadcast_reduce_shape_compact},
    loom::{
        num::{Element, dispatch_type},
        ops::{OpAttrs, OpContext, OpError, OpReq},
        tensor::TBlob,
    },
};

/// An elementwise binary function.
pub trait Binary: 'static {
    fn apply<T: Element>(x: T, y: T) -> T;
}

pub struct Add;
pub struct Sub;
pub struct Mul;
pub struct Div;
pub struct Maximum;
pub struct Minimum;

impl Binary for Add {
    #[inline]
    fn apply<T: Element>(x: T, y: T) -> T {
        x + y
    }
}

impl Binary for Sub {
    #[inline]
    fn apply<T: Element>(x: T, y: T) -> T {
        x - y
    }
}

impl Binary for Mul {
    #[inline]
    fn apply<T: Element>(x: T, y: T) -> T {
        x * y
    }
}

impl Binary for Div {
    #[inline]
    fn apply<T: Element>(x: T, y: T) -> T {
        x / y
    }
}

impl Binary for Maximum {
    #[inline]
    fn apply<T: Element>(x: T, y: T) -> T {
        if y > x { y } else { x }
    }
}

impl Binary for Minimum {
    #[inline]
    fn apply<T: Element>(x: T, y: T) -> T {
        if y < x { y } else { x }
    }
}

/// Applies `B` to `lhs` and `rhs`, broadcasting both to the shape of `output`.
pub fn binary<B: Binary, T: Element>(
    lhs: &TBlob,
    rhs: &TBlob,
    req: OpReq,
    output: &TBlob,
) -> Result<(), OpError> {
    if req == OpReq::Null || output.shape().size() == 0 {
        return Ok(());
    }
    let x = lhs.to_vec::<T>()?;
    let y = rhs.to_vec::<T>()?;
    let values = match binary_broadcast_shape_compact(lhs.shape(), rhs.shape(), output.shape())? {
        None => x.into_iter().zip_eq(y).map(|(x, y)| B::apply(x, y)).collect(),
        Some((l, r, o)) => {
            let li = Indexer::broadcast(&l, &o);
            let ri = Indexer::broadcast(&r, &o);
            generate(o.size(), |index| {
                B::apply(x[li.offset(index)], y[ri.offset(index)])
            })
        }
    };
    store(output, req, values)
}

pub fn binary_broadcast<B: Binary>(
    _attrs: &OpAttrs,
    _ctx: &OpContext,
    inputs: &[TBlob],
    req: &[OpReq],
    outputs: &[TBlob],
) -> Result<(), OpError> {
    let dtype = outputs[0].dtype();
    dispatch_type!(dtype, T => binary::<B, T>(&inputs[0], &inputs[1], req[0], &outputs[0]))
}

/// Copies `input` into `output`, repeating it along the axes where it has size 1.
pub fn expand<T: Element>(input: &TBlob, req: OpReq, output: &TBlob) -> Result<(), OpError> {
    if req == OpReq::Null || output.shape().size() == 0 {
        return Ok(());
    }
    let (dst, src) = broadcast_reduce_shape_compact(output.shape(), input.shape())?;
    let x = input.to_vec::<T>()?;
    let indexer = Indexer::broadcast(&src, &dst);
    let values = generate(dst.size(), |index| x[indexer.offset(index)]);
    store(output, req, values)
}

/// Kernel of `broadcast_axis` and `broadcast_to`, whose output shape was already inferred.
pub fn broadcast(
    _attrs: &OpAttrs,
    _ctx: &OpContext,
    inputs: &[TBlob],
    req: &[OpReq],
    outputs: &[TBlob],
) -> Result<(), OpError> {
    dispatch_type!(inputs[0].dtype(), T => expand::<T>(&inputs[0], req[0], &outputs[0]))
}
