use super::{generate, store};
use crate::{
    hal::ops::SampleUniformParam,
    loom::{
        num::{Element, dispatch_type},
        ops::{OpAttrs, OpContext, OpError, OpReq},
        tensor::TBlob,
    },
};

fn fill<T: Element>(output: &TBlob, req: OpReq, value: T) -> Result<(), OpError> {
    store(output, req, vec![value; output.shape().size()])
}

pub fn zeros(
    _attrs: &OpAttrs,
    _ctx: &OpContext,
    _inputs: &[TBlob],
    req: &[OpReq],
    outputs: &[TBlob],
) -> Result<(), OpError> {
    dispatch_type!(outputs[0].dtype(), T => fill::<T>(&outputs[0], req[0], T::ZERO))
}

pub fn ones(
    _attrs: &OpAttrs,
    _ctx: &OpContext,
    _inputs: &[TBlob],
    req: &[OpReq],
    outputs: &[TBlob],
) -> Result<(), OpError> {
    dispatch_type!(outputs[0].dtype(), T => fill::<T>(&outputs[0], req[0], T::ONE))
}

/// Draws from `[low, high)` with the first requested random resource.
pub fn random_uniform(
    attrs: &OpAttrs,
    ctx: &OpContext,
    _inputs: &[TBlob],
    req: &[OpReq],
    outputs: &[TBlob],
) -> Result<(), OpError> {
    fn sample<T: Element>(
        param: &SampleUniformParam,
        rng: &mut fastrand::Rng,
        req: OpReq,
        output: &TBlob,
    ) -> Result<(), OpError> {
        let (low, high) = (param.low, param.high);
        let draws: Vec<f64> = (0..output.shape().size()).map(|_| rng.f64()).collect();
        let values = generate(draws.len(), |index| {
            T::from_f64(low + (high - low) * draws[index])
        });
        store(output, req, values)
    }

    let param = attrs.params::<SampleUniformParam>()?;
    let random = ctx.resource(0)?;
    random.with_rng(|rng| {
        dispatch_type!(outputs[0].dtype(), T => sample::<T>(param, rng, req[0], &outputs[0]))
    })?
}
