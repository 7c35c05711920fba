//! Definitions of the built-in operators.

use std::{any::Any, sync::Arc};

use itertools::Itertools;
use weft_derive::Params;

use super::{
    cpu::{
        broadcast::{self, Add, Binary, Div, Maximum, Minimum, Mul, Sub},
        init,
        reduce::{self, ArgMax, ArgMin, Max, Mean, Min, Prod, Reducer, Search, Sum},
    },
    shape::{
        binary_broadcast_shape, binary_broadcast_shape_compact, broadcast_axes_shape,
        broadcast_reduce_shape_compact, broadcast_to_shape, reduce_axes_shape, reduce_axis_shape,
    },
};
use crate::loom::{
    context::{Context, Device},
    num::DataType,
    ops::{OpAttrs, OpDef, OpError, Registry, assign_shape, assign_type, elemwise_type},
    params::{ParamDict, ParamError, Params},
    resource::ResourceRequest,
    shape::Shape,
};

/// Reduction over a set of axes.
#[derive(Debug, Clone, Params)]
#[params(crate = "crate")]
pub struct ReduceAxesParam {
    /// Axes to reduce. Empty reduces every axis.
    #[param(default = "()")]
    pub axis: Shape,
    #[param(default = "false")]
    pub keepdims: bool,
    /// Reduce every axis except the ones named.
    #[param(default = "false")]
    pub exclude: bool,
}

impl ReduceAxesParam {
    /// Parses the parameters, sorting the axes.
    pub fn parse(dict: &ParamDict) -> Result<Arc<dyn Any + Send + Sync>, ParamError> {
        let mut param = Self::from_dict(dict)?;
        param.axis = param.axis.iter().copied().sorted_unstable().collect_vec().into();
        Ok(Arc::new(param))
    }
}

/// Reduction over a single axis. Without an axis the input is flattened.
#[derive(Debug, Clone, Params)]
#[params(crate = "crate")]
pub struct ReduceAxisParam {
    pub axis: Option<usize>,
    #[param(default = "false")]
    pub keepdims: bool,
}

#[derive(Debug, Clone, Params)]
#[params(crate = "crate")]
pub struct BroadcastAxesParam {
    #[param(default = "()")]
    pub axis: Shape,
    #[param(default = "()")]
    pub size: Shape,
}

#[derive(Debug, Clone, Params)]
#[params(crate = "crate")]
pub struct BroadcastToParam {
    /// Target shape. A size of 0 keeps the size of the input.
    pub shape: Shape,
}

#[derive(Debug, Clone, Params)]
#[params(crate = "crate")]
pub struct InitParam {
    pub shape: Shape,
    pub ctx: Option<Context>,
    #[param(default = "float32")]
    pub dtype: DataType,
}

#[derive(Debug, Clone, Params)]
#[params(crate = "crate")]
pub struct SampleUniformParam {
    #[param(default = "0.0")]
    pub low: f64,
    #[param(default = "1.0")]
    pub high: f64,
    pub shape: Shape,
    pub ctx: Option<Context>,
    #[param(default = "float32")]
    pub dtype: DataType,
}

fn reduce_axes_infer_shape(
    attrs: &OpAttrs,
    inputs: &mut [Shape],
    outputs: &mut [Shape],
) -> Result<bool, OpError> {
    if inputs[0].is_unknown() {
        return Ok(false);
    }
    let param = attrs.params::<ReduceAxesParam>()?;
    let shape = reduce_axes_shape(&inputs[0], &param.axis, param.keepdims, param.exclude)?;
    let small = reduce_axes_shape(&inputs[0], &param.axis, true, param.exclude)?;
    broadcast_reduce_shape_compact(&inputs[0], &small)?;
    assign_shape(outputs, 0, shape)?;
    Ok(true)
}

fn reduce_axis_infer_shape(
    attrs: &OpAttrs,
    inputs: &mut [Shape],
    outputs: &mut [Shape],
) -> Result<bool, OpError> {
    if inputs[0].is_unknown() {
        return Ok(false);
    }
    let param = attrs.params::<ReduceAxisParam>()?;
    let shape = reduce_axis_shape(&inputs[0], param.axis, param.keepdims)?;
    assign_shape(outputs, 0, shape)?;
    Ok(true)
}

fn norm_infer_shape(
    _attrs: &OpAttrs,
    inputs: &mut [Shape],
    outputs: &mut [Shape],
) -> Result<bool, OpError> {
    assign_shape(outputs, 0, Shape::from([1]))?;
    Ok(!inputs[0].is_unknown())
}

fn broadcast_axes_infer_shape(
    attrs: &OpAttrs,
    inputs: &mut [Shape],
    outputs: &mut [Shape],
) -> Result<bool, OpError> {
    if inputs[0].is_unknown() {
        return Ok(false);
    }
    let param = attrs.params::<BroadcastAxesParam>()?;
    let shape = broadcast_axes_shape(&inputs[0], &param.axis, &param.size)?;
    broadcast_reduce_shape_compact(&shape, &inputs[0])?;
    assign_shape(outputs, 0, shape)?;
    Ok(true)
}

fn broadcast_to_infer_shape(
    attrs: &OpAttrs,
    inputs: &mut [Shape],
    outputs: &mut [Shape],
) -> Result<bool, OpError> {
    if inputs[0].is_unknown() {
        return Ok(false);
    }
    let param = attrs.params::<BroadcastToParam>()?;
    let shape = broadcast_to_shape(&inputs[0], &param.shape)?;
    broadcast_reduce_shape_compact(&shape, &inputs[0])?;
    assign_shape(outputs, 0, shape)?;
    Ok(true)
}

fn binary_broadcast_infer_shape(
    _attrs: &OpAttrs,
    inputs: &mut [Shape],
    outputs: &mut [Shape],
) -> Result<bool, OpError> {
    if inputs.iter().any(Shape::is_unknown) {
        return Ok(false);
    }
    let shape = binary_broadcast_shape(&inputs[0], &inputs[1])?;
    binary_broadcast_shape_compact(&inputs[0], &inputs[1], &shape)?;
    assign_shape(outputs, 0, shape)?;
    Ok(true)
}

fn init_infer_shape(
    attrs: &OpAttrs,
    _inputs: &mut [Shape],
    outputs: &mut [Shape],
) -> Result<bool, OpError> {
    let shape = match attrs.params::<InitParam>() {
        Ok(param) => param.shape.clone(),
        Err(_) => attrs.params::<SampleUniformParam>()?.shape.clone(),
    };
    assign_shape(outputs, 0, shape)?;
    Ok(!outputs[0].is_unknown())
}

fn init_infer_type(
    attrs: &OpAttrs,
    _inputs: &mut [Option<DataType>],
    outputs: &mut [Option<DataType>],
) -> Result<bool, OpError> {
    let dtype = match attrs.params::<InitParam>() {
        Ok(param) => param.dtype,
        Err(_) => attrs.params::<SampleUniformParam>()?.dtype,
    };
    assign_type(outputs, 0, dtype)?;
    Ok(true)
}

fn reduce_axes_op<R: Reducer>(name: &str) -> OpDef {
    OpDef::new(name)
        .parser(ReduceAxesParam::parse)
        .infer_shape(reduce_axes_infer_shape)
        .infer_type(elemwise_type)
        .compute(Device::Cpu, reduce::reduce_axes::<R>)
}

fn search_axis_op<S: Search>(name: &str) -> OpDef {
    OpDef::new(name)
        .params::<ReduceAxisParam>()
        .infer_shape(reduce_axis_infer_shape)
        .infer_type(elemwise_type)
        .compute(Device::Cpu, reduce::search_axis::<S>)
}

fn binary_broadcast_op<B: Binary>(name: &str) -> OpDef {
    OpDef::new(name)
        .num_inputs(2)
        .infer_shape(binary_broadcast_infer_shape)
        .infer_type(elemwise_type)
        .compute(Device::Cpu, broadcast::binary_broadcast::<B>)
}

impl Registry {
    /// A registry holding every built-in operator.
    pub fn with_builtins() -> Self {
        Self::new()
            .register(reduce_axes_op::<Sum>("sum"))
            .register(reduce_axes_op::<Mean>("mean"))
            .register(reduce_axes_op::<Max>("max"))
            .register(reduce_axes_op::<Min>("min"))
            .register(reduce_axes_op::<Prod>("prod"))
            .register(search_axis_op::<ArgMax>("argmax"))
            .register(search_axis_op::<ArgMin>("argmin"))
            .register(
                OpDef::new("norm")
                    .infer_shape(norm_infer_shape)
                    .infer_type(elemwise_type)
                    .compute(Device::Cpu, reduce::l2_norm),
            )
            .register(
                OpDef::new("broadcast_axis")
                    .params::<BroadcastAxesParam>()
                    .infer_shape(broadcast_axes_infer_shape)
                    .infer_type(elemwise_type)
                    .compute(Device::Cpu, broadcast::broadcast),
            )
            .register(
                OpDef::new("broadcast_to")
                    .params::<BroadcastToParam>()
                    .infer_shape(broadcast_to_infer_shape)
                    .infer_type(elemwise_type)
                    .compute(Device::Cpu, broadcast::broadcast),
            )
            .register(binary_broadcast_op::<Add>("broadcast_add"))
            .register(binary_broadcast_op::<Sub>("broadcast_sub"))
            .register(binary_broadcast_op::<Mul>("broadcast_mul"))
            .register(binary_broadcast_op::<Div>("broadcast_div"))
            .register(binary_broadcast_op::<Maximum>("broadcast_maximum"))
            .register(binary_broadcast_op::<Minimum>("broadcast_minimum"))
            .register(
                OpDef::new("_zeros")
                    .params::<InitParam>()
                    .num_inputs(0)
                    .infer_shape(init_infer_shape)
                    .infer_type(init_infer_type)
                    .compute(Device::Cpu, init::zeros),
            )
            .register(
                OpDef::new("_ones")
                    .params::<InitParam>()
                    .num_inputs(0)
                    .infer_shape(init_infer_shape)
                    .infer_type(init_infer_type)
                    .compute(Device::Cpu, init::ones),
            )
            .register(
                OpDef::new("_random_uniform")
                    .params::<SampleUniformParam>()
                    .num_inputs(0)
                    .infer_shape(init_infer_shape)
                    .infer_type(init_infer_type)
                    .resource_request(|_| vec![ResourceRequest::Random])
                    .compute(Device::Cpu, init::random_uniform),
            )
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use crate::loom::{
        context::Context,
        engine::{EngineBuilder, EngineKind},
        num::DataType,
        ops::{OpError, Registry},
        runtime::{InvokeError, Runtime, RuntimeBuilder},
        shape::{Shape, ShapeError},
        tensor::NdArray,
    };

    fn runtime() -> Runtime {
        RuntimeBuilder::new()
            .engine(EngineBuilder::new().cpu_workers(2))
            .registry(Registry::with_builtins())
            .build()
    }

    fn iota(shape: impl Into<Shape>) -> Result<NdArray, Box<dyn Error>> {
        let shape = shape.into();
        let data = (0..shape.size()).map(|x| x as f32).collect();
        Ok(NdArray::from_vec(shape, Context::cpu(), data)?)
    }

    #[tokio::test]
    async fn test_reductions() -> Result<(), Box<dyn Error>> {
        let runtime = runtime();
        let x = iota([2, 3])?;

        let y = runtime.invoke("sum", &[x.clone()], &[])?;
        assert_eq!(y[0].shape(), Shape::from([1]));
        assert_eq!(runtime.read::<f32>(&y[0]).await?, vec![15.0]);

        let y = runtime.invoke("sum", &[x.clone()], &[("axis", "0")])?;
        assert_eq!(runtime.read::<f32>(&y[0]).await?, vec![3.0, 5.0, 7.0]);

        let y = runtime.invoke("mean", &[x.clone()], &[("axis", "1"), ("keepdims", "1")])?;
        assert_eq!(y[0].shape(), Shape::from([2, 1]));
        assert_eq!(runtime.read::<f32>(&y[0]).await?, vec![1.0, 4.0]);

        let y = runtime.invoke("max", &[x.clone()], &[("axis", "1")])?;
        assert_eq!(runtime.read::<f32>(&y[0]).await?, vec![2.0, 5.0]);

        let y = runtime.invoke("min", &[x.clone()], &[("axis", "0"), ("exclude", "true")])?;
        assert_eq!(runtime.read::<f32>(&y[0]).await?, vec![0.0, 3.0]);

        let y = runtime.invoke("prod", &[x.clone()], &[("axis", "(1,0)")])?;
        assert_eq!(runtime.read::<f32>(&y[0]).await?, vec![0.0]);

        let y = runtime.invoke("argmax", &[x.clone()], &[("axis", "1")])?;
        assert_eq!(runtime.read::<f32>(&y[0]).await?, vec![2.0, 2.0]);

        let y = runtime.invoke("argmin", &[x.clone()], &[])?;
        assert_eq!(y[0].shape(), Shape::from([1]));
        assert_eq!(runtime.read::<f32>(&y[0]).await?, vec![0.0]);

        let z = NdArray::from_vec([2], Context::cpu(), vec![3.0f64, 4.0])?;
        let y = runtime.invoke("norm", &[z], &[])?;
        assert_eq!(runtime.read::<f64>(&y[0]).await?, vec![5.0]);
        Ok(())
    }

    #[tokio::test]
    async fn test_broadcasts() -> Result<(), Box<dyn Error>> {
        let runtime = runtime();
        let x = iota([2, 1])?;

        let y = runtime.invoke("broadcast_axis", &[x.clone()], &[("axis", "1"), ("size", "3")])?;
        assert_eq!(y[0].shape(), Shape::from([2, 3]));
        assert_eq!(
            runtime.read::<f32>(&y[0]).await?,
            vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]
        );

        let y = runtime.invoke("broadcast_to", &[x.clone()], &[("shape", "(0,2)")])?;
        assert_eq!(y[0].shape(), Shape::from([2, 2]));
        assert_eq!(runtime.read::<f32>(&y[0]).await?, vec![0.0, 0.0, 1.0, 1.0]);

        let err = runtime
            .invoke("broadcast_to", &[x.clone()], &[("shape", "(3,2)")])
            .unwrap_err();
        assert!(matches!(
            err,
            InvokeError::Op(OpError::Shape(ShapeError::BroadcastTo(..)))
        ));

        let row = NdArray::from_vec([3], Context::cpu(), vec![1.0f32, 2.0, 3.0])?;
        let y = runtime.invoke("broadcast_sub", &[x.clone(), row.clone()], &[])?;
        assert_eq!(
            runtime.read::<f32>(&y[0]).await?,
            vec![-1.0, -2.0, -3.0, 0.0, -1.0, -2.0]
        );
        let y = runtime.invoke("broadcast_mul", &[x.clone(), row.clone()], &[])?;
        assert_eq!(
            runtime.read::<f32>(&y[0]).await?,
            vec![0.0, 0.0, 0.0, 1.0, 2.0, 3.0]
        );
        let y = runtime.invoke("broadcast_div", &[row.clone(), row.clone()], &[])?;
        assert_eq!(runtime.read::<f32>(&y[0]).await?, vec![1.0; 3]);
        let y = runtime.invoke("broadcast_maximum", &[x.clone(), row.clone()], &[])?;
        assert_eq!(
            runtime.read::<f32>(&y[0]).await?,
            vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]
        );
        let y = runtime.invoke("broadcast_minimum", &[x, row], &[])?;
        assert_eq!(
            runtime.read::<f32>(&y[0]).await?,
            vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_arrays() -> Result<(), Box<dyn Error>> {
        let runtime = runtime();
        let x = NdArray::new([3, 0], Context::cpu(), DataType::F32);

        let y = runtime.invoke("sum", &[x.clone()], &[("axis", "1")])?;
        assert_eq!(y[0].shape(), Shape::from([3]));
        assert_eq!(runtime.read::<f32>(&y[0]).await?, vec![0.0; 3]);

        let y = runtime.invoke("prod", &[x.clone()], &[("axis", "1")])?;
        assert_eq!(runtime.read::<f32>(&y[0]).await?, vec![1.0; 3]);

        let ones = NdArray::from_vec([1, 1], Context::cpu(), vec![1.0f32])?;
        let y = runtime.invoke("broadcast_add", &[x.clone(), ones], &[])?;
        assert_eq!(y[0].shape(), Shape::from([3, 0]));
        assert!(runtime.read::<f32>(&y[0]).await?.is_empty());

        let wide = NdArray::new([3, 2], Context::cpu(), DataType::F32);
        let err = runtime.invoke("broadcast_add", &[x, wide], &[]).unwrap_err();
        assert!(matches!(
            err,
            InvokeError::Op(OpError::Shape(ShapeError::Incompatible(..)))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_exclude_without_axes() -> Result<(), Box<dyn Error>> {
        let runtime = runtime();
        let x = iota([2, 3])?;
        let y = runtime.invoke("sum", &[x], &[("exclude", "true")])?;
        assert_eq!(y[0].shape(), Shape::from([2, 3]));
        assert_eq!(
            runtime.read::<f32>(&y[0]).await?,
            vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]
        );
        Ok(())
    }

    #[test]
    fn test_too_many_axes_rejected() -> Result<(), Box<dyn Error>> {
        let runtime = RuntimeBuilder::new()
            .engine(EngineBuilder::new().kind(EngineKind::Naive))
            .registry(Registry::with_builtins())
            .build();
        let too_many = |err: InvokeError| {
            matches!(
                err,
                InvokeError::Op(OpError::Shape(ShapeError::TooManyAxes(..)))
            )
        };

        let x = NdArray::new(Shape::filled(6, 2), Context::cpu(), DataType::F32);
        let err = runtime.invoke("sum", &[x.clone()], &[("axis", "(1,3,5)")]).unwrap_err();
        assert!(too_many(err));

        let y = NdArray::new([2, 1, 2, 1, 2, 1], Context::cpu(), DataType::F32);
        let z = NdArray::new([1, 2, 1, 2, 1, 2], Context::cpu(), DataType::F32);
        let err = runtime.invoke("broadcast_add", &[y.clone(), z], &[]).unwrap_err();
        assert!(too_many(err));

        let err = runtime
            .invoke("broadcast_to", &[y.clone()], &[("shape", "(2,2,2,2,2,2)")])
            .unwrap_err();
        assert!(too_many(err));

        let params = [("axis", "(1,3,5)"), ("size", "(2,2,2)")];
        let err = runtime.invoke("broadcast_axis", &[y], &params).unwrap_err();
        assert!(too_many(err));

        // a reduction that merges into few axes still runs
        let y = runtime.invoke("sum", &[x], &[("axis", "(3,4,5)")])?;
        assert_eq!(y[0].shape(), Shape::from([2, 2, 2]));
        assert_eq!(runtime.read_blocking::<f32>(&y[0])?, vec![0.0; 8]);
        Ok(())
    }

    #[tokio::test]
    async fn test_initializers() -> Result<(), Box<dyn Error>> {
        let runtime = runtime();

        let y = runtime.invoke("_zeros", &[], &[("shape", "(2,2)"), ("dtype", "int32")])?;
        assert_eq!(y[0].dtype(), Some(DataType::I32));
        assert_eq!(runtime.read::<i32>(&y[0]).await?, vec![0; 4]);

        let err = runtime.invoke("_ones", &[], &[]).unwrap_err();
        assert!(matches!(err, InvokeError::Param(..)));

        runtime.seed(3);
        let params = [("shape", "(64,)"), ("low", "-2"), ("high", "2")];
        let x = runtime.invoke("_random_uniform", &[], &params)?;
        runtime.seed(3);
        let y = runtime.invoke("_random_uniform", &[], &params)?;
        let x = runtime.read::<f32>(&x[0]).await?;
        let y = runtime.read::<f32>(&y[0]).await?;
        assert!(x.iter().all(|x| (-2.0..2.0).contains(x)));
        assert_eq!(x, y);
        Ok(())
    }
}
