//! The invocation pipeline: one op call from parameters to scheduled computation.
//!
//! Every contract violation is reported before anything is submitted to the engine. Once a
//! call was submitted it runs to completion; a kernel failing inside the engine aborts the
//! process.

use std::sync::Arc;

use itertools::Itertools;
use thiserror::Error;

use super::{
    context::{Context, ContextError, Device},
    engine::{Complete, Dependencies, Engine, EngineBuilder, EngineExt, Property, RunContext},
    num::{DataType, Scalar},
    ops::{ExecType, OpComplete, OpContext, OpDef, OpError, OpReq, Registry},
    params::{ParamDict, ParamError},
    resource::{ResourceBuilder, ResourceManager, ResourceRequest},
    shape::Shape,
    tensor::{NdArray, TBlob, TensorError},
};

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("op `{0}` is not registered")]
    UnknownOp(String),
    #[error("op `{op}` expects {expected} inputs, got {got}")]
    InputCount {
        op: Arc<str>,
        expected: usize,
        got: usize,
    },
    #[error("op `{op}` has {total} outputs ({visible} visible), got {got}")]
    OutputCount {
        op: Arc<str>,
        total: usize,
        visible: usize,
        got: usize,
    },
    #[error("input {index} of op `{op}` is none")]
    NoneInput { op: Arc<str>, index: usize },
    #[error("op `{op}` mutates input {index}, but only has {count} inputs")]
    MutateIndex {
        op: Arc<str>,
        index: usize,
        count: usize,
    },
    #[error("shape inference of op `{0}` is incomplete")]
    ShapeIncomplete(Arc<str>),
    #[error("type inference of op `{0}` is incomplete")]
    TypeIncomplete(Arc<str>),
    #[error("output {index} of op `{op}` has shape {got}, expected {expected}")]
    OutputShape {
        op: Arc<str>,
        index: usize,
        expected: Shape,
        got: Shape,
    },
    #[error("output {index} of op `{op}` has type {got}, expected {expected}")]
    OutputType {
        op: Arc<str>,
        index: usize,
        expected: DataType,
        got: DataType,
    },
    #[error("op `{op}` provides no {capability} for {device}")]
    MissingCapability {
        op: Arc<str>,
        capability: &'static str,
        device: Device,
    },
    #[error("op `{0}` requested more than one temp space")]
    MultipleTempSpace(Arc<str>),
    #[error(transparent)]
    Op(#[from] OpError),
    #[error(transparent)]
    Param(#[from] ParamError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Context(#[from] ContextError),
}

/// How a call reaches its kernel.
enum Dispatch {
    Compute(super::ops::ComputeFn),
    Operator(super::ops::CreateOperatorFn),
}

/// Configuration of a [`Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeBuilder {
    pub engine: EngineBuilder,
    pub resource: ResourceBuilder,
    pub registry: Registry,
    /// Context of outputs when neither inputs, outputs nor the `ctx` attribute name one.
    pub context: Context,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self {
            engine: EngineBuilder::default(),
            resource: ResourceBuilder::default(),
            registry: Registry::default(),
            context: Context::cpu(),
        }
    }
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the engine and resource configuration from `WEFT_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            engine: EngineBuilder::from_env(),
            resource: ResourceBuilder::from_env(),
            ..Default::default()
        }
    }

    pub fn engine(mut self, engine: EngineBuilder) -> Self {
        self.engine = engine;
        self
    }

    pub fn resource(mut self, resource: ResourceBuilder) -> Self {
        self.resource = resource;
        self
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn build(self) -> Runtime {
        let engine = self.engine.build();
        let resources = self.resource.build(engine.clone());
        Runtime {
            registry: self.registry,
            resources,
            engine,
            context: self.context,
        }
    }
}

/// The services an op call runs against.
///
/// Fields drop in declaration order: the resource manager goes before the engine, and the
/// engine waits for every in-flight work item when it is dropped.
pub struct Runtime {
    registry: Registry,
    resources: ResourceManager,
    engine: Arc<dyn Engine>,
    context: Context,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("engine", &self.engine.kind())
            .field("resources", &self.resources)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    #[inline]
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    #[inline]
    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    #[inline]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Reseeds every random stream.
    #[inline]
    pub fn seed(&self, seed: u64) {
        self.resources.seed(seed)
    }

    /// Invokes `op`, allocating every output. Returns the visible outputs.
    ///
    /// Returns as soon as the computation is submitted.
    pub fn invoke(
        &self,
        op: &str,
        inputs: &[NdArray],
        params: &[(&str, &str)],
    ) -> Result<Vec<NdArray>, InvokeError> {
        self.invoke_impl(op, inputs, None, params)
    }

    /// Invokes `op`, writing into caller-supplied outputs.
    ///
    /// `outputs` holds either all outputs or only the visible ones. Bound handles must match the
    /// inferred shape and type; none handles are filled with fresh buffers.
    pub fn invoke_into(
        &self,
        op: &str,
        inputs: &[NdArray],
        outputs: &mut [NdArray],
        params: &[(&str, &str)],
    ) -> Result<(), InvokeError> {
        let results = self.invoke_impl(op, inputs, Some(&*outputs), params)?;
        for (slot, output) in outputs.iter_mut().zip_eq(results) {
            *slot = output;
        }
        Ok(())
    }

    #[inline]
    fn def(&self, op: &str) -> Result<Arc<OpDef>, InvokeError> {
        self.registry
            .get(op)
            .ok_or_else(|| InvokeError::UnknownOp(op.to_string()))
    }

    /// Runs the pipeline. Returns the adopted supplied outputs, or the visible outputs if none
    /// were supplied.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, inputs, supplied, params)))]
    fn invoke_impl(
        &self,
        op: &str,
        inputs: &[NdArray],
        supplied: Option<&[NdArray]>,
        params: &[(&str, &str)],
    ) -> Result<Vec<NdArray>, InvokeError> {
        let def = self.def(op)?;
        let name = def.name.clone();

        // parse
        let attrs = def.parse(dict(params), inputs.len())?;

        // arity
        let num_inputs = def.num_inputs.resolve(&attrs);
        if inputs.len() != num_inputs {
            return Err(InvokeError::InputCount {
                op: name,
                expected: num_inputs,
                got: inputs.len(),
            });
        }
        if let Some(index) = inputs.iter().position(NdArray::is_none) {
            return Err(InvokeError::NoneInput { op: name, index });
        }
        let num_outputs = def.num_outputs.resolve(&attrs);
        let num_visible = def
            .num_visible_outputs
            .map(|f| f(&attrs))
            .unwrap_or(num_outputs);

        // output reconciliation
        let mut outputs = match supplied {
            None => vec![NdArray::none(); num_outputs],
            Some(supplied) if supplied.len() == num_outputs || supplied.len() == num_visible => {
                let mut outputs = supplied.to_vec();
                outputs.resize(num_outputs, NdArray::none());
                outputs
            }
            Some(supplied) => {
                return Err(InvokeError::OutputCount {
                    op: name,
                    total: num_outputs,
                    visible: num_visible,
                    got: supplied.len(),
                });
            }
        };
        let num_returned = supplied.map_or(num_visible, <[NdArray]>::len);

        // fast path
        if let Some(f) = def.array_function {
            f(&attrs, inputs, &mut outputs)?;
            outputs.truncate(num_returned);
            return Ok(outputs);
        }

        // shape and type inference
        let infer_shape = def.infer_shape.ok_or(InvokeError::MissingCapability {
            op: name.clone(),
            capability: "shape inference",
            device: Device::Cpu,
        })?;
        let infer_type = def.infer_type.ok_or(InvokeError::MissingCapability {
            op: name.clone(),
            capability: "type inference",
            device: Device::Cpu,
        })?;

        // bound outputs are checked against the inferred slots afterwards
        let mut in_shapes = inputs.iter().map(NdArray::shape).collect_vec();
        let mut out_shapes = vec![Shape::unknown(); outputs.len()];
        let complete = infer_shape(&attrs, &mut in_shapes, &mut out_shapes)?;
        if !complete || out_shapes.iter().any(Shape::is_unknown) {
            return Err(InvokeError::ShapeIncomplete(name));
        }

        let mut in_types = inputs.iter().map(NdArray::dtype).collect_vec();
        let mut out_types = vec![None::<DataType>; outputs.len()];
        let complete = infer_type(&attrs, &mut in_types, &mut out_types)?;
        let (Some(in_types), Some(out_types)) = (
            in_types.into_iter().collect::<Option<Vec<_>>>(),
            out_types.into_iter().collect::<Option<Vec<_>>>(),
        ) else {
            return Err(InvokeError::TypeIncomplete(name));
        };
        if !complete {
            return Err(InvokeError::TypeIncomplete(name));
        }

        for (index, output) in outputs.iter().enumerate() {
            let Some(dtype) = output.dtype() else {
                continue;
            };
            if output.shape() != out_shapes[index] {
                return Err(InvokeError::OutputShape {
                    op: name,
                    index,
                    expected: out_shapes[index].clone(),
                    got: output.shape(),
                });
            }
            if dtype != out_types[index] {
                return Err(InvokeError::OutputType {
                    op: name,
                    index,
                    expected: out_types[index],
                    got: dtype,
                });
            }
        }

        // context and capability
        let context = self.resolve_context(&attrs.dict, inputs, &outputs)?;
        let dispatch = match (def.compute.get(&context.device.mask()), def.create_operator) {
            (Some(&f), _) => Dispatch::Compute(f),
            (None, Some(f)) => Dispatch::Operator(f),
            (None, None) => {
                return Err(InvokeError::MissingCapability {
                    op: name,
                    capability: "compute function",
                    device: context.device,
                });
            }
        };

        // dependencies
        let mut mutate = def.mutate_inputs.map(|f| f(&attrs)).unwrap_or_default();
        mutate.sort_unstable();
        mutate.dedup();
        if let Some(&index) = mutate.iter().find(|&&index| index >= inputs.len()) {
            return Err(InvokeError::MutateIndex {
                op: name,
                index,
                count: inputs.len(),
            });
        }
        let requests = def.resource_request.map(|f| f(&attrs)).unwrap_or_default();
        let temp_spaces = requests
            .iter()
            .filter(|&&request| request == ResourceRequest::TempSpace)
            .count();
        if temp_spaces > 1 {
            return Err(InvokeError::MultipleTempSpace(name));
        }

        // materialization
        for (index, output) in outputs.iter_mut().enumerate() {
            if output.is_none() {
                *output = NdArray::new(out_shapes[index].clone(), context, out_types[index]);
            }
        }
        let in_blobs = inputs
            .iter()
            .map(NdArray::blob)
            .collect::<Result<Vec<TBlob>, _>>()?;
        let out_blobs = outputs
            .iter()
            .map(NdArray::blob)
            .collect::<Result<Vec<TBlob>, _>>()?;
        let req = outputs
            .iter()
            .map(|output| match inputs.iter().any(|input| input.ptr_eq(output)) {
                true => OpReq::WriteInplace,
                false => OpReq::WriteTo,
            })
            .collect_vec();

        let requested = requests
            .iter()
            .map(|&request| self.resources.request(context, request))
            .collect_vec();
        let reads = inputs.iter().filter_map(NdArray::var).cloned();
        let writes = outputs
            .iter()
            .filter_map(NdArray::var)
            .chain(mutate.iter().filter_map(|&index| inputs[index].var()))
            .cloned()
            .chain(requested.iter().map(|resource| resource.var().clone()))
            .collect_vec();
        let deps = Dependencies::new(reads, writes);

        // dispatch
        match dispatch {
            Dispatch::Compute(compute) => {
                let f = move |run: RunContext, complete: Complete| {
                    let complete = OpComplete::new(complete);
                    let ctx = OpContext::new(run, requested, complete.clone());
                    if let Err(err) = compute(&attrs, &ctx, &in_blobs, &req, &out_blobs) {
                        abort(&attrs.name, ctx.context(), err);
                    }
                    ctx.run.wait_stream();
                    complete.complete();
                };
                let property = Property::Normal;
                self.engine
                    .push_async(Box::new(f), context, deps, property, &name);
            }
            Dispatch::Operator(create) => {
                let mut operator = create(&attrs, context, &in_shapes, &in_types);
                let exec = operator.exec_type();
                let (in_data, aux): (Vec<_>, Vec<_>) = in_blobs
                    .into_iter()
                    .enumerate()
                    .partition(|(index, _)| mutate.binary_search(index).is_err());
                let in_data = in_data.into_iter().map(|(_, blob)| blob).collect_vec();
                let aux = aux.into_iter().map(|(_, blob)| blob).collect_vec();

                let f = move |run: RunContext, complete: Complete| {
                    let complete = OpComplete::with_operator(complete);
                    let ctx = OpContext::new(run, requested, complete.clone());
                    if let Err(err) = operator.forward(&ctx, &in_data, &req, &out_blobs, &aux) {
                        abort(&attrs.name, ctx.context(), err);
                    }
                    match exec {
                        ExecType::Sync => {
                            ctx.run.wait_stream();
                            complete.park(operator);
                            complete.complete();
                        }
                        ExecType::Async => complete.park(operator),
                    }
                };
                let property = match exec {
                    ExecType::Sync => Property::Normal,
                    ExecType::Async => Property::Async,
                };
                self.engine
                    .push_async(Box::new(f), context, deps, property, &name);
            }
        }

        outputs.truncate(num_returned);
        Ok(outputs)
    }

    /// Picks the context of new outputs: the first input's, else the first bound output's, else
    /// the `ctx` attribute, else the default. Pinned host memory degrades to plain host memory.
    fn resolve_context(
        &self,
        dict: &ParamDict,
        inputs: &[NdArray],
        outputs: &[NdArray],
    ) -> Result<Context, InvokeError> {
        let attr = dict.get("ctx").map(|ctx| ctx.parse::<Context>()).transpose()?;
        let context = inputs
            .first()
            .and_then(NdArray::context)
            .or_else(|| outputs.iter().find_map(NdArray::context))
            .or(attr)
            .unwrap_or(self.context);
        match context.device {
            Device::CpuPinned => Ok(Context::cpu()),
            _ => Ok(context),
        }
    }

    /// Resolves once all pending writes of `array` completed.
    pub async fn wait_to_read(&self, array: &NdArray) {
        if let Some(var) = array.var() {
            self.engine.wait_for_var(var).await;
        }
    }

    /// Blocking version of [`Runtime::wait_to_read`].
    pub fn wait_to_read_blocking(&self, array: &NdArray) {
        if let Some(var) = array.var() {
            self.engine.wait_for_var_blocking(var);
        }
    }

    /// Resolves once every submitted op completed.
    pub async fn wait_all(&self) {
        self.engine.wait_all().await
    }

    /// Waits for pending writes of `array` and copies its contents out.
    pub async fn read<T: Scalar>(&self, array: &NdArray) -> Result<Vec<T>, TensorError> {
        self.wait_to_read(array).await;
        array.to_vec()
    }

    /// Blocking version of [`Runtime::read`].
    pub fn read_blocking<T: Scalar>(&self, array: &NdArray) -> Result<Vec<T>, TensorError> {
        self.wait_to_read_blocking(array);
        array.to_vec()
    }
}

#[inline]
fn dict(params: &[(&str, &str)]) -> ParamDict {
    params
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn abort(name: &str, context: Context, err: OpError) -> ! {
    log::error!("op `{name}` failed on {context}: {err}");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use std::{
        error::Error,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };

    use super::{InvokeError, Runtime, RuntimeBuilder};
    use crate::loom::{
        context::{Context, Device},
        engine::{EngineBuilder, EngineKind},
        num::DataType,
        ops::{
            ExecType, OpAttrs, OpContext, OpDef, OpError, OpReq, Operator, Registry,
            elemwise_type,
        },
        resource::{ResourceBuilder, ResourceRequest},
        shape::{Shape, ShapeError},
        tensor::{NdArray, TBlob},
    };

    fn runtime(registry: Registry) -> Runtime {
        RuntimeBuilder::new()
            .engine(EngineBuilder::new().cpu_workers(2))
            .registry(registry)
            .build()
    }

    fn same_shape(
        _attrs: &OpAttrs,
        inputs: &mut [Shape],
        outputs: &mut [Shape],
    ) -> Result<bool, OpError> {
        let shape = inputs[0].clone();
        for index in 0..outputs.len() {
            crate::loom::ops::assign_shape(outputs, index, shape.clone())?;
        }
        Ok(true)
    }

    static TOUCHED: AtomicUsize = AtomicUsize::new(0);

    fn touch(
        _attrs: &OpAttrs,
        _ctx: &OpContext,
        _inputs: &[TBlob],
        _req: &[OpReq],
        _outputs: &[TBlob],
    ) -> Result<(), OpError> {
        TOUCHED.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    #[tokio::test]
    async fn test_broadcast_add() -> Result<(), Box<dyn Error>> {
        let runtime = runtime(Registry::with_builtins());
        let x = NdArray::from_vec([3, 1, 5], Context::cpu(), (0..15).map(|x| x as f32).collect())?;
        let y = NdArray::from_vec([1, 4, 5], Context::cpu(), vec![100.0f32; 20])?;

        let outputs = runtime.invoke("broadcast_add", &[x, y], &[])?;
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].shape(), Shape::from([3, 4, 5]));

        let data = runtime.read::<f32>(&outputs[0]).await?;
        assert_eq!(data[0], 100.0);
        assert_eq!(data[5], 100.0);
        assert_eq!(data[20], 105.0);
        assert_eq!(data[59], 114.0);
        Ok(())
    }

    #[test]
    fn test_incompatible_broadcast() -> Result<(), Box<dyn Error>> {
        let runtime = runtime(Registry::with_builtins());
        let x = NdArray::new([3, 4], Context::cpu(), DataType::F32);
        let y = NdArray::new([5], Context::cpu(), DataType::F32);
        let err = runtime.invoke("broadcast_add", &[x, y], &[]).unwrap_err();
        assert!(matches!(
            err,
            InvokeError::Op(OpError::Shape(ShapeError::Incompatible(..)))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_reduce_sum() -> Result<(), Box<dyn Error>> {
        let runtime = runtime(Registry::with_builtins());
        let x = NdArray::from_vec([2, 3, 4], Context::cpu(), vec![1.0f32; 24])?;

        let y = runtime.invoke("sum", &[x.clone()], &[("axis", "1")])?;
        assert_eq!(y[0].shape(), Shape::from([2, 4]));
        assert_eq!(runtime.read::<f32>(&y[0]).await?, vec![3.0; 8]);

        let y = runtime.invoke("sum", &[x], &[("axis", "(1,)"), ("keepdims", "true")])?;
        assert_eq!(y[0].shape(), Shape::from([2, 1, 4]));
        Ok(())
    }

    #[test]
    fn test_contract_violations() -> Result<(), Box<dyn Error>> {
        let runtime = runtime(Registry::with_builtins());
        let x = NdArray::new([2, 3], Context::cpu(), DataType::F32);

        let err = runtime.invoke("broadcast_add", &[x.clone()], &[]).unwrap_err();
        assert!(matches!(err, InvokeError::InputCount { expected: 2, got: 1, .. }));

        let err = runtime.invoke("sum", &[x.clone()], &[("axis", "2")]).unwrap_err();
        assert!(matches!(
            err,
            InvokeError::Op(OpError::Shape(ShapeError::AxisOutOfRange { .. }))
        ));

        let err = runtime.invoke("sum", &[x.clone()], &[("bogus", "1")]).unwrap_err();
        assert!(matches!(err, InvokeError::Param(..)));

        let err = runtime.invoke("fancy", &[x.clone()], &[]).unwrap_err();
        assert!(matches!(err, InvokeError::UnknownOp(..)));

        let err = runtime.invoke("sum", &[NdArray::none()], &[]).unwrap_err();
        assert!(matches!(err, InvokeError::NoneInput { index: 0, .. }));

        // a bound output of the wrong shape is rejected and left untouched
        let wrong = NdArray::new([3], Context::cpu(), DataType::F32);
        let mut outputs = [wrong.clone()];
        let err = runtime
            .invoke_into("sum", &[x.clone()], &mut outputs, &[("axis", "1")])
            .unwrap_err();
        assert!(matches!(err, InvokeError::OutputShape { index: 0, .. }));
        assert!(outputs[0].ptr_eq(&wrong));

        let wrong = NdArray::new([2], Context::cpu(), DataType::I32);
        let mut outputs = [wrong.clone()];
        let err = runtime
            .invoke_into("sum", &[x.clone()], &mut outputs, &[("axis", "1")])
            .unwrap_err();
        assert!(matches!(
            err,
            InvokeError::OutputType {
                index: 0,
                expected: DataType::F32,
                got: DataType::I32,
                ..
            }
        ));
        assert!(outputs[0].ptr_eq(&wrong));

        let mut outputs = [NdArray::none(), NdArray::none()];
        let err = runtime
            .invoke_into("sum", &[x], &mut outputs, &[])
            .unwrap_err();
        assert!(matches!(err, InvokeError::OutputCount { got: 2, .. }));
        Ok(())
    }

    #[test]
    fn test_invoke_into() -> Result<(), Box<dyn Error>> {
        let runtime = runtime(Registry::with_builtins());
        let x = NdArray::from_vec([2, 2], Context::cpu(), vec![1.0f32, 2.0, 3.0, 4.0])?;
        let y = NdArray::from_vec([2, 2], Context::cpu(), vec![1.0f32; 4])?;

        // in place: x += y
        let mut outputs = [x.clone()];
        runtime.invoke_into("broadcast_add", &[x.clone(), y.clone()], &mut outputs, &[])?;
        assert!(outputs[0].ptr_eq(&x));
        runtime.invoke_into("broadcast_add", &[x.clone(), y], &mut outputs, &[])?;
        assert_eq!(runtime.read_blocking::<f32>(&x)?, vec![3.0, 4.0, 5.0, 6.0]);

        // none slots are filled
        let mut outputs = [NdArray::none()];
        runtime.invoke_into("_ones", &[], &mut outputs, &[("shape", "(3,)")])?;
        assert_eq!(outputs[0].shape(), Shape::from([3]));
        assert_eq!(runtime.read_blocking::<f32>(&outputs[0])?, vec![1.0; 3]);
        Ok(())
    }

    #[test]
    fn test_context_resolution() -> Result<(), Box<dyn Error>> {
        let runtime = runtime(Registry::with_builtins());

        let y = runtime.invoke("_zeros", &[], &[("shape", "(2,)"), ("ctx", "cpu_pinned(0)")])?;
        assert_eq!(y[0].context(), Some(Context::cpu()));

        let x = NdArray::new([2], Context::cpu_pinned(), DataType::F32);
        let y = runtime.invoke("norm", &[x], &[])?;
        assert_eq!(y[0].context(), Some(Context::cpu()));

        let y = runtime.invoke("_zeros", &[], &[("shape", "(2,)"), ("ctx", "gpu(1)")]);
        assert!(matches!(
            y,
            Err(InvokeError::MissingCapability {
                device: Device::Gpu,
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn test_second_temp_space_rejected() -> Result<(), Box<dyn Error>> {
        let op = OpDef::new("greedy")
            .infer_shape(same_shape)
            .infer_type(elemwise_type)
            .resource_request(|_| vec![ResourceRequest::TempSpace, ResourceRequest::TempSpace])
            .compute(Device::Cpu, touch);
        let runtime = runtime(Registry::new().register(op));
        let before = TOUCHED.load(Ordering::SeqCst);

        let x = NdArray::new([4], Context::cpu(), DataType::F32);
        let err = runtime.invoke("greedy", &[x], &[]).unwrap_err();
        assert!(matches!(err, InvokeError::MultipleTempSpace(..)));

        runtime.engine().wait_all_blocking();
        assert_eq!(TOUCHED.load(Ordering::SeqCst), before);
        Ok(())
    }

    static LEASED: AtomicBool = AtomicBool::new(false);
    static OVERLAPS: AtomicUsize = AtomicUsize::new(0);
    static SCRATCHED: AtomicUsize = AtomicUsize::new(0);

    fn scratch(
        _attrs: &OpAttrs,
        ctx: &OpContext,
        inputs: &[TBlob],
        _req: &[OpReq],
        _outputs: &[TBlob],
    ) -> Result<(), OpError> {
        if LEASED.swap(true, Ordering::SeqCst) {
            OVERLAPS.fetch_add(1, Ordering::SeqCst);
        }
        let space = ctx.resource(0)?.get_space(inputs[0].shape().clone(), DataType::F32)?;
        space.write(|data: &mut [f32]| data.fill(1.0))?;
        std::thread::sleep(Duration::from_millis(2));
        LEASED.store(false, Ordering::SeqCst);
        SCRATCHED.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    #[test]
    fn test_temp_space_never_shared() -> Result<(), Box<dyn Error>> {
        let op = OpDef::new("scratch")
            .infer_shape(same_shape)
            .infer_type(elemwise_type)
            .resource_request(|_| vec![ResourceRequest::TempSpace])
            .compute(Device::Cpu, scratch);
        let runtime = RuntimeBuilder::new()
            .engine(EngineBuilder::new().cpu_workers(4))
            .resource(ResourceBuilder::new().cpu_temp_copies(1))
            .registry(Registry::new().register(op))
            .build();

        // independent inputs, so only the shared lease orders the calls
        let outputs = (0..16)
            .map(|_| {
                let x = NdArray::new([8], Context::cpu(), DataType::F32);
                runtime.invoke("scratch", &[x], &[])
            })
            .collect::<Result<Vec<_>, _>>()?;
        runtime.engine().wait_all_blocking();

        assert_eq!(outputs.len(), 16);
        assert_eq!(SCRATCHED.load(Ordering::SeqCst), 16);
        assert_eq!(OVERLAPS.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn test_missing_capability() {
        let op = OpDef::new("hollow")
            .infer_shape(same_shape)
            .infer_type(elemwise_type);
        let runtime = runtime(Registry::new().register(op));
        let x = NdArray::new([4], Context::cpu(), DataType::F32);
        let err = runtime.invoke("hollow", &[x], &[]).unwrap_err();
        assert!(matches!(err, InvokeError::MissingCapability { .. }));
    }

    #[test]
    fn test_array_function_fast_path() -> Result<(), Box<dyn Error>> {
        let op = OpDef::new("fill_seven").array_function(|_, inputs, outputs| {
            let output = NdArray::new(inputs[0].shape(), Context::cpu(), DataType::I32);
            output.blob()?.write(|x: &mut [i32]| x.fill(7))?;
            outputs[0] = output;
            Ok(())
        });
        let runtime = runtime(Registry::new().register(op));
        let x = NdArray::new([3], Context::cpu(), DataType::F32);
        let y = runtime.invoke("fill_seven", &[x], &[])?;
        // no engine round trip is needed
        assert_eq!(y[0].to_vec::<i32>()?, vec![7; 3]);
        Ok(())
    }

    static DROPS: AtomicUsize = AtomicUsize::new(0);

    /// Adds one to its mutated input, completing from another thread.
    struct Increment;

    impl Drop for Increment {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Operator for Increment {
        fn exec_type(&self) -> ExecType {
            ExecType::Async
        }

        fn forward(
            &mut self,
            ctx: &OpContext,
            _inputs: &[TBlob],
            _req: &[OpReq],
            _outputs: &[TBlob],
            aux: &[TBlob],
        ) -> Result<(), OpError> {
            let state = aux[0].clone();
            let complete = ctx.async_complete();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_micros(100));
                _ = state.write(|x: &mut [i64]| x[0] += 1);
                complete.complete();
            });
            Ok(())
        }
    }

    fn increment_op() -> OpDef {
        OpDef::new("increment")
            .mutate_inputs(|_| vec![0])
            .infer_shape(same_shape)
            .infer_type(elemwise_type)
            .create_operator(|_, _, _, _| Box::new(Increment))
    }

    #[tokio::test]
    async fn test_async_operator_exactly_once() -> Result<(), Box<dyn Error>> {
        for kind in [EngineKind::Threaded, EngineKind::Naive] {
            let runtime = RuntimeBuilder::new()
                .engine(EngineBuilder::new().kind(kind).cpu_workers(3))
                .registry(Registry::new().register(increment_op()))
                .build();
            let before = DROPS.load(Ordering::SeqCst);

            let states: Vec<_> = (0..3)
                .map(|_| NdArray::from_vec([1], Context::cpu(), vec![0i64]))
                .collect::<Result<_, _>>()?;
            let mut rng = fastrand::Rng::with_seed(7);
            let mut expected = [0i64; 3];
            for _ in 0..60 {
                let index = rng.usize(0..3);
                expected[index] += 1;
                runtime.invoke("increment", &[states[index].clone()], &[])?;
            }
            runtime.wait_all().await;

            for (state, expected) in states.iter().zip(expected) {
                assert_eq!(runtime.read::<i64>(state).await?, vec![expected]);
            }
            assert_eq!(DROPS.load(Ordering::SeqCst) - before, 60);
        }
        Ok(())
    }
}
