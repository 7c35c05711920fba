//! Operator definitions and the registry the invocation pipeline consumes.
//!
//! An [`OpDef`] bundles the optional capabilities of one operator: attribute parsing, arity,
//! shape and type inference, compute functions per device kind, a stateful operator factory,
//! in-place mutated inputs, resource requests and a synchronous array function. Capabilities
//! are plain function pointers, resolved once when the definition is registered.

use std::{
    any::Any,
    sync::{Arc, Mutex},
};

use derive_more::Display;
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use super::{
    context::{Context, Device},
    engine::{Complete, RunContext},
    num::DataType,
    params::{ParamDict, ParamError, Params},
    resource::{Resource, ResourceError, ResourceRequest},
    shape::{Shape, ShapeError},
    tensor::{NdArray, TBlob, TensorError},
};

#[derive(Debug, Error)]
pub enum OpError {
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Param(#[from] ParamError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error("type inconsistent at slot {index}: expected {expected}, got {got}")]
    Type {
        index: usize,
        expected: DataType,
        got: DataType,
    },
    #[error("data type {0} is not supported")]
    Unsupported(DataType),
    #[error("expecting {expected} requested resources, got {got}")]
    MissingResource { expected: usize, got: usize },
}

/// How a kernel stores its result into an output.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum OpReq {
    /// Leave the output untouched.
    #[display("null")]
    Null,
    /// Overwrite the output.
    #[default]
    #[display("write")]
    WriteTo,
    /// Overwrite the output, which may alias an input.
    #[display("inplace")]
    WriteInplace,
    /// Accumulate into the output.
    #[display("add")]
    AddTo,
}

/// Whether a stateful operator finishes within [`Operator::forward`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecType {
    #[default]
    Sync,
    /// The operator signals completion later through [`OpContext::async_complete`].
    Async,
}

/// Raw and parsed attributes of one op call.
#[derive(Clone)]
pub struct OpAttrs {
    pub name: Arc<str>,
    pub dict: ParamDict,
    parsed: Option<Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for OpAttrs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpAttrs")
            .field("name", &self.name)
            .field("dict", &self.dict)
            .field("parsed", &self.parsed.is_some())
            .finish()
    }
}

impl OpAttrs {
    pub fn new(name: impl Into<Arc<str>>, dict: ParamDict) -> Self {
        Self {
            name: name.into(),
            dict,
            parsed: None,
        }
    }

    /// The typed parameters produced by the op's parser.
    pub fn params<P: Params>(&self) -> Result<&P, ParamError> {
        self.parsed
            .as_deref()
            .and_then(|parsed| parsed.downcast_ref())
            .ok_or(ParamError::Unparsed(std::any::type_name::<P>()))
    }
}

/// Completion of an op call, guarded so that it fires at most once.
///
/// For stateful operators the guard also owns the operator once its forward pass returned.
/// The operator is dropped after it signaled completion and before its dependents are
/// released, whichever of the forward pass and the signal finishes last.
#[derive(Clone)]
pub struct OpComplete(Arc<Mutex<Capture>>);

struct Capture {
    fired: bool,
    complete: Option<Complete>,
    operator: Option<Box<dyn Operator>>,
    /// An operator is still in its forward pass and will be parked.
    awaiting: bool,
}

impl std::fmt::Debug for OpComplete {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let capture = self.0.lock().expect("failed to lock");
        f.debug_struct("OpComplete")
            .field("fired", &capture.fired)
            .finish()
    }
}

impl OpComplete {
    pub(crate) fn new(complete: Complete) -> Self {
        Self(Arc::new(Mutex::new(Capture {
            fired: false,
            complete: Some(complete),
            operator: None,
            awaiting: false,
        })))
    }

    /// A guard that will own an operator once [`OpComplete::park`] hands it over.
    pub(crate) fn with_operator(complete: Complete) -> Self {
        let guard = Self::new(complete);
        guard.0.lock().expect("failed to lock").awaiting = true;
        guard
    }

    #[inline]
    pub fn is_fired(&self) -> bool {
        self.0.lock().expect("failed to lock").fired
    }

    /// Signals that the call's outputs are ready. Later calls are ignored.
    pub fn complete(&self) {
        let (complete, operator) = {
            let mut capture = self.0.lock().expect("failed to lock");
            if capture.fired {
                log::warn!("op completion fired more than once");
                return;
            }
            capture.fired = true;
            if capture.awaiting {
                return;
            }
            (capture.complete.take(), capture.operator.take())
        };
        drop(operator);
        if let Some(complete) = complete {
            complete.complete();
        }
    }

    /// Keeps `operator` alive until the completion fires. If it already has, drops the operator
    /// and releases the dependents right away.
    pub(crate) fn park(&self, operator: Box<dyn Operator>) {
        let complete = {
            let mut capture = self.0.lock().expect("failed to lock");
            capture.awaiting = false;
            if !capture.fired {
                capture.operator = Some(operator);
                return;
            }
            capture.complete.take()
        };
        drop(operator);
        if let Some(complete) = complete {
            complete.complete();
        }
    }
}

/// Everything a kernel sees besides its blobs.
#[derive(Debug, Clone)]
pub struct OpContext {
    pub run: RunContext,
    /// Resources leased for this call, in the order the op requested them.
    pub requested: Vec<Resource>,
    complete: OpComplete,
}

impl OpContext {
    pub(crate) fn new(run: RunContext, requested: Vec<Resource>, complete: OpComplete) -> Self {
        Self {
            run,
            requested,
            complete,
        }
    }

    #[inline]
    pub fn context(&self) -> Context {
        self.run.context
    }

    /// The completion an [`ExecType::Async`] operator must fire once its outputs are ready.
    #[inline]
    pub fn async_complete(&self) -> OpComplete {
        self.complete.clone()
    }

    /// The `index`-th requested resource.
    pub fn resource(&self, index: usize) -> Result<&Resource, OpError> {
        self.requested.get(index).ok_or(OpError::MissingResource {
            expected: index + 1,
            got: self.requested.len(),
        })
    }
}

/// An operator instance that persists across its forward pass.
pub trait Operator: Send {
    #[inline]
    fn exec_type(&self) -> ExecType {
        ExecType::Sync
    }

    /// Computes the outputs. `aux` holds the inputs the op mutates in place.
    fn forward(
        &mut self,
        ctx: &OpContext,
        inputs: &[TBlob],
        req: &[OpReq],
        outputs: &[TBlob],
        aux: &[TBlob],
    ) -> Result<(), OpError>;
}

pub type ParseFn = fn(&ParamDict) -> Result<Arc<dyn Any + Send + Sync>, ParamError>;
pub type CountFn = fn(&OpAttrs) -> usize;
pub type InferShapeFn = fn(&OpAttrs, &mut [Shape], &mut [Shape]) -> Result<bool, OpError>;
pub type InferTypeFn =
    fn(&OpAttrs, &mut [Option<DataType>], &mut [Option<DataType>]) -> Result<bool, OpError>;
pub type ComputeFn = fn(&OpAttrs, &OpContext, &[TBlob], &[OpReq], &[TBlob]) -> Result<(), OpError>;
pub type CreateOperatorFn = fn(&OpAttrs, Context, &[Shape], &[DataType]) -> Box<dyn Operator>;
pub type IndicesFn = fn(&OpAttrs) -> Vec<usize>;
pub type ResourceFn = fn(&OpAttrs) -> Vec<ResourceRequest>;
pub type ArrayFn = fn(&OpAttrs, &[NdArray], &mut [NdArray]) -> Result<(), OpError>;

#[derive(Debug, Clone, Copy)]
pub enum Arity {
    Fixed(usize),
    Dynamic(CountFn),
}

impl Arity {
    #[inline]
    pub fn resolve(self, attrs: &OpAttrs) -> usize {
        match self {
            Arity::Fixed(count) => count,
            Arity::Dynamic(f) => f(attrs),
        }
    }
}

/// The definition of an operator.
#[derive(Debug, Clone)]
pub struct OpDef {
    pub(crate) name: Arc<str>,
    pub(crate) parser: Option<ParseFn>,
    pub(crate) num_inputs: Arity,
    pub(crate) num_outputs: Arity,
    pub(crate) num_visible_outputs: Option<CountFn>,
    pub(crate) key_var_num_args: Option<&'static str>,
    pub(crate) infer_shape: Option<InferShapeFn>,
    pub(crate) infer_type: Option<InferTypeFn>,
    pub(crate) compute: HashMap<Device, ComputeFn>,
    pub(crate) create_operator: Option<CreateOperatorFn>,
    pub(crate) mutate_inputs: Option<IndicesFn>,
    pub(crate) resource_request: Option<ResourceFn>,
    pub(crate) array_function: Option<ArrayFn>,
}

impl OpDef {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            parser: None,
            num_inputs: Arity::Fixed(1),
            num_outputs: Arity::Fixed(1),
            num_visible_outputs: None,
            key_var_num_args: None,
            infer_shape: None,
            infer_type: None,
            compute: HashMap::default(),
            create_operator: None,
            mutate_inputs: None,
            resource_request: None,
            array_function: None,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Binds the call's parameters into attributes and runs the parser, if any.
    pub fn parse(&self, mut dict: ParamDict, num_inputs: usize) -> Result<OpAttrs, ParamError> {
        if let Some(key) = self.key_var_num_args {
            dict.entry(key.to_string())
                .or_insert_with(|| num_inputs.to_string());
        }
        let mut attrs = OpAttrs::new(self.name.clone(), dict);
        if let Some(parser) = self.parser {
            attrs.parsed = Some(parser(&attrs.dict)?);
        }
        Ok(attrs)
    }

    /// Parses attributes into `P` with its derived parser.
    pub fn params<P: Params>(self) -> Self {
        let parser: ParseFn = |dict| {
            let params = P::from_dict(dict)?;
            Ok(Arc::new(params))
        };
        self.parser(parser)
    }

    pub fn parser(mut self, f: ParseFn) -> Self {
        self.parser = Some(f);
        self
    }

    pub fn num_inputs(mut self, count: usize) -> Self {
        self.num_inputs = Arity::Fixed(count);
        self
    }

    pub fn num_inputs_with(mut self, f: CountFn) -> Self {
        self.num_inputs = Arity::Dynamic(f);
        self
    }

    pub fn num_outputs(mut self, count: usize) -> Self {
        self.num_outputs = Arity::Fixed(count);
        self
    }

    pub fn num_outputs_with(mut self, f: CountFn) -> Self {
        self.num_outputs = Arity::Dynamic(f);
        self
    }

    /// Outputs returned to the caller. The remaining outputs stay hidden.
    pub fn num_visible_outputs(mut self, f: CountFn) -> Self {
        self.num_visible_outputs = Some(f);
        self
    }

    /// The parameter carrying the number of variadic inputs. Filled in if the caller omits it.
    pub fn key_var_num_args(mut self, key: &'static str) -> Self {
        self.key_var_num_args = Some(key);
        self
    }

    pub fn infer_shape(mut self, f: InferShapeFn) -> Self {
        self.infer_shape = Some(f);
        self
    }

    pub fn infer_type(mut self, f: InferTypeFn) -> Self {
        self.infer_type = Some(f);
        self
    }

    pub fn compute(mut self, device: Device, f: ComputeFn) -> Self {
        self.compute.insert(device, f);
        self
    }

    pub fn create_operator(mut self, f: CreateOperatorFn) -> Self {
        self.create_operator = Some(f);
        self
    }

    /// Indices of the inputs the op writes in place.
    pub fn mutate_inputs(mut self, f: IndicesFn) -> Self {
        self.mutate_inputs = Some(f);
        self
    }

    pub fn resource_request(mut self, f: ResourceFn) -> Self {
        self.resource_request = Some(f);
        self
    }

    /// A function run directly on the caller's thread, bypassing inference and the engine.
    pub fn array_function(mut self, f: ArrayFn) -> Self {
        self.array_function = Some(f);
        self
    }
}

/// Operator definitions keyed by name.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    ops: HashMap<Arc<str>, Arc<OpDef>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, op: OpDef) -> Self {
        let name = op.name.clone();
        if self.ops.insert(name.clone(), Arc::new(op)).is_some() {
            #[cfg(feature = "strict")]
            panic!("op `{name}` registered twice");
            #[cfg(not(feature = "strict"))]
            log::warn!("op `{name}` registered twice, replacing");
        }
        self
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<Arc<OpDef>> {
        self.ops.get(name).cloned()
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ops.keys().map(|name| name.as_ref())
    }
}

/// Fills slot `index` with `shape`, failing if it already holds a different known shape.
pub fn assign_shape(shapes: &mut [Shape], index: usize, shape: Shape) -> Result<(), ShapeError> {
    let slot = &mut shapes[index];
    if shape.is_unknown() || *slot == shape {
        return Ok(());
    }
    if slot.is_unknown() {
        *slot = shape;
        return Ok(());
    }
    Err(ShapeError::Assign {
        index,
        expected: slot.clone(),
        got: shape,
    })
}

/// Fills slot `index` with `dtype`, failing if it already holds a different type.
pub fn assign_type(
    types: &mut [Option<DataType>],
    index: usize,
    dtype: DataType,
) -> Result<(), OpError> {
    match types[index] {
        None => {
            types[index] = Some(dtype);
            Ok(())
        }
        Some(expected) if expected == dtype => Ok(()),
        Some(expected) => Err(OpError::Type {
            index,
            expected,
            got: dtype,
        }),
    }
}

/// Type inference of ops whose inputs and outputs all share one type.
pub fn elemwise_type(
    _attrs: &OpAttrs,
    inputs: &mut [Option<DataType>],
    outputs: &mut [Option<DataType>],
) -> Result<bool, OpError> {
    let Some(dtype) = inputs.iter().chain(outputs.iter()).find_map(|&dtype| dtype) else {
        return Ok(false);
    };
    for index in 0..inputs.len() {
        assign_type(inputs, index, dtype)?;
    }
    for index in 0..outputs.len() {
        assign_type(outputs, index, dtype)?;
    }
    Ok(true)
}
