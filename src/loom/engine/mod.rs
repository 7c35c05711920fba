//! The dependency-tracked scheduling engine.
//!
//! Work is submitted together with the [`Var`]s it reads and the ones it mutates. The engine
//! runs it once every earlier conflicting submission has completed:
//! - writes to a variable run in submission order, after all earlier reads of it;
//! - reads of a variable may run concurrently once the preceding write completed;
//! - work on disjoint variables is unordered, also across contexts.
//!
//! Every callback receives a [`Complete`] token and must consume it once its effects are
//! visible. Completion releases the callback's variables to their next waiters.

use std::{str::FromStr, sync::Arc};

use derive_more::Display;
use itertools::Itertools;
use rustc_hash::FxHashSet as HashSet;
use thiserror::Error;

pub use naive::NaiveEngine;
pub use stream::Stream;
pub use threaded::ThreadedEngine;
pub use var::{Var, VarId};

use super::{
    context::Context,
    platform::{self, BoxFuture},
};

pub mod naive;
pub mod stream;
pub mod threaded;
pub mod var;

/// Scheduling class of a work item.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Property {
    #[default]
    Normal,
    /// Copies from a streaming device to the host.
    CopyFromGpu,
    /// Copies from the host to a streaming device.
    CopyToGpu,
    /// Host work that jumps ahead of normal host work.
    CpuPrioritized,
    /// Work that only launches something and completes later; runs on the dispatching thread.
    Async,
}

/// Where a work item runs.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub context: Context,
    pub stream: Option<Stream>,
}

impl RunContext {
    /// Blocks until every command enqueued on the context's stream has run.
    #[inline]
    pub fn wait_stream(&self) {
        if let Some(stream) = &self.stream {
            stream.wait();
        }
    }
}

/// One-shot completion signal of a work item.
///
/// Consuming it with [`Complete::complete`] releases the work item's variables. A token dropped
/// without being consumed completes on drop, so dependents are never left hanging.
#[must_use = "work items stay pending until their completion fires"]
pub struct Complete {
    name: Arc<str>,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
}

impl std::fmt::Debug for Complete {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Complete")
            .field("name", &self.name)
            .field("fired", &self.on_complete.is_none())
            .finish()
    }
}

impl Complete {
    pub(crate) fn new(name: Arc<str>, on_complete: impl FnOnce() + Send + 'static) -> Self {
        let on_complete = Some(Box::new(on_complete) as Box<dyn FnOnce() + Send>);
        Self { name, on_complete }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signals that the work item's effects are visible.
    #[inline]
    pub fn complete(mut self) {
        if let Some(f) = self.on_complete.take() {
            f()
        }
    }
}

impl Drop for Complete {
    fn drop(&mut self) {
        if let Some(f) = self.on_complete.take() {
            log::warn!("completion of `{}` dropped without firing", self.name);
            f()
        }
    }
}

/// Deferred computation handed to [`Engine::push_async`].
pub type AsyncFn = Box<dyn FnOnce(RunContext, Complete) + Send + 'static>;

/// Deduplicated read and write sets of a work item.
///
/// A variable listed in both sets is kept as a write only.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Dependencies {
    reads: Vec<Var>,
    writes: Vec<Var>,
}

impl Dependencies {
    pub fn new(
        reads: impl IntoIterator<Item = Var>,
        writes: impl IntoIterator<Item = Var>,
    ) -> Self {
        let writes = writes.into_iter().unique().collect_vec();
        let written: HashSet<_> = writes.iter().map(Var::id).collect();
        let reads = reads
            .into_iter()
            .unique()
            .filter(|var| !written.contains(&var.id()))
            .collect_vec();
        Self { reads, writes }
    }

    #[inline]
    pub fn reads(&self) -> &[Var] {
        &self.reads
    }

    #[inline]
    pub fn writes(&self) -> &[Var] {
        &self.writes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.reads.len() + self.writes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display)]
pub enum EngineKind {
    /// Runs every work item synchronously on the submitting thread.
    #[display("NaiveEngine")]
    Naive,
    /// Dispatches ready work items to per-context worker pools.
    #[default]
    #[display("ThreadedEngine")]
    Threaded,
}

#[derive(Debug, Error)]
#[error("unknown engine type: {0}")]
pub struct EngineKindError(String);

impl FromStr for EngineKind {
    type Err = EngineKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "NaiveEngine" | "naive" => Ok(Self::Naive),
            "ThreadedEngine" | "ThreadedEnginePerDevice" | "threaded" => Ok(Self::Threaded),
            s => Err(EngineKindError(s.to_string())),
        }
    }
}

pub trait Engine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Submits `f` to run on `context` once its dependencies allow it.
    ///
    /// Returns immediately. `f` is invoked exactly once and must consume its [`Complete`].
    fn push_async(
        &self,
        f: AsyncFn,
        context: Context,
        deps: Dependencies,
        property: Property,
        name: &str,
    );

    /// Resolves once every work item submitted so far has completed.
    fn wait_all(&self) -> BoxFuture<'_, ()>;

    /// Blocks until every work item submitted so far has completed.
    fn wait_all_blocking(&self);
}

/// Conveniences available on every [`Engine`], including `dyn Engine`.
pub trait EngineExt: Engine {
    /// Creates a fresh dependency variable.
    #[inline]
    fn new_var(&self) -> Var {
        Var::new()
    }

    /// Submits a closure whose effects are visible as soon as it returns.
    fn push_sync<F>(&self, f: F, context: Context, deps: Dependencies, property: Property, name: &str)
    where
        F: FnOnce(RunContext) + Send + 'static,
    {
        let f = move |run: RunContext, complete: Complete| {
            f(run);
            complete.complete();
        };
        self.push_async(Box::new(f), context, deps, property, name);
    }

    /// Resolves once all work that writes `var` submitted before this call has completed.
    fn wait_for_var(&self, var: &Var) -> BoxFuture<'static, ()> {
        let (sender, receiver) = flume::bounded(1);
        let f = move |_: RunContext, complete: Complete| {
            complete.complete();
            _ = sender.send(());
        };
        let deps = Dependencies::new([var.clone()], []);
        self.push_async(Box::new(f), Context::cpu(), deps, Property::Async, "wait_for_var");
        Box::pin(async move {
            _ = receiver.recv_async().await;
        })
    }

    /// Blocking version of [`EngineExt::wait_for_var`].
    fn wait_for_var_blocking(&self, var: &Var) {
        let (sender, receiver) = flume::bounded(1);
        let f = move |_: RunContext, complete: Complete| {
            complete.complete();
            _ = sender.send(());
        };
        let deps = Dependencies::new([var.clone()], []);
        self.push_async(Box::new(f), Context::cpu(), deps, Property::Async, "wait_for_var");
        _ = receiver.recv();
    }
}

impl<E: Engine + ?Sized> EngineExt for E {}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineBuilder {
    pub kind: EngineKind,
    /// Worker threads per host context.
    pub cpu_workers: usize,
    /// Worker threads serving [`Property::CpuPrioritized`] per host context.
    pub cpu_priority_workers: usize,
    /// Worker threads per streaming context.
    pub gpu_workers: usize,
    /// Worker threads serving copies per streaming context.
    pub gpu_copy_workers: usize,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            kind: EngineKind::Threaded,
            cpu_workers: 1,
            cpu_priority_workers: 4,
            gpu_workers: 2,
            gpu_copy_workers: 1,
        }
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the configuration from `WEFT_*` environment variables.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            kind: platform::env_or("WEFT_ENGINE_TYPE", default.kind),
            cpu_workers: platform::env_or("WEFT_CPU_WORKER_NTHREADS", default.cpu_workers),
            cpu_priority_workers: platform::env_or(
                "WEFT_CPU_PRIORITY_NTHREADS",
                default.cpu_priority_workers,
            ),
            gpu_workers: platform::env_or("WEFT_GPU_WORKER_NTHREADS", default.gpu_workers),
            gpu_copy_workers: platform::env_or("WEFT_GPU_COPY_NTHREADS", default.gpu_copy_workers),
        }
    }

    pub fn kind(mut self, kind: EngineKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn cpu_workers(mut self, count: usize) -> Self {
        self.cpu_workers = count;
        self
    }

    pub fn cpu_priority_workers(mut self, count: usize) -> Self {
        self.cpu_priority_workers = count;
        self
    }

    pub fn gpu_workers(mut self, count: usize) -> Self {
        self.gpu_workers = count;
        self
    }

    pub fn gpu_copy_workers(mut self, count: usize) -> Self {
        self.gpu_copy_workers = count;
        self
    }

    pub fn build(self) -> Arc<dyn Engine> {
        log::debug!("building {} with {self:?}", self.kind);
        match self.kind {
            EngineKind::Naive => Arc::new(NaiveEngine::new()),
            EngineKind::Threaded => Arc::new(ThreadedEngine::new(self)),
        }
    }
}

/// Runs a callback, aborting the process if it panics. Work items have no partial-failure recovery.
pub(crate) fn run_fatal(name: &str, context: Context, f: impl FnOnce()) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
    if result.is_err() {
        log::error!("work item `{name}` panicked on {context}, aborting");
        std::process::abort();
    }
}
