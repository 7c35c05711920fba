use std::{
    sync::{
        Arc, Condvar, Mutex, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
    thread::JoinHandle,
};

use derive_more::Display;
use rustc_hash::FxHashMap as HashMap;

use super::{
    AsyncFn, Complete, Dependencies, Engine, EngineBuilder, EngineKind, Property, RunContext,
    Stream, run_fatal,
};
use crate::loom::{
    context::{Context, Device},
    platform::BoxFuture,
};

/// A submitted work item waiting for its variables.
///
/// `wait` counts the variables that have not granted access yet, plus one guard released after
/// all variables were appended. The job is dispatched by whoever brings it to zero.
pub(crate) struct Block {
    wait: AtomicUsize,
    job: Mutex<Option<Job>>,
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("wait", &self.wait.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Block {
    fn decrement(&self, shared: &Arc<Shared>) {
        if self.wait.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let job = self.job.lock().expect("failed to lock").take();
        if let Some(job) = job {
            shared.dispatch(job);
        }
    }
}

struct Job {
    f: AsyncFn,
    context: Context,
    property: Property,
    name: Arc<str>,
    complete: Complete,
}

impl Job {
    fn execute(self, stream: Option<Stream>) {
        let Job {
            f,
            context,
            name,
            complete,
            ..
        } = self;
        log::trace!("run `{name}` on {context}");
        let run = RunContext { context, stream };
        run_fatal(&name, context, move || f(run, complete));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
enum PoolKind {
    #[display("worker")]
    Normal,
    #[display("priority")]
    Priority,
    #[display("copy")]
    Copy,
}

impl PoolKind {
    fn select(context: Context, property: Property) -> Self {
        match (context.device.is_streaming(), property) {
            (false, Property::CpuPrioritized) => PoolKind::Priority,
            (true, Property::CopyFromGpu | Property::CopyToGpu) => PoolKind::Copy,
            _ => PoolKind::Normal,
        }
    }
}

struct Pool {
    sender: flume::Sender<(Job, Option<Stream>)>,
    workers: Vec<JoinHandle<()>>,
}

impl Pool {
    fn new(context: Context, kind: PoolKind, count: usize) -> Self {
        let (sender, receiver) = flume::unbounded();
        let workers = (0..count.max(1))
            .map(|index| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("weft-{context}-{kind}-{index}"))
                    .spawn(move || serve(receiver))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        log::debug!("spawned {} {kind} threads for {context}", count.max(1));
        Self { sender, workers }
    }
}

fn serve(receiver: flume::Receiver<(Job, Option<Stream>)>) {
    while let Ok((job, stream)) = receiver.recv() {
        job.execute(stream);
    }
}

struct Shared {
    config: EngineBuilder,
    pools: RwLock<HashMap<(Context, PoolKind), Pool>>,
    streams: RwLock<HashMap<Context, Stream>>,
    /// Serializes the variable appends of concurrent submissions.
    submit: Mutex<()>,
    pending: Mutex<usize>,
    idle: Condvar,
    notify: tokio::sync::Notify,
}

impl Shared {
    fn stream(&self, context: Context) -> Option<Stream> {
        if !context.device.is_streaming() {
            return None;
        }
        if let Some(stream) = self.streams.read().expect("failed to lock").get(&context) {
            return Some(stream.clone());
        }
        let mut streams = self.streams.write().expect("failed to lock");
        let stream = streams.entry(context).or_insert_with(|| Stream::new(context));
        Some(stream.clone())
    }

    fn sender(&self, context: Context, kind: PoolKind) -> flume::Sender<(Job, Option<Stream>)> {
        let key = (context, kind);
        if let Some(pool) = self.pools.read().expect("failed to lock").get(&key) {
            return pool.sender.clone();
        }
        let count = match (context.device, kind) {
            (Device::Gpu, PoolKind::Copy) => self.config.gpu_copy_workers,
            (Device::Gpu, _) => self.config.gpu_workers,
            (_, PoolKind::Priority) => self.config.cpu_priority_workers,
            (_, _) => self.config.cpu_workers,
        };
        let mut pools = self.pools.write().expect("failed to lock");
        let pool = pools
            .entry(key)
            .or_insert_with(|| Pool::new(context, kind, count));
        pool.sender.clone()
    }

    fn dispatch(&self, job: Job) {
        let context = Context {
            device: job.context.device.mask(),
            ..job.context
        };
        let stream = self.stream(context);
        match job.property {
            Property::Async => job.execute(stream),
            property => {
                let kind = PoolKind::select(context, property);
                _ = self.sender(context, kind).send((job, stream));
            }
        }
    }

    fn complete(self: &Arc<Self>, deps: &Dependencies) {
        let mut ready = vec![];
        for var in deps.reads() {
            ready.extend(var.complete_read());
        }
        for var in deps.writes() {
            ready.extend(var.complete_write());
        }
        for block in ready {
            block.decrement(self);
        }

        let mut pending = self.pending.lock().expect("failed to lock");
        *pending -= 1;
        if *pending == 0 {
            self.idle.notify_all();
            self.notify.notify_waiters();
        }
    }

    #[inline]
    fn is_idle(&self) -> bool {
        *self.pending.lock().expect("failed to lock") == 0
    }
}

/// Dispatches ready work items to lazily created per-context worker pools.
///
/// Host contexts get a normal pool and a pool for [`Property::CpuPrioritized`] work. Streaming
/// contexts get a normal pool, a copy pool and one [`Stream`]. [`Property::Async`] work runs on
/// the thread that makes it ready.
pub struct ThreadedEngine {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ThreadedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedEngine")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl ThreadedEngine {
    pub fn new(config: EngineBuilder) -> Self {
        let shared = Arc::new(Shared {
            config,
            pools: Default::default(),
            streams: Default::default(),
            submit: Mutex::new(()),
            pending: Mutex::new(0),
            idle: Condvar::new(),
            notify: tokio::sync::Notify::new(),
        });
        Self { shared }
    }
}

impl Engine for ThreadedEngine {
    #[inline]
    fn kind(&self) -> EngineKind {
        EngineKind::Threaded
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(name = name)))]
    fn push_async(
        &self,
        f: AsyncFn,
        context: Context,
        deps: Dependencies,
        property: Property,
        name: &str,
    ) {
        let name: Arc<str> = name.into();
        *self.shared.pending.lock().expect("failed to lock") += 1;

        let complete = {
            let shared = self.shared.clone();
            let deps = deps.clone();
            Complete::new(name.clone(), move || shared.complete(&deps))
        };
        let job = Job {
            f,
            context,
            property,
            name,
            complete,
        };
        let block = Arc::new(Block {
            wait: AtomicUsize::new(deps.len() + 1),
            job: Mutex::new(Some(job)),
        });

        let mut granted = 0;
        {
            let _guard = self.shared.submit.lock().expect("failed to lock");
            for var in deps.reads() {
                granted += var.append_read(&block) as usize;
            }
            for var in deps.writes() {
                granted += var.append_write(&block) as usize;
            }
        }
        for _ in 0..granted {
            block.decrement(&self.shared);
        }
        block.decrement(&self.shared);
    }

    fn wait_all(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            loop {
                let notified = self.shared.notify.notified();
                if self.shared.is_idle() {
                    break;
                }
                notified.await;
            }
        })
    }

    fn wait_all_blocking(&self) {
        let pending = self.shared.pending.lock().expect("failed to lock");
        let _pending = self
            .shared
            .idle
            .wait_while(pending, |pending| *pending > 0)
            .expect("failed to lock");
    }
}

impl Drop for ThreadedEngine {
    fn drop(&mut self) {
        self.wait_all_blocking();

        let pools = std::mem::take(&mut *self.shared.pools.write().expect("failed to lock"));
        self.shared.streams.write().expect("failed to lock").clear();
        for (_, Pool { sender, workers }) in pools {
            drop(sender);
            for worker in workers {
                _ = worker.join();
            }
        }
        log::debug!("threaded engine shut down");
    }
}
