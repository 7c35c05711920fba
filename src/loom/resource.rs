//! Reusable scratch resources leased to work items.
//!
//! Each resource carries its own [`Var`]. A work item using a resource lists that variable in
//! its write set, so two in-flight work items never hold the same resource.

use std::sync::{
    Arc, Mutex, RwLock,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use derive_more::Display;
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use super::{
    context::{Context, Device},
    engine::{Dependencies, Engine, EngineExt, Property, RunContext, Var},
    num::DataType,
    platform,
    shape::Shape,
    tensor::{Storage, TBlob},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ResourceRequest {
    /// A workspace buffer that grows on demand.
    #[default]
    #[display("temp_space")]
    TempSpace,
    /// A seeded random number stream.
    #[display("random")]
    Random,
}

#[derive(Debug, Error)]
#[error("resource {got} cannot serve as {expected}")]
pub struct ResourceError {
    pub expected: ResourceRequest,
    pub got: ResourceRequest,
}

#[derive(Debug)]
enum Payload {
    Space(Mutex<Arc<Storage>>),
    Random(Mutex<fastrand::Rng>),
}

#[derive(Debug)]
struct Slot {
    context: Context,
    var: Var,
    payload: Payload,
}

/// A leased resource.
#[derive(Debug, Clone)]
pub struct Resource(Arc<Slot>);

impl Resource {
    fn new(context: Context, payload: Payload) -> Self {
        let var = Var::new();
        Self(Arc::new(Slot {
            context,
            var,
            payload,
        }))
    }

    #[inline]
    pub fn kind(&self) -> ResourceRequest {
        match self.0.payload {
            Payload::Space(_) => ResourceRequest::TempSpace,
            Payload::Random(_) => ResourceRequest::Random,
        }
    }

    #[inline]
    pub fn context(&self) -> Context {
        self.0.context
    }

    #[inline]
    pub fn var(&self) -> &Var {
        &self.0.var
    }

    /// Lends a workspace of the given shape, growing the buffer if it is too small.
    ///
    /// The contents are left over from earlier users.
    pub fn get_space(
        &self,
        shape: impl Into<Shape>,
        dtype: DataType,
    ) -> Result<TBlob, ResourceError> {
        let Payload::Space(space) = &self.0.payload else {
            return Err(ResourceError {
                expected: ResourceRequest::TempSpace,
                got: self.kind(),
            });
        };
        let shape = shape.into();
        let len = shape.size() * dtype.size();
        let mut storage = space.lock().expect("failed to lock");
        if storage.len() < len {
            log::trace!("grow temp space on {} to {len} bytes", self.0.context);
            *storage = Arc::new(Storage::new(len));
        }
        Ok(TBlob::new(shape, dtype, storage.clone()))
    }

    /// Runs `f` with the random number generator.
    pub fn with_rng<R>(&self, f: impl FnOnce(&mut fastrand::Rng) -> R) -> Result<R, ResourceError> {
        let Payload::Random(rng) = &self.0.payload else {
            return Err(ResourceError {
                expected: ResourceRequest::Random,
                got: self.kind(),
            });
        };
        let mut rng = rng.lock().expect("failed to lock");
        Ok(f(&mut rng))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceBuilder {
    /// Temp spaces per host context, handed out round-robin.
    pub cpu_temp_copies: usize,
    /// Temp spaces per streaming context, handed out round-robin.
    pub gpu_temp_copies: usize,
    /// The global seed of random streams.
    pub seed: u64,
}

impl Default for ResourceBuilder {
    fn default() -> Self {
        Self {
            cpu_temp_copies: 4,
            gpu_temp_copies: 1,
            seed: 0,
        }
    }
}

impl ResourceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the configuration from `WEFT_*` environment variables.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            cpu_temp_copies: platform::env_or("WEFT_CPU_TEMP_COPY", default.cpu_temp_copies),
            gpu_temp_copies: platform::env_or("WEFT_GPU_TEMP_COPY", default.gpu_temp_copies),
            seed: platform::env_or("WEFT_SEED", default.seed),
        }
    }

    pub fn cpu_temp_copies(mut self, count: usize) -> Self {
        self.cpu_temp_copies = count;
        self
    }

    pub fn gpu_temp_copies(mut self, count: usize) -> Self {
        self.gpu_temp_copies = count;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn build(self, engine: Arc<dyn Engine>) -> ResourceManager {
        let seed = AtomicU64::new(self.seed);
        ResourceManager {
            engine,
            config: self,
            seed,
            pools: Default::default(),
        }
    }
}

#[derive(Debug)]
struct Pool {
    spaces: Vec<Resource>,
    cursor: AtomicUsize,
    random: Resource,
}

impl Pool {
    fn new(context: Context, copies: usize, seed: u64) -> Self {
        let spaces = (0..copies.max(1))
            .map(|_| Resource::new(context, Payload::Space(Mutex::new(Arc::new(Storage::new(0))))))
            .collect();
        let rng = fastrand::Rng::with_seed(context_seed(seed, context));
        let random = Resource::new(context, Payload::Random(Mutex::new(rng)));
        log::debug!("created resource pool for {context} with {copies} temp spaces");
        Self {
            spaces,
            cursor: AtomicUsize::new(0),
            random,
        }
    }
}

#[inline]
fn context_seed(seed: u64, context: Context) -> u64 {
    seed.wrapping_add(context.id as u64)
}

/// Issues per-context scratch resources.
///
/// Holds the engine, which therefore outlives every resource it issued.
pub struct ResourceManager {
    engine: Arc<dyn Engine>,
    config: ResourceBuilder,
    seed: AtomicU64,
    pools: RwLock<HashMap<Context, Arc<Pool>>>,
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("config", &self.config)
            .field("seed", &self.seed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ResourceManager {
    fn pool(&self, context: Context) -> Arc<Pool> {
        if let Some(pool) = self.pools.read().expect("failed to lock").get(&context) {
            return pool.clone();
        }
        let copies = match context.device {
            Device::Gpu => self.config.gpu_temp_copies,
            _ => self.config.cpu_temp_copies,
        };
        let mut pools = self.pools.write().expect("failed to lock");
        // read under the lock, ordered against `seed`
        let seed = self.seed.load(Ordering::Acquire);
        pools
            .entry(context)
            .or_insert_with(|| Arc::new(Pool::new(context, copies, seed)))
            .clone()
    }

    /// Leases a resource on `context`. The caller must write the resource's variable.
    pub fn request(&self, context: Context, request: ResourceRequest) -> Resource {
        let context = Context {
            device: context.device.mask(),
            ..context
        };
        let pool = self.pool(context);
        match request {
            ResourceRequest::TempSpace => {
                let index = pool.cursor.fetch_add(1, Ordering::Relaxed) % pool.spaces.len();
                pool.spaces[index].clone()
            }
            ResourceRequest::Random => pool.random.clone(),
        }
    }

    /// Reseeds every random stream, ordered after all work already using them.
    pub fn seed(&self, seed: u64) {
        self.seed.store(seed, Ordering::Release);
        let pools = self.pools.read().expect("failed to lock");
        for (&context, pool) in pools.iter() {
            let random = pool.random.clone();
            let deps = Dependencies::new([], [random.var().clone()]);
            let f = move |_: RunContext| {
                _ = random.with_rng(|rng| rng.seed(context_seed(seed, context)));
            };
            self.engine
                .push_sync(f, context, deps, Property::Normal, "resource_seed");
        }
    }
}
