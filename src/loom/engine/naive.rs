use std::sync::RwLock;

use rustc_hash::FxHashMap as HashMap;

use super::{
    AsyncFn, Complete, Dependencies, Engine, EngineKind, Property, RunContext, Stream, run_fatal,
};
use crate::loom::{context::Context, platform::BoxFuture};

/// Runs every work item on the submitting thread and blocks until it completes.
///
/// Submission order is execution order, so dependencies are trivially honored. Work that
/// completes from another thread is fine; work that waits for a later submission deadlocks.
#[derive(Debug, Default)]
pub struct NaiveEngine {
    streams: RwLock<HashMap<Context, Stream>>,
}

impl NaiveEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream(&self, context: Context) -> Option<Stream> {
        if !context.device.is_streaming() {
            return None;
        }
        let mut streams = self.streams.write().expect("failed to lock");
        let stream = streams.entry(context).or_insert_with(|| Stream::new(context));
        Some(stream.clone())
    }
}

impl Engine for NaiveEngine {
    #[inline]
    fn kind(&self) -> EngineKind {
        EngineKind::Naive
    }

    fn push_async(
        &self,
        f: AsyncFn,
        context: Context,
        _deps: Dependencies,
        _property: Property,
        name: &str,
    ) {
        let (sender, receiver) = flume::bounded(1);
        let complete = Complete::new(name.into(), move || _ = sender.send(()));
        let context = Context {
            device: context.device.mask(),
            ..context
        };
        let run = RunContext {
            context,
            stream: self.stream(context),
        };
        log::trace!("run `{name}` on {context}");
        run_fatal(name, context, move || f(run, complete));
        _ = receiver.recv();
    }

    fn wait_all(&self) -> BoxFuture<'_, ()> {
        Box::pin(futures::future::ready(()))
    }

    #[inline]
    fn wait_all_blocking(&self) {}
}
