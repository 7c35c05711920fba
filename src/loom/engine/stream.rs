use super::run_fatal;
use crate::loom::context::Context;

enum Command {
    Run(Box<dyn FnOnce() + Send>),
    Sync(flume::Sender<()>),
}

/// An ordered asynchronous command queue of a streaming context.
///
/// Commands run one after another on a dedicated thread. The thread exits once every handle
/// of the stream is dropped.
#[derive(Debug, Clone)]
pub struct Stream {
    context: Context,
    sender: flume::Sender<Command>,
}

impl Stream {
    pub fn new(context: Context) -> Self {
        let (sender, receiver) = flume::unbounded();
        let spawned = std::thread::Builder::new()
            .name(format!("weft-{context}-stream"))
            .spawn(move || serve(context, receiver));
        if let Err(err) = spawned {
            log::error!("failed to spawn stream thread for {context}: {err}");
        }
        log::debug!("created stream for {context}");
        Self { context, sender }
    }

    #[inline]
    pub fn context(&self) -> Context {
        self.context
    }

    /// Enqueues a command. Returns immediately.
    pub fn enqueue(&self, f: impl FnOnce() + Send + 'static) {
        _ = self.sender.send(Command::Run(Box::new(f)));
    }

    /// Blocks until every command enqueued so far has run.
    pub fn wait(&self) {
        let (sender, receiver) = flume::bounded(1);
        if self.sender.send(Command::Sync(sender)).is_ok() {
            _ = receiver.recv();
        }
    }
}

fn serve(context: Context, receiver: flume::Receiver<Command>) {
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Run(f) => run_fatal("stream command", context, f),
            Command::Sync(sender) => _ = sender.send(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::Stream;
    use crate::loom::context::Context;

    #[test]
    fn test_stream_order() {
        let stream = Stream::new(Context::gpu(0));
        let log = Arc::new(Mutex::new(vec![]));
        for index in 0..16 {
            let log = log.clone();
            stream.enqueue(move || log.lock().unwrap().push(index));
        }
        stream.wait();
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }
}
