use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use super::threaded::Block;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId;

#[derive(Debug)]
enum Waiter {
    Read(Arc<Block>),
    Write(Arc<Block>),
}

/// Scheduling state of one variable.
#[derive(Debug, Default)]
struct VarState {
    /// Number of reads currently allowed to run.
    reads: usize,
    /// Whether a write is currently allowed to run.
    writing: bool,
    /// Work items waiting on this variable, in submission order.
    queue: VecDeque<Waiter>,
}

/// A dependency variable: the scheduling token of one mutable resource.
///
/// The variable carries no payload. Cloning it yields another handle to the same token.
#[derive(Clone)]
pub struct Var(Arc<VarInner>);

struct VarInner {
    id: uid::Id<VarId>,
    state: Mutex<VarState>,
}

impl Default for Var {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Var {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "var#{}", self.id())
    }
}

impl std::fmt::Debug for Var {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Var").field(&self.id()).finish()
    }
}

impl PartialEq for Var {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Var {}

impl std::hash::Hash for Var {
    #[inline]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl Var {
    pub fn new() -> Self {
        let id = uid::Id::new();
        let state = Default::default();
        Self(Arc::new(VarInner { id, state }))
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.0.id.get()
    }

    #[inline]
    fn state(&self) -> std::sync::MutexGuard<'_, VarState> {
        self.0.state.lock().expect("failed to lock var")
    }

    /// Registers a read. Returns `true` if the read may proceed right away.
    pub(super) fn append_read(&self, block: &Arc<Block>) -> bool {
        let mut state = self.state();
        if !state.writing && state.queue.is_empty() {
            state.reads += 1;
            true
        } else {
            state.queue.push_back(Waiter::Read(block.clone()));
            false
        }
    }

    /// Registers a write. Returns `true` if the write may proceed right away.
    pub(super) fn append_write(&self, block: &Arc<Block>) -> bool {
        let mut state = self.state();
        if !state.writing && state.reads == 0 && state.queue.is_empty() {
            state.writing = true;
            true
        } else {
            state.queue.push_back(Waiter::Write(block.clone()));
            false
        }
    }

    /// Retires a read. Returns the work items this releases.
    pub(super) fn complete_read(&self) -> Vec<Arc<Block>> {
        let mut state = self.state();
        state.reads -= 1;
        if state.reads > 0 {
            return vec![];
        }
        match state.queue.pop_front() {
            Some(Waiter::Write(block)) => {
                state.writing = true;
                vec![block]
            }
            Some(Waiter::Read(_)) => unreachable!("read queued behind running reads"),
            None => vec![],
        }
    }

    /// Retires a write. Returns the work items this releases.
    pub(super) fn complete_write(&self) -> Vec<Arc<Block>> {
        let mut state = self.state();
        state.writing = false;

        let mut ready = vec![];
        while matches!(state.queue.front(), Some(Waiter::Read(_))) {
            if let Some(Waiter::Read(block)) = state.queue.pop_front() {
                state.reads += 1;
                ready.push(block);
            }
        }
        if ready.is_empty() && matches!(state.queue.front(), Some(Waiter::Write(_))) {
            if let Some(Waiter::Write(block)) = state.queue.pop_front() {
                state.writing = true;
                ready.push(block);
            }
        }
        ready
    }
}
