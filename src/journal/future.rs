//! Durability futures for appended entries. A future completes once its
//! own write is safe and every predecessor in its appender chain has
//! completed; the first error observed anywhere in the chain is the one
//! the caller sees.

use crate::error::Result;
use crate::executor::{Completion, Executor};
use parking_lot::Mutex;
use std::sync::Arc;

/// Consulted by a future to expedite durability of its pending batch.
pub trait FlushHandler: Send + Sync {
    fn flush_future(&self, future: &Arc<EntryFuture>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushState {
    None,
    Requested,
    InProgress,
}

struct FutureState {
    prev: Option<Arc<EntryFuture>>,
    flush_state: FlushState,
    safe: bool,
    consistent: bool,
    result: Result<()>,
    flush_handler: Option<Arc<dyn FlushHandler>>,
    wait_contexts: Vec<Completion>,
}

pub struct EntryFuture {
    tag: String,
    tid: u64,
    commit_tid: u64,
    executor: Executor,
    state: Mutex<FutureState>,
}

impl EntryFuture {
    /// Create a future chained to `prev`, the immediately preceding
    /// append of the same appender.
    pub fn new(
        executor: Executor,
        tag: impl Into<String>,
        tid: u64,
        commit_tid: u64,
        prev: Option<Arc<EntryFuture>>,
    ) -> Arc<Self> {
        let future = Arc::new(Self {
            tag: tag.into(),
            tid,
            commit_tid,
            executor,
            state: Mutex::new(FutureState {
                prev: prev.clone(),
                flush_state: FlushState::None,
                safe: false,
                consistent: prev.is_none(),
                result: Ok(()),
                flush_handler: None,
                wait_contexts: Vec::new(),
            }),
        });
        if let Some(prev) = prev {
            let successor = Arc::clone(&future);
            prev.wait(Box::new(move |result| successor.consistent(result)));
        }
        future
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn tid(&self) -> u64 {
        self.tid
    }

    pub fn commit_tid(&self) -> u64 {
        self.commit_tid
    }

    pub fn is_complete(&self) -> bool {
        let state = self.state.lock();
        state.safe && state.consistent
    }

    pub fn result(&self) -> Result<()> {
        self.state.lock().result.clone()
    }

    /// Invoke `cb` once the entry is durable. Idempotent; an already
    /// complete future schedules `cb` on the executor with the stored
    /// result.
    pub fn wait(&self, cb: Completion) {
        let mut state = self.state.lock();
        if state.safe && state.consistent {
            let result = state.result.clone();
            drop(state);
            self.executor.complete(cb, result);
            return;
        }
        state.wait_contexts.push(cb);
    }

    /// Request expedited durability for this future and all unflushed
    /// predecessors, then behave as [`wait`](Self::wait). A `None`
    /// callback requests the flush only.
    pub fn flush(self: &Arc<Self>, on_safe: Option<Completion>) {
        let mut handlers: Vec<(Arc<dyn FlushHandler>, Arc<EntryFuture>)> = Vec::new();
        let mut state = self.state.lock();
        if state.safe && state.consistent {
            let result = state.result.clone();
            drop(state);
            if let Some(cb) = on_safe {
                self.executor.complete(cb, result);
            }
            return;
        }
        if let Some(cb) = on_safe {
            state.wait_contexts.push(cb);
        }
        if state.flush_state != FlushState::None {
            return;
        }
        state.flush_state = FlushState::Requested;
        if let Some(handler) = state.flush_handler.clone() {
            handlers.push((handler, Arc::clone(self)));
        }
        let mut prev = state.prev.clone();
        drop(state);

        // walk the chain until a future that already flushed or completed
        while let Some(predecessor) = prev {
            let mut pred_state = predecessor.state.lock();
            if pred_state.flush_state != FlushState::None
                || (pred_state.safe && pred_state.consistent)
            {
                break;
            }
            pred_state.flush_state = FlushState::Requested;
            if let Some(handler) = pred_state.flush_handler.clone() {
                handlers.push((handler, Arc::clone(&predecessor)));
            }
            let next = pred_state.prev.clone();
            drop(pred_state);
            prev = next;
        }

        for (handler, future) in handlers {
            handler.flush_future(&future);
        }
    }

    /// Install the appender's flush handler. Returns true when a flush
    /// has already been requested, in which case the caller must flush
    /// immediately.
    pub fn attach(&self, handler: Arc<dyn FlushHandler>) -> bool {
        let mut state = self.state.lock();
        debug_assert!(state.flush_handler.is_none());
        state.flush_handler = Some(handler);
        state.flush_state != FlushState::None
    }

    pub fn detach(&self) {
        self.state.lock().flush_handler = None;
    }

    pub fn set_flush_in_progress(&self) {
        let mut state = self.state.lock();
        state.flush_state = FlushState::InProgress;
        state.flush_handler = None;
    }

    pub fn is_flush_in_progress(&self) -> bool {
        self.state.lock().flush_state == FlushState::InProgress
    }

    /// Completion from the appender: the entry (and all earlier entries
    /// of the same object write) is durably stored.
    pub fn safe(&self, result: Result<()>) {
        let mut state = self.state.lock();
        debug_assert!(!state.safe, "future safed twice");
        state.safe = true;
        state.flush_handler = None;
        if state.result.is_ok() {
            if let Err(err) = result {
                state.result = Err(err);
            }
        }
        if state.consistent {
            self.finish_locked(state);
        }
    }

    /// The predecessor chain completed with `result`.
    fn consistent(&self, result: Result<()>) {
        let mut state = self.state.lock();
        debug_assert!(!state.consistent);
        state.consistent = true;
        state.prev = None;
        if state.result.is_ok() {
            if let Err(err) = result {
                state.result = Err(err);
            }
        }
        if state.safe {
            self.finish_locked(state);
        }
    }

    fn finish_locked(&self, mut state: parking_lot::MutexGuard<'_, FutureState>) {
        let result = state.result.clone();
        let contexts = std::mem::take(&mut state.wait_contexts);
        drop(state);
        for cb in contexts {
            cb(result.clone());
        }
    }
}
