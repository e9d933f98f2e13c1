//! Shared helpers for the in-crate test modules.

use crate::error::Result;
use crate::executor::Completion;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// One-shot condition a test blocks on until some completion fires,
/// surfacing the delivered result.
pub(crate) struct SignalledResult {
    slot: Mutex<Option<Result<()>>>,
    cond: Condvar,
}

impl SignalledResult {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn completion(self: &Arc<Self>) -> Completion {
        let signal = Arc::clone(self);
        Box::new(move |result| signal.deliver(result))
    }

    pub(crate) fn deliver(&self, result: Result<()>) {
        let mut slot = self.slot.lock();
        *slot = Some(result);
        self.cond.notify_all();
    }

    pub(crate) fn wait(&self) -> Result<()> {
        let mut slot = self.slot.lock();
        while slot.is_none() {
            if self
                .cond
                .wait_for(&mut slot, WAIT_TIMEOUT)
                .timed_out()
            {
                panic!("completion never delivered");
            }
        }
        slot.take().expect("result present")
    }
}
