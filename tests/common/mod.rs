//! Shared helpers for the checkpoint suites.

use jostor::{Completion, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// One-shot condition bridging asynchronous completions into blocking
/// test assertions.
pub struct SignalledResult {
    slot: Mutex<Option<Result<()>>>,
    cond: Condvar,
}

impl SignalledResult {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    pub fn completion(self: &Arc<Self>) -> Completion {
        let signal = Arc::clone(self);
        Box::new(move |result| {
            let mut slot = signal.slot.lock();
            *slot = Some(result);
            signal.cond.notify_all();
        })
    }

    pub fn wait(&self) -> Result<()> {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        let mut slot = self.slot.lock();
        while slot.is_none() {
            assert!(
                !self.cond.wait_until(&mut slot, deadline).timed_out(),
                "completion never delivered"
            );
        }
        slot.take().expect("result present")
    }
}

#[allow(dead_code)]
pub fn wait_until(mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !predicate() {
        assert!(Instant::now() < deadline, "condition never reached");
        std::thread::sleep(Duration::from_millis(10));
    }
}
