//! In-memory object store used by the test suites and embedders that
//! want a self-contained journal. Asynchronous completions and watch
//! callbacks run on a dedicated store thread, mirroring the production
//! store's callback threading.

use crate::error::{JournalError, Result};
use crate::executor::{AsyncOpTracker, BytesCompletion, Completion};
use crate::header::class::{self, HeaderState};
use crate::store::{ExecCall, ObjectStore, WatchHandler, WatchId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

#[derive(Default)]
struct ObjectState {
    data: Vec<u8>,
    header: Option<HeaderState>,
    watchers: BTreeMap<WatchId, Arc<dyn WatchHandler>>,
}

#[derive(Default)]
struct StoreState {
    objects: BTreeMap<String, ObjectState>,
    next_watch_id: WatchId,
    next_notify_id: u64,
    append_errors: HashMap<String, VecDeque<JournalError>>,
}

enum Job {
    Run(Box<dyn FnOnce() + Send>),
    Stop,
}

pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
    jobs: Mutex<Sender<Job>>,
    ops: Arc<AsyncOpTracker>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = channel::<Job>();
        let thread = std::thread::Builder::new()
            .name("memory-store".to_string())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    match job {
                        Job::Run(job) => job(),
                        Job::Stop => break,
                    }
                }
            })
            .expect("spawn store thread");

        Arc::new(Self {
            state: Arc::new(Mutex::new(StoreState {
                next_watch_id: 1,
                next_notify_id: 1,
                ..StoreState::default()
            })),
            jobs: Mutex::new(sender),
            ops: Arc::new(AsyncOpTracker::new()),
            thread: Mutex::new(Some(thread)),
        })
    }

    fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.ops.start_op();
        let ops = Arc::clone(&self.ops);
        let wrapped = Box::new(move || {
            job();
            ops.finish_op();
        });
        if self.jobs.lock().send(Job::Run(wrapped)).is_err() {
            self.ops.finish_op();
        }
    }

    fn exec_locked(state: &mut StoreState, oid: &str, calls: &[ExecCall]) -> Result<Vec<u8>> {
        let existing = state.objects.get(oid);
        let mut header = existing.and_then(|object| object.header.clone());
        let object_size = existing.map(|object| object.data.len() as u64).unwrap_or(0);
        let preexisting = existing.is_some();

        let mut output = Vec::new();
        for call in calls {
            let out = class::call(&mut header, object_size, &call.method, &call.input)?;
            output.extend_from_slice(&out);
        }

        // atomic commit of the batch
        if preexisting || header.is_some() {
            let object = state.objects.entry(oid.to_string()).or_default();
            object.header = header;
        }
        Ok(output)
    }

    fn watchers_of(&self, oid: &str) -> Vec<Arc<dyn WatchHandler>> {
        let state = self.state.lock();
        state
            .objects
            .get(oid)
            .map(|object| object.watchers.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Queue `err` for the next guarded append on `oid` (test hook).
    pub fn inject_append_error(&self, oid: &str, err: JournalError) {
        self.state
            .lock()
            .append_errors
            .entry(oid.to_string())
            .or_default()
            .push_back(err);
    }

    /// Deliver a watch error to every watcher of `oid` (test hook); the
    /// registrations stay live until the owner unwatches.
    pub fn break_watches(&self, oid: &str, err: JournalError) {
        let watchers = self.watchers_of(oid);
        self.submit(move || {
            for watcher in watchers {
                watcher.handle_error(err.clone());
            }
        });
    }

    /// Raw object payload, for assertions on frame layout.
    pub fn object_data(&self, oid: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .objects
            .get(oid)
            .map(|object| object.data.clone())
    }

    pub fn object_names(&self) -> Vec<String> {
        self.state.lock().objects.keys().cloned().collect()
    }
}

impl ObjectStore for MemoryStore {
    fn exec(&self, oid: &str, calls: Vec<ExecCall>) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        Self::exec_locked(&mut state, oid, &calls)
    }

    fn aio_exec(&self, oid: &str, calls: Vec<ExecCall>, on_complete: BytesCompletion) {
        let state = Arc::clone(&self.state);
        let oid = oid.to_string();
        self.submit(move || {
            let result = {
                let mut state = state.lock();
                Self::exec_locked(&mut state, &oid, &calls)
            };
            on_complete(result);
        });
    }

    fn aio_append(
        &self,
        oid: &str,
        soft_max_size: u64,
        data: Vec<u8>,
        on_complete: Completion,
    ) {
        let state = Arc::clone(&self.state);
        let oid = oid.to_string();
        self.submit(move || {
            let result = {
                let mut state = state.lock();
                if let Some(err) = state
                    .append_errors
                    .get_mut(&oid)
                    .and_then(|queue| queue.pop_front())
                {
                    Err(err)
                } else {
                    let object = state.objects.entry(oid.clone()).or_default();
                    if object.data.len() as u64 >= soft_max_size {
                        Err(JournalError::Overflow)
                    } else {
                        object.data.extend_from_slice(&data);
                        Ok(())
                    }
                }
            };
            on_complete(result);
        });
    }

    fn aio_read(&self, oid: &str, on_complete: BytesCompletion) {
        let state = Arc::clone(&self.state);
        let oid = oid.to_string();
        self.submit(move || {
            let result = {
                let state = state.lock();
                state
                    .objects
                    .get(&oid)
                    .map(|object| object.data.clone())
                    .ok_or(JournalError::NotFound)
            };
            on_complete(result);
        });
    }

    fn stat(&self, oid: &str) -> Result<u64> {
        let state = self.state.lock();
        state
            .objects
            .get(oid)
            .map(|object| object.data.len() as u64)
            .ok_or(JournalError::NotFound)
    }

    fn remove(&self, oid: &str) -> Result<()> {
        let watchers = {
            let mut state = self.state.lock();
            let object = state.objects.remove(oid).ok_or(JournalError::NotFound)?;
            object.watchers.into_values().collect::<Vec<_>>()
        };
        if !watchers.is_empty() {
            // deleted-object watchers observe the loss asynchronously
            self.submit(move || {
                for watcher in watchers {
                    watcher.handle_error(JournalError::NotFound);
                }
            });
        }
        Ok(())
    }

    fn aio_remove(&self, oid: &str, on_complete: Completion) {
        let state = Arc::clone(&self.state);
        let oid = oid.to_string();
        self.submit(move || {
            let result = {
                let mut state = state.lock();
                state
                    .objects
                    .remove(&oid)
                    .map(|_| ())
                    .ok_or(JournalError::NotFound)
            };
            on_complete(result);
        });
    }

    fn watch(&self, oid: &str, handler: Arc<dyn WatchHandler>) -> Result<WatchId> {
        let mut state = self.state.lock();
        let watch_id = state.next_watch_id;
        let object = state
            .objects
            .get_mut(oid)
            .ok_or(JournalError::NotFound)?;
        object.watchers.insert(watch_id, handler);
        state.next_watch_id += 1;
        Ok(watch_id)
    }

    fn unwatch(&self, oid: &str, watch_id: WatchId) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(object) = state.objects.get_mut(oid) {
            object.watchers.remove(&watch_id);
        }
        Ok(())
    }

    fn notify(&self, oid: &str) -> Result<()> {
        let notify_id = {
            let mut state = self.state.lock();
            let id = state.next_notify_id;
            state.next_notify_id += 1;
            id
        };
        let watchers = self.watchers_of(oid);
        self.submit(move || {
            for watcher in watchers {
                watcher.handle_notify(notify_id);
            }
        });
        Ok(())
    }

    fn aio_notify(&self, oid: &str, on_complete: Completion) {
        let result = self.notify(oid);
        self.submit(move || on_complete(result));
    }

    fn notify_ack(&self, _oid: &str, _notify_id: u64) {}

    fn flush(&self) {
        self.ops.wait_for_ops();
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        let _ = self.jobs.lock().send(Job::Stop);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}
