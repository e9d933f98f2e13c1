//! Image request work queue: admission control, write blocking for
//! lifecycle transitions, journal routing for write-class requests,
//! refresh gating, and in-flight accounting for a safe shutdown.

use crate::error::{JournalError, Result};
use crate::executor::{BytesCompletion, Completion};
use crate::image::events::ImageEvent;
use crate::image::journal::{ImageJournal, ObjectRequest};
use crate::image::ImageBackend;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

/// Image-state seams consulted on dispatch: metadata refresh gating and
/// exclusive-lock acquisition for queued writes.
pub trait ImageGates: Send + Sync {
    fn is_refresh_required(&self) -> bool;
    fn refresh(&self, on_finish: Completion);
    fn is_lock_supported(&self) -> bool;
    fn is_lock_owner(&self) -> bool;
    fn request_lock(&self);
}

enum ImageRequest {
    Read {
        offset: u64,
        length: u64,
        completion: BytesCompletion,
    },
    Write {
        offset: u64,
        data: Vec<u8>,
        completion: Completion,
    },
    Discard {
        offset: u64,
        length: u64,
        completion: Completion,
    },
    Flush {
        completion: Completion,
    },
}

impl ImageRequest {
    fn is_write_op(&self) -> bool {
        !matches!(self, ImageRequest::Read { .. })
    }

    fn fail(self, err: JournalError) {
        match self {
            ImageRequest::Read { completion, .. } => completion(Err(err)),
            ImageRequest::Write { completion, .. }
            | ImageRequest::Discard { completion, .. }
            | ImageRequest::Flush { completion } => completion(Err(err)),
        }
    }
}

struct QueueState {
    queue: VecDeque<ImageRequest>,
    write_blockers: u32,
    in_progress_writes: u64,
    queued_writes: u64,
    in_flight_ops: u64,
    refresh_in_progress: bool,
    shutdown: bool,
    on_shutdown: Option<Completion>,
    write_blocker_contexts: Vec<Completion>,
    stop_worker: bool,
}

struct QueueShared {
    state: Mutex<QueueState>,
    cond: Condvar,
}

/// Admission and dispatch queue in front of the image data plane. When a
/// journal is attached, write-class requests are recorded before their
/// image I/O is issued.
pub struct ImageRequestQueue {
    backend: Arc<dyn ImageBackend>,
    gates: Arc<dyn ImageGates>,
    journal: Mutex<Option<Arc<ImageJournal>>>,
    non_blocking_io: bool,
    shared: Arc<QueueShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ImageRequestQueue {
    pub fn new(
        backend: Arc<dyn ImageBackend>,
        gates: Arc<dyn ImageGates>,
        non_blocking_io: bool,
    ) -> Arc<Self> {
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                write_blockers: 0,
                in_progress_writes: 0,
                queued_writes: 0,
                in_flight_ops: 0,
                refresh_in_progress: false,
                shutdown: false,
                on_shutdown: None,
                write_blocker_contexts: Vec::new(),
                stop_worker: false,
            }),
            cond: Condvar::new(),
        });

        let queue = Arc::new(Self {
            backend,
            gates,
            journal: Mutex::new(None),
            non_blocking_io,
            shared: Arc::clone(&shared),
            worker: Mutex::new(None),
        });

        // the worker holds only a weak reference so dropping the queue
        // stops it
        let weak = Arc::downgrade(&queue);
        let handle = std::thread::Builder::new()
            .name("image-request-queue".to_string())
            .spawn(move || worker_loop(&shared, &weak))
            .expect("spawn request queue worker");
        *queue.worker.lock() = Some(handle);
        queue
    }

    /// Route write-class requests through `journal` from now on. The
    /// journal must already be open and ready.
    pub fn set_journal(&self, journal: Arc<ImageJournal>) {
        *self.journal.lock() = Some(journal);
    }

    pub fn clear_journal(&self) {
        *self.journal.lock() = None;
    }

    pub fn aio_read(&self, offset: u64, length: u64, completion: BytesCompletion) {
        if !self.start_in_flight_op() {
            completion(Err(JournalError::ShutDown));
            return;
        }
        let queue_request = {
            let state = self.shared.state.lock();
            self.non_blocking_io || state.write_blockers > 0 || state.queued_writes > 0
        };
        if queue_request {
            self.enqueue(ImageRequest::Read {
                offset,
                length,
                completion,
            });
        } else {
            self.backend.aio_read(offset, length, completion);
            self.finish_in_flight_op();
        }
    }

    pub fn aio_write(&self, offset: u64, data: Vec<u8>, completion: Completion) {
        if !self.start_in_flight_op() {
            completion(Err(JournalError::ShutDown));
            return;
        }
        if self.must_queue_write() {
            self.enqueue(ImageRequest::Write {
                offset,
                data,
                completion,
            });
        } else {
            self.issue_write(offset, data, completion);
            self.finish_in_flight_op();
        }
    }

    pub fn aio_discard(&self, offset: u64, length: u64, completion: Completion) {
        if !self.start_in_flight_op() {
            completion(Err(JournalError::ShutDown));
            return;
        }
        if self.must_queue_write() {
            self.enqueue(ImageRequest::Discard {
                offset,
                length,
                completion,
            });
        } else {
            self.issue_discard(offset, length, completion);
            self.finish_in_flight_op();
        }
    }

    pub fn aio_flush(&self, completion: Completion) {
        if !self.start_in_flight_op() {
            completion(Err(JournalError::ShutDown));
            return;
        }
        let queue_request = {
            let state = self.shared.state.lock();
            self.non_blocking_io
                || self.is_journal_required()
                || state.write_blockers > 0
                || state.queued_writes > 0
        };
        if queue_request {
            self.enqueue(ImageRequest::Flush { completion });
        } else {
            self.issue_flush(completion);
            self.finish_in_flight_op();
        }
    }

    /// Blocking read facade.
    pub fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let cond = Arc::new((Mutex::new(None::<Result<Vec<u8>>>), Condvar::new()));
        let signal = Arc::clone(&cond);
        self.aio_read(
            offset,
            length,
            Box::new(move |result| {
                let (slot, cond) = &*signal;
                *slot.lock() = Some(result);
                cond.notify_all();
            }),
        );
        let (slot, cond) = &*cond;
        let mut result = slot.lock();
        while result.is_none() {
            cond.wait(&mut result);
        }
        result.take().expect("read result present")
    }

    /// Blocking write facade.
    pub fn write(&self, offset: u64, data: Vec<u8>) -> Result<()> {
        wait_sync(|completion| self.aio_write(offset, data, completion))
    }

    /// Blocking discard facade.
    pub fn discard(&self, offset: u64, length: u64) -> Result<()> {
        wait_sync(|completion| self.aio_discard(offset, length, completion))
    }

    /// Blocking flush facade.
    pub fn flush(&self) -> Result<()> {
        wait_sync(|completion| self.aio_flush(completion))
    }

    /// Reject new requests, let in-flight requests finish, then flush and
    /// fire `on_shutdown`.
    pub fn shut_down(&self, on_shutdown: Completion) {
        let flush_now = {
            let mut state = self.shared.state.lock();
            debug_assert!(!state.shutdown);
            state.shutdown = true;
            debug!(
                "event=image_queue_shutdown in_flight={}",
                state.in_flight_ops
            );
            if state.in_flight_ops > 0 {
                state.on_shutdown = Some(on_shutdown);
                None
            } else {
                Some(on_shutdown)
            }
        };
        if let Some(on_shutdown) = flush_now {
            self.backend.aio_flush(on_shutdown);
        }
    }

    /// Block new writes; `on_blocked` fires once in-progress writes have
    /// drained and been flushed.
    pub fn block_writes(&self, on_blocked: Completion) {
        let flush_now = {
            let mut state = self.shared.state.lock();
            state.write_blockers += 1;
            debug!(
                "event=image_queue_block_writes blockers={}",
                state.write_blockers
            );
            if !state.write_blocker_contexts.is_empty() || state.in_progress_writes > 0 {
                state.write_blocker_contexts.push(on_blocked);
                None
            } else {
                Some(on_blocked)
            }
        };
        if let Some(on_blocked) = flush_now {
            self.backend.aio_flush(on_blocked);
        }
    }

    /// Blocking write-block facade.
    pub fn block_writes_sync(&self) -> Result<()> {
        wait_sync(|completion| self.block_writes(completion))
    }

    pub fn unblock_writes(&self) {
        let wake_up = {
            let mut state = self.shared.state.lock();
            debug_assert!(state.write_blockers > 0);
            state.write_blockers -= 1;
            debug!(
                "event=image_queue_unblock_writes blockers={}",
                state.write_blockers
            );
            state.write_blockers == 0
        };
        if wake_up {
            self.shared.cond.notify_all();
        }
    }

    pub fn writes_blocked(&self) -> bool {
        self.shared.state.lock().write_blockers > 0
    }

    fn is_journal_required(&self) -> bool {
        self.journal.lock().is_some()
    }

    fn must_queue_write(&self) -> bool {
        let state = self.shared.state.lock();
        self.non_blocking_io || self.is_journal_required() || state.write_blockers > 0
    }

    fn start_in_flight_op(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            warn!("event=image_queue_rejected reason=shutdown");
            return false;
        }
        state.in_flight_ops += 1;
        true
    }

    fn finish_in_flight_op(&self) {
        let on_shutdown = {
            let mut state = self.shared.state.lock();
            state.in_flight_ops -= 1;
            if state.in_flight_ops == 0 && state.shutdown {
                state.on_shutdown.take()
            } else {
                None
            }
        };
        if let Some(on_shutdown) = on_shutdown {
            debug!("event=image_queue_shutdown_complete");
            self.backend.aio_flush(on_shutdown);
        }
    }

    fn enqueue(&self, request: ImageRequest) {
        let request_lock_needed = {
            let mut state = self.shared.state.lock();
            let is_write = request.is_write_op();
            if is_write {
                state.queued_writes += 1;
            }
            state.queue.push_back(request);
            is_write && self.gates.is_lock_supported() && !self.gates.is_lock_owner()
        };
        if request_lock_needed {
            self.gates.request_lock();
        }
        self.shared.cond.notify_all();
    }

    fn handle_refreshed(self: &Arc<Self>, result: Result<()>, request: ImageRequest) {
        debug!("event=image_queue_refreshed ok={}", result.is_ok());
        match result {
            Ok(()) => self.process(request),
            Err(err) => {
                let is_write = request.is_write_op();
                request.fail(err);
                self.retire_request(is_write);
            }
        }
        self.shared.state.lock().refresh_in_progress = false;
        self.shared.cond.notify_all();
    }

    fn process(self: &Arc<Self>, request: ImageRequest) {
        let is_write = request.is_write_op();
        match request {
            ImageRequest::Read {
                offset,
                length,
                completion,
            } => self.backend.aio_read(offset, length, completion),
            ImageRequest::Write {
                offset,
                data,
                completion,
            } => self.issue_write(offset, data, completion),
            ImageRequest::Discard {
                offset,
                length,
                completion,
            } => self.issue_discard(offset, length, completion),
            ImageRequest::Flush { completion } => self.issue_flush(completion),
        }
        self.retire_request(is_write);
    }

    fn retire_request(&self, is_write: bool) {
        if is_write {
            let drain_blockers = {
                let mut state = self.shared.state.lock();
                debug_assert!(state.queued_writes > 0);
                state.queued_writes -= 1;
                debug_assert!(state.in_progress_writes > 0);
                state.in_progress_writes -= 1;
                state.in_progress_writes == 0 && !state.write_blocker_contexts.is_empty()
            };
            if drain_blockers {
                self.handle_blocked_writes();
            }
        }
        self.finish_in_flight_op();
    }

    fn handle_blocked_writes(&self) {
        let contexts = {
            let mut state = self.shared.state.lock();
            std::mem::take(&mut state.write_blocker_contexts)
        };
        if contexts.is_empty() {
            return;
        }
        self.backend.aio_flush(Box::new(move |result| {
            for ctx in contexts {
                ctx(result.clone());
            }
        }));
    }

    fn journal_if_ready(&self) -> Option<Arc<ImageJournal>> {
        self.journal
            .lock()
            .as_ref()
            .filter(|journal| journal.is_journal_ready())
            .cloned()
    }

    fn issue_write(&self, offset: u64, data: Vec<u8>, completion: Completion) {
        match self.journal_if_ready() {
            Some(journal) => {
                let length = data.len() as u64;
                let event = ImageEvent::AioWrite {
                    offset,
                    length,
                    data: data.clone(),
                };
                let backend = Arc::clone(&self.backend);
                let commit_journal = Arc::clone(&journal);
                let request: ObjectRequest = Box::new(move |tid| {
                    backend.aio_write(
                        offset,
                        data,
                        Box::new(move |result| {
                            commit_journal.commit_io_event_extent(tid, offset, length, result);
                        }),
                    );
                });
                let _ = journal.append_io_event(
                    event,
                    vec![request],
                    offset,
                    length,
                    false,
                    completion,
                );
            }
            None => self.backend.aio_write(offset, data, completion),
        }
    }

    fn issue_discard(&self, offset: u64, length: u64, completion: Completion) {
        match self.journal_if_ready() {
            Some(journal) => {
                let event = ImageEvent::AioDiscard { offset, length };
                let backend = Arc::clone(&self.backend);
                let commit_journal = Arc::clone(&journal);
                let request: ObjectRequest = Box::new(move |tid| {
                    backend.aio_discard(
                        offset,
                        length,
                        Box::new(move |result| {
                            commit_journal.commit_io_event_extent(tid, offset, length, result);
                        }),
                    );
                });
                let _ = journal.append_io_event(
                    event,
                    vec![request],
                    offset,
                    length,
                    false,
                    completion,
                );
            }
            None => self.backend.aio_discard(offset, length, completion),
        }
    }

    fn issue_flush(&self, completion: Completion) {
        match self.journal_if_ready() {
            Some(journal) => {
                let backend = Arc::clone(&self.backend);
                let commit_journal = Arc::clone(&journal);
                let request: ObjectRequest = Box::new(move |tid| {
                    backend.aio_flush(Box::new(move |result| {
                        commit_journal.commit_io_event(tid, result);
                    }));
                });
                let _ = journal.append_io_event(
                    ImageEvent::AioFlush,
                    vec![request],
                    0,
                    0,
                    true,
                    completion,
                );
            }
            None => self.backend.aio_flush(completion),
        }
    }
}

impl Drop for ImageRequestQueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.stop_worker = true;
        }
        self.shared.cond.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: &Arc<QueueShared>, queue: &Weak<ImageRequestQueue>) {
    loop {
        let request = {
            let mut state = shared.state.lock();
            loop {
                if state.stop_worker {
                    return;
                }
                if !state.refresh_in_progress {
                    match state.queue.front() {
                        Some(front) if !front.is_write_op() || state.write_blockers == 0 => {
                            break;
                        }
                        _ => {}
                    }
                }
                shared.cond.wait(&mut state);
            }
            let request = state.queue.pop_front().expect("queue non-empty");
            if request.is_write_op() {
                state.in_progress_writes += 1;
            }
            request
        };

        let Some(queue) = queue.upgrade() else {
            return;
        };
        if queue.gates.is_refresh_required() {
            debug!("event=image_queue_refresh_gate");
            shared.state.lock().refresh_in_progress = true;
            let refresh_queue = Arc::clone(&queue);
            queue.gates.refresh(Box::new(move |result| {
                refresh_queue.handle_refreshed(result, request);
            }));
            continue;
        }
        queue.process(request);
    }
}

fn wait_sync(submit: impl FnOnce(Completion)) -> Result<()> {
    let cond = Arc::new((Mutex::new(None::<Result<()>>), Condvar::new()));
    let signal = Arc::clone(&cond);
    submit(Box::new(move |result| {
        let (slot, cond) = &*signal;
        *slot.lock() = Some(result);
        cond.notify_all();
    }));
    let (slot, cond) = &*cond;
    let mut result = slot.lock();
    while result.is_none() {
        cond.wait(&mut result);
    }
    result.take().expect("result present")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageOperation;
    use crate::testutil::SignalledResult;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct MockBackend {
        writes: Mutex<Vec<(u64, Vec<u8>)>>,
        pending_writes: Mutex<Vec<Completion>>,
        pending_flushes: Mutex<Vec<Completion>>,
        defer_writes: Mutex<bool>,
    }

    impl MockBackend {
        fn complete_pending_write(&self) {
            let write = self.pending_writes.lock().pop();
            if let Some(write) = write {
                write(Ok(()));
            }
            let flushes: Vec<Completion> = {
                let pending = self.pending_writes.lock();
                if pending.is_empty() {
                    self.pending_flushes.lock().drain(..).collect()
                } else {
                    Vec::new()
                }
            };
            for flush in flushes {
                flush(Ok(()));
            }
        }
    }

    impl ImageBackend for MockBackend {
        fn aio_read(&self, _offset: u64, length: u64, on_finish: BytesCompletion) {
            on_finish(Ok(vec![0u8; length as usize]));
        }

        fn aio_write(&self, offset: u64, data: Vec<u8>, on_finish: Completion) {
            self.writes.lock().push((offset, data));
            if *self.defer_writes.lock() {
                self.pending_writes.lock().push(on_finish);
            } else {
                on_finish(Ok(()));
            }
        }

        fn aio_discard(&self, _offset: u64, _length: u64, on_finish: Completion) {
            on_finish(Ok(()));
        }

        fn aio_flush(&self, on_finish: Completion) {
            if self.pending_writes.lock().is_empty() {
                on_finish(Ok(()));
            } else {
                self.pending_flushes.lock().push(on_finish);
            }
        }

        fn execute_op(&self, _op: ImageOperation, on_finish: Completion) {
            on_finish(Ok(()));
        }
    }

    #[derive(Default)]
    struct MockGates {
        refresh_required: Mutex<bool>,
        refreshes: Mutex<u32>,
        lock_requests: Mutex<u32>,
    }

    impl ImageGates for MockGates {
        fn is_refresh_required(&self) -> bool {
            *self.refresh_required.lock()
        }

        fn refresh(&self, on_finish: Completion) {
            *self.refresh_required.lock() = false;
            *self.refreshes.lock() += 1;
            on_finish(Ok(()));
        }

        fn is_lock_supported(&self) -> bool {
            false
        }

        fn is_lock_owner(&self) -> bool {
            true
        }

        fn request_lock(&self) {
            *self.lock_requests.lock() += 1;
        }
    }

    struct Fixture {
        backend: Arc<MockBackend>,
        gates: Arc<MockGates>,
        queue: Arc<ImageRequestQueue>,
    }

    fn fixture(non_blocking_io: bool) -> Fixture {
        let backend = Arc::new(MockBackend::default());
        let gates = Arc::new(MockGates::default());
        let queue = ImageRequestQueue::new(
            Arc::clone(&backend) as Arc<dyn ImageBackend>,
            Arc::clone(&gates) as Arc<dyn ImageGates>,
            non_blocking_io,
        );
        Fixture {
            backend,
            gates,
            queue,
        }
    }

    fn wait_until(mut predicate: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !predicate() {
            assert!(Instant::now() < deadline, "condition never reached");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn unjournaled_unblocked_writes_issue_inline() {
        let fx = fixture(false);
        fx.queue.write(0, vec![1, 2, 3]).unwrap();
        assert_eq!(*fx.backend.writes.lock(), vec![(0, vec![1, 2, 3])]);
        assert_eq!(fx.queue.read(0, 3).unwrap(), vec![0, 0, 0]);
        fx.queue.flush().unwrap();
        fx.queue.discard(0, 3).unwrap();
    }

    #[test]
    fn non_blocking_mode_routes_through_the_worker() {
        let fx = fixture(true);
        fx.queue.write(8, vec![9]).unwrap();
        assert_eq!(*fx.backend.writes.lock(), vec![(8, vec![9])]);
    }

    #[test]
    fn blocked_writes_queue_and_release_in_fifo_order() {
        let fx = fixture(false);
        fx.queue.block_writes_sync().unwrap();
        assert!(fx.queue.writes_blocked());

        let first = SignalledResult::new();
        let second = SignalledResult::new();
        fx.queue.aio_write(0, vec![1], first.completion());
        fx.queue.aio_write(8, vec![2], second.completion());
        // both are parked behind the write blocker
        std::thread::sleep(Duration::from_millis(50));
        assert!(fx.backend.writes.lock().is_empty());

        fx.queue.unblock_writes();
        first.wait().unwrap();
        second.wait().unwrap();
        assert_eq!(*fx.backend.writes.lock(), vec![(0, vec![1]), (8, vec![2])]);
    }

    #[test]
    fn reads_bypass_the_block_only_without_queued_writes() {
        let fx = fixture(false);
        fx.queue.block_writes_sync().unwrap();

        // no queued writes: the read proceeds inline
        assert_eq!(fx.queue.read(0, 1).unwrap(), vec![0]);

        let write = SignalledResult::new();
        fx.queue.aio_write(0, vec![1], write.completion());
        // a queued write forces later reads behind it
        let read_done = SignalledResult::new();
        let read_signal = Arc::clone(&read_done);
        fx.queue.aio_read(
            0,
            1,
            Box::new(move |result| read_signal.deliver(result.map(|_| ()))),
        );
        std::thread::sleep(Duration::from_millis(50));
        assert!(fx.backend.writes.lock().is_empty());

        fx.queue.unblock_writes();
        write.wait().unwrap();
        read_done.wait().unwrap();
    }

    #[test]
    fn block_writes_waits_for_outstanding_write_io() {
        let fx = fixture(true);
        *fx.backend.defer_writes.lock() = true;

        let write = SignalledResult::new();
        let write_signal = Arc::clone(&write);
        fx.queue
            .aio_write(0, vec![7], Box::new(move |result| write_signal.deliver(result)));
        wait_until(|| fx.backend.pending_writes.lock().len() == 1);

        let blocked = SignalledResult::new();
        fx.queue.block_writes(blocked.completion());
        // the blocker's flush is held back by the outstanding write
        std::thread::sleep(Duration::from_millis(50));
        assert!(fx.backend.pending_writes.lock().len() == 1);

        fx.backend.complete_pending_write();
        write.wait().unwrap();
        blocked.wait().unwrap();
        fx.queue.unblock_writes();
    }

    #[test]
    fn shutdown_rejects_new_requests_and_drains() {
        let fx = fixture(false);
        let done = SignalledResult::new();
        fx.queue.shut_down(done.completion());
        done.wait().unwrap();

        assert_eq!(
            fx.queue.write(0, vec![1]),
            Err(JournalError::ShutDown)
        );
        assert_eq!(fx.queue.flush(), Err(JournalError::ShutDown));
        assert!(matches!(
            fx.queue.read(0, 1),
            Err(JournalError::ShutDown)
        ));
    }

    #[test]
    fn refresh_gate_runs_before_dispatch() {
        let fx = fixture(true);
        *fx.gates.refresh_required.lock() = true;
        fx.queue.write(16, vec![3]).unwrap();
        assert_eq!(*fx.gates.refreshes.lock(), 1);
        assert_eq!(*fx.backend.writes.lock(), vec![(16, vec![3])]);
    }
}
