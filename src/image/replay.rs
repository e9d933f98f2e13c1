//! Replay driver: decodes journal entries into typed events and applies
//! them to the image backend. Write-class events pipeline against
//! in-flight watermarks; maintenance ops wait for their paired
//! `OpFinish` record before executing.

use crate::error::{JournalError, Result};
use crate::executor::{Completion, Executor};
use crate::image::events::ImageEvent;
use crate::image::{ImageBackend, ImageOperation};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

const IN_FLIGHT_IO_LOW_WATER_MARK: u64 = 32;
const IN_FLIGHT_IO_HIGH_WATER_MARK: u64 = 64;

struct OpEvent {
    op: Option<ImageOperation>,
    on_start_safe: Option<Completion>,
}

struct ReplayState {
    in_flight_aio: u64,
    in_flight_ops: u64,
    on_aio_ready: Option<Completion>,
    aio_modify_unsafe: Vec<Completion>,
    aio_error: Option<JournalError>,
    op_events: HashMap<u64, OpEvent>,
    flush_ctx: Option<Completion>,
}

/// Applies a decoded entry stream to the image. Modify events' commit
/// callbacks are retired at flush boundaries, preserving writeback
/// ordering; op events commit when the op completes.
pub struct ImageReplay {
    backend: Arc<dyn ImageBackend>,
    executor: Executor,
    self_ref: Weak<ImageReplay>,
    state: Mutex<ReplayState>,
}

impl ImageReplay {
    pub fn new(backend: Arc<dyn ImageBackend>, executor: Executor) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            backend,
            executor,
            self_ref: self_ref.clone(),
            state: Mutex::new(ReplayState {
                in_flight_aio: 0,
                in_flight_ops: 0,
                on_aio_ready: None,
                aio_modify_unsafe: Vec::new(),
                aio_error: None,
                op_events: HashMap::new(),
                flush_ctx: None,
            }),
        })
    }

    /// Apply one journal entry. `on_ready` fires when the next entry may
    /// be processed; `on_safe` fires once the event is applied durably
    /// enough to commit back to the journal.
    pub fn process(self: &Arc<Self>, data: &[u8], on_ready: Completion, on_safe: Completion) {
        let event = match ImageEvent::decode(data) {
            Ok(event) => event,
            Err(err) => {
                warn!("event=image_replay_decode_failed error={}", err);
                on_ready(Err(err));
                return;
            }
        };
        debug!("event=image_replay_process type={}", event.event_type());

        match event {
            ImageEvent::AioWrite { offset, data, .. } => {
                self.handle_modify(on_ready, on_safe, move |backend, cb| {
                    backend.aio_write(offset, data, cb)
                });
            }
            ImageEvent::AioDiscard { offset, length } => {
                self.handle_modify(on_ready, on_safe, move |backend, cb| {
                    backend.aio_discard(offset, length, cb)
                });
            }
            ImageEvent::AioFlush => {
                self.handle_flush_event(on_safe);
                on_ready(Ok(()));
            }
            ImageEvent::OpFinish { op_tid, result } => {
                self.handle_op_finish(op_tid, result, on_ready, on_safe);
            }
            ImageEvent::Unknown => {
                // newer writer: skip but still commit the entry
                self.executor.complete(on_safe, Ok(()));
                on_ready(Ok(()));
            }
            op_event => {
                let op_tid = op_event.op_tid().expect("maintenance event has op tid");
                let op = ImageOperation::from_event(&op_event);
                let mut state = self.state.lock();
                state.op_events.insert(
                    op_tid,
                    OpEvent {
                        op,
                        on_start_safe: Some(on_safe),
                    },
                );
                drop(state);
                on_ready(Ok(()));
            }
        }
    }

    /// Drain in-flight work and cancel ops still waiting for their
    /// finish record.
    pub fn flush(self: &Arc<Self>, on_finish: Completion) {
        let (cancelled, flush_unsafe, deferred) = {
            let mut state = self.state.lock();
            let cancelled: Vec<Completion> = state
                .op_events
                .drain()
                .filter_map(|(_, mut op_event)| op_event.on_start_safe.take())
                .collect();
            let flush_unsafe = std::mem::take(&mut state.aio_modify_unsafe);
            let waiting = state.in_flight_aio > 0
                || state.in_flight_ops > 0
                || !flush_unsafe.is_empty();
            if waiting {
                debug_assert!(state.flush_ctx.is_none(), "flush already in progress");
                state.flush_ctx = Some(on_finish);
                // the flush itself holds the aio count until it lands
                state.in_flight_aio += 1;
                (cancelled, Some(flush_unsafe), None)
            } else {
                (cancelled, None, Some(on_finish))
            }
        };

        for ctx in cancelled {
            ctx(Err(JournalError::Restart));
        }
        if let Some(flush_unsafe) = flush_unsafe {
            self.issue_flush(flush_unsafe, None);
        }
        if let Some(on_finish) = deferred {
            self.executor.complete(on_finish, Ok(()));
        }
    }

    fn handle_modify<F>(self: &Arc<Self>, on_ready: Completion, on_safe: Completion, issue: F)
    where
        F: FnOnce(&dyn ImageBackend, Completion),
    {
        let deferred_ready = {
            let mut state = self.state.lock();
            state.in_flight_aio += 1;
            state.aio_modify_unsafe.push(on_safe);
            if state.in_flight_aio >= IN_FLIGHT_IO_HIGH_WATER_MARK {
                debug_assert!(state.on_aio_ready.is_none(), "replay pipelines one entry");
                state.on_aio_ready = Some(on_ready);
                None
            } else {
                Some(on_ready)
            }
        };

        let replay = Arc::clone(self);
        issue(
            self.backend.as_ref(),
            Box::new(move |result| replay.handle_aio_modify_complete(result)),
        );

        if let Some(on_ready) = deferred_ready {
            on_ready(Ok(()));
        }
    }

    /// A flush entry retires every accumulated modify commit callback
    /// with the flush result.
    fn handle_flush_event(self: &Arc<Self>, on_safe: Completion) {
        let flush_unsafe = {
            let mut state = self.state.lock();
            state.in_flight_aio += 1;
            std::mem::take(&mut state.aio_modify_unsafe)
        };
        self.issue_flush(flush_unsafe, Some(on_safe));
    }

    fn issue_flush(self: &Arc<Self>, flush_unsafe: Vec<Completion>, on_safe: Option<Completion>) {
        let replay = Arc::clone(self);
        self.backend.aio_flush(Box::new(move |result| {
            let result = {
                let mut state = replay.state.lock();
                state.in_flight_aio -= 1;
                match state.aio_error.take() {
                    Some(err) => Err(err),
                    None => result,
                }
            };
            for ctx in flush_unsafe {
                ctx(result.clone());
            }
            if let Some(on_safe) = on_safe {
                on_safe(result);
            }
            replay.check_resume_and_flush();
        }));
    }

    fn handle_op_finish(
        self: &Arc<Self>,
        op_tid: u64,
        result: i32,
        on_ready: Completion,
        on_safe: Completion,
    ) {
        let op_event = self.state.lock().op_events.remove(&op_tid);
        let Some(mut op_event) = op_event else {
            // op predates the replay window: assume previously committed
            debug!(
                "event=image_replay_orphan_op_finish op_tid={}",
                op_tid
            );
            self.executor.complete(on_safe, Ok(()));
            on_ready(Ok(()));
            return;
        };

        let on_start_safe = op_event.on_start_safe.take().expect("op start uncommitted");
        if result < 0 {
            // the op was recorded as failed: no-op it and commit both
            // entries so it is not replayed again
            debug!(
                "event=image_replay_op_noop op_tid={} result={}",
                op_tid, result
            );
            on_start_safe(Ok(()));
            self.executor.complete(on_safe, Ok(()));
            on_ready(Ok(()));
            return;
        }

        let Some(op) = op_event.op else {
            on_start_safe(Ok(()));
            self.executor.complete(on_safe, Ok(()));
            on_ready(Ok(()));
            return;
        };

        self.state.lock().in_flight_ops += 1;
        let replay = Arc::clone(self);
        self.backend.execute_op(
            op,
            Box::new(move |op_result| {
                on_start_safe(op_result.clone());
                on_safe(op_result);
                replay.state.lock().in_flight_ops -= 1;
                replay.check_resume_and_flush();
            }),
        );
        on_ready(Ok(()));
    }

    fn handle_aio_modify_complete(self: &Arc<Self>, result: Result<()>) {
        {
            let mut state = self.state.lock();
            state.in_flight_aio -= 1;
            if let Err(err) = result {
                warn!("event=image_replay_aio_failed error={}", err);
                state.aio_error.get_or_insert(err);
            }
        }
        self.check_resume_and_flush();
    }

    fn check_resume_and_flush(self: &Arc<Self>) {
        let (on_ready, flush_ctx) = {
            let mut state = self.state.lock();
            let on_ready = if state.in_flight_aio < IN_FLIGHT_IO_LOW_WATER_MARK {
                state.on_aio_ready.take()
            } else {
                None
            };
            let flush_ctx = if state.in_flight_aio == 0 && state.in_flight_ops == 0 {
                state.flush_ctx.take()
            } else {
                None
            };
            (on_ready, flush_ctx)
        };
        if let Some(on_ready) = on_ready {
            on_ready(Ok(()));
        }
        if let Some(flush_ctx) = flush_ctx {
            flush_ctx(Ok(()));
        }
    }
}
