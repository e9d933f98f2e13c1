//! Image journal state machine: opens the journal, replays pending
//! events into the image, transitions to steady append, restarts replay
//! on error, and drains to close. Application I/O funnels through
//! `append_io_event` / `commit_io_event_extent` so every modification is
//! durable in the journal before it reaches the image.

use crate::config::JournalConfig;
use crate::error::{JournalError, Result};
use crate::executor::{Completion, Executor};
use crate::image::events::ImageEvent;
use crate::image::replay::ImageReplay;
use crate::image::ImageBackend;
use crate::journal::future::EntryFuture;
use crate::journal::journaler::Journaler;
use crate::journal::player::ReplayHandler;
use crate::store::ObjectStore;
use crate::util::IntervalSet;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Client id of the image's own journal consumer.
pub const IMAGE_CLIENT_ID: &str = "";
const CLIENT_DESCRIPTION: &str = "master image";
/// Tag used for all image events; ordering within the image is total.
const LOCAL_TAG: &str = "";
/// Consecutive replay-restart cycles tolerated before the journal closes
/// with the recorded error.
const MAX_REPLAY_RESTARTS: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageJournalState {
    Uninitialized,
    Initializing,
    Replaying,
    FlushingReplay,
    FlushingRestart,
    RestartingReplay,
    Ready,
    Stopping,
    Closing,
    Closed,
}

impl ImageJournalState {
    fn is_steady(self) -> bool {
        matches!(self, ImageJournalState::Ready | ImageJournalState::Closed)
    }
}

/// Deferred image I/O issued once the journal entry is durable; receives
/// the event tid for extent commit callbacks.
pub type ObjectRequest = Box<dyn FnOnce(u64) + Send>;

struct IoEvent {
    future: Arc<EntryFuture>,
    completion: Option<Completion>,
    object_requests: Vec<ObjectRequest>,
    pending_extents: IntervalSet,
    ret_val: Option<JournalError>,
    committed_io: bool,
    safe: bool,
    on_safe_contexts: Vec<Completion>,
}

struct EventsData {
    event_tid: u64,
    events: HashMap<u64, IoEvent>,
}

struct StateData {
    state: ImageJournalState,
    journaler: Option<Arc<Journaler>>,
    replay: Option<Arc<ImageReplay>>,
    error_result: Option<JournalError>,
    close_pending: bool,
    restart_attempts: u32,
    wait_for_state: Vec<Completion>,
}

pub struct ImageJournal {
    store: Arc<dyn ObjectStore>,
    image_id: String,
    backend: Arc<dyn ImageBackend>,
    config: JournalConfig,
    work_queue: Executor,
    self_ref: Weak<ImageJournal>,
    // lock order: state -> events
    state: Mutex<StateData>,
    events: Mutex<EventsData>,
}

struct ImageReplayHandler {
    journal: Weak<ImageJournal>,
}

impl ReplayHandler for ImageReplayHandler {
    fn handle_entries_available(&self) {
        if let Some(journal) = self.journal.upgrade() {
            journal.handle_replay_ready();
        }
    }

    fn handle_complete(&self, result: Result<()>) {
        if let Some(journal) = self.journal.upgrade() {
            journal.handle_replay_complete(result);
        }
    }
}

impl ImageJournal {
    /// Create the image's journal header and register the image client.
    pub fn create(
        store: Arc<dyn ObjectStore>,
        image_id: &str,
        config: &JournalConfig,
    ) -> Result<()> {
        config.validate()?;
        let journaler = Journaler::new(
            Arc::clone(&store),
            image_id,
            IMAGE_CLIENT_ID,
            config.commit_interval(),
        );
        let result = journaler
            .create(config.order, config.splay_width, config.data_pool_id)
            .and_then(|()| journaler.register_client(CLIENT_DESCRIPTION));
        journaler.metadata().shutdown();
        result
    }

    /// Delete the image's journal; absent journals succeed.
    pub fn remove(store: Arc<dyn ObjectStore>, image_id: &str) -> Result<()> {
        let journaler = Journaler::new(
            Arc::clone(&store),
            image_id,
            IMAGE_CLIENT_ID,
            JournalConfig::default().commit_interval(),
        );
        let result = Self::remove_inner(&journaler);
        journaler.metadata().shutdown();
        result
    }

    fn remove_inner(journaler: &Arc<Journaler>) -> Result<()> {
        if !journaler.exists()? {
            return Ok(());
        }
        match Self::wait_for_init(journaler) {
            Ok(()) => journaler.remove(true),
            Err(JournalError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Administrative reset: recreate the journal empty with the same
    /// geometry. Callers must quiesce all consumers first.
    pub fn reset(store: Arc<dyn ObjectStore>, image_id: &str) -> Result<()> {
        let journaler = Journaler::new(
            Arc::clone(&store),
            image_id,
            IMAGE_CLIENT_ID,
            JournalConfig::default().commit_interval(),
        );
        let result = Self::wait_for_init(&journaler).and_then(|()| {
            journaler
                .reset()
                .and_then(|()| journaler.register_client(CLIENT_DESCRIPTION))
        });
        journaler.metadata().shutdown();
        result
    }

    fn wait_for_init(journaler: &Arc<Journaler>) -> Result<()> {
        let cond = Arc::new((Mutex::new(None::<Result<()>>), Condvar::new()));
        let signal = Arc::clone(&cond);
        journaler.init(Box::new(move |result| {
            let (slot, cond) = &*signal;
            *slot.lock() = Some(result);
            cond.notify_all();
        }));
        let (slot, cond) = &*cond;
        let mut result = slot.lock();
        while result.is_none() {
            cond.wait(&mut result);
        }
        result.take().expect("init result present")
    }

    pub fn new(
        store: Arc<dyn ObjectStore>,
        image_id: impl Into<String>,
        backend: Arc<dyn ImageBackend>,
        config: JournalConfig,
        work_queue: Executor,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            store,
            image_id: image_id.into(),
            backend,
            config,
            work_queue,
            self_ref: self_ref.clone(),
            state: Mutex::new(StateData {
                state: ImageJournalState::Uninitialized,
                journaler: None,
                replay: None,
                error_result: None,
                close_pending: false,
                restart_attempts: 0,
                wait_for_state: Vec::new(),
            }),
            events: Mutex::new(EventsData {
                event_tid: 0,
                events: HashMap::new(),
            }),
        })
    }

    pub fn state(&self) -> ImageJournalState {
        self.state.lock().state
    }

    pub fn is_journal_ready(&self) -> bool {
        self.state.lock().state == ImageJournalState::Ready
    }

    pub fn is_journal_replaying(&self) -> bool {
        matches!(
            self.state.lock().state,
            ImageJournalState::Replaying
                | ImageJournalState::FlushingReplay
                | ImageJournalState::FlushingRestart
                | ImageJournalState::RestartingReplay
        )
    }

    /// Complete `on_ready` once the journal reaches a steady state,
    /// reporting the first recorded error.
    pub fn wait_for_journal_ready(&self, on_ready: Completion) {
        let mut state = self.state.lock();
        if state.state == ImageJournalState::Ready {
            let result = Self::steady_result(&state);
            drop(state);
            self.work_queue.complete(on_ready, result);
            return;
        }
        state.wait_for_state.push(on_ready);
    }

    pub fn open(self: &Arc<Self>, on_finish: Completion) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.state, ImageJournalState::Uninitialized);
        state.wait_for_state.push(on_finish);
        self.create_journaler(&mut state);
    }

    pub fn close(self: &Arc<Self>, on_finish: Completion) {
        // stop_append may complete inline, so it runs outside the lock
        let stop_journaler = {
            let mut state = self.state.lock();
            debug_assert_ne!(state.state, ImageJournalState::Uninitialized);
            if state.state == ImageJournalState::Closed {
                let result = Self::steady_result(&state);
                drop(state);
                self.work_queue.complete(on_finish, result);
                return;
            }
            let stop_journaler = if state.state == ImageJournalState::Ready {
                self.transition_state(&mut state, ImageJournalState::Stopping, None);
                Some(state.journaler.clone().expect("journaler in ready state"))
            } else {
                None
            };
            state.close_pending = true;
            state.wait_for_state.push(on_finish);
            stop_journaler
        };

        if let Some(journaler) = stop_journaler {
            let journal = Arc::clone(self);
            journaler.stop_append(Box::new(move |result| {
                journal.handle_recording_stopped(result);
            }));
        }
    }

    /// Record a write-class event. `object_requests` are issued with the
    /// event tid once the entry is durable; the completion fails
    /// immediately when the journal write fails.
    pub fn append_io_event(
        self: &Arc<Self>,
        event: ImageEvent,
        object_requests: Vec<ObjectRequest>,
        offset: u64,
        length: u64,
        flush_entry: bool,
        completion: Completion,
    ) -> Result<u64> {
        let data = event.encode();
        let (future, tid) = {
            let state = self.state.lock();
            if state.state != ImageJournalState::Ready {
                drop(state);
                let err = JournalError::invalid("journal not in ready state");
                completion(Err(err.clone()));
                return Err(err);
            }
            let journaler = state.journaler.clone().expect("journaler in ready state");

            let mut events = self.events.lock();
            events.event_tid += 1;
            let tid = events.event_tid;
            let future = match journaler.append(LOCAL_TAG, data) {
                Ok(future) => future,
                Err(err) => {
                    drop(events);
                    drop(state);
                    completion(Err(err.clone()));
                    return Err(err);
                }
            };
            let mut pending_extents = IntervalSet::new();
            pending_extents.insert(offset, length);
            events.events.insert(
                tid,
                IoEvent {
                    future: Arc::clone(&future),
                    completion: Some(completion),
                    object_requests,
                    pending_extents,
                    ret_val: None,
                    committed_io: false,
                    safe: false,
                    on_safe_contexts: Vec::new(),
                },
            );
            (future, tid)
        };

        debug!(
            "event=image_journal_io_event image={} tid={} offset={} length={} flush={}",
            self.image_id, tid, offset, length, flush_entry
        );
        let journal = Arc::clone(self);
        let on_safe: Completion = Box::new(move |result| {
            journal.handle_io_event_safe(result, tid);
        });
        if flush_entry {
            future.flush(Some(on_safe));
        } else {
            future.wait(on_safe);
        }
        Ok(tid)
    }

    /// The whole event's image-side I/O finished (flush-style events).
    pub fn commit_io_event(&self, tid: u64, result: Result<()>) {
        let mut events = self.events.lock();
        if !events.events.contains_key(&tid) {
            return;
        }
        let actions = Self::complete_event_locked(&mut events, tid, result);
        drop(events);
        self.run_commit_actions(actions);
    }

    /// One extent of the event's image-side I/O finished.
    pub fn commit_io_event_extent(
        &self,
        tid: u64,
        offset: u64,
        length: u64,
        result: Result<()>,
    ) {
        debug_assert!(length > 0);
        let mut events = self.events.lock();
        let Some(event) = events.events.get_mut(&tid) else {
            return;
        };
        if event.ret_val.is_none() {
            if let Err(err) = &result {
                event.ret_val = Some(err.clone());
            }
        }
        event.pending_extents.subtract(offset, length);
        if !event.pending_extents.is_empty() {
            return;
        }
        let pinned_result = match &event.ret_val {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        };
        let actions = Self::complete_event_locked(&mut events, tid, pinned_result);
        drop(events);
        self.run_commit_actions(actions);
    }

    /// Record a maintenance op event; `on_safe` fires when durable.
    pub fn append_op_event(
        self: &Arc<Self>,
        op_tid: u64,
        event: ImageEvent,
        on_safe: Completion,
    ) -> Result<()> {
        let future = self.append_ready_entry(event)?;
        debug!(
            "event=image_journal_op_event image={} op_tid={}",
            self.image_id, op_tid
        );
        let journal = Arc::clone(self);
        let commit_tid = future.commit_tid();
        future.flush(Some(Box::new(move |result| {
            journal.handle_op_event_safe(result, commit_tid, Some(on_safe));
        })));
        Ok(())
    }

    /// Record the op-finish event paired with `append_op_event`.
    pub fn commit_op_event(self: &Arc<Self>, op_tid: u64, result: i32) -> Result<()> {
        let future = self.append_ready_entry(ImageEvent::OpFinish { op_tid, result })?;
        let journal = Arc::clone(self);
        let commit_tid = future.commit_tid();
        future.flush(Some(Box::new(move |flush_result| {
            journal.handle_op_event_safe(flush_result, commit_tid, None);
        })));
        Ok(())
    }

    /// Expedite durability of a recorded event and wait for it.
    pub fn flush_event(&self, tid: u64, on_safe: Completion) {
        let future = {
            let mut events = self.events.lock();
            self.wait_event_locked(&mut events, tid, on_safe)
        };
        if let Some(future) = future {
            future.flush(None);
        }
    }

    /// Wait for a recorded event to become durable.
    pub fn wait_event(&self, tid: u64, on_safe: Completion) {
        let mut events = self.events.lock();
        self.wait_event_locked(&mut events, tid, on_safe);
    }

    fn append_ready_entry(&self, event: ImageEvent) -> Result<Arc<EntryFuture>> {
        let state = self.state.lock();
        if state.state != ImageJournalState::Ready {
            return Err(JournalError::invalid("journal not in ready state"));
        }
        let journaler = state.journaler.clone().expect("journaler in ready state");
        journaler.append(LOCAL_TAG, event.encode())
    }

    fn wait_event_locked(
        &self,
        events: &mut EventsData,
        tid: u64,
        on_safe: Completion,
    ) -> Option<Arc<EntryFuture>> {
        let event = events.events.get_mut(&tid)?;
        if event.safe {
            let result = match &event.ret_val {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            };
            self.work_queue.complete(on_safe, result);
            return None;
        }
        event.on_safe_contexts.push(on_safe);
        Some(Arc::clone(&event.future))
    }

    fn handle_io_event_safe(self: &Arc<Self>, result: Result<()>, tid: u64) {
        debug!(
            "event=image_journal_io_event_safe image={} tid={} ok={}",
            self.image_id,
            tid,
            result.is_ok()
        );

        let (commit_tid, completion, object_requests, on_safe_contexts) = {
            let mut events = self.events.lock();
            let Some(event) = events.events.get_mut(&tid) else {
                return;
            };
            let object_requests = std::mem::take(&mut event.object_requests);
            let on_safe_contexts = std::mem::take(&mut event.on_safe_contexts);
            let mut commit_tid = None;
            let mut completion = None;
            match &result {
                Err(err) => {
                    // the entry never became durable: the I/O must not be
                    // issued and the event will not be replayed
                    warn!(
                        "event=image_journal_entry_failed image={} tid={} error={}",
                        self.image_id, tid, err
                    );
                    event.ret_val = Some(err.clone());
                    commit_tid = Some(event.future.commit_tid());
                    completion = event.completion.take().map(|cb| (cb, Err(err.clone())));
                    events.events.remove(&tid);
                }
                Ok(()) => {
                    event.safe = true;
                    if event.committed_io {
                        let event_result = match &event.ret_val {
                            Some(err) => Err(err.clone()),
                            None => {
                                commit_tid = Some(event.future.commit_tid());
                                Ok(())
                            }
                        };
                        completion = event.completion.take().map(|cb| (cb, event_result));
                        events.events.remove(&tid);
                    }
                }
            }
            (commit_tid, completion, object_requests, on_safe_contexts)
        };

        if let Some(commit_tid) = commit_tid {
            self.committed(commit_tid);
        }
        match &result {
            Ok(()) => {
                for request in object_requests {
                    request(tid);
                }
            }
            Err(_) => drop(object_requests),
        }
        for ctx in on_safe_contexts {
            ctx(result.clone());
        }
        if let Some((cb, completion_result)) = completion {
            cb(completion_result);
        }
    }

    fn complete_event_locked(
        events: &mut EventsData,
        tid: u64,
        result: Result<()>,
    ) -> (Option<u64>, Option<(Completion, Result<()>)>) {
        let event = events.events.get_mut(&tid).expect("event present");
        event.committed_io = true;
        if event.ret_val.is_none() {
            if let Err(err) = &result {
                // recorded to the journal but the image write failed: the
                // event stays uncommitted so re-replay re-applies it
                event.ret_val = Some(err.clone());
            }
        }
        if !event.safe {
            return (None, None);
        }

        let event = events.events.remove(&tid).expect("event present");
        let event_result = match event.ret_val {
            Some(err) => Err(err),
            None => Ok(()),
        };
        let commit_tid = event_result
            .is_ok()
            .then(|| event.future.commit_tid());
        let completion = event
            .completion
            .map(|cb| (cb, event_result));
        (commit_tid, completion)
    }

    fn run_commit_actions(
        &self,
        (commit_tid, completion): (Option<u64>, Option<(Completion, Result<()>)>),
    ) {
        if let Some(commit_tid) = commit_tid {
            self.committed(commit_tid);
        }
        if let Some((cb, result)) = completion {
            cb(result);
        }
    }

    fn committed(&self, commit_tid: u64) {
        let journaler = self.state.lock().journaler.clone();
        if let Some(journaler) = journaler {
            journaler.committed(commit_tid);
        }
    }

    fn handle_op_event_safe(
        self: &Arc<Self>,
        result: Result<()>,
        commit_tid: u64,
        on_safe: Option<Completion>,
    ) {
        if let Err(err) = &result {
            warn!(
                "event=image_journal_op_entry_failed image={} error={}",
                self.image_id, err
            );
        }
        self.committed(commit_tid);
        if let Some(on_safe) = on_safe {
            on_safe(result);
        }
    }

    fn create_journaler(self: &Arc<Self>, state: &mut StateData) {
        debug_assert!(matches!(
            state.state,
            ImageJournalState::Uninitialized | ImageJournalState::RestartingReplay
        ));
        debug_assert!(state.journaler.is_none());
        self.transition_state(state, ImageJournalState::Initializing, None);

        let journaler = Journaler::new(
            Arc::clone(&self.store),
            self.image_id.clone(),
            IMAGE_CLIENT_ID,
            self.config.commit_interval(),
        );
        state.journaler = Some(Arc::clone(&journaler));

        let journal = Arc::clone(self);
        journaler.init(Box::new(move |result| {
            journal.handle_initialized(result);
        }));
    }

    fn handle_initialized(self: &Arc<Self>, result: Result<()>) {
        debug!(
            "event=image_journal_initialized image={} ok={}",
            self.image_id,
            result.is_ok()
        );
        let mut state = self.state.lock();
        if let Err(err) = result {
            warn!(
                "event=image_journal_init_failed image={} error={}",
                self.image_id, err
            );
            self.destroy_journaler(&mut state, Some(err));
            return;
        }

        self.transition_state(&mut state, ImageJournalState::Replaying, None);
        let replay = ImageReplay::new(Arc::clone(&self.backend), self.work_queue.clone());
        state.replay = Some(Arc::clone(&replay));
        let journaler = state.journaler.clone().expect("journaler initialized");
        drop(state);

        let handler: Arc<dyn ReplayHandler> = Arc::new(ImageReplayHandler {
            journal: self.self_ref.clone(),
        });
        journaler.start_replay(handler);
    }

    fn handle_replay_ready(self: &Arc<Self>) {
        let (journaler, replay) = {
            let state = self.state.lock();
            if state.state != ImageJournalState::Replaying {
                return;
            }
            (
                state.journaler.clone().expect("journaler while replaying"),
                state.replay.clone().expect("replay while replaying"),
            )
        };
        let Some(entry) = journaler.try_pop_front() else {
            return;
        };

        let commit_tid = entry.commit_tid;
        let ready_journal = self.self_ref.clone();
        let safe_journal = Arc::clone(self);
        replay.process(
            &entry.data,
            Box::new(move |result| {
                // trampoline the next pop to bound the pipeline depth
                if let Some(journal) = ready_journal.upgrade() {
                    let next = Arc::clone(&journal);
                    journal.work_queue.queue(move || match result {
                        Ok(()) => next.handle_replay_ready(),
                        Err(err) => next.handle_replay_complete(Err(err)),
                    });
                }
            }),
            Box::new(move |result| {
                safe_journal.handle_replay_process_safe(result, commit_tid);
            }),
        );
    }

    fn handle_replay_complete(self: &Arc<Self>, result: Result<()>) {
        let (replay, restart) = {
            let mut state = self.state.lock();
            if state.state != ImageJournalState::Replaying {
                return;
            }
            let journaler = state.journaler.clone().expect("journaler while replaying");
            journaler.stop_replay();
            let replay = state.replay.clone().expect("replay while replaying");
            match result {
                Ok(()) => {
                    self.transition_state(&mut state, ImageJournalState::FlushingReplay, None);
                    (replay, false)
                }
                Err(err) => {
                    self.transition_state(
                        &mut state,
                        ImageJournalState::FlushingRestart,
                        Some(err),
                    );
                    (replay, true)
                }
            }
        };

        let journal = Arc::clone(self);
        if restart {
            replay.flush(Box::new(move |_| journal.handle_flushing_restart()));
        } else {
            replay.flush(Box::new(move |result| {
                journal.handle_flushing_replay(result)
            }));
        }
    }

    fn handle_replay_process_safe(self: &Arc<Self>, result: Result<()>, commit_tid: u64) {
        match result {
            Ok(()) => {
                let journaler = self.state.lock().journaler.clone();
                if let Some(journaler) = journaler {
                    journaler.committed(commit_tid);
                }
            }
            Err(err) => {
                warn!(
                    "event=image_journal_replay_commit_failed image={} error={}",
                    self.image_id, err
                );
                let replay = {
                    let mut state = self.state.lock();
                    match state.state {
                        ImageJournalState::Replaying => {
                            let journaler =
                                state.journaler.clone().expect("journaler while replaying");
                            journaler.stop_replay();
                            self.transition_state(
                                &mut state,
                                ImageJournalState::FlushingRestart,
                                Some(err),
                            );
                            state.replay.clone()
                        }
                        ImageJournalState::FlushingReplay => {
                            // the end-of-replay flush is already running;
                            // redirect it into the restart path
                            self.transition_state(
                                &mut state,
                                ImageJournalState::FlushingRestart,
                                Some(err),
                            );
                            None
                        }
                        _ => None,
                    }
                };
                if let Some(replay) = replay {
                    let journal = Arc::clone(self);
                    replay.flush(Box::new(move |_| journal.handle_flushing_restart()));
                }
            }
        }
    }

    fn handle_flushing_restart(self: &Arc<Self>) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.state, ImageJournalState::FlushingRestart);
        if state.close_pending {
            self.destroy_journaler(&mut state, None);
            return;
        }
        self.recreate_journaler(&mut state);
    }

    fn handle_flushing_replay(self: &Arc<Self>, result: Result<()>) {
        let mut state = self.state.lock();
        if state.close_pending {
            self.destroy_journaler(&mut state, result.err());
            return;
        }
        if state.state == ImageJournalState::FlushingRestart {
            // a commit error arrived while the replay flush was running
            self.recreate_journaler(&mut state);
            return;
        }
        debug_assert_eq!(state.state, ImageJournalState::FlushingReplay);
        if let Err(err) = result {
            self.transition_state(&mut state, ImageJournalState::FlushingRestart, Some(err));
            self.recreate_journaler(&mut state);
            return;
        }

        state.replay = None;
        state.restart_attempts = 0;
        state.error_result = None;
        let journaler = state.journaler.clone().expect("journaler while flushing");
        journaler.start_append(
            self.config.flush_interval,
            self.config.flush_bytes,
            self.config.flush_age(),
        );
        info!("event=image_journal_ready image={}", self.image_id);
        self.transition_state(&mut state, ImageJournalState::Ready, None);
    }

    fn handle_recording_stopped(self: &Arc<Self>, result: Result<()>) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.state, ImageJournalState::Stopping);
        self.destroy_journaler(&mut state, result.err());
    }

    fn recreate_journaler(self: &Arc<Self>, state: &mut StateData) {
        state.replay = None;
        state.restart_attempts += 1;
        if state.restart_attempts > MAX_REPLAY_RESTARTS {
            warn!(
                "event=image_journal_restart_limit image={} attempts={}",
                self.image_id, state.restart_attempts
            );
            self.destroy_journaler(state, None);
            return;
        }
        debug!(
            "event=image_journal_restarting image={} attempt={}",
            self.image_id, state.restart_attempts
        );
        self.transition_state(state, ImageJournalState::RestartingReplay, None);
        self.queue_destroy();
    }

    fn destroy_journaler(self: &Arc<Self>, state: &mut StateData, err: Option<JournalError>) {
        state.replay = None;
        self.transition_state(state, ImageJournalState::Closing, err);
        self.queue_destroy();
    }

    fn queue_destroy(self: &Arc<Self>) {
        let journal = Arc::clone(self);
        self.work_queue
            .queue(move || journal.handle_journal_destroyed());
    }

    fn handle_journal_destroyed(self: &Arc<Self>) {
        let journaler = self.state.lock().journaler.take();
        if let Some(journaler) = journaler {
            journaler.shutdown();
        }

        let mut state = self.state.lock();
        if state.state == ImageJournalState::RestartingReplay {
            self.create_journaler(&mut state);
            return;
        }
        debug_assert_eq!(state.state, ImageJournalState::Closing);
        info!("event=image_journal_closed image={}", self.image_id);
        self.transition_state(&mut state, ImageJournalState::Closed, None);
    }

    fn transition_state(
        &self,
        state: &mut StateData,
        next: ImageJournalState,
        err: Option<JournalError>,
    ) {
        debug!(
            "event=image_journal_state image={} from={:?} to={:?}",
            self.image_id, state.state, next
        );
        state.state = next;
        if state.error_result.is_none() {
            if let Some(err) = err {
                state.error_result = Some(err);
            }
        }

        if state.state.is_steady() {
            let result = Self::steady_result(state);
            for ctx in std::mem::take(&mut state.wait_for_state) {
                self.work_queue.complete(ctx, result.clone());
            }
        }
    }

    fn steady_result(state: &StateData) -> Result<()> {
        match &state.error_result {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}
