//! Replicated journal header: immutable geometry, the mutable object-set
//! window, registered consumers, and this consumer's committed position.
//! The header object is watched; mutations are broadcast by notification
//! and absorbed through refresh.

use crate::error::{JournalError, Result};
use crate::executor::{AsyncOpTracker, Completion, Executor, TaskTimer, TimerToken};
use crate::header::client::{self, MutableMetadata};
use crate::header::{EntryPosition, ObjectSetPosition, RegisteredClient};
use crate::store::{ObjectStore, WatchHandler, WatchId};
use crate::telemetry::MetricsRegistry;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

const WATCH_RESET_DELAY: Duration = Duration::from_millis(100);

/// Observer of header refreshes. Implementations are held weakly; dispatch
/// happens without the metadata lock and is serialised against listener
/// registration.
pub trait MetadataListener: Send + Sync {
    fn handle_update(&self);
}

/// Ties an appended entry to its asynchronous commit acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEntry {
    pub object_num: u64,
    pub tag: String,
    pub tid: u64,
    pub committed: bool,
}

struct MetadataState {
    initialized: bool,
    order: u8,
    splay_width: u8,
    pool_id: i64,
    watch_id: Option<WatchId>,
    minimum_set: u64,
    active_set: u64,
    registered_clients: Vec<RegisteredClient>,
    client: RegisteredClient,
    allocated_tids: HashMap<String, u64>,
    commit_tid: u64,
    pending_commit_tids: BTreeMap<u64, CommitEntry>,
    listeners: Vec<Weak<dyn MetadataListener>>,
    update_notifications: usize,
    commit_position: ObjectSetPosition,
    commit_position_ctx: Option<Completion>,
}

struct CommitTaskState {
    token: Option<TimerToken>,
}

pub struct JournalMetadata {
    store: Arc<dyn ObjectStore>,
    oid: String,
    client_id: String,
    commit_interval: Duration,
    executor: Executor,
    timer: TaskTimer,
    // lock order: timer_state -> state; listeners run with neither held
    timer_state: Mutex<CommitTaskState>,
    state: Mutex<MetadataState>,
    update_cond: Condvar,
    op_tracker: AsyncOpTracker,
}

/// Balances the async-op tracker whether the wrapped task runs or is
/// dropped unrun at timer shutdown.
struct TrackedOp {
    metadata: Weak<JournalMetadata>,
}

impl TrackedOp {
    fn new(metadata: Arc<JournalMetadata>) -> Self {
        metadata.op_tracker.start_op();
        Self {
            metadata: Arc::downgrade(&metadata),
        }
    }
}

impl Drop for TrackedOp {
    fn drop(&mut self) {
        if let Some(metadata) = self.metadata.upgrade() {
            metadata.op_tracker.finish_op();
        }
    }
}

struct MetadataWatcher {
    metadata: Weak<JournalMetadata>,
}

impl WatchHandler for MetadataWatcher {
    fn handle_notify(&self, notify_id: u64) {
        if let Some(metadata) = self.metadata.upgrade() {
            debug!("event=journal_header_notified oid={}", metadata.oid);
            metadata.store.notify_ack(&metadata.oid, notify_id);
            metadata.refresh(None);
        }
    }

    fn handle_error(&self, err: JournalError) {
        if let Some(metadata) = self.metadata.upgrade() {
            metadata.handle_watch_error(err);
        }
    }
}

impl JournalMetadata {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        oid: impl Into<String>,
        client_id: impl Into<String>,
        commit_interval: Duration,
    ) -> Arc<Self> {
        let oid = oid.into();
        let client_id = client_id.into();
        Arc::new(Self {
            store,
            oid,
            client_id: client_id.clone(),
            commit_interval,
            executor: Executor::new("journal-executor", 2),
            timer: TaskTimer::new("journal-timer"),
            timer_state: Mutex::new(CommitTaskState { token: None }),
            state: Mutex::new(MetadataState {
                initialized: false,
                order: 0,
                splay_width: 0,
                pool_id: -1,
                watch_id: None,
                minimum_set: 0,
                active_set: 0,
                registered_clients: Vec::new(),
                client: RegisteredClient::new(client_id, ""),
                allocated_tids: HashMap::new(),
                commit_tid: 0,
                pending_commit_tids: BTreeMap::new(),
                listeners: Vec::new(),
                update_notifications: 0,
                commit_position: ObjectSetPosition::default(),
                commit_position_ctx: None,
            }),
            update_cond: Condvar::new(),
            op_tracker: AsyncOpTracker::new(),
        })
    }

    pub fn executor(&self) -> Executor {
        self.executor.clone()
    }

    pub fn timer(&self) -> TaskTimer {
        self.timer.clone()
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.store)
    }

    pub fn oid(&self) -> &str {
        &self.oid
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn order(&self) -> u8 {
        self.state.lock().order
    }

    pub fn splay_width(&self) -> u8 {
        self.state.lock().splay_width
    }

    pub fn pool_id(&self) -> i64 {
        self.state.lock().pool_id
    }

    pub fn minimum_set(&self) -> u64 {
        self.state.lock().minimum_set
    }

    pub fn active_set(&self) -> u64 {
        self.state.lock().active_set
    }

    pub fn object_soft_max_size(&self) -> u64 {
        1u64 << self.state.lock().order
    }

    pub fn commit_position(&self) -> ObjectSetPosition {
        self.state.lock().client.commit_position.clone()
    }

    pub fn registered_clients(&self) -> Vec<RegisteredClient> {
        self.state.lock().registered_clients.clone()
    }

    /// Watch the header, fetch the immutable geometry once, then run a
    /// mutable refresh. `on_init` completes after the first refresh.
    pub fn init(self: &Arc<Self>, on_init: Completion) {
        {
            let mut state = self.state.lock();
            debug_assert!(!state.initialized, "metadata initialised twice");
            state.initialized = true;
        }

        let watcher = Arc::new(MetadataWatcher {
            metadata: Arc::downgrade(self),
        });
        match self.store.watch(&self.oid, watcher) {
            Ok(watch_id) => {
                self.state.lock().watch_id = Some(watch_id);
            }
            Err(err) => {
                warn!(
                    "event=journal_watch_failed oid={} error={}",
                    self.oid, err
                );
                self.state.lock().initialized = false;
                self.executor.complete(on_init, Err(err));
                return;
            }
        }

        let metadata = Arc::clone(self);
        self.op_tracker.start_op();
        client::get_immutable_metadata(
            &self.store,
            &self.oid,
            Box::new(move |result| {
                match result {
                    Ok(immutable) => {
                        {
                            let mut state = metadata.state.lock();
                            state.order = immutable.order;
                            state.splay_width = immutable.splay_width;
                            state.pool_id = immutable.pool_id;
                        }
                        debug!(
                            "event=journal_immutable_metadata oid={} order={} splay_width={} pool_id={}",
                            metadata.oid, immutable.order, immutable.splay_width, immutable.pool_id
                        );
                        metadata.refresh(Some(on_init));
                    }
                    Err(err) => {
                        warn!(
                            "event=journal_init_failed oid={} error={}",
                            metadata.oid, err
                        );
                        metadata.executor.complete(on_init, Err(err));
                    }
                }
                metadata.op_tracker.finish_op();
            }),
        );
    }

    /// Unwatch, flush any pending commit-position write, stop the timer
    /// and executor, and drain in-flight asynchronous ops.
    pub fn shutdown(self: &Arc<Self>) {
        let watch_id = {
            let mut state = self.state.lock();
            state.initialized = false;
            state.watch_id.take()
        };
        if let Some(watch_id) = watch_id {
            let _ = self.store.unwatch(&self.oid, watch_id);
        }

        self.flush_commit_position();

        self.timer.shutdown();
        self.op_tracker.wait_for_ops();
        self.store.flush();
        self.executor.shutdown();
        info!("event=journal_metadata_shutdown oid={}", self.oid);
    }

    pub fn add_listener(&self, listener: &Arc<dyn MetadataListener>) {
        let mut state = self.state.lock();
        while state.update_notifications > 0 {
            self.update_cond.wait(&mut state);
        }
        state.listeners.push(Arc::downgrade(listener));
    }

    pub fn remove_listener(&self, listener: &Arc<dyn MetadataListener>) {
        let mut state = self.state.lock();
        while state.update_notifications > 0 {
            self.update_cond.wait(&mut state);
        }
        state.listeners.retain(|candidate| {
            candidate
                .upgrade()
                .map_or(false, |candidate| !Arc::ptr_eq(&candidate, listener))
        });
    }

    /// Atomically add this client to the header; `Exists` when already
    /// registered. Peers learn of the change by notification.
    pub fn register_client(&self, description: &str) -> Result<()> {
        debug!(
            "event=journal_client_register oid={} client={}",
            self.oid, self.client_id
        );
        client::client_register(self.store.as_ref(), &self.oid, &self.client_id, description)?;
        self.notify_update();
        Ok(())
    }

    pub fn unregister_client(&self) -> Result<()> {
        debug!(
            "event=journal_client_unregister oid={} client={}",
            self.oid, self.client_id
        );
        client::client_unregister(self.store.as_ref(), &self.oid, &self.client_id)?;
        self.notify_update();
        Ok(())
    }

    /// Monotonic advance of the minimum set; `object_set` at or below the
    /// current value is a no-op.
    pub fn set_minimum_set(self: &Arc<Self>, object_set: u64) {
        {
            let mut state = self.state.lock();
            if state.minimum_set >= object_set {
                return;
            }
            debug!(
                "event=journal_set_minimum oid={} current={} new={}",
                self.oid, state.minimum_set, object_set
            );
            state.minimum_set = object_set;
        }
        self.write_header_update(client::set_minimum_set_call(object_set), None);
    }

    /// Monotonic advance of the active set; `object_set` at or below the
    /// current value is a no-op.
    pub fn set_active_set(self: &Arc<Self>, object_set: u64) {
        {
            let mut state = self.state.lock();
            if state.active_set >= object_set {
                return;
            }
            debug!(
                "event=journal_set_active oid={} current={} new={}",
                self.oid, state.active_set, object_set
            );
            state.active_set = object_set;
        }
        self.write_header_update(client::set_active_set_call(object_set), None);
    }

    pub fn allocate_tid(&self, tag: &str) -> u64 {
        let mut state = self.state.lock();
        let counter = state.allocated_tids.entry(tag.to_string()).or_insert(0);
        let tid = *counter;
        *counter += 1;
        tid
    }

    /// Raise the tag's tid counter past `tid` so replayed entries are not
    /// reallocated.
    pub fn reserve_tid(&self, tag: &str, tid: u64) {
        let mut state = self.state.lock();
        let counter = state.allocated_tids.entry(tag.to_string()).or_insert(0);
        if *counter <= tid {
            *counter = tid + 1;
        }
    }

    pub fn last_allocated_tid(&self, tag: &str) -> Option<u64> {
        let state = self.state.lock();
        state.allocated_tids.get(tag).map(|counter| counter - 1)
    }

    /// Allocate a strictly increasing commit tid and record the pending
    /// commit entry for it.
    pub fn allocate_commit_tid(&self, object_num: u64, tag: &str, tid: u64) -> u64 {
        let mut state = self.state.lock();
        state.commit_tid += 1;
        let commit_tid = state.commit_tid;
        state.pending_commit_tids.insert(
            commit_tid,
            CommitEntry {
                object_num,
                tag: tag.to_string(),
                tid,
                committed: false,
            },
        );
        debug!(
            "event=journal_commit_tid_allocated oid={} commit_tid={} object_num={} tag={} tid={}",
            self.oid, commit_tid, object_num, tag, tid
        );
        commit_tid
    }

    /// Mark `commit_tid` committed and fold every contiguous committed
    /// entry at the front of the pending map into the running position.
    /// Returns the folded position when it advanced.
    pub fn committed(&self, commit_tid: u64) -> Option<ObjectSetPosition> {
        let mut state = self.state.lock();
        match state.pending_commit_tids.get_mut(&commit_tid) {
            Some(entry) => entry.committed = true,
            None => {
                warn!(
                    "event=journal_unknown_commit_tid oid={} commit_tid={}",
                    self.oid, commit_tid
                );
                return None;
            }
        }

        let mut position = if !state.commit_position.is_empty() {
            state.commit_position.clone()
        } else {
            state.client.commit_position.clone()
        };

        let mut advanced = false;
        loop {
            let front = match state.pending_commit_tids.iter().next() {
                Some((&front_tid, entry)) if entry.committed => (front_tid, entry.clone()),
                _ => break,
            };
            let (front_tid, entry) = front;
            position.object_number = entry.object_num;
            match position.entry_positions.front_mut() {
                Some(existing) if existing.tag == entry.tag => {
                    existing.tid = entry.tid;
                }
                _ => {
                    position
                        .entry_positions
                        .push_front(EntryPosition::new(entry.tag, entry.tid));
                }
            }
            state.pending_commit_tids.remove(&front_tid);
            advanced = true;
        }

        if !advanced {
            return None;
        }

        // keep commit order: first occurrence of each tag wins
        let mut seen = std::collections::HashSet::new();
        position
            .entry_positions
            .retain(|entry| seen.insert(entry.tag.clone()));

        debug!(
            "event=journal_commit_position_folded oid={} object_number={} entries={}",
            self.oid,
            position.object_number,
            position.entry_positions.len()
        );
        Some(position)
    }

    /// Replace the staged commit position, coalescing writes within the
    /// commit interval. A position at or before the current one completes
    /// `on_safe` with `Stale`; a superseded pending callback is likewise
    /// retired with `Stale`.
    pub fn set_commit_position(self: &Arc<Self>, position: ObjectSetPosition, on_safe: Completion) {
        let stale_ctx;
        {
            let mut timer_state = self.timer_state.lock();
            let mut state = self.state.lock();
            debug!(
                "event=journal_set_commit_position oid={} object_number={} entries={}",
                self.oid,
                position.object_number,
                position.entry_positions.len()
            );
            if position.at_or_before(&state.client.commit_position)
                || position.at_or_before(&state.commit_position)
            {
                stale_ctx = Some(on_safe);
            } else {
                stale_ctx = state.commit_position_ctx.replace(on_safe);
                state.commit_position = position.clone();
                state.client.commit_position = position;
                self.schedule_commit_task(&mut timer_state);
            }
        }
        if let Some(ctx) = stale_ctx {
            self.executor.complete(ctx, Err(JournalError::Stale));
        }
    }

    /// Cancel the coalescing timer, if armed, and write the staged commit
    /// position immediately.
    pub fn flush_commit_position(self: &Arc<Self>) {
        {
            let mut timer_state = self.timer_state.lock();
            match timer_state.token.take() {
                Some(token) => {
                    if !self.timer.cancel(token) {
                        // task is already firing and will do the write
                        return;
                    }
                }
                None => return,
            }
        }
        self.handle_commit_position_task();
    }

    fn schedule_commit_task(self: &Arc<Self>, timer_state: &mut CommitTaskState) {
        if timer_state.token.is_some() {
            return;
        }
        let metadata = Arc::downgrade(self);
        // the task only clears its own token: a flush may already have
        // consumed it and armed a successor
        let own_token = Arc::new(Mutex::new(None::<TimerToken>));
        let token_cell = Arc::clone(&own_token);
        let token = self.timer.schedule(self.commit_interval, move || {
            if let Some(metadata) = metadata.upgrade() {
                {
                    let mut timer_state = metadata.timer_state.lock();
                    if timer_state.token == *token_cell.lock() {
                        timer_state.token = None;
                    }
                }
                metadata.handle_commit_position_task();
            }
        });
        *own_token.lock() = Some(token);
        timer_state.token = Some(token);
    }

    fn handle_commit_position_task(self: &Arc<Self>) {
        let (position, ctx) = {
            let mut state = self.state.lock();
            (
                state.commit_position.clone(),
                state.commit_position_ctx.take(),
            )
        };
        debug!(
            "event=journal_commit_position_write oid={} object_number={}",
            self.oid, position.object_number
        );
        self.write_header_update(client::client_commit_call(&self.client_id, &position), ctx);
    }

    /// Asynchronously apply a header mutation; on success broadcast a
    /// header-update notification, then complete `on_safe`.
    fn write_header_update(self: &Arc<Self>, call: crate::store::ExecCall, on_safe: Option<Completion>) {
        self.op_tracker.start_op();
        let metadata = Arc::clone(self);
        self.store.aio_exec(
            &self.oid,
            vec![call],
            Box::new(move |result| {
                let result = result.map(|_| ());
                if result.is_ok() {
                    metadata.async_notify_update();
                } else if let Err(err) = &result {
                    warn!(
                        "event=journal_header_update_failed oid={} error={}",
                        metadata.oid, err
                    );
                }
                if let Some(ctx) = on_safe {
                    ctx(result);
                }
                metadata.op_tracker.finish_op();
            }),
        );
    }

    pub fn notify_update(&self) {
        if let Err(err) = self.store.notify(&self.oid) {
            warn!(
                "event=journal_notify_failed oid={} error={}",
                self.oid, err
            );
        }
    }

    fn async_notify_update(self: &Arc<Self>) {
        self.op_tracker.start_op();
        let metadata = Arc::clone(self);
        self.store.aio_notify(
            &self.oid,
            Box::new(move |result| {
                if let Err(err) = result {
                    warn!(
                        "event=journal_notify_failed oid={} error={}",
                        metadata.oid, err
                    );
                }
                metadata.op_tracker.finish_op();
            }),
        );
    }

    /// Re-read the mutable header. The registered-client set must contain
    /// this client or the refresh fails with `NotFound`.
    pub fn refresh(self: &Arc<Self>, on_complete: Option<Completion>) {
        if !self.state.lock().initialized {
            if let Some(ctx) = on_complete {
                self.executor.complete(ctx, Err(JournalError::ShutDown));
            }
            return;
        }
        self.op_tracker.start_op();
        let metadata = Arc::clone(self);
        client::get_mutable_metadata(
            &self.store,
            &self.oid,
            Box::new(move |result| {
                metadata.handle_refresh_complete(result, on_complete);
                metadata.op_tracker.finish_op();
            }),
        );
    }

    fn handle_refresh_complete(
        self: &Arc<Self>,
        result: Result<MutableMetadata>,
        on_complete: Option<Completion>,
    ) {
        let result = result.and_then(|mutable| {
            let listeners = {
                let mut state = self.state.lock();
                let client = mutable
                    .clients
                    .iter()
                    .find(|client| client.id == self.client_id)
                    .cloned();
                match client {
                    Some(client) => {
                        state.minimum_set = mutable.minimum_set;
                        state.active_set = mutable.active_set;
                        state.registered_clients = mutable.clients;
                        state.client = client;
                        state.update_notifications += 1;
                        state
                            .listeners
                            .iter()
                            .filter_map(Weak::upgrade)
                            .collect::<Vec<_>>()
                    }
                    None => {
                        warn!(
                            "event=journal_client_missing oid={} client={}",
                            self.oid, self.client_id
                        );
                        return Err(JournalError::NotFound);
                    }
                }
            };

            for listener in listeners {
                listener.handle_update();
            }

            let mut state = self.state.lock();
            state.update_notifications -= 1;
            if state.update_notifications == 0 {
                self.update_cond.notify_all();
            }
            Ok(())
        });

        if let Err(err) = &result {
            debug!(
                "event=journal_refresh_failed oid={} error={}",
                self.oid, err
            );
        }
        if let Some(ctx) = on_complete {
            ctx(result);
        }
    }

    fn handle_watch_error(self: &Arc<Self>, err: JournalError) {
        warn!("event=journal_watch_error oid={} error={}", self.oid, err);
        let rearm = {
            let _timer_state = self.timer_state.lock();
            let mut state = self.state.lock();
            if let Some(watch_id) = state.watch_id.take() {
                let _ = self.store.unwatch(&self.oid, watch_id);
            }
            state.initialized && !err.is_fatal_watch_error()
        };
        if rearm {
            self.schedule_watch_reset();
        }
    }

    fn schedule_watch_reset(self: &Arc<Self>) {
        // the guard balances the tracker even when the timer is shut
        // down before the task fires
        let guard = TrackedOp::new(Arc::clone(self));
        self.timer.schedule(WATCH_RESET_DELAY, move || {
            if let Some(metadata) = guard.metadata.upgrade() {
                metadata.handle_watch_reset();
            }
            drop(guard);
        });
    }

    fn handle_watch_reset(self: &Arc<Self>) {
        if !self.state.lock().initialized {
            return;
        }
        let watcher = Arc::new(MetadataWatcher {
            metadata: Arc::downgrade(self),
        });
        match self.store.watch(&self.oid, watcher) {
            Ok(watch_id) => {
                info!("event=journal_watch_reset oid={}", self.oid);
                self.state.lock().watch_id = Some(watch_id);
                self.refresh(None);
            }
            Err(err) if err.is_fatal_watch_error() => {
                warn!(
                    "event=journal_watch_abandoned oid={} error={}",
                    self.oid, err
                );
            }
            Err(err) => {
                warn!(
                    "event=journal_watch_reset_failed oid={} error={}",
                    self.oid, err
                );
                self.schedule_watch_reset();
            }
        }
    }

    pub fn publish_metrics(&self, registry: &mut MetricsRegistry) {
        let state = self.state.lock();
        registry.set_gauge("metadata.minimum_set", state.minimum_set);
        registry.set_gauge("metadata.active_set", state.active_set);
        registry.set_gauge(
            "metadata.pending_commit_entries",
            state.pending_commit_tids.len() as u64,
        );
        registry.set_gauge(
            "metadata.registered_clients",
            state.registered_clients.len() as u64,
        );
    }
}
