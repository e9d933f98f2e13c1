//! Splayed journal appenders. Each appender owns one data object of the
//! active set, batches framed entries, and delivers them in tid order;
//! filling an object rotates the whole set forward.

use crate::error::{JournalError, Result};
use crate::executor::{Completion, Countdown, Executor, TaskTimer, TimerToken};
use crate::journal::entry::Entry;
use crate::journal::future::{EntryFuture, FlushHandler};
use crate::journal::metadata::{JournalMetadata, MetadataListener};
use crate::store::ObjectStore;
use crate::telemetry::MetricsRegistry;
use crate::util::object_name;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

type AppendBuffer = (Arc<EntryFuture>, Vec<u8>);

struct ObjectRecorderState {
    pending: VecDeque<AppendBuffer>,
    pending_bytes: u64,
    in_flight: VecDeque<Vec<AppendBuffer>>,
    write_active: bool,
    object_bytes: u64,
    overflowed: bool,
    closed: bool,
    age_task: Option<TimerToken>,
}

/// Appender for a single data object. One write is in flight at a time,
/// which keeps entries durable in tid order.
struct ObjectRecorder {
    oid: String,
    object_num: u64,
    soft_max_size: u64,
    store: Arc<dyn ObjectStore>,
    timer: TaskTimer,
    flush_interval: u32,
    flush_bytes: u64,
    flush_age: Option<Duration>,
    overflow_handler: Weak<JournalRecorder>,
    self_ref: Weak<ObjectRecorder>,
    state: Mutex<ObjectRecorderState>,
}

impl ObjectRecorder {
    #[allow(clippy::too_many_arguments)]
    fn new(
        oid: String,
        object_num: u64,
        soft_max_size: u64,
        store: Arc<dyn ObjectStore>,
        timer: TaskTimer,
        flush_interval: u32,
        flush_bytes: u64,
        flush_age: Option<Duration>,
        overflow_handler: Weak<JournalRecorder>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            oid,
            object_num,
            soft_max_size,
            store,
            timer,
            flush_interval,
            flush_bytes,
            flush_age,
            overflow_handler,
            self_ref: self_ref.clone(),
            state: Mutex::new(ObjectRecorderState {
                pending: VecDeque::new(),
                pending_bytes: 0,
                in_flight: VecDeque::new(),
                write_active: false,
                object_bytes: 0,
                overflowed: false,
                closed: false,
                age_task: None,
            }),
        })
    }

    /// Buffer one framed entry. Returns false when the object is full or
    /// closed; the caller then rotates the set and retries elsewhere.
    fn append(self: &Arc<Self>, future: &Arc<EntryFuture>, data: Vec<u8>) -> bool {
        let mut state = self.state.lock();
        if state.overflowed || state.closed {
            return false;
        }
        let occupied = state.object_bytes + state.pending_bytes;
        if occupied > 0 && occupied + data.len() as u64 > self.soft_max_size {
            return false;
        }

        let flush_requested = future.attach(Arc::clone(self) as Arc<dyn FlushHandler>);
        state.pending_bytes += data.len() as u64;
        state.pending.push_back((Arc::clone(future), data));

        if flush_requested || self.batch_ready(&state) {
            self.submit_pending(&mut state);
        } else if let Some(age) = self.flush_age {
            if state.age_task.is_none() {
                let recorder = Arc::downgrade(self);
                state.age_task = Some(self.timer.schedule(age, move || {
                    if let Some(recorder) = recorder.upgrade() {
                        recorder.handle_age_flush();
                    }
                }));
            }
        }
        true
    }

    /// Re-buffer entries claimed from a rotated-out appender; they were
    /// already flush-in-progress, so write immediately.
    fn restart_append(self: &Arc<Self>, buffers: Vec<AppendBuffer>) {
        if buffers.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        for (future, data) in buffers {
            state.pending_bytes += data.len() as u64;
            state.pending.push_back((future, data));
        }
        self.submit_pending(&mut state);
    }

    fn batch_ready(&self, state: &ObjectRecorderState) -> bool {
        let unconstrained =
            self.flush_interval == 0 && self.flush_bytes == 0 && self.flush_age.is_none();
        unconstrained
            || (self.flush_interval > 0 && state.pending.len() >= self.flush_interval as usize)
            || (self.flush_bytes > 0 && state.pending_bytes >= self.flush_bytes)
    }

    fn handle_age_flush(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.age_task = None;
        self.submit_pending(&mut state);
    }

    /// Move the pending batch into the write queue and start the write
    /// if none is active. Callers hold the state lock.
    fn submit_pending(self: &Arc<Self>, state: &mut ObjectRecorderState) {
        if state.pending.is_empty() {
            return;
        }
        if let Some(token) = state.age_task.take() {
            self.timer.cancel(token);
        }
        let batch: Vec<AppendBuffer> = state.pending.drain(..).collect();
        state.object_bytes += state.pending_bytes;
        state.pending_bytes = 0;
        for (future, _) in &batch {
            future.set_flush_in_progress();
        }
        state.in_flight.push_back(batch);
        self.maybe_start_write(state);
    }

    fn maybe_start_write(self: &Arc<Self>, state: &mut ObjectRecorderState) {
        if state.write_active || state.overflowed {
            return;
        }
        let Some(batch) = state.in_flight.front() else {
            return;
        };
        state.write_active = true;
        let data: Vec<u8> = batch
            .iter()
            .flat_map(|(_, bytes)| bytes.iter().copied())
            .collect();
        debug!(
            "event=journal_object_write oid={} bytes={} entries={}",
            self.oid,
            data.len(),
            batch.len()
        );
        let recorder = Arc::clone(self);
        self.store.aio_append(
            &self.oid,
            self.soft_max_size,
            data,
            Box::new(move |result| recorder.handle_write_complete(result)),
        );
    }

    fn handle_write_complete(self: &Arc<Self>, result: Result<()>) {
        let mut completed: Vec<Arc<EntryFuture>> = Vec::new();
        let mut batch_error: Option<JournalError> = None;
        let mut overflowed = false;
        {
            let mut state = self.state.lock();
            state.write_active = false;
            match result {
                Ok(()) => {
                    if let Some(batch) = state.in_flight.pop_front() {
                        completed.extend(batch.into_iter().map(|(future, _)| future));
                    }
                    self.maybe_start_write(&mut state);
                }
                Err(JournalError::Overflow) => {
                    warn!("event=journal_object_overflow oid={}", self.oid);
                    state.overflowed = true;
                    overflowed = true;
                    // rewind unwritten batches so the next object claims them
                    while let Some(batch) = state.in_flight.pop_back() {
                        let bytes: u64 =
                            batch.iter().map(|(_, data)| data.len() as u64).sum();
                        state.object_bytes = state.object_bytes.saturating_sub(bytes);
                        state.pending_bytes += bytes;
                        for buffer in batch.into_iter().rev() {
                            state.pending.push_front(buffer);
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        "event=journal_object_write_failed oid={} error={}",
                        self.oid, err
                    );
                    // the error surfaces through the batch's futures;
                    // later batches still attempt their writes
                    if let Some(batch) = state.in_flight.pop_front() {
                        completed.extend(batch.into_iter().map(|(future, _)| future));
                    }
                    batch_error = Some(err);
                    self.maybe_start_write(&mut state);
                }
            }
        }

        for future in completed {
            match &batch_error {
                Some(err) => future.safe(Err(err.clone())),
                None => future.safe(Ok(())),
            }
        }
        if overflowed {
            if let Some(handler) = self.overflow_handler.upgrade() {
                if let Some(this) = self.self_ref.upgrade() {
                    handler.handle_overflow(&this);
                }
            }
        }
    }

    /// Take back every unwritten buffer, preserving append order.
    fn claim_pending(&self) -> Vec<AppendBuffer> {
        let mut state = self.state.lock();
        if let Some(token) = state.age_task.take() {
            self.timer.cancel(token);
        }
        state.pending_bytes = 0;
        state.pending.drain(..).collect()
    }

    /// Flush outstanding buffers and refuse further appends.
    fn close(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.closed = true;
        self.submit_pending(&mut state);
    }
}

impl FlushHandler for ObjectRecorder {
    fn flush_future(&self, _future: &Arc<EntryFuture>) {
        // the future sits somewhere in the pending batch; submitting the
        // whole batch makes everything up to it durable
        if let Some(this) = self.self_ref.upgrade() {
            let mut state = this.state.lock();
            this.submit_pending(&mut state);
        }
    }
}

struct RecorderSetState {
    current_set: u64,
    object_recorders: Vec<Arc<ObjectRecorder>>,
    prev_futures: Vec<Option<Arc<EntryFuture>>>,
    entries_appended: u64,
    bytes_appended: u64,
}

/// Fans appends across `splay_width` object appenders and rotates the
/// active object set when an object fills.
pub struct JournalRecorder {
    store: Arc<dyn ObjectStore>,
    object_oid_prefix: String,
    metadata: Arc<JournalMetadata>,
    executor: Executor,
    timer: TaskTimer,
    flush_interval: u32,
    flush_bytes: u64,
    flush_age: Option<Duration>,
    state: Mutex<RecorderSetState>,
    listener: Mutex<Option<Arc<dyn MetadataListener>>>,
}

struct RecorderListener {
    recorder: Weak<JournalRecorder>,
}

impl MetadataListener for RecorderListener {
    fn handle_update(&self) {
        if let Some(recorder) = self.recorder.upgrade() {
            recorder.handle_metadata_update();
        }
    }
}

impl JournalRecorder {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        object_oid_prefix: impl Into<String>,
        metadata: Arc<JournalMetadata>,
        flush_interval: u32,
        flush_bytes: u64,
        flush_age: Option<Duration>,
    ) -> Arc<Self> {
        let recorder = Arc::new(Self {
            store,
            object_oid_prefix: object_oid_prefix.into(),
            executor: metadata.executor(),
            timer: metadata.timer(),
            metadata,
            flush_interval,
            flush_bytes,
            flush_age,
            state: Mutex::new(RecorderSetState {
                current_set: 0,
                object_recorders: Vec::new(),
                prev_futures: Vec::new(),
                entries_appended: 0,
                bytes_appended: 0,
            }),
            listener: Mutex::new(None),
        });

        {
            let mut state = recorder.state.lock();
            let current_set = recorder.metadata.active_set();
            state.current_set = current_set;
            let splay_width = recorder.metadata.splay_width();
            state.prev_futures = vec![None; splay_width as usize];
            state.object_recorders = recorder.create_object_recorders(current_set);
        }

        let listener: Arc<dyn MetadataListener> = Arc::new(RecorderListener {
            recorder: Arc::downgrade(&recorder),
        });
        recorder.metadata.add_listener(&listener);
        *recorder.listener.lock() = Some(listener);
        recorder
    }

    /// Append one entry under `tag`. The returned future resolves when
    /// the entry and its appender predecessors are durable.
    pub fn append(self: &Arc<Self>, tag: &str, payload: Vec<u8>) -> Arc<EntryFuture> {
        let mut state = self.state.lock();
        let splay_width = self.metadata.splay_width() as u64;
        let tid = self.metadata.allocate_tid(tag);
        let splay_offset = (tid % splay_width) as usize;

        let object_recorder = Arc::clone(&state.object_recorders[splay_offset]);
        let commit_tid =
            self.metadata
                .allocate_commit_tid(object_recorder.object_num, tag, tid);
        let future = EntryFuture::new(
            self.executor.clone(),
            tag,
            tid,
            commit_tid,
            state.prev_futures[splay_offset].clone(),
        );
        state.prev_futures[splay_offset] = Some(Arc::clone(&future));

        let data = Entry::new(tag, tid, payload).encode();
        state.entries_appended += 1;
        state.bytes_appended += data.len() as u64;

        let mut target = object_recorder;
        while !target.append(&future, data.clone()) {
            // target object full: rotate the set and retry there; an
            // empty object accepts any single entry, so this terminates
            let next_set = state.current_set + 1;
            self.advance_object_set(&mut state, next_set, true);
            target = Arc::clone(&state.object_recorders[splay_offset]);
        }
        future
    }

    /// Expedite durability of everything appended so far.
    pub fn flush(self: &Arc<Self>, on_safe: Completion) {
        let futures: Vec<Arc<EntryFuture>> = {
            let state = self.state.lock();
            state.prev_futures.iter().flatten().cloned().collect()
        };
        let countdown = Countdown::new(futures.len(), on_safe);
        for future in futures {
            future.flush(Some(countdown.completion()));
        }
    }

    /// Detach from header updates; outstanding writes complete through
    /// their futures.
    pub fn stop(&self) {
        if let Some(listener) = self.listener.lock().take() {
            self.metadata.remove_listener(&listener);
        }
    }

    pub fn publish_metrics(&self, registry: &mut MetricsRegistry) {
        let state = self.state.lock();
        registry.set_gauge("recorder.current_set", state.current_set);
        registry.set_gauge("recorder.entries_appended", state.entries_appended);
        registry.set_gauge("recorder.bytes_appended", state.bytes_appended);
    }

    fn create_object_recorders(
        self: &Arc<Self>,
        object_set: u64,
    ) -> Vec<Arc<ObjectRecorder>> {
        let splay_width = self.metadata.splay_width() as u64;
        let soft_max_size = self.metadata.object_soft_max_size();
        (0..splay_width)
            .map(|splay_offset| {
                let object_num = object_set * splay_width + splay_offset;
                ObjectRecorder::new(
                    object_name(&self.object_oid_prefix, object_num),
                    object_num,
                    soft_max_size,
                    Arc::clone(&self.store),
                    self.timer.clone(),
                    self.flush_interval,
                    self.flush_bytes,
                    self.flush_age,
                    Arc::downgrade(self),
                )
            })
            .collect()
    }

    fn handle_metadata_update(self: &Arc<Self>) {
        let active_set = self.metadata.active_set();
        let mut state = self.state.lock();
        if active_set > state.current_set {
            debug!(
                "event=journal_recorder_set_advanced prefix={} from={} to={}",
                self.object_oid_prefix, state.current_set, active_set
            );
            self.advance_object_set(&mut state, active_set, false);
        }
    }

    fn handle_overflow(self: &Arc<Self>, object_recorder: &Arc<ObjectRecorder>) {
        let mut state = self.state.lock();
        let splay_width = self.metadata.splay_width() as u64;
        let splay_offset = (object_recorder.object_num % splay_width) as usize;
        let overflowed_set = object_recorder.object_num / splay_width;
        if overflowed_set >= state.current_set {
            let next_set = overflowed_set + 1;
            self.advance_object_set(&mut state, next_set, true);
        }
        // re-target anything the rejected appender still holds
        let claimed = object_recorder.claim_pending();
        state.object_recorders[splay_offset].restart_append(claimed);
    }

    /// Close the current appenders, re-target their unwritten buffers at
    /// the new set, and optionally advance the shared active set.
    fn advance_object_set(
        self: &Arc<Self>,
        state: &mut RecorderSetState,
        object_set: u64,
        update_header: bool,
    ) {
        debug_assert!(object_set > state.current_set);
        let old_recorders = std::mem::take(&mut state.object_recorders);
        state.current_set = object_set;
        state.object_recorders = self.create_object_recorders(object_set);

        for (splay_offset, old) in old_recorders.iter().enumerate() {
            let claimed = old.claim_pending();
            old.close();
            state.object_recorders[splay_offset].restart_append(claimed);
        }

        if update_header {
            self.metadata.set_active_set(object_set);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::client;
    use crate::journal::entry::Entry;
    use crate::store::MemoryStore;
    use crate::testutil::SignalledResult;

    const OID: &str = "journal.img";
    const PREFIX: &str = "journal_data.-1.img.";

    struct Fixture {
        store: Arc<MemoryStore>,
        metadata: Arc<JournalMetadata>,
    }

    fn fixture(order: u8, splay_width: u8) -> Fixture {
        let store = MemoryStore::new();
        client::create(store.as_ref(), OID, order, splay_width, -1).unwrap();
        client::client_register(store.as_ref(), OID, "c1", "").unwrap();
        let metadata = JournalMetadata::new(
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            OID,
            "c1",
            Duration::from_secs(60),
        );
        let cond = SignalledResult::new();
        metadata.init(cond.completion());
        cond.wait().unwrap();
        Fixture { store, metadata }
    }

    fn decode_entries(data: &[u8]) -> Vec<Entry> {
        let mut entries = Vec::new();
        let mut offset = 0;
        while let Some((entry, consumed)) = Entry::decode_prefix(&data[offset..]).unwrap() {
            entries.push(entry);
            offset += consumed;
        }
        entries
    }

    #[test]
    fn append_writes_framed_entries_in_tid_order() {
        let fx = fixture(22, 1);
        let recorder = JournalRecorder::new(
            Arc::clone(&fx.store) as Arc<dyn ObjectStore>,
            PREFIX,
            Arc::clone(&fx.metadata),
            0,
            0,
            None,
        );

        let futures: Vec<_> = (0..3)
            .map(|index| recorder.append("tag1", vec![index as u8; 8]))
            .collect();
        let cond = SignalledResult::new();
        recorder.flush(cond.completion());
        cond.wait().unwrap();

        for (tid, future) in futures.iter().enumerate() {
            assert!(future.is_complete());
            assert_eq!(future.tid(), tid as u64);
        }

        let entries = decode_entries(&fx.store.object_data(&format!("{}0", PREFIX)).unwrap());
        assert_eq!(entries.len(), 3);
        for (tid, entry) in entries.iter().enumerate() {
            assert_eq!(entry.tag, "tag1");
            assert_eq!(entry.tid, tid as u64);
        }

        recorder.stop();
        fx.metadata.shutdown();
    }

    #[test]
    fn appends_splay_across_objects_by_tid() {
        let fx = fixture(22, 2);
        let recorder = JournalRecorder::new(
            Arc::clone(&fx.store) as Arc<dyn ObjectStore>,
            PREFIX,
            Arc::clone(&fx.metadata),
            0,
            0,
            None,
        );

        for index in 0..4u8 {
            recorder.append("tag1", vec![index; 4]);
        }
        let cond = SignalledResult::new();
        recorder.flush(cond.completion());
        cond.wait().unwrap();

        let even = decode_entries(&fx.store.object_data(&format!("{}0", PREFIX)).unwrap());
        let odd = decode_entries(&fx.store.object_data(&format!("{}1", PREFIX)).unwrap());
        assert_eq!(
            even.iter().map(|entry| entry.tid).collect::<Vec<_>>(),
            vec![0, 2]
        );
        assert_eq!(
            odd.iter().map(|entry| entry.tid).collect::<Vec<_>>(),
            vec![1, 3]
        );

        recorder.stop();
        fx.metadata.shutdown();
    }

    #[test]
    fn batch_waits_for_flush_threshold() {
        let fx = fixture(22, 1);
        let recorder = JournalRecorder::new(
            Arc::clone(&fx.store) as Arc<dyn ObjectStore>,
            PREFIX,
            Arc::clone(&fx.metadata),
            2,
            0,
            None,
        );

        let first = recorder.append("tag1", vec![1; 8]);
        fx.store.flush();
        assert!(!first.is_complete());

        let second = recorder.append("tag1", vec![2; 8]);
        let cond = SignalledResult::new();
        second.wait(cond.completion());
        cond.wait().unwrap();
        assert!(first.is_complete());

        recorder.stop();
        fx.metadata.shutdown();
    }

    #[test]
    fn future_flush_forces_partial_batch_out() {
        let fx = fixture(22, 1);
        let recorder = JournalRecorder::new(
            Arc::clone(&fx.store) as Arc<dyn ObjectStore>,
            PREFIX,
            Arc::clone(&fx.metadata),
            64,
            0,
            None,
        );

        let future = recorder.append("tag1", vec![7; 8]);
        let cond = SignalledResult::new();
        future.flush(Some(cond.completion()));
        cond.wait().unwrap();
        assert!(future.is_complete());

        recorder.stop();
        fx.metadata.shutdown();
    }

    #[test]
    fn filling_an_object_rotates_the_active_set() {
        // order 12 => 4096-byte soft max
        let fx = fixture(12, 1);
        let recorder = JournalRecorder::new(
            Arc::clone(&fx.store) as Arc<dyn ObjectStore>,
            PREFIX,
            Arc::clone(&fx.metadata),
            0,
            0,
            None,
        );

        let first = recorder.append("tag1", vec![0xaa; 3000]);
        let second = recorder.append("tag1", vec![0xbb; 3000]);
        let cond = SignalledResult::new();
        recorder.flush(cond.completion());
        cond.wait().unwrap();
        assert!(first.is_complete());
        assert!(second.is_complete());

        assert_eq!(fx.metadata.active_set(), 1);
        let object0 = decode_entries(&fx.store.object_data(&format!("{}0", PREFIX)).unwrap());
        let object1 = decode_entries(&fx.store.object_data(&format!("{}1", PREFIX)).unwrap());
        assert_eq!(object0.len(), 1);
        assert_eq!(object1.len(), 1);
        assert_eq!(object1[0].tid, 1);

        recorder.stop();
        fx.metadata.shutdown();
    }

    #[test]
    fn per_appender_futures_chain_in_order() {
        let fx = fixture(22, 1);
        let recorder = JournalRecorder::new(
            Arc::clone(&fx.store) as Arc<dyn ObjectStore>,
            PREFIX,
            Arc::clone(&fx.metadata),
            8,
            0,
            None,
        );

        let first = recorder.append("tag1", vec![1; 8]);
        let second = recorder.append("tag1", vec![2; 8]);
        let cond = SignalledResult::new();
        second.flush(Some(cond.completion()));
        cond.wait().unwrap();
        // safing the second future implies the first is safe
        assert!(first.is_complete());
        assert!(second.is_complete());
        assert!(first.commit_tid() < second.commit_tid());

        recorder.stop();
        fx.metadata.shutdown();
    }
}
