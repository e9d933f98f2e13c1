//! Journal window maintenance: folds commit acknowledgements into the
//! header commit position and deletes object sets once every registered
//! consumer has moved past them.

use crate::error::{JournalError, Result};
use crate::executor::{AsyncOpTracker, Completion};
use crate::journal::metadata::{JournalMetadata, MetadataListener};
use crate::store::ObjectStore;
use crate::util::object_name;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};

struct TrimmerState {
    remove_set: u64,
    remove_set_pending: bool,
    remove_set_ctx: Option<Completion>,
}

/// Advances the minimum object set and removes retired data objects.
pub struct JournalTrimmer {
    store: Arc<dyn ObjectStore>,
    object_oid_prefix: String,
    metadata: Arc<JournalMetadata>,
    state: Mutex<TrimmerState>,
    op_tracker: Arc<AsyncOpTracker>,
    listener: Mutex<Option<Arc<dyn MetadataListener>>>,
}

struct TrimmerListener {
    trimmer: Weak<JournalTrimmer>,
}

impl MetadataListener for TrimmerListener {
    fn handle_update(&self) {
        if let Some(trimmer) = self.trimmer.upgrade() {
            trimmer.handle_metadata_update();
        }
    }
}

/// Splay-fanned set deletion: absent objects are fine, the first real
/// error wins, any successful delete upgrades a fully-absent set.
struct RemoveSetGate {
    remaining: Mutex<(usize, Result<()>)>,
    on_finish: Mutex<Option<Box<dyn FnOnce(Result<()>) + Send>>>,
}

impl RemoveSetGate {
    fn new(count: usize, on_finish: Box<dyn FnOnce(Result<()>) + Send>) -> Arc<Self> {
        Arc::new(Self {
            remaining: Mutex::new((count, Err(JournalError::NotFound))),
            on_finish: Mutex::new(Some(on_finish)),
        })
    }

    fn completion(self: &Arc<Self>) -> Completion {
        let gate = Arc::clone(self);
        Box::new(move |result| {
            let finished = {
                let mut remaining = gate.remaining.lock();
                match result {
                    Ok(()) => {
                        if remaining.1 == Err(JournalError::NotFound) {
                            remaining.1 = Ok(());
                        }
                    }
                    Err(JournalError::NotFound) => {}
                    Err(err) => {
                        if remaining.1 == Err(JournalError::NotFound) {
                            remaining.1 = Err(err);
                        }
                    }
                }
                remaining.0 -= 1;
                if remaining.0 == 0 {
                    Some(remaining.1.clone())
                } else {
                    None
                }
            };
            if let Some(result) = finished {
                if let Some(cb) = gate.on_finish.lock().take() {
                    cb(result);
                }
            }
        })
    }
}

impl JournalTrimmer {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        object_oid_prefix: impl Into<String>,
        metadata: Arc<JournalMetadata>,
    ) -> Arc<Self> {
        let trimmer = Arc::new(Self {
            store,
            object_oid_prefix: object_oid_prefix.into(),
            metadata,
            state: Mutex::new(TrimmerState {
                remove_set: 0,
                remove_set_pending: false,
                remove_set_ctx: None,
            }),
            op_tracker: Arc::new(AsyncOpTracker::new()),
            listener: Mutex::new(None),
        });

        let listener: Arc<dyn MetadataListener> = Arc::new(TrimmerListener {
            trimmer: Arc::downgrade(&trimmer),
        });
        trimmer.metadata.add_listener(&listener);
        *trimmer.listener.lock() = Some(listener);
        trimmer
    }

    /// Flush the staged commit position and drain deletions.
    pub fn shutdown(&self) {
        if let Some(listener) = self.listener.lock().take() {
            self.metadata.remove_listener(&listener);
        }
        self.metadata.flush_commit_position();
        self.op_tracker.wait_for_ops();
    }

    /// A replayed or appended entry finished its image-side I/O; fold it
    /// into the commit position and stage the coalesced header write.
    pub fn committed(self: &Arc<Self>, commit_tid: u64) {
        debug!(
            "event=journal_trimmer_committed prefix={} commit_tid={}",
            self.object_oid_prefix, commit_tid
        );
        let Some(position) = self.metadata.committed(commit_tid) else {
            return;
        };

        self.op_tracker.start_op();
        let trimmer = Arc::clone(self);
        self.metadata.set_commit_position(
            position,
            Box::new(move |result| {
                match result {
                    Ok(()) => trimmer.handle_metadata_update(),
                    // a superseded position means a newer write carries
                    // the progress; nothing to do
                    Err(JournalError::Stale) => {}
                    Err(err) => {
                        warn!(
                            "event=journal_commit_position_failed prefix={} error={}",
                            trimmer.object_oid_prefix, err
                        );
                    }
                }
                trimmer.op_tracker.finish_op();
            }),
        );
    }

    /// Delete every data object of the journal. Without `force` the
    /// journal must have exactly this one registered client.
    pub fn remove_objects(self: &Arc<Self>, force: bool) -> Result<()> {
        self.op_tracker.wait_for_ops();

        let cond = Arc::new((Mutex::new(None::<Result<()>>), Condvar::new()));
        {
            let mut state = self.state.lock();
            if state.remove_set_pending {
                return Err(JournalError::Busy);
            }
            if !force {
                let clients = self.metadata.registered_clients();
                if clients.is_empty() {
                    return Err(JournalError::invalid("journal has no registered clients"));
                }
                if clients.len() > 1 {
                    return Err(JournalError::Busy);
                }
            }

            state.remove_set = u64::MAX;
            state.remove_set_pending = true;
            let cond = Arc::clone(&cond);
            state.remove_set_ctx = Some(Box::new(move |result| {
                let (slot, signal) = &*cond;
                *slot.lock() = Some(result);
                signal.notify_all();
            }));
            self.remove_set(self.metadata.minimum_set());
        }

        let (slot, signal) = &*cond;
        let mut result = slot.lock();
        while result.is_none() {
            signal.wait(&mut result);
        }
        result.take().expect("removal result present")
    }

    fn handle_metadata_update(self: &Arc<Self>) {
        let splay_width = self.metadata.splay_width() as u64;
        if splay_width == 0 {
            return;
        }
        let clients = self.metadata.registered_clients();
        if clients.is_empty() {
            return;
        }
        let safe_set = clients
            .iter()
            .map(|client| client.commit_position.object_number / splay_width)
            .min()
            .expect("non-empty client set");

        let mut state = self.state.lock();
        self.trim_objects(&mut state, safe_set);
    }

    fn trim_objects(self: &Arc<Self>, state: &mut TrimmerState, minimum_set: u64) {
        if minimum_set <= self.metadata.minimum_set() {
            return;
        }
        if state.remove_set_pending {
            state.remove_set = state.remove_set.max(minimum_set);
            return;
        }
        debug!(
            "event=journal_trim prefix={} to_set={}",
            self.object_oid_prefix, minimum_set
        );
        state.remove_set = minimum_set;
        state.remove_set_pending = true;
        self.remove_set(self.metadata.minimum_set());
    }

    /// Asynchronously delete the `splay_width` objects of `object_set`.
    fn remove_set(self: &Arc<Self>, object_set: u64) {
        self.op_tracker.start_op();
        let splay_width = self.metadata.splay_width() as u64;

        let trimmer = Arc::clone(self);
        let gate = RemoveSetGate::new(
            splay_width as usize,
            Box::new(move |result| {
                trimmer.handle_set_removed(result, object_set);
                trimmer.op_tracker.finish_op();
            }),
        );

        debug!(
            "event=journal_remove_set prefix={} object_set={}",
            self.object_oid_prefix, object_set
        );
        for object_num in object_set * splay_width..(object_set + 1) * splay_width {
            let oid = object_name(&self.object_oid_prefix, object_num);
            self.store.aio_remove(&oid, gate.completion());
        }
    }

    fn handle_set_removed(self: &Arc<Self>, result: Result<()>, object_set: u64) {
        debug!(
            "event=journal_set_removed prefix={} object_set={} ok={}",
            self.object_oid_prefix,
            object_set,
            result.is_ok()
        );

        let (ctx, result) = {
            let mut state = self.state.lock();
            state.remove_set_pending = false;

            let absent = result == Err(JournalError::NotFound);
            let advance = result.is_ok() || (absent && state.remove_set_ctx.is_none());
            let mut result = result;
            if advance {
                // advance past the removed set and continue while more
                // sets are marked for removal
                self.metadata.set_minimum_set(object_set + 1);
                let minimum_set = self.metadata.minimum_set();
                if state.remove_set > minimum_set {
                    state.remove_set_pending = true;
                    self.remove_set(minimum_set);
                }
                result = Ok(());
            } else if absent {
                // no objects existed in the set
                result = Ok(());
            } else if let Err(err) = &result {
                warn!(
                    "event=journal_trim_failed prefix={} object_set={} error={}",
                    self.object_oid_prefix, object_set, err
                );
            }

            if state.remove_set_ctx.is_some() && !state.remove_set_pending {
                (state.remove_set_ctx.take(), result)
            } else {
                (None, result)
            }
        };

        if let Some(ctx) = ctx {
            ctx(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::client;
    use crate::header::{EntryPosition, ObjectSetPosition};
    use crate::store::MemoryStore;
    use crate::testutil::SignalledResult;
    use std::time::Duration;

    const OID: &str = "journal.img";
    const PREFIX: &str = "journal_data.-1.img.";

    struct Fixture {
        store: Arc<MemoryStore>,
        metadata: Arc<JournalMetadata>,
    }

    fn fixture(splay_width: u8, clients: &[&str]) -> Fixture {
        let store = MemoryStore::new();
        client::create(store.as_ref(), OID, 22, splay_width, -1).unwrap();
        for id in clients {
            client::client_register(store.as_ref(), OID, id, "").unwrap();
        }
        let metadata = JournalMetadata::new(
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            OID,
            clients[0],
            Duration::from_millis(20),
        );
        let cond = SignalledResult::new();
        metadata.init(cond.completion());
        cond.wait().unwrap();
        Fixture { store, metadata }
    }

    fn seed_object(store: &Arc<MemoryStore>, object_num: u64) {
        let done = SignalledResult::new();
        store.aio_append(
            &object_name(PREFIX, object_num),
            u64::MAX,
            vec![0u8; 8],
            done.completion(),
        );
        done.wait().unwrap();
    }

    fn wait_until(mut predicate: impl FnMut() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while !predicate() {
            assert!(
                std::time::Instant::now() < deadline,
                "condition never reached"
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn committed_entries_advance_minimum_and_delete_sets() {
        let fx = fixture(2, &["c1"]);
        let trimmer = JournalTrimmer::new(
            Arc::clone(&fx.store) as Arc<dyn ObjectStore>,
            PREFIX,
            Arc::clone(&fx.metadata),
        );

        for object_num in 0..4 {
            seed_object(&fx.store, object_num);
        }
        fx.metadata.set_active_set(1);

        // commit an entry living in set 1
        let commit_tid = fx.metadata.allocate_commit_tid(2, "tag1", 0);
        trimmer.committed(commit_tid);

        wait_until(|| fx.metadata.minimum_set() == 1);
        wait_until(|| {
            fx.store.stat(&object_name(PREFIX, 0)).is_err()
                && fx.store.stat(&object_name(PREFIX, 1)).is_err()
        });
        // set 1 is still referenced
        assert!(fx.store.stat(&object_name(PREFIX, 2)).is_ok());

        trimmer.shutdown();
        fx.metadata.shutdown();
    }

    #[test]
    fn lagging_peer_blocks_trimming() {
        let fx = fixture(2, &["c1", "c2"]);
        let trimmer = JournalTrimmer::new(
            Arc::clone(&fx.store) as Arc<dyn ObjectStore>,
            PREFIX,
            Arc::clone(&fx.metadata),
        );

        for object_num in 0..4 {
            seed_object(&fx.store, object_num);
        }
        fx.metadata.set_active_set(1);

        let commit_tid = fx.metadata.allocate_commit_tid(2, "tag1", 0);
        trimmer.committed(commit_tid);

        // c2 never committed anything, so set 0 must survive
        let ack = SignalledResult::new();
        fx.metadata.set_commit_position(
            ObjectSetPosition::new(3, [EntryPosition::new("tag1", 1)]),
            ack.completion(),
        );
        fx.metadata.flush_commit_position();
        let _ = ack.wait();
        fx.store.flush();

        assert_eq!(fx.metadata.minimum_set(), 0);
        assert!(fx.store.stat(&object_name(PREFIX, 0)).is_ok());

        trimmer.shutdown();
        fx.metadata.shutdown();
    }

    #[test]
    fn remove_objects_requires_sole_ownership() {
        let fx = fixture(2, &["c1", "c2"]);
        let trimmer = JournalTrimmer::new(
            Arc::clone(&fx.store) as Arc<dyn ObjectStore>,
            PREFIX,
            Arc::clone(&fx.metadata),
        );
        assert_eq!(trimmer.remove_objects(false), Err(JournalError::Busy));

        seed_object(&fx.store, 0);
        trimmer.remove_objects(true).unwrap();
        assert!(fx.store.stat(&object_name(PREFIX, 0)).is_err());

        trimmer.shutdown();
        fx.metadata.shutdown();
    }

    #[test]
    fn remove_objects_tolerates_absent_sets() {
        let fx = fixture(2, &["c1"]);
        let trimmer = JournalTrimmer::new(
            Arc::clone(&fx.store) as Arc<dyn ObjectStore>,
            PREFIX,
            Arc::clone(&fx.metadata),
        );
        trimmer.remove_objects(false).unwrap();
        trimmer.shutdown();
        fx.metadata.shutdown();
    }
}
