//! Facade over the journal subsystems: header lifecycle, replay, append,
//! commit acknowledgement, and trimming for one journal.

use crate::config::JournalConfig;
use crate::error::{JournalError, Result};
use crate::executor::Completion;
use crate::header::client;
use crate::journal::future::EntryFuture;
use crate::journal::metadata::JournalMetadata;
use crate::journal::player::{JournalPlayer, ReplayHandler};
use crate::journal::recorder::JournalRecorder;
use crate::journal::trimmer::JournalTrimmer;
use crate::store::ObjectStore;
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const HEADER_PREFIX: &str = "journal.";
const OBJECT_PREFIX: &str = "journal_data.";

/// One entry handed back from replay, carrying the commit tid used to
/// acknowledge it once applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayEntry {
    pub tag: String,
    pub data: Vec<u8>,
    pub commit_tid: u64,
}

pub struct Journaler {
    store: Arc<dyn ObjectStore>,
    journal_id: String,
    header_oid: String,
    metadata: Arc<JournalMetadata>,
    object_oid_prefix: Mutex<Option<String>>,
    player: Mutex<Option<Arc<JournalPlayer>>>,
    recorder: Mutex<Option<Arc<JournalRecorder>>>,
    trimmer: Mutex<Option<Arc<JournalTrimmer>>>,
}

impl Journaler {
    pub fn header_oid(journal_id: &str) -> String {
        format!("{}{}", HEADER_PREFIX, journal_id)
    }

    pub fn object_oid_prefix(pool_id: i64, journal_id: &str) -> String {
        format!("{}{}.{}.", OBJECT_PREFIX, pool_id, journal_id)
    }

    pub fn new(
        store: Arc<dyn ObjectStore>,
        journal_id: impl Into<String>,
        client_id: impl Into<String>,
        commit_interval: Duration,
    ) -> Arc<Self> {
        let journal_id = journal_id.into();
        let header_oid = Self::header_oid(&journal_id);
        let metadata = JournalMetadata::new(
            Arc::clone(&store),
            header_oid.clone(),
            client_id,
            commit_interval,
        );
        Arc::new(Self {
            store,
            journal_id,
            header_oid,
            metadata,
            object_oid_prefix: Mutex::new(None),
            player: Mutex::new(None),
            recorder: Mutex::new(None),
            trimmer: Mutex::new(None),
        })
    }

    pub fn metadata(&self) -> Arc<JournalMetadata> {
        Arc::clone(&self.metadata)
    }

    pub fn exists(&self) -> Result<bool> {
        match self.store.stat(&self.header_oid) {
            Ok(_) => Ok(true),
            Err(JournalError::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Create the journal header. `order` outside [12, 64] is a `Domain`
    /// error; a zero `splay_width` is `Invalid`.
    pub fn create(&self, order: u8, splay_width: u8, pool_id: i64) -> Result<()> {
        JournalConfig {
            order,
            splay_width,
            data_pool_id: pool_id,
            ..JournalConfig::default()
        }
        .validate()?;

        info!(
            "event=journal_create journal={} order={} splay_width={} pool_id={}",
            self.journal_id, order, splay_width, pool_id
        );
        client::create(self.store.as_ref(), &self.header_oid, order, splay_width, pool_id)
    }

    /// Watch and load the header, then stand up the trimmer.
    pub fn init(self: &Arc<Self>, on_init: Completion) {
        let journaler = Arc::clone(self);
        self.metadata.init(Box::new(move |result| {
            if result.is_ok() {
                journaler.init_complete();
            }
            on_init(result);
        }));
    }

    fn init_complete(self: &Arc<Self>) {
        let prefix = Self::object_oid_prefix(self.metadata.pool_id(), &self.journal_id);
        *self.object_oid_prefix.lock() = Some(prefix.clone());
        *self.trimmer.lock() = Some(JournalTrimmer::new(
            Arc::clone(&self.store),
            prefix,
            Arc::clone(&self.metadata),
        ));
    }

    pub fn shutdown(&self) {
        if let Some(player) = self.player.lock().take() {
            player.stop();
        }
        if let Some(recorder) = self.recorder.lock().take() {
            recorder.stop();
        }
        if let Some(trimmer) = self.trimmer.lock().take() {
            trimmer.shutdown();
        }
        self.metadata.shutdown();
    }

    /// Delete the journal: every data object, then the header. Without
    /// `force`, other registered clients make this `Busy`.
    pub fn remove(&self, force: bool) -> Result<()> {
        self.metadata.shutdown();
        let trimmer = self
            .trimmer
            .lock()
            .take()
            .ok_or_else(|| JournalError::invalid("journal not initialized"))?;
        trimmer.remove_objects(force)?;
        trimmer.shutdown();

        info!("event=journal_remove journal={}", self.journal_id);
        self.store.remove(&self.header_oid)
    }

    /// Administrative reset: destroy and recreate the journal with the
    /// same geometry. Not guarded against concurrent consumers; callers
    /// must quiesce the journal first.
    pub fn reset(&self) -> Result<()> {
        let (order, splay_width, pool_id) = self.get_metadata();
        self.remove(true)?;
        self.create(order, splay_width, pool_id)
    }

    pub fn register_client(&self, description: &str) -> Result<()> {
        self.metadata.register_client(description)
    }

    pub fn unregister_client(&self) -> Result<()> {
        self.metadata.unregister_client()
    }

    pub fn get_metadata(&self) -> (u8, u8, i64) {
        (
            self.metadata.order(),
            self.metadata.splay_width(),
            self.metadata.pool_id(),
        )
    }

    /// Replay all pending entries, then report completion.
    pub fn start_replay(&self, replay_handler: Arc<dyn ReplayHandler>) {
        let player = self.create_player(replay_handler);
        player.prefetch();
    }

    /// Replay pending entries and keep tailing the live journal.
    pub fn start_live_replay(&self, replay_handler: Arc<dyn ReplayHandler>, interval: Duration) {
        let player = self.create_player(replay_handler);
        player.prefetch_and_watch(interval);
    }

    fn create_player(&self, replay_handler: Arc<dyn ReplayHandler>) -> Arc<JournalPlayer> {
        let player = JournalPlayer::new(
            Arc::clone(&self.store),
            self.object_prefix(),
            Arc::clone(&self.metadata),
            replay_handler,
        );
        let mut slot = self.player.lock();
        debug_assert!(slot.is_none(), "replay already started");
        *slot = Some(Arc::clone(&player));
        player
    }

    pub fn try_pop_front(&self) -> Option<ReplayEntry> {
        let player = self.player.lock().as_ref().cloned()?;
        let (entry, commit_tid) = player.try_pop_front()?;
        Some(ReplayEntry {
            tag: entry.tag,
            data: entry.payload,
            commit_tid,
        })
    }

    pub fn stop_replay(&self) {
        if let Some(player) = self.player.lock().take() {
            player.stop();
        }
    }

    /// Acknowledge that the entry behind `commit_tid` has been applied;
    /// the trimmer folds it into the commit position asynchronously.
    pub fn committed(&self, commit_tid: u64) {
        let trimmer = self.trimmer.lock().as_ref().cloned();
        if let Some(trimmer) = trimmer {
            trimmer.committed(commit_tid);
        }
    }

    pub fn start_append(
        &self,
        flush_interval: u32,
        flush_bytes: u64,
        flush_age: Option<Duration>,
    ) {
        let recorder = JournalRecorder::new(
            Arc::clone(&self.store),
            self.object_prefix(),
            Arc::clone(&self.metadata),
            flush_interval,
            flush_bytes,
            flush_age,
        );
        let mut slot = self.recorder.lock();
        debug_assert!(slot.is_none(), "append already started");
        *slot = Some(recorder);
    }

    /// Flush outstanding appends, then tear the recorder down and
    /// complete `on_safe`.
    pub fn stop_append(&self, on_safe: Completion) {
        let Some(recorder) = self.recorder.lock().take() else {
            on_safe(Err(JournalError::invalid("appending not started")));
            return;
        };
        debug!("event=journal_stop_append journal={}", self.journal_id);
        let flushed = Arc::clone(&recorder);
        recorder.flush(Box::new(move |result| {
            flushed.stop();
            on_safe(result);
        }));
    }

    pub fn append(&self, tag: &str, payload: Vec<u8>) -> Result<Arc<EntryFuture>> {
        let recorder = self
            .recorder
            .lock()
            .as_ref()
            .cloned()
            .ok_or_else(|| JournalError::invalid("appending not started"))?;
        Ok(recorder.append(tag, payload))
    }

    /// Expedite durability of everything appended so far.
    pub fn flush_append(&self, on_safe: Completion) {
        let recorder = self.recorder.lock().as_ref().cloned();
        match recorder {
            Some(recorder) => recorder.flush(on_safe),
            None => on_safe(Ok(())),
        }
    }

    fn object_prefix(&self) -> String {
        self.object_oid_prefix
            .lock()
            .clone()
            .expect("journal initialized before use")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testutil::SignalledResult;
    use parking_lot::Condvar;
    use std::time::Instant;

    struct TestHandler {
        available: Mutex<u32>,
        completions: Mutex<Vec<Result<()>>>,
        cond: Condvar,
    }

    impl TestHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                available: Mutex::new(0),
                completions: Mutex::new(Vec::new()),
                cond: Condvar::new(),
            })
        }

        fn wait_available(&self) {
            let deadline = Instant::now() + Duration::from_secs(10);
            let mut available = self.available.lock();
            while *available == 0 {
                assert!(!self.cond.wait_until(&mut available, deadline).timed_out());
            }
        }

        fn wait_complete(&self) -> Result<()> {
            let deadline = Instant::now() + Duration::from_secs(10);
            let mut completions = self.completions.lock();
            while completions.is_empty() {
                assert!(!self.cond.wait_until(&mut completions, deadline).timed_out());
            }
            completions.remove(0)
        }
    }

    impl ReplayHandler for TestHandler {
        fn handle_entries_available(&self) {
            *self.available.lock() += 1;
            self.cond.notify_all();
        }

        fn handle_complete(&self, result: Result<()>) {
            self.completions.lock().push(result);
            self.cond.notify_all();
        }
    }

    fn open_journaler(store: &Arc<MemoryStore>) -> Arc<Journaler> {
        let journaler = Journaler::new(
            Arc::clone(store) as Arc<dyn ObjectStore>,
            "img",
            "c1",
            Duration::from_millis(20),
        );
        journaler.create(20, 2, -1).unwrap();
        journaler.register_client("test client").unwrap();
        let cond = SignalledResult::new();
        journaler.init(cond.completion());
        cond.wait().unwrap();
        journaler
    }

    /// Replay must run on a freshly opened journaler: a journaler that
    /// just appended already holds the allocated tids.
    fn reopen_journaler(store: &Arc<MemoryStore>) -> Arc<Journaler> {
        let journaler = Journaler::new(
            Arc::clone(store) as Arc<dyn ObjectStore>,
            "img",
            "c1",
            Duration::from_millis(20),
        );
        let cond = SignalledResult::new();
        journaler.init(cond.completion());
        cond.wait().unwrap();
        journaler
    }

    #[test]
    fn create_validates_geometry() {
        let store = MemoryStore::new();
        let journaler = Journaler::new(
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            "img",
            "c1",
            Duration::from_millis(20),
        );
        assert!(matches!(
            journaler.create(11, 4, -1),
            Err(JournalError::Domain(_))
        ));
        assert!(matches!(
            journaler.create(65, 4, -1),
            Err(JournalError::Domain(_))
        ));
        assert!(matches!(
            journaler.create(20, 0, -1),
            Err(JournalError::Invalid(_))
        ));
        assert!(!journaler.exists().unwrap());
        journaler.create(20, 4, -1).unwrap();
        assert!(journaler.exists().unwrap());
        assert_eq!(journaler.create(20, 4, -1), Err(JournalError::Exists));
        journaler.metadata().shutdown();
    }

    #[test]
    fn append_then_replay_round_trip() {
        let store = MemoryStore::new();
        let journaler = open_journaler(&store);
        assert_eq!(journaler.get_metadata(), (20, 2, -1));

        journaler.start_append(0, 0, None);
        for index in 0..3u8 {
            journaler.append("tag1", vec![index; 4]).unwrap();
        }
        let stopped = SignalledResult::new();
        journaler.stop_append(stopped.completion());
        stopped.wait().unwrap();
        journaler.shutdown();

        let journaler = reopen_journaler(&store);
        let handler = TestHandler::new();
        journaler.start_replay(Arc::clone(&handler) as Arc<dyn ReplayHandler>);
        handler.wait_available();

        let mut replayed = Vec::new();
        while let Some(entry) = journaler.try_pop_front() {
            journaler.committed(entry.commit_tid);
            replayed.push(entry);
        }
        handler.wait_complete().unwrap();
        assert_eq!(replayed.len(), 3);
        for (index, entry) in replayed.iter().enumerate() {
            assert_eq!(entry.tag, "tag1");
            assert_eq!(entry.data, vec![index as u8; 4]);
        }
        journaler.stop_replay();

        // committed positions reach the header after the commit interval
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let clients = journaler.metadata().registered_clients();
            if clients[0].commit_position.object_number != 0
                || !clients[0].commit_position.is_empty()
            {
                break;
            }
            assert!(Instant::now() < deadline, "commit position never persisted");
            std::thread::sleep(Duration::from_millis(10));
        }
        journaler.shutdown();
    }

    #[test]
    fn replay_skips_previously_committed_entries() {
        let store = MemoryStore::new();
        let journaler = open_journaler(&store);

        journaler.start_append(0, 0, None);
        for index in 0..4u8 {
            journaler.append("tag1", vec![index; 4]).unwrap();
        }
        let stopped = SignalledResult::new();
        journaler.stop_append(stopped.completion());
        stopped.wait().unwrap();
        journaler.shutdown();

        // first consumer applies two entries
        let journaler = reopen_journaler(&store);
        let handler = TestHandler::new();
        journaler.start_replay(Arc::clone(&handler) as Arc<dyn ReplayHandler>);
        handler.wait_available();
        for _ in 0..2 {
            let entry = journaler.try_pop_front().unwrap();
            journaler.committed(entry.commit_tid);
        }
        journaler.stop_replay();
        journaler.metadata().flush_commit_position();
        store.flush();
        journaler.shutdown();

        // a fresh open resumes after the committed position
        let journaler = reopen_journaler(&store);
        let handler = TestHandler::new();
        journaler.start_replay(Arc::clone(&handler) as Arc<dyn ReplayHandler>);
        handler.wait_available();
        let mut tids = Vec::new();
        while let Some(entry) = journaler.try_pop_front() {
            journaler.committed(entry.commit_tid);
            tids.push(entry.data[0]);
        }
        handler.wait_complete().unwrap();
        assert_eq!(tids, vec![2, 3]);
        journaler.stop_replay();
        journaler.shutdown();
    }

    #[test]
    fn remove_deletes_header_and_objects() {
        let store = MemoryStore::new();
        let journaler = open_journaler(&store);

        journaler.start_append(0, 0, None);
        journaler.append("tag1", vec![9; 16]).unwrap();
        let stopped = SignalledResult::new();
        journaler.stop_append(stopped.completion());
        stopped.wait().unwrap();

        journaler.remove(true).unwrap();
        assert!(!journaler.exists().unwrap());
        assert!(store
            .object_names()
            .iter()
            .all(|name| !name.starts_with(OBJECT_PREFIX)));
    }

    #[test]
    fn reset_recreates_empty_journal_with_same_geometry() {
        let store = MemoryStore::new();
        let journaler = open_journaler(&store);

        journaler.start_append(0, 0, None);
        journaler.append("tag1", vec![5; 8]).unwrap();
        let stopped = SignalledResult::new();
        journaler.stop_append(stopped.completion());
        stopped.wait().unwrap();

        journaler.reset().unwrap();
        assert!(journaler.exists().unwrap());

        let reopened = Journaler::new(
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            "img",
            "c1",
            Duration::from_millis(20),
        );
        reopened.register_client("test client").unwrap();
        let cond = SignalledResult::new();
        reopened.init(cond.completion());
        cond.wait().unwrap();
        assert_eq!(reopened.get_metadata(), (20, 2, -1));
        let handler = TestHandler::new();
        reopened.start_replay(Arc::clone(&handler) as Arc<dyn ReplayHandler>);
        handler.wait_complete().unwrap();
        assert!(reopened.try_pop_front().is_none());
        reopened.stop_replay();
        reopened.shutdown();
    }
}
