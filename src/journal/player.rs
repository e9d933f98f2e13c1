//! Journal playback: per-object fetchers plus the splay-merging player
//! that reconstructs a tag-ordered entry stream, filters entries at or
//! before the consumer's committed position, and optionally tails the
//! live journal.

use crate::error::{JournalError, Result};
use crate::executor::{Executor, TaskTimer, TimerToken};
use crate::journal::entry::Entry;
use crate::journal::metadata::{JournalMetadata, MetadataListener};
use crate::store::ObjectStore;
use crate::util::object_name;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Consumer-side sink for replayed entries. `handle_entries_available`
/// fires when `try_pop_front` will yield an entry; `handle_complete`
/// fires once replay is done or fails.
pub trait ReplayHandler: Send + Sync {
    fn handle_entries_available(&self);
    fn handle_complete(&self, result: Result<()>);
}

struct ObjectPlayerState {
    entries: VecDeque<Entry>,
    parsed_bytes: usize,
    fetch_in_progress: bool,
    refetch_task: Option<TimerToken>,
}

/// Fetches and frames one data object, keeping only the undelivered tail.
struct ObjectPlayer {
    oid: String,
    object_num: u64,
    store: Arc<dyn ObjectStore>,
    timer: TaskTimer,
    self_ref: Weak<ObjectPlayer>,
    state: Mutex<ObjectPlayerState>,
}

impl ObjectPlayer {
    fn new(
        oid: String,
        object_num: u64,
        store: Arc<dyn ObjectStore>,
        timer: TaskTimer,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            oid,
            object_num,
            store,
            timer,
            self_ref: self_ref.clone(),
            state: Mutex::new(ObjectPlayerState {
                entries: VecDeque::new(),
                parsed_bytes: 0,
                fetch_in_progress: false,
                refetch_task: None,
            }),
        })
    }

    fn fetch(self: &Arc<Self>, on_done: Box<dyn FnOnce(Result<()>) + Send>) {
        {
            let mut state = self.state.lock();
            if state.fetch_in_progress {
                return;
            }
            state.fetch_in_progress = true;
        }
        let player = Arc::clone(self);
        self.store.aio_read(
            &self.oid,
            Box::new(move |result| {
                let result = match result {
                    Ok(data) => {
                        player.absorb(&data);
                        Ok(())
                    }
                    // an unwritten object is an empty tail, not a fault
                    Err(JournalError::NotFound) => Ok(()),
                    Err(err) => Err(err),
                };
                player.state.lock().fetch_in_progress = false;
                on_done(result);
            }),
        );
    }

    /// Parse frames beyond the already-delivered prefix.
    fn absorb(&self, data: &[u8]) {
        let mut state = self.state.lock();
        while state.parsed_bytes < data.len() {
            match Entry::decode_prefix(&data[state.parsed_bytes..]) {
                Ok(Some((entry, consumed))) => {
                    state.parsed_bytes += consumed;
                    state.entries.push_back(entry);
                }
                Ok(None) => break,
                Err(err) => {
                    // a bad frame terminates this object's readable tail
                    warn!(
                        "event=journal_object_bad_frame oid={} offset={} error={}",
                        self.oid, state.parsed_bytes, err
                    );
                    break;
                }
            }
        }
    }

    fn schedule_refetch(
        self: &Arc<Self>,
        delay: Duration,
        on_done: Box<dyn FnOnce(Result<()>) + Send>,
    ) {
        let player = Arc::downgrade(self);
        let token = self.timer.schedule(delay, move || {
            if let Some(player) = player.upgrade() {
                player.fetch(on_done);
            }
        });
        self.state.lock().refetch_task = Some(token);
    }

    fn cancel_refetch(&self) {
        if let Some(token) = self.state.lock().refetch_task.take() {
            self.timer.cancel(token);
        }
    }

    fn front(&self) -> Option<Entry> {
        self.state.lock().entries.front().cloned()
    }

    fn pop_front(&self) {
        self.state.lock().entries.pop_front();
    }

    fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    fn fetch_in_progress(&self) -> bool {
        self.state.lock().fetch_in_progress
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlayerState {
    Init,
    Prefetch,
    Playback,
    Error,
}

type SplayedObjectPlayers = HashMap<u8, BTreeMap<u64, Arc<ObjectPlayer>>>;

struct JournalPlayerState {
    state: PlayerState,
    splay_offset: u8,
    watch_enabled: bool,
    watch_scheduled: bool,
    watch_interval: Duration,
    commit_object: u64,
    commit_tag: Option<String>,
    commit_tids: HashMap<String, u64>,
    prefetch_splay_offsets: HashSet<u8>,
    object_players: SplayedObjectPlayers,
}

/// Windowed prefetch plus tag-ordered merge across the splayed data
/// objects of the active window.
pub struct JournalPlayer {
    store: Arc<dyn ObjectStore>,
    object_oid_prefix: String,
    metadata: Arc<JournalMetadata>,
    replay_handler: Arc<dyn ReplayHandler>,
    executor: Executor,
    timer: TaskTimer,
    self_ref: Weak<JournalPlayer>,
    state: Mutex<JournalPlayerState>,
    listener: Mutex<Option<Arc<dyn MetadataListener>>>,
}

struct PlayerListener {
    player: Weak<JournalPlayer>,
}

impl MetadataListener for PlayerListener {
    fn handle_update(&self) {
        if let Some(player) = self.player.upgrade() {
            player.handle_metadata_update();
        }
    }
}

impl JournalPlayer {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        object_oid_prefix: impl Into<String>,
        metadata: Arc<JournalMetadata>,
        replay_handler: Arc<dyn ReplayHandler>,
    ) -> Arc<Self> {
        let commit_position = metadata.commit_position();
        let splay_width = metadata.splay_width();

        let mut splay_offset = 0;
        let mut commit_object = 0;
        let mut commit_tag = None;
        let mut commit_tids = HashMap::new();
        if !commit_position.is_empty() {
            splay_offset = (commit_position.object_number % splay_width as u64) as u8;
            commit_object = commit_position.object_number;
            commit_tag = commit_position
                .entry_positions
                .front()
                .map(|position| position.tag.clone());
            for position in &commit_position.entry_positions {
                commit_tids.insert(position.tag.clone(), position.tid);
            }
        }

        let player = Arc::new_cyclic(|self_ref| Self {
            store,
            object_oid_prefix: object_oid_prefix.into(),
            executor: metadata.executor(),
            timer: metadata.timer(),
            metadata,
            replay_handler,
            self_ref: self_ref.clone(),
            state: Mutex::new(JournalPlayerState {
                state: PlayerState::Init,
                splay_offset,
                watch_enabled: false,
                watch_scheduled: false,
                watch_interval: Duration::from_secs(1),
                commit_object,
                commit_tag,
                commit_tids,
                prefetch_splay_offsets: HashSet::new(),
                object_players: HashMap::new(),
            }),
            listener: Mutex::new(None),
        });

        let listener: Arc<dyn MetadataListener> = Arc::new(PlayerListener {
            player: Arc::downgrade(&player),
        });
        player.metadata.add_listener(&listener);
        *player.listener.lock() = Some(listener);
        player
    }

    /// Open every object of the window starting at the committed set and
    /// begin reading.
    pub fn prefetch(self: &Arc<Self>) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.state, PlayerState::Init);
        state.state = PlayerState::Prefetch;

        let splay_width = self.metadata.splay_width();
        for splay_offset in 0..splay_width {
            state.prefetch_splay_offsets.insert(splay_offset);
        }

        let object_set = state.commit_object / splay_width as u64;
        let active_set = self.metadata.active_set();
        let object_count =
            splay_width as u64 * std::cmp::min(2, active_set.saturating_sub(object_set) + 1);
        debug!(
            "event=journal_prefetch prefix={} objects={}",
            self.object_oid_prefix, object_count
        );

        let start_object = object_set * splay_width as u64;
        for object_num in start_object..start_object + object_count {
            self.fetch(&mut state, object_num);
        }
    }

    /// Prefetch, then keep polling each tail object every `interval` and
    /// whenever the header update notification fires.
    pub fn prefetch_and_watch(self: &Arc<Self>, interval: Duration) {
        {
            let mut state = self.state.lock();
            state.watch_enabled = true;
            state.watch_interval = interval;
        }
        self.prefetch();
    }

    pub fn unwatch(&self) {
        let mut state = self.state.lock();
        state.watch_enabled = false;
        if state.watch_scheduled {
            if let Some(object_player) = Self::object_player(&state) {
                object_player.cancel_refetch();
            }
            state.watch_scheduled = false;
        }
    }

    /// Stop observing header updates; called before dropping the player.
    pub fn stop(&self) {
        self.unwatch();
        if let Some(listener) = self.listener.lock().take() {
            self.metadata.remove_listener(&listener);
        }
    }

    /// Pop the next entry of the merged, committed-filtered stream and
    /// register it for commit. Returns `None` when no entry is currently
    /// deliverable.
    pub fn try_pop_front(self: &Arc<Self>) -> Option<(Entry, u64)> {
        let mut state = self.state.lock();
        if state.state != PlayerState::Playback {
            return None;
        }

        let object_player = Self::object_player(&state)?;
        if object_player.is_empty() {
            if state.watch_enabled && !state.watch_scheduled {
                self.schedule_watch(&mut state, &object_player);
            } else if !state.watch_enabled && !object_player.fetch_in_progress() {
                debug!(
                    "event=journal_replay_complete prefix={}",
                    self.object_oid_prefix
                );
                self.queue_complete(Ok(()));
            }
            return None;
        }

        let entry = object_player.front().expect("non-empty player");
        object_player.pop_front();

        if let Some(last_tid) = self.metadata.last_allocated_tid(&entry.tag) {
            if entry.tid != last_tid + 1 {
                warn!(
                    "event=journal_missing_entry prefix={} tag={} expected_tid={} found_tid={}",
                    self.object_oid_prefix,
                    entry.tag,
                    last_tid + 1,
                    entry.tid
                );
                state.state = PlayerState::Error;
                self.queue_complete(Err(JournalError::invalid("missing prior journal entry")));
                return None;
            }
        }

        // move to the next splay object when the next entry here cannot
        // be the next one in sequence
        if let Some(peek) = object_player.front() {
            let out_of_sequence = self
                .metadata
                .last_allocated_tid(&peek.tag)
                .map_or(false, |last_tid| last_tid + 1 != peek.tid);
            if peek.tag == entry.tag || out_of_sequence {
                Self::advance_splay_object(&mut state, self.metadata.splay_width());
            }
        } else {
            Self::advance_splay_object(&mut state, self.metadata.splay_width());
            self.remove_empty_object_player(&mut state, &object_player);
        }

        self.metadata.reserve_tid(&entry.tag, entry.tid);
        let commit_tid =
            self.metadata
                .allocate_commit_tid(object_player.object_num, &entry.tag, entry.tid);
        Some((entry, commit_tid))
    }

    fn handle_metadata_update(self: &Arc<Self>) {
        // live tailing: treat a header update like an early poll tick
        let mut state = self.state.lock();
        if state.state != PlayerState::Playback || !state.watch_enabled {
            return;
        }
        if let Some(object_player) = Self::object_player(&state) {
            if !object_player.fetch_in_progress() {
                object_player.cancel_refetch();
                state.watch_scheduled = true;
                let player = Arc::clone(self);
                let object_num = object_player.object_num;
                drop(state);
                object_player.fetch(Box::new(move |result| {
                    player.handle_watch(object_num, result);
                }));
            }
        }
    }

    fn schedule_watch(
        self: &Arc<Self>,
        state: &mut JournalPlayerState,
        object_player: &Arc<ObjectPlayer>,
    ) {
        state.watch_scheduled = true;
        let player = Arc::clone(self);
        let object_num = object_player.object_num;
        object_player.schedule_refetch(
            state.watch_interval,
            Box::new(move |result| {
                player.handle_watch(object_num, result);
            }),
        );
    }

    fn fetch(self: &Arc<Self>, state: &mut JournalPlayerState, object_num: u64) {
        let oid = object_name(&self.object_oid_prefix, object_num);
        debug!("event=journal_fetch oid={}", oid);
        let object_player = ObjectPlayer::new(
            oid,
            object_num,
            Arc::clone(&self.store),
            self.timer.clone(),
        );

        let splay_width = self.metadata.splay_width();
        let splay_offset = (object_num % splay_width as u64) as u8;
        state
            .object_players
            .entry(splay_offset)
            .or_default()
            .insert(object_num, Arc::clone(&object_player));

        let player = Arc::clone(self);
        object_player.fetch(Box::new(move |result| {
            player.handle_fetched(object_num, result);
        }));
    }

    fn handle_fetched(self: &Arc<Self>, object_num: u64, result: Result<()>) {
        debug!(
            "event=journal_fetched prefix={} object_num={} ok={}",
            self.object_oid_prefix,
            object_num,
            result.is_ok()
        );
        if result.is_ok() {
            let mut state = self.state.lock();
            let splay_width = self.metadata.splay_width();
            let splay_offset = (object_num % splay_width as u64) as u8;
            let object_player = state
                .object_players
                .get(&splay_offset)
                .and_then(|players| players.get(&object_num))
                .cloned();
            if let Some(object_player) = object_player {
                self.remove_empty_object_player(&mut state, &object_player);
            }
        }
        self.process_state(object_num, result);
    }

    fn handle_watch(self: &Arc<Self>, object_num: u64, result: Result<()>) {
        self.process_state(object_num, result);
    }

    fn process_state(self: &Arc<Self>, object_num: u64, result: Result<()>) {
        let result = result.and_then(|()| {
            let mut state = self.state.lock();
            match state.state {
                PlayerState::Prefetch => self.process_prefetch(&mut state, object_num),
                PlayerState::Playback => self.process_playback(&mut state, object_num),
                PlayerState::Error | PlayerState::Init => Ok(()),
            }
        });
        if let Err(err) = result {
            {
                let mut state = self.state.lock();
                state.state = PlayerState::Error;
            }
            self.queue_complete(Err(err));
        }
    }

    fn process_prefetch(
        self: &Arc<Self>,
        state: &mut JournalPlayerState,
        object_num: u64,
    ) -> Result<()> {
        let splay_width = self.metadata.splay_width();
        let splay_offset = (object_num % splay_width as u64) as u8;
        if !state.prefetch_splay_offsets.contains(&splay_offset) {
            return Ok(());
        }

        // prefetch in order: a newer splay object may have fetched first
        let mut prefetch_complete = false;
        loop {
            let Some(object_player) = state
                .object_players
                .get(&splay_offset)
                .and_then(|players| players.values().next())
                .cloned()
            else {
                prefetch_complete = true;
                break;
            };
            if object_player.fetch_in_progress() {
                break;
            }

            // drop entries at or before the committed position
            if !state.commit_tids.is_empty() {
                while let Some(entry) = object_player.front() {
                    let committed = state
                        .commit_tids
                        .get(&entry.tag)
                        .map_or(false, |&tid| entry.tid <= tid);
                    if !committed {
                        debug!(
                            "event=journal_first_uncommitted oid={} tag={} tid={}",
                            object_player.oid, entry.tag, entry.tid
                        );
                        break;
                    }
                    self.metadata.reserve_tid(&entry.tag, entry.tid);
                    object_player.pop_front();
                }

                // playback resumes on the splay object after the one
                // holding the committed position
                if object_player.object_num == state.commit_object {
                    let advance = match object_player.front() {
                        None => true,
                        Some(entry) => Some(&entry.tag) == state.commit_tag.as_ref(),
                    };
                    if advance {
                        Self::advance_splay_object(state, splay_width);
                    }
                }
            }

            if !self.remove_empty_object_player(state, &object_player) {
                prefetch_complete = true;
                break;
            }
        }

        if !prefetch_complete {
            return Ok(());
        }
        state.prefetch_splay_offsets.remove(&splay_offset);
        if !state.prefetch_splay_offsets.is_empty() {
            return Ok(());
        }

        state.state = PlayerState::Playback;
        let object_player = Self::object_player(state);
        match object_player {
            Some(object_player) if !object_player.is_empty() => {
                debug!(
                    "event=journal_prefetch_complete prefix={} entries_available=true",
                    self.object_oid_prefix
                );
                self.queue_entries_available();
            }
            Some(object_player) if state.watch_enabled => {
                self.schedule_watch(state, &object_player);
            }
            _ => {
                debug!(
                    "event=journal_prefetch_complete prefix={} entries_available=false",
                    self.object_oid_prefix
                );
                self.queue_complete(Ok(()));
            }
        }
        Ok(())
    }

    fn process_playback(
        self: &Arc<Self>,
        state: &mut JournalPlayerState,
        object_num: u64,
    ) -> Result<()> {
        state.watch_scheduled = false;

        let Some(object_player) = Self::object_player(state) else {
            return Ok(());
        };
        if object_player.object_num != object_num {
            return Ok(());
        }

        let splay_width = self.metadata.splay_width();
        let active_set = self.metadata.active_set();
        let object_set = object_player.object_num / splay_width as u64;
        if !object_player.is_empty() {
            self.queue_entries_available();
        } else if object_set == active_set {
            if state.watch_enabled {
                // tail reached while live: keep polling
                self.schedule_watch(state, &object_player);
            } else {
                debug!(
                    "event=journal_replay_complete prefix={}",
                    self.object_oid_prefix
                );
                self.queue_complete(Ok(()));
            }
        } else {
            // the active window moved on; advance past the empty object
            self.remove_empty_object_player(state, &object_player);
        }
        Ok(())
    }

    fn object_player(state: &JournalPlayerState) -> Option<Arc<ObjectPlayer>> {
        state
            .object_players
            .get(&state.splay_offset)
            .and_then(|players| players.values().next())
            .cloned()
    }

    fn advance_splay_object(state: &mut JournalPlayerState, splay_width: u8) {
        state.splay_offset = (state.splay_offset + 1) % splay_width;
    }

    /// Drop an exhausted object player and fetch the same splay slot of
    /// the next object set, unless the player is still in the active set.
    fn remove_empty_object_player(
        self: &Arc<Self>,
        state: &mut JournalPlayerState,
        object_player: &Arc<ObjectPlayer>,
    ) -> bool {
        let splay_width = self.metadata.splay_width();
        let object_set = object_player.object_num / splay_width as u64;
        let active_set = self.metadata.active_set();
        if !object_player.is_empty() || object_set == active_set {
            return false;
        }

        let splay_offset = (object_player.object_num % splay_width as u64) as u8;
        let players = state
            .object_players
            .entry(splay_offset)
            .or_default();
        let next_object_num = players
            .keys()
            .next_back()
            .map(|&object_num| object_num + splay_width as u64)
            .unwrap_or(object_player.object_num + splay_width as u64);
        players.remove(&object_player.object_num);

        let next_object_set = next_object_num / splay_width as u64;
        if next_object_set <= active_set {
            self.fetch(state, next_object_num);
        }
        true
    }

    fn queue_entries_available(&self) {
        let handler = Arc::clone(&self.replay_handler);
        self.executor.queue(move || handler.handle_entries_available());
    }

    fn queue_complete(&self, result: Result<()>) {
        let handler = Arc::clone(&self.replay_handler);
        self.executor.queue(move || handler.handle_complete(result));
    }
}
