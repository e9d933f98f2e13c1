//! jostor: the per-image write-ahead journal core of a block-image
//! service layered over an object store. A replicated header object
//! tracks journal geometry, the active object-set window, and each
//! consumer's committed position; splayed appenders batch framed entries
//! into rotating data objects; a tag-ordered player replays pending
//! entries; and the image runtime funnels application I/O through the
//! journal before it reaches the data plane.
//!
//! Lock order across the crate: timer state, then metadata state, then
//! image event state. Listener dispatch never holds the metadata lock.
#![deny(unreachable_pub)]
#![deny(unused_must_use)]

pub mod codec;
pub mod config;
pub mod error;
pub mod executor;
pub mod header;
pub mod image;
pub mod journal;
pub mod store;
pub mod telemetry;
pub mod util;

#[cfg(test)]
mod testutil;

pub use config::{JournalConfig, MAX_ORDER, MIN_ORDER};
pub use error::{JournalError, Result};
pub use executor::{
    AsyncOpTracker, BytesCompletion, Completion, Countdown, Executor, TaskTimer, TimerToken,
};
pub use header::client::{ImmutableMetadata, MutableMetadata};
pub use header::{EntryPosition, ObjectSetPosition, RegisteredClient};
pub use image::{
    ImageBackend, ImageEvent, ImageGates, ImageJournal, ImageJournalState, ImageOperation,
    ImageReplay, ImageRequestQueue,
};
pub use journal::{
    CommitEntry, Entry, EntryFuture, FlushHandler, JournalMetadata, JournalPlayer,
    JournalRecorder, JournalTrimmer, Journaler, MetadataListener, ReplayEntry, ReplayHandler,
};
pub use store::{ExecCall, MemoryStore, ObjectStore, WatchHandler, WatchId};
pub use telemetry::{MetricsRegistry, MetricsSnapshot};
pub use util::IntervalSet;
