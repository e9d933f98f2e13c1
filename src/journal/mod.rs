//! Per-image write-ahead journal: header metadata, splayed recorders,
//! tag-ordered replay, and window trimming over an object store.

pub mod entry;
pub mod future;
pub mod journaler;
pub mod metadata;
pub mod player;
pub mod recorder;
pub mod trimmer;

pub use entry::Entry;
pub use future::{EntryFuture, FlushHandler};
pub use journaler::{Journaler, ReplayEntry};
pub use metadata::{CommitEntry, JournalMetadata, MetadataListener};
pub use player::{JournalPlayer, ReplayHandler};
pub use recorder::JournalRecorder;
pub use trimmer::JournalTrimmer;
