//! Image runtime pieces that funnel application I/O through the journal:
//! the typed event set, the replay driver, the image journal state
//! machine, and the request work queue.

pub mod events;
pub mod journal;
pub mod replay;
pub mod request_queue;

use crate::executor::{BytesCompletion, Completion};

pub use events::ImageEvent;
pub use journal::{ImageJournal, ImageJournalState, ObjectRequest};
pub use replay::ImageReplay;
pub use request_queue::{ImageGates, ImageRequestQueue};

/// Maintenance operation decoded from a replayed op event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOperation {
    SnapCreate { snap_name: String },
    SnapRemove { snap_name: String },
    SnapRename { src_snap_id: u64, dest_snap_name: String },
    SnapProtect { snap_name: String },
    SnapUnprotect { snap_name: String },
    SnapRollback { snap_name: String },
    Rename { image_name: String },
    Resize { size: u64 },
    Flatten,
    RebuildObjectMap,
}

impl ImageOperation {
    pub fn from_event(event: &ImageEvent) -> Option<Self> {
        match event {
            ImageEvent::SnapCreate { snap_name, .. } => Some(ImageOperation::SnapCreate {
                snap_name: snap_name.clone(),
            }),
            ImageEvent::SnapRemove { snap_name, .. } => Some(ImageOperation::SnapRemove {
                snap_name: snap_name.clone(),
            }),
            ImageEvent::SnapRename {
                src_snap_id,
                dest_snap_name,
                ..
            } => Some(ImageOperation::SnapRename {
                src_snap_id: *src_snap_id,
                dest_snap_name: dest_snap_name.clone(),
            }),
            ImageEvent::SnapProtect { snap_name, .. } => Some(ImageOperation::SnapProtect {
                snap_name: snap_name.clone(),
            }),
            ImageEvent::SnapUnprotect { snap_name, .. } => Some(ImageOperation::SnapUnprotect {
                snap_name: snap_name.clone(),
            }),
            ImageEvent::SnapRollback { snap_name, .. } => Some(ImageOperation::SnapRollback {
                snap_name: snap_name.clone(),
            }),
            ImageEvent::Rename { image_name, .. } => Some(ImageOperation::Rename {
                image_name: image_name.clone(),
            }),
            ImageEvent::Resize { size, .. } => Some(ImageOperation::Resize { size: *size }),
            ImageEvent::Flatten { .. } => Some(ImageOperation::Flatten),
            ImageEvent::RebuildObjectMap { .. } => Some(ImageOperation::RebuildObjectMap),
            _ => None,
        }
    }
}

/// Block-image data plane the journal replays into and the work queue
/// dispatches to. All callbacks are asynchronous and must tolerate an
/// event being applied more than once: replay delivers at-least-once.
pub trait ImageBackend: Send + Sync {
    fn aio_read(&self, offset: u64, length: u64, on_finish: BytesCompletion);
    fn aio_write(&self, offset: u64, data: Vec<u8>, on_finish: Completion);
    fn aio_discard(&self, offset: u64, length: u64, on_finish: Completion);
    fn aio_flush(&self, on_finish: Completion);
    fn execute_op(&self, op: ImageOperation, on_finish: Completion);
}
