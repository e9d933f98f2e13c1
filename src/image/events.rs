//! Typed journal events recorded by the image runtime. Entries are
//! framed as a u32 event tag plus a version byte so older readers can
//! skip unknown kinds.

use crate::codec::{WireDecoder, WireEncoder};
use crate::error::Result;
use serde::{Deserialize, Serialize};

const EVENT_VERSION: u8 = 1;

pub const EVENT_TYPE_AIO_DISCARD: u32 = 0;
pub const EVENT_TYPE_AIO_WRITE: u32 = 1;
pub const EVENT_TYPE_AIO_FLUSH: u32 = 2;
pub const EVENT_TYPE_OP_FINISH: u32 = 3;
pub const EVENT_TYPE_SNAP_CREATE: u32 = 4;
pub const EVENT_TYPE_SNAP_REMOVE: u32 = 5;
pub const EVENT_TYPE_SNAP_RENAME: u32 = 6;
pub const EVENT_TYPE_SNAP_PROTECT: u32 = 7;
pub const EVENT_TYPE_SNAP_UNPROTECT: u32 = 8;
pub const EVENT_TYPE_SNAP_ROLLBACK: u32 = 9;
pub const EVENT_TYPE_RENAME: u32 = 10;
pub const EVENT_TYPE_RESIZE: u32 = 11;
pub const EVENT_TYPE_FLATTEN: u32 = 12;
pub const EVENT_TYPE_REBUILD_OBJECT_MAP: u32 = 13;

/// One recorded image event. Write-class events carry their own data;
/// maintenance events carry the op tid that pairs them with an
/// `OpFinish` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageEvent {
    AioDiscard {
        offset: u64,
        length: u64,
    },
    AioWrite {
        offset: u64,
        length: u64,
        data: Vec<u8>,
    },
    AioFlush,
    OpFinish {
        op_tid: u64,
        result: i32,
    },
    SnapCreate {
        op_tid: u64,
        snap_name: String,
    },
    SnapRemove {
        op_tid: u64,
        snap_name: String,
    },
    SnapRename {
        op_tid: u64,
        src_snap_id: u64,
        dest_snap_name: String,
    },
    SnapProtect {
        op_tid: u64,
        snap_name: String,
    },
    SnapUnprotect {
        op_tid: u64,
        snap_name: String,
    },
    SnapRollback {
        op_tid: u64,
        snap_name: String,
    },
    Rename {
        op_tid: u64,
        image_name: String,
    },
    Resize {
        op_tid: u64,
        size: u64,
    },
    Flatten {
        op_tid: u64,
    },
    RebuildObjectMap {
        op_tid: u64,
    },
    Unknown,
}

impl ImageEvent {
    pub fn event_type(&self) -> u32 {
        match self {
            ImageEvent::AioDiscard { .. } => EVENT_TYPE_AIO_DISCARD,
            ImageEvent::AioWrite { .. } => EVENT_TYPE_AIO_WRITE,
            ImageEvent::AioFlush => EVENT_TYPE_AIO_FLUSH,
            ImageEvent::OpFinish { .. } => EVENT_TYPE_OP_FINISH,
            ImageEvent::SnapCreate { .. } => EVENT_TYPE_SNAP_CREATE,
            ImageEvent::SnapRemove { .. } => EVENT_TYPE_SNAP_REMOVE,
            ImageEvent::SnapRename { .. } => EVENT_TYPE_SNAP_RENAME,
            ImageEvent::SnapProtect { .. } => EVENT_TYPE_SNAP_PROTECT,
            ImageEvent::SnapUnprotect { .. } => EVENT_TYPE_SNAP_UNPROTECT,
            ImageEvent::SnapRollback { .. } => EVENT_TYPE_SNAP_ROLLBACK,
            ImageEvent::Rename { .. } => EVENT_TYPE_RENAME,
            ImageEvent::Resize { .. } => EVENT_TYPE_RESIZE,
            ImageEvent::Flatten { .. } => EVENT_TYPE_FLATTEN,
            ImageEvent::RebuildObjectMap { .. } => EVENT_TYPE_REBUILD_OBJECT_MAP,
            ImageEvent::Unknown => u32::MAX,
        }
    }

    /// Op tid for maintenance events; write-class events have none.
    pub fn op_tid(&self) -> Option<u64> {
        match self {
            ImageEvent::OpFinish { op_tid, .. }
            | ImageEvent::SnapCreate { op_tid, .. }
            | ImageEvent::SnapRemove { op_tid, .. }
            | ImageEvent::SnapRename { op_tid, .. }
            | ImageEvent::SnapProtect { op_tid, .. }
            | ImageEvent::SnapUnprotect { op_tid, .. }
            | ImageEvent::SnapRollback { op_tid, .. }
            | ImageEvent::Rename { op_tid, .. }
            | ImageEvent::Resize { op_tid, .. }
            | ImageEvent::Flatten { op_tid }
            | ImageEvent::RebuildObjectMap { op_tid } => Some(*op_tid),
            _ => None,
        }
    }

    pub fn is_write_class(&self) -> bool {
        matches!(
            self,
            ImageEvent::AioDiscard { .. } | ImageEvent::AioWrite { .. } | ImageEvent::AioFlush
        )
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = WireEncoder::new();
        enc.put_u32(self.event_type());
        enc.put_u8(EVENT_VERSION);
        match self {
            ImageEvent::AioDiscard { offset, length } => {
                enc.put_u64(*offset).put_u64(*length);
            }
            ImageEvent::AioWrite {
                offset,
                length,
                data,
            } => {
                enc.put_u64(*offset).put_u64(*length).put_bytes(data);
            }
            ImageEvent::AioFlush | ImageEvent::Unknown => {}
            ImageEvent::OpFinish { op_tid, result } => {
                enc.put_u64(*op_tid).put_i64(*result as i64);
            }
            ImageEvent::SnapCreate { op_tid, snap_name }
            | ImageEvent::SnapRemove { op_tid, snap_name }
            | ImageEvent::SnapProtect { op_tid, snap_name }
            | ImageEvent::SnapUnprotect { op_tid, snap_name }
            | ImageEvent::SnapRollback { op_tid, snap_name } => {
                enc.put_u64(*op_tid).put_str(snap_name);
            }
            ImageEvent::SnapRename {
                op_tid,
                src_snap_id,
                dest_snap_name,
            } => {
                enc.put_u64(*op_tid).put_u64(*src_snap_id).put_str(dest_snap_name);
            }
            ImageEvent::Rename { op_tid, image_name } => {
                enc.put_u64(*op_tid).put_str(image_name);
            }
            ImageEvent::Resize { op_tid, size } => {
                enc.put_u64(*op_tid).put_u64(*size);
            }
            ImageEvent::Flatten { op_tid } | ImageEvent::RebuildObjectMap { op_tid } => {
                enc.put_u64(*op_tid);
            }
        }
        enc.finish()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut dec = WireDecoder::new(data);
        let event_type = dec.get_u32()?;
        let _version = dec.get_u8()?;
        let event = match event_type {
            EVENT_TYPE_AIO_DISCARD => ImageEvent::AioDiscard {
                offset: dec.get_u64()?,
                length: dec.get_u64()?,
            },
            EVENT_TYPE_AIO_WRITE => ImageEvent::AioWrite {
                offset: dec.get_u64()?,
                length: dec.get_u64()?,
                data: dec.get_bytes()?,
            },
            EVENT_TYPE_AIO_FLUSH => ImageEvent::AioFlush,
            EVENT_TYPE_OP_FINISH => ImageEvent::OpFinish {
                op_tid: dec.get_u64()?,
                result: dec.get_i64()? as i32,
            },
            EVENT_TYPE_SNAP_CREATE => ImageEvent::SnapCreate {
                op_tid: dec.get_u64()?,
                snap_name: dec.get_str()?,
            },
            EVENT_TYPE_SNAP_REMOVE => ImageEvent::SnapRemove {
                op_tid: dec.get_u64()?,
                snap_name: dec.get_str()?,
            },
            EVENT_TYPE_SNAP_RENAME => ImageEvent::SnapRename {
                op_tid: dec.get_u64()?,
                src_snap_id: dec.get_u64()?,
                dest_snap_name: dec.get_str()?,
            },
            EVENT_TYPE_SNAP_PROTECT => ImageEvent::SnapProtect {
                op_tid: dec.get_u64()?,
                snap_name: dec.get_str()?,
            },
            EVENT_TYPE_SNAP_UNPROTECT => ImageEvent::SnapUnprotect {
                op_tid: dec.get_u64()?,
                snap_name: dec.get_str()?,
            },
            EVENT_TYPE_SNAP_ROLLBACK => ImageEvent::SnapRollback {
                op_tid: dec.get_u64()?,
                snap_name: dec.get_str()?,
            },
            EVENT_TYPE_RENAME => ImageEvent::Rename {
                op_tid: dec.get_u64()?,
                image_name: dec.get_str()?,
            },
            EVENT_TYPE_RESIZE => ImageEvent::Resize {
                op_tid: dec.get_u64()?,
                size: dec.get_u64()?,
            },
            EVENT_TYPE_FLATTEN => ImageEvent::Flatten {
                op_tid: dec.get_u64()?,
            },
            EVENT_TYPE_REBUILD_OBJECT_MAP => ImageEvent::RebuildObjectMap {
                op_tid: dec.get_u64()?,
            },
            _ => ImageEvent::Unknown,
        };
        Ok(event)
    }
}
