//! Object-store client seam. The journal core needs named objects with
//! atomic compound class calls, guarded appends, watch/notify, and
//! asynchronous completions delivered on a store-owned thread.

pub mod memory;

use crate::error::Result;
use crate::executor::{BytesCompletion, Completion};
use std::sync::Arc;

pub use memory::MemoryStore;

/// One class-method invocation inside a compound `exec` batch.
#[derive(Debug, Clone)]
pub struct ExecCall {
    pub method: String,
    pub input: Vec<u8>,
}

impl ExecCall {
    pub fn new(method: &str, input: Vec<u8>) -> Self {
        Self {
            method: method.to_string(),
            input,
        }
    }
}

pub type WatchId = u64;

/// Receiver for header-object watch traffic. Callbacks arrive on the
/// store thread and must not block; long work is trampolined onto the
/// journal executor by the receiver.
pub trait WatchHandler: Send + Sync {
    fn handle_notify(&self, notify_id: u64);
    fn handle_error(&self, err: crate::error::JournalError);
}

/// Capability set required from the backing object store. Compound
/// `exec` batches are atomic: either every call applies or none does,
/// and read outputs concatenate in call order.
pub trait ObjectStore: Send + Sync {
    fn exec(&self, oid: &str, calls: Vec<ExecCall>) -> Result<Vec<u8>>;
    fn aio_exec(&self, oid: &str, calls: Vec<ExecCall>, on_complete: BytesCompletion);

    /// Guarded append: atomically verifies the object is smaller than
    /// `soft_max_size`, then appends `data` as one atomic frame write.
    fn aio_append(
        &self,
        oid: &str,
        soft_max_size: u64,
        data: Vec<u8>,
        on_complete: Completion,
    );

    fn aio_read(&self, oid: &str, on_complete: BytesCompletion);
    fn stat(&self, oid: &str) -> Result<u64>;
    fn remove(&self, oid: &str) -> Result<()>;
    fn aio_remove(&self, oid: &str, on_complete: Completion);

    fn watch(&self, oid: &str, handler: Arc<dyn WatchHandler>) -> Result<WatchId>;
    fn unwatch(&self, oid: &str, watch_id: WatchId) -> Result<()>;
    fn notify(&self, oid: &str) -> Result<()>;
    fn aio_notify(&self, oid: &str, on_complete: Completion);
    fn notify_ack(&self, oid: &str, notify_id: u64);

    /// Blocks until every in-flight asynchronous op has completed.
    fn flush(&self);
}
