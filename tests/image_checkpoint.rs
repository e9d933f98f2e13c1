mod common;

use common::SignalledResult;
use jostor::{
    BytesCompletion, Completion, Executor, ImageBackend, ImageGates, ImageJournal,
    ImageOperation, ImageRequestQueue, JournalConfig, JournalError, MemoryStore, ObjectStore,
};
use parking_lot::Mutex;
use std::sync::Arc;

const IMAGE_ID: &str = "img1";

#[derive(Default)]
struct TestBackend {
    writes: Mutex<Vec<(u64, Vec<u8>)>>,
    discards: Mutex<Vec<(u64, u64)>>,
    ops: Mutex<Vec<ImageOperation>>,
}

impl ImageBackend for TestBackend {
    fn aio_read(&self, _offset: u64, length: u64, on_finish: BytesCompletion) {
        on_finish(Ok(vec![0u8; length as usize]));
    }

    fn aio_write(&self, offset: u64, data: Vec<u8>, on_finish: Completion) {
        self.writes.lock().push((offset, data));
        on_finish(Ok(()));
    }

    fn aio_discard(&self, offset: u64, length: u64, on_finish: Completion) {
        self.discards.lock().push((offset, length));
        on_finish(Ok(()));
    }

    fn aio_flush(&self, on_finish: Completion) {
        on_finish(Ok(()));
    }

    fn execute_op(&self, op: ImageOperation, on_finish: Completion) {
        self.ops.lock().push(op);
        on_finish(Ok(()));
    }
}

struct OpenGates;

impl ImageGates for OpenGates {
    fn is_refresh_required(&self) -> bool {
        false
    }

    fn refresh(&self, on_finish: Completion) {
        on_finish(Ok(()));
    }

    fn is_lock_supported(&self) -> bool {
        false
    }

    fn is_lock_owner(&self) -> bool {
        true
    }

    fn request_lock(&self) {}
}

fn test_config() -> JournalConfig {
    JournalConfig {
        commit_interval_secs: 0.02,
        order: 16,
        splay_width: 2,
        ..JournalConfig::default()
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    backend: Arc<TestBackend>,
    work_queue: Executor,
}

impl Fixture {
    fn new() -> Self {
        let store = MemoryStore::new();
        ImageJournal::create(
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            IMAGE_ID,
            &test_config(),
        )
        .unwrap();
        Self {
            store,
            backend: Arc::new(TestBackend::default()),
            work_queue: Executor::new("image-checkpoint", 2),
        }
    }

    fn open_journal(&self) -> Arc<ImageJournal> {
        let journal = ImageJournal::new(
            Arc::clone(&self.store) as Arc<dyn ObjectStore>,
            IMAGE_ID,
            Arc::clone(&self.backend) as Arc<dyn ImageBackend>,
            test_config(),
            self.work_queue.clone(),
        );
        let opened = SignalledResult::new();
        journal.open(opened.completion());
        opened.wait().unwrap();
        journal
    }

    fn close_journal(&self, journal: &Arc<ImageJournal>) {
        let closed = SignalledResult::new();
        journal.close(closed.completion());
        closed.wait().unwrap();
    }
}

#[test]
fn journaled_writes_flow_through_queue_journal_and_image() {
    let fx = Fixture::new();
    let journal = fx.open_journal();

    let queue = ImageRequestQueue::new(
        Arc::clone(&fx.backend) as Arc<dyn ImageBackend>,
        Arc::new(OpenGates) as Arc<dyn ImageGates>,
        false,
    );
    queue.set_journal(Arc::clone(&journal));

    queue.write(0, vec![1, 2, 3, 4]).unwrap();
    queue.write(4096, vec![9; 8]).unwrap();
    queue.discard(1 << 20, 4096).unwrap();
    queue.flush().unwrap();

    assert_eq!(
        *fx.backend.writes.lock(),
        vec![(0, vec![1, 2, 3, 4]), (4096, vec![9; 8])]
    );
    assert_eq!(*fx.backend.discards.lock(), vec![(1 << 20, 4096)]);

    queue.clear_journal();
    fx.close_journal(&journal);

    // everything was committed, so a fresh open replays nothing
    let journal = fx.open_journal();
    assert_eq!(fx.backend.writes.lock().len(), 2);
    fx.close_journal(&journal);
    fx.work_queue.shutdown();
}

#[test]
fn uncommitted_journal_entries_replay_on_next_open() {
    let fx = Fixture::new();
    let journal = fx.open_journal();

    // record an event whose image write never completes before close
    let completion = SignalledResult::new();
    journal
        .append_io_event(
            jostor::ImageEvent::AioWrite {
                offset: 512,
                length: 4,
                data: vec![7; 4],
            },
            Vec::new(),
            512,
            4,
            true,
            completion.completion(),
        )
        .unwrap();
    fx.close_journal(&journal);

    // the write was durable in the journal but never committed, so the
    // next open replays it into the image
    let journal = fx.open_journal();
    assert_eq!(*fx.backend.writes.lock(), vec![(512, vec![7; 4])]);
    fx.close_journal(&journal);
    fx.work_queue.shutdown();
}

#[test]
fn write_block_gates_journaled_writes() {
    let fx = Fixture::new();
    let journal = fx.open_journal();
    let queue = ImageRequestQueue::new(
        Arc::clone(&fx.backend) as Arc<dyn ImageBackend>,
        Arc::new(OpenGates) as Arc<dyn ImageGates>,
        false,
    );
    queue.set_journal(Arc::clone(&journal));

    queue.block_writes_sync().unwrap();
    let write = SignalledResult::new();
    queue.aio_write(0, vec![5; 4], write.completion());
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert!(fx.backend.writes.lock().is_empty());

    queue.unblock_writes();
    write.wait().unwrap();
    assert_eq!(*fx.backend.writes.lock(), vec![(0, vec![5; 4])]);

    queue.clear_journal();
    fx.close_journal(&journal);
    fx.work_queue.shutdown();
}

#[test]
fn shutdown_drains_in_flight_requests_then_rejects() {
    let fx = Fixture::new();
    let queue = ImageRequestQueue::new(
        Arc::clone(&fx.backend) as Arc<dyn ImageBackend>,
        Arc::new(OpenGates) as Arc<dyn ImageGates>,
        false,
    );

    queue.write(0, vec![1]).unwrap();
    let drained = SignalledResult::new();
    queue.shut_down(drained.completion());
    drained.wait().unwrap();

    assert_eq!(queue.write(8, vec![2]), Err(JournalError::ShutDown));
    assert_eq!(fx.backend.writes.lock().len(), 1);
    fx.work_queue.shutdown();
}
