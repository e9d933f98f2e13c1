mod common;

use common::{wait_until, SignalledResult};
use jostor::header::client;
use jostor::{
    EntryPosition, JournalError, JournalMetadata, MemoryStore, ObjectSetPosition, ObjectStore,
};
use std::sync::Arc;
use std::time::Duration;

const OID: &str = "journal.img1";

fn immutable_and_mutable(
    store: &Arc<MemoryStore>,
) -> (client::ImmutableMetadata, client::MutableMetadata) {
    let store_dyn: Arc<dyn ObjectStore> = Arc::clone(store) as Arc<dyn ObjectStore>;

    let immutable = Arc::new(parking_lot::Mutex::new(None));
    let immutable_slot = Arc::clone(&immutable);
    client::get_immutable_metadata(
        &store_dyn,
        OID,
        Box::new(move |result| {
            *immutable_slot.lock() = Some(result.unwrap());
        }),
    );

    let mutable = Arc::new(parking_lot::Mutex::new(None));
    let mutable_slot = Arc::clone(&mutable);
    client::get_mutable_metadata(
        &store_dyn,
        OID,
        Box::new(move |result| {
            *mutable_slot.lock() = Some(result.unwrap());
        }),
    );
    store.flush();

    let immutable = immutable.lock().take().expect("immutable metadata");
    let mutable = mutable.lock().take().expect("mutable metadata");
    (immutable, mutable)
}

#[test]
fn header_round_trip() {
    let store = MemoryStore::new();
    client::create(store.as_ref(), OID, 22, 4, -1).unwrap();

    let (immutable, mutable) = immutable_and_mutable(&store);
    assert_eq!(immutable.order, 22);
    assert_eq!(immutable.splay_width, 4);
    assert_eq!(immutable.pool_id, -1);
    assert_eq!(mutable.minimum_set, 0);
    assert_eq!(mutable.active_set, 0);
    assert!(mutable.clients.is_empty());
}

#[test]
fn register_commit_refresh() {
    let store = MemoryStore::new();
    client::create(store.as_ref(), OID, 22, 4, -1).unwrap();
    client::client_register(store.as_ref(), OID, "c1", "x").unwrap();

    let (_, mutable) = immutable_and_mutable(&store);
    assert_eq!(mutable.clients.len(), 1);
    assert_eq!(mutable.clients[0].id, "c1");
    assert_eq!(mutable.clients[0].description, "x");
    assert!(mutable.clients[0].commit_position.is_empty());

    let commit_interval = Duration::from_millis(50);
    let metadata = JournalMetadata::new(
        Arc::clone(&store) as Arc<dyn ObjectStore>,
        OID,
        "c1",
        commit_interval,
    );
    let initialized = SignalledResult::new();
    metadata.init(initialized.completion());
    initialized.wait().unwrap();

    let position = ObjectSetPosition::new(7, [EntryPosition::new("A", 3)]);
    let acked = SignalledResult::new();
    metadata.set_commit_position(position.clone(), acked.completion());
    std::thread::sleep(2 * commit_interval);
    acked.wait().unwrap();

    wait_until(|| {
        client::client_list(store.as_ref(), OID).unwrap()[0].commit_position == position
    });
    metadata.shutdown();
}

#[test]
fn client_registration_conflicts_and_listing() {
    let store = MemoryStore::new();
    client::create(store.as_ref(), OID, 22, 4, -1).unwrap();

    for id in ["mirror-a", "mirror-b", "mirror-c"] {
        client::client_register(store.as_ref(), OID, id, "peer").unwrap();
    }
    assert_eq!(
        client::client_register(store.as_ref(), OID, "mirror-b", "peer"),
        Err(JournalError::Exists)
    );

    let clients = client::client_list(store.as_ref(), OID).unwrap();
    let ids: Vec<&str> = clients.iter().map(|client| client.id.as_str()).collect();
    assert_eq!(ids, vec!["mirror-a", "mirror-b", "mirror-c"]);

    client::client_unregister(store.as_ref(), OID, "mirror-b").unwrap();
    assert_eq!(
        client::client_unregister(store.as_ref(), OID, "mirror-b"),
        Err(JournalError::NotFound)
    );
    assert_eq!(client::client_list(store.as_ref(), OID).unwrap().len(), 2);
}

#[test]
fn commit_position_encoding_survives_the_store() {
    let store = MemoryStore::new();
    client::create(store.as_ref(), OID, 22, 4, -1).unwrap();
    client::client_register(store.as_ref(), OID, "c1", "").unwrap();

    let position = ObjectSetPosition::new(
        11,
        [
            EntryPosition::new("alpha", 42),
            EntryPosition::new("beta", 7),
        ],
    );
    let call = client::client_commit_call("c1", &position);
    store.exec(OID, vec![call]).unwrap();

    let clients = client::client_list(store.as_ref(), OID).unwrap();
    assert_eq!(clients[0].commit_position, position);
}
