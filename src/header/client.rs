//! Client-side shims for the header object class: inputs are encoded,
//! dispatched through the store, outputs decoded. Decode failures map to
//! `BadMessage`, distinct from store errors.

use crate::codec::{WireDecoder, WireEncoder};
use crate::error::Result;
use crate::header::class;
use crate::header::{decode_client_set, ObjectSetPosition, RegisteredClient};
use crate::store::{ExecCall, ObjectStore};
use std::sync::Arc;

/// Page size for the client list; registrations beyond this are fetched
/// with follow-up pages.
pub const CLIENT_LIST_MAX_RETURN: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImmutableMetadata {
    pub order: u8,
    pub splay_width: u8,
    pub pool_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableMetadata {
    pub minimum_set: u64,
    pub active_set: u64,
    pub clients: Vec<RegisteredClient>,
}

pub fn create(
    store: &dyn ObjectStore,
    oid: &str,
    order: u8,
    splay_width: u8,
    pool_id: i64,
) -> Result<()> {
    let mut enc = WireEncoder::new();
    enc.put_u8(order).put_u8(splay_width).put_i64(pool_id);
    store
        .exec(oid, vec![ExecCall::new(class::CLASS_CREATE, enc.finish())])
        .map(|_| ())
}

pub fn get_immutable_metadata(
    store: &Arc<dyn ObjectStore>,
    oid: &str,
    on_finish: Box<dyn FnOnce(Result<ImmutableMetadata>) + Send>,
) {
    let calls = vec![
        ExecCall::new(class::CLASS_GET_ORDER, Vec::new()),
        ExecCall::new(class::CLASS_GET_SPLAY_WIDTH, Vec::new()),
        ExecCall::new(class::CLASS_GET_POOL_ID, Vec::new()),
    ];
    store.aio_exec(
        oid,
        calls,
        Box::new(move |result| {
            on_finish(result.and_then(|out| {
                let mut dec = WireDecoder::new(&out);
                let order = dec.get_u8()?;
                let splay_width = dec.get_u8()?;
                let pool_id = dec.get_i64()?;
                Ok(ImmutableMetadata {
                    order,
                    splay_width,
                    pool_id,
                })
            }));
        }),
    );
}

pub fn get_mutable_metadata(
    store: &Arc<dyn ObjectStore>,
    oid: &str,
    on_finish: Box<dyn FnOnce(Result<MutableMetadata>) + Send>,
) {
    let calls = vec![
        ExecCall::new(class::CLASS_GET_MINIMUM_SET, Vec::new()),
        ExecCall::new(class::CLASS_GET_ACTIVE_SET, Vec::new()),
    ];
    let store_clone = Arc::clone(store);
    let oid_owned = oid.to_string();
    store.aio_exec(
        oid,
        calls,
        Box::new(move |result| {
            let (minimum_set, active_set) = match result.and_then(|out| {
                let mut dec = WireDecoder::new(&out);
                Ok((dec.get_u64()?, dec.get_u64()?))
            }) {
                Ok(sets) => sets,
                Err(err) => {
                    on_finish(Err(err));
                    return;
                }
            };
            list_clients_page(
                store_clone,
                oid_owned,
                String::new(),
                Vec::new(),
                minimum_set,
                active_set,
                on_finish,
            );
        }),
    );
}

fn list_clients_page(
    store: Arc<dyn ObjectStore>,
    oid: String,
    start_after: String,
    mut clients: Vec<RegisteredClient>,
    minimum_set: u64,
    active_set: u64,
    on_finish: Box<dyn FnOnce(Result<MutableMetadata>) + Send>,
) {
    let call = ExecCall::new(
        class::CLASS_CLIENT_LIST,
        encode_client_list_input(&start_after, CLIENT_LIST_MAX_RETURN),
    );
    let store_clone = Arc::clone(&store);
    let oid_clone = oid.clone();
    store.aio_exec(
        &oid,
        vec![call],
        Box::new(move |result| {
            let page = match result.and_then(|out| decode_client_page(&out)) {
                Ok(page) => page,
                Err(err) => {
                    on_finish(Err(err));
                    return;
                }
            };
            let full_page = page.len() as u64 >= CLIENT_LIST_MAX_RETURN;
            let next_start = page.last().map(|client| client.id.clone());
            clients.extend(page);
            match (full_page, next_start) {
                (true, Some(start_after)) => list_clients_page(
                    store_clone,
                    oid_clone,
                    start_after,
                    clients,
                    minimum_set,
                    active_set,
                    on_finish,
                ),
                _ => on_finish(Ok(MutableMetadata {
                    minimum_set,
                    active_set,
                    clients,
                })),
            }
        }),
    );
}

pub fn client_register(
    store: &dyn ObjectStore,
    oid: &str,
    id: &str,
    description: &str,
) -> Result<()> {
    let mut enc = WireEncoder::new();
    enc.put_str(id).put_str(description);
    store
        .exec(
            oid,
            vec![ExecCall::new(class::CLASS_CLIENT_REGISTER, enc.finish())],
        )
        .map(|_| ())
}

pub fn client_unregister(store: &dyn ObjectStore, oid: &str, id: &str) -> Result<()> {
    let mut enc = WireEncoder::new();
    enc.put_str(id);
    store
        .exec(
            oid,
            vec![ExecCall::new(class::CLASS_CLIENT_UNREGISTER, enc.finish())],
        )
        .map(|_| ())
}

/// Synchronous client listing, paging until a short page.
pub fn client_list(store: &dyn ObjectStore, oid: &str) -> Result<Vec<RegisteredClient>> {
    let mut clients = Vec::new();
    let mut start_after = String::new();
    loop {
        let out = store.exec(
            oid,
            vec![ExecCall::new(
                class::CLASS_CLIENT_LIST,
                encode_client_list_input(&start_after, CLIENT_LIST_MAX_RETURN),
            )],
        )?;
        let page = decode_client_page(&out)?;
        let short_page = (page.len() as u64) < CLIENT_LIST_MAX_RETURN;
        if let Some(last) = page.last() {
            start_after = last.id.clone();
        }
        clients.extend(page);
        if short_page {
            return Ok(clients);
        }
    }
}

pub fn client_commit_call(id: &str, commit_position: &ObjectSetPosition) -> ExecCall {
    let mut enc = WireEncoder::new();
    enc.put_str(id);
    commit_position.encode(&mut enc);
    ExecCall::new(class::CLASS_CLIENT_COMMIT, enc.finish())
}

pub fn set_minimum_set_call(object_set: u64) -> ExecCall {
    let mut enc = WireEncoder::new();
    enc.put_u64(object_set);
    ExecCall::new(class::CLASS_SET_MINIMUM_SET, enc.finish())
}

pub fn set_active_set_call(object_set: u64) -> ExecCall {
    let mut enc = WireEncoder::new();
    enc.put_u64(object_set);
    ExecCall::new(class::CLASS_SET_ACTIVE_SET, enc.finish())
}

pub(crate) fn encode_client_list_input(start_after: &str, max_return: u64) -> Vec<u8> {
    let mut enc = WireEncoder::new();
    enc.put_str(start_after).put_u64(max_return);
    enc.finish()
}

pub(crate) fn decode_client_page(out: &[u8]) -> Result<Vec<RegisteredClient>> {
    decode_client_set(&mut WireDecoder::new(out))
}
