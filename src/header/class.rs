//! Server-side implementation of the header object class. The in-memory
//! store dispatches `exec` calls here; a production store would host the
//! same methods next to the objects.

use crate::codec::{WireDecoder, WireEncoder};
use crate::error::{JournalError, Result};
use crate::header::{
    decode_client_set, encode_client_set, ObjectSetPosition, RegisteredClient,
};
use std::collections::BTreeMap;

pub const CLASS_CREATE: &str = "create";
pub const CLASS_GET_ORDER: &str = "get_order";
pub const CLASS_GET_SPLAY_WIDTH: &str = "get_splay_width";
pub const CLASS_GET_POOL_ID: &str = "get_pool_id";
pub const CLASS_GET_MINIMUM_SET: &str = "get_minimum_set";
pub const CLASS_SET_MINIMUM_SET: &str = "set_minimum_set";
pub const CLASS_GET_ACTIVE_SET: &str = "get_active_set";
pub const CLASS_SET_ACTIVE_SET: &str = "set_active_set";
pub const CLASS_CLIENT_REGISTER: &str = "client_register";
pub const CLASS_CLIENT_UNREGISTER: &str = "client_unregister";
pub const CLASS_CLIENT_COMMIT: &str = "client_commit";
pub const CLASS_CLIENT_LIST: &str = "client_list";
pub const CLASS_GUARD_APPEND: &str = "guard_append";

/// Mutable state of one journal header object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderState {
    pub order: u8,
    pub splay_width: u8,
    pub pool_id: i64,
    pub minimum_set: u64,
    pub active_set: u64,
    pub clients: BTreeMap<String, RegisteredClient>,
}

/// Dispatch a single class method against `header` (None until `create`).
/// `object_size` is the current byte size of the object, consulted by
/// `guard_append`. Decode failures of inputs map to `BadMessage`.
pub fn call(
    header: &mut Option<HeaderState>,
    object_size: u64,
    method: &str,
    input: &[u8],
) -> Result<Vec<u8>> {
    let mut dec = WireDecoder::new(input);
    match method {
        CLASS_CREATE => {
            let order = dec.get_u8()?;
            let splay_width = dec.get_u8()?;
            let pool_id = dec.get_i64()?;
            if header.is_some() {
                return Err(JournalError::Exists);
            }
            *header = Some(HeaderState {
                order,
                splay_width,
                pool_id,
                minimum_set: 0,
                active_set: 0,
                clients: BTreeMap::new(),
            });
            Ok(Vec::new())
        }
        CLASS_GUARD_APPEND => {
            let soft_max_size = dec.get_u64()?;
            if object_size >= soft_max_size {
                return Err(JournalError::Overflow);
            }
            Ok(Vec::new())
        }
        _ => {
            let state = header.as_mut().ok_or(JournalError::NotFound)?;
            stateful_call(state, method, &mut dec)
        }
    }
}

fn stateful_call(
    state: &mut HeaderState,
    method: &str,
    dec: &mut WireDecoder<'_>,
) -> Result<Vec<u8>> {
    match method {
        CLASS_GET_ORDER => Ok(encode_u8(state.order)),
        CLASS_GET_SPLAY_WIDTH => Ok(encode_u8(state.splay_width)),
        CLASS_GET_POOL_ID => {
            let mut enc = WireEncoder::new();
            enc.put_i64(state.pool_id);
            Ok(enc.finish())
        }
        CLASS_GET_MINIMUM_SET => Ok(encode_u64(state.minimum_set)),
        CLASS_GET_ACTIVE_SET => Ok(encode_u64(state.active_set)),
        CLASS_SET_MINIMUM_SET => {
            let object_set = dec.get_u64()?;
            if state.active_set < object_set {
                return Err(JournalError::invalid(
                    "minimum set may not pass the active set",
                ));
            }
            if object_set < state.minimum_set {
                return Err(JournalError::Stale);
            }
            state.minimum_set = object_set;
            Ok(Vec::new())
        }
        CLASS_SET_ACTIVE_SET => {
            let object_set = dec.get_u64()?;
            if object_set < state.minimum_set {
                return Err(JournalError::invalid(
                    "active set may not precede the minimum set",
                ));
            }
            if object_set < state.active_set {
                return Err(JournalError::Stale);
            }
            state.active_set = object_set;
            Ok(Vec::new())
        }
        CLASS_CLIENT_REGISTER => {
            let id = dec.get_str()?;
            let description = dec.get_str()?;
            if state.clients.contains_key(&id) {
                return Err(JournalError::Exists);
            }
            state
                .clients
                .insert(id.clone(), RegisteredClient::new(id, description));
            Ok(Vec::new())
        }
        CLASS_CLIENT_UNREGISTER => {
            let id = dec.get_str()?;
            state
                .clients
                .remove(&id)
                .map(|_| Vec::new())
                .ok_or(JournalError::NotFound)
        }
        CLASS_CLIENT_COMMIT => {
            let id = dec.get_str()?;
            let commit_position = ObjectSetPosition::decode(dec)?;
            if commit_position.entry_positions.len() > state.splay_width as usize {
                return Err(JournalError::invalid(
                    "more entry positions than splay width",
                ));
            }
            let client = state
                .clients
                .get_mut(&id)
                .ok_or(JournalError::NotFound)?;
            client.commit_position = commit_position;
            Ok(Vec::new())
        }
        CLASS_CLIENT_LIST => {
            let start_after = dec.get_str()?;
            let max_return = dec.get_u64()?;
            let page: Vec<RegisteredClient> = state
                .clients
                .range::<String, _>((
                    std::ops::Bound::Excluded(&start_after),
                    std::ops::Bound::Unbounded,
                ))
                .take(max_return as usize)
                .map(|(_, client)| client.clone())
                .collect();
            Ok(encode_client_set(&page))
        }
        _ => Err(JournalError::invalid(format!(
            "unknown header class method '{}'",
            method
        ))),
    }
}

fn encode_u8(value: u8) -> Vec<u8> {
    let mut enc = WireEncoder::new();
    enc.put_u8(value);
    enc.finish()
}

fn encode_u64(value: u64) -> Vec<u8> {
    let mut enc = WireEncoder::new();
    enc.put_u64(value);
    enc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::client::{decode_client_page, encode_client_list_input};

    fn create_input(order: u8, splay_width: u8, pool_id: i64) -> Vec<u8> {
        let mut enc = WireEncoder::new();
        enc.put_u8(order).put_u8(splay_width).put_i64(pool_id);
        enc.finish()
    }

    fn register_input(id: &str, description: &str) -> Vec<u8> {
        let mut enc = WireEncoder::new();
        enc.put_str(id).put_str(description);
        enc.finish()
    }

    fn set_input(object_set: u64) -> Vec<u8> {
        let mut enc = WireEncoder::new();
        enc.put_u64(object_set);
        enc.finish()
    }

    #[test]
    fn create_then_read_back() {
        let mut header = None;
        call(&mut header, 0, CLASS_CREATE, &create_input(22, 4, -1)).unwrap();
        let out = call(&mut header, 0, CLASS_GET_ORDER, &[]).unwrap();
        assert_eq!(out, vec![22]);
        assert_eq!(
            call(&mut header, 0, CLASS_CREATE, &create_input(22, 4, -1)),
            Err(JournalError::Exists)
        );
    }

    #[test]
    fn reads_on_missing_header_are_not_found() {
        let mut header = None;
        assert_eq!(
            call(&mut header, 0, CLASS_GET_ORDER, &[]),
            Err(JournalError::NotFound)
        );
    }

    #[test]
    fn set_windows_enforce_monotonic_bounds() {
        let mut header = None;
        call(&mut header, 0, CLASS_CREATE, &create_input(22, 4, -1)).unwrap();

        assert_eq!(
            call(&mut header, 0, CLASS_SET_MINIMUM_SET, &set_input(1)),
            Err(JournalError::Invalid(
                "minimum set may not pass the active set".into()
            ))
        );
        call(&mut header, 0, CLASS_SET_ACTIVE_SET, &set_input(3)).unwrap();
        call(&mut header, 0, CLASS_SET_MINIMUM_SET, &set_input(2)).unwrap();
        assert_eq!(
            call(&mut header, 0, CLASS_SET_MINIMUM_SET, &set_input(1)),
            Err(JournalError::Stale)
        );
        assert_eq!(
            call(&mut header, 0, CLASS_SET_ACTIVE_SET, &set_input(2)),
            Err(JournalError::Stale)
        );
        // same value is a no-op
        call(&mut header, 0, CLASS_SET_ACTIVE_SET, &set_input(3)).unwrap();
    }

    #[test]
    fn duplicate_client_registration_exists() {
        let mut header = None;
        call(&mut header, 0, CLASS_CREATE, &create_input(22, 4, -1)).unwrap();
        call(
            &mut header,
            0,
            CLASS_CLIENT_REGISTER,
            &register_input("c1", "x"),
        )
        .unwrap();
        assert_eq!(
            call(
                &mut header,
                0,
                CLASS_CLIENT_REGISTER,
                &register_input("c1", "x"),
            ),
            Err(JournalError::Exists)
        );
    }

    #[test]
    fn client_list_pages_in_id_order() {
        let mut header = None;
        call(&mut header, 0, CLASS_CREATE, &create_input(22, 4, -1)).unwrap();
        for id in ["b", "a", "c"] {
            call(
                &mut header,
                0,
                CLASS_CLIENT_REGISTER,
                &register_input(id, ""),
            )
            .unwrap();
        }

        let out = call(
            &mut header,
            0,
            CLASS_CLIENT_LIST,
            &encode_client_list_input("", 2),
        )
        .unwrap();
        let page = decode_client_page(&out).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, "a");
        assert_eq!(page[1].id, "b");

        let out = call(
            &mut header,
            0,
            CLASS_CLIENT_LIST,
            &encode_client_list_input("b", 2),
        )
        .unwrap();
        let page = decode_client_page(&out).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "c");
    }

    #[test]
    fn commit_rejects_wide_positions_and_unknown_clients() {
        let mut header = None;
        call(&mut header, 0, CLASS_CREATE, &create_input(22, 1, -1)).unwrap();
        call(
            &mut header,
            0,
            CLASS_CLIENT_REGISTER,
            &register_input("c1", ""),
        )
        .unwrap();

        let wide = ObjectSetPosition::new(
            0,
            [
                crate::header::EntryPosition::new("a", 1),
                crate::header::EntryPosition::new("b", 2),
            ],
        );
        let mut enc = WireEncoder::new();
        enc.put_str("c1");
        wide.encode(&mut enc);
        assert!(matches!(
            call(&mut header, 0, CLASS_CLIENT_COMMIT, &enc.finish()),
            Err(JournalError::Invalid(_))
        ));

        let narrow = ObjectSetPosition::new(
            0,
            [crate::header::EntryPosition::new("a", 1)],
        );
        let mut enc = WireEncoder::new();
        enc.put_str("ghost");
        narrow.encode(&mut enc);
        assert_eq!(
            call(&mut header, 0, CLASS_CLIENT_COMMIT, &enc.finish()),
            Err(JournalError::NotFound)
        );
    }

    #[test]
    fn guard_append_rejects_full_objects() {
        let mut header = None;
        assert_eq!(
            call(&mut header, 100, CLASS_GUARD_APPEND, &set_input(100)),
            Err(JournalError::Overflow)
        );
        call(&mut header, 99, CLASS_GUARD_APPEND, &set_input(100)).unwrap();
    }
}
