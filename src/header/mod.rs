//! Header-object data model: per-tag entry positions, object-set
//! positions, and registered client records, with their wire codecs.

pub mod class;
pub mod client;

use crate::codec::{WireDecoder, WireEncoder};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Progress marker on a single tag: the last committed tid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPosition {
    pub tag: String,
    pub tid: u64,
}

impl EntryPosition {
    pub fn new(tag: impl Into<String>, tid: u64) -> Self {
        Self {
            tag: tag.into(),
            tid,
        }
    }

    pub fn encode(&self, enc: &mut WireEncoder) {
        enc.put_str(&self.tag);
        enc.put_u64(self.tid);
    }

    pub fn decode(dec: &mut WireDecoder<'_>) -> Result<Self> {
        let tag = dec.get_str()?;
        let tid = dec.get_u64()?;
        Ok(Self { tag, tid })
    }
}

/// A consumer's durable progress: the newest committed object number plus
/// one entry position per tag, newest first. Tags are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSetPosition {
    pub object_number: u64,
    pub entry_positions: VecDeque<EntryPosition>,
}

impl ObjectSetPosition {
    pub fn new(
        object_number: u64,
        entry_positions: impl IntoIterator<Item = EntryPosition>,
    ) -> Self {
        Self {
            object_number,
            entry_positions: entry_positions.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entry_positions.is_empty()
    }

    pub fn tid_for(&self, tag: &str) -> Option<u64> {
        self.entry_positions
            .iter()
            .find(|position| position.tag == tag)
            .map(|position| position.tid)
    }

    /// Partial order over positions: `self ≤ other` when the object number
    /// is strictly older, or the object numbers match and `other` covers
    /// every tag of `self` at an equal-or-newer tid. Positions on disjoint
    /// tags at the same object are incomparable (neither ≤).
    pub fn at_or_before(&self, other: &ObjectSetPosition) -> bool {
        if self.object_number != other.object_number {
            return self.object_number < other.object_number;
        }
        self.entry_positions.iter().all(|position| {
            other
                .tid_for(&position.tag)
                .map_or(false, |tid| position.tid <= tid)
        })
    }

    pub fn encode(&self, enc: &mut WireEncoder) {
        enc.put_u64(self.object_number);
        enc.put_u32(self.entry_positions.len() as u32);
        for position in &self.entry_positions {
            position.encode(enc);
        }
    }

    pub fn decode(dec: &mut WireDecoder<'_>) -> Result<Self> {
        let object_number = dec.get_u64()?;
        let count = dec.get_u32()?;
        let mut entry_positions = VecDeque::with_capacity(count as usize);
        for _ in 0..count {
            entry_positions.push_back(EntryPosition::decode(dec)?);
        }
        Ok(Self {
            object_number,
            entry_positions,
        })
    }
}

/// A registered journal consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredClient {
    pub id: String,
    pub description: String,
    pub commit_position: ObjectSetPosition,
}

impl RegisteredClient {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            commit_position: ObjectSetPosition::default(),
        }
    }

    pub fn encode(&self, enc: &mut WireEncoder) {
        enc.put_str(&self.id);
        enc.put_str(&self.description);
        self.commit_position.encode(enc);
    }

    pub fn decode(dec: &mut WireDecoder<'_>) -> Result<Self> {
        let id = dec.get_str()?;
        let description = dec.get_str()?;
        let commit_position = ObjectSetPosition::decode(dec)?;
        Ok(Self {
            id,
            description,
            commit_position,
        })
    }
}

pub(crate) fn encode_client_set(clients: &[RegisteredClient]) -> Vec<u8> {
    let mut enc = WireEncoder::new();
    enc.put_u32(clients.len() as u32);
    for client in clients {
        client.encode(&mut enc);
    }
    enc.finish()
}

pub(crate) fn decode_client_set(dec: &mut WireDecoder<'_>) -> Result<Vec<RegisteredClient>> {
    let count = dec.get_u32()?;
    let mut clients = Vec::with_capacity(count as usize);
    for _ in 0..count {
        clients.push(RegisteredClient::decode(dec)?);
    }
    Ok(clients)
}
