//! Data-object entry framing. Appends are atomic full-frame writes, so a
//! reader never observes a partial frame mid-object; an incomplete or
//! corrupt frame terminates that object's tail.

use crate::codec::{WireDecoder, WireEncoder};
use crate::error::{JournalError, Result};

const PREAMBLE: u64 = 0x3141_5926_5358_9793;
/// magic + body length + crc
const FRAME_HEADER_SIZE: usize = 8 + 4 + 4;

/// One journal entry: a caller payload scoped by `(tag, tid)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub tag: String,
    pub tid: u64,
    pub payload: Vec<u8>,
}

impl Entry {
    pub fn new(tag: impl Into<String>, tid: u64, payload: Vec<u8>) -> Self {
        Self {
            tag: tag.into(),
            tid,
            payload,
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut enc = WireEncoder::with_capacity(self.payload.len() + self.tag.len() + 24);
        enc.put_str(&self.tag);
        enc.put_u64(self.tid);
        enc.put_bytes(&self.payload);
        enc.finish()
    }

    pub fn encode(&self) -> Vec<u8> {
        let body = self.encode_body();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        let mut enc = WireEncoder::with_capacity(FRAME_HEADER_SIZE + body.len());
        enc.put_u64(PREAMBLE);
        enc.put_u32(body.len() as u32);
        enc.put_u32(crc);
        enc.append_raw(&body);
        enc.finish()
    }

    pub fn encoded_size(&self) -> u64 {
        (FRAME_HEADER_SIZE + self.encode_body().len()) as u64
    }

    /// Decode the frame at the front of `buf`. Returns `Ok(None)` when the
    /// buffer ends before a complete frame (clean tail) and `BadMessage`
    /// when the bytes present are not a valid frame.
    pub fn decode_prefix(buf: &[u8]) -> Result<Option<(Entry, usize)>> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let mut dec = WireDecoder::new(buf);
        let preamble = dec.get_u64()?;
        if preamble != PREAMBLE {
            return Err(JournalError::bad_message("entry preamble mismatch"));
        }
        let body_len = dec.get_u32()? as usize;
        let crc = dec.get_u32()?;
        if buf.len() < FRAME_HEADER_SIZE + body_len {
            return Ok(None);
        }

        let body = &buf[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + body_len];
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(body);
        if hasher.finalize() != crc {
            return Err(JournalError::bad_message("entry crc mismatch"));
        }

        let mut body_dec = WireDecoder::new(body);
        let tag = body_dec.get_str()?;
        let tid = body_dec.get_u64()?;
        let payload = body_dec.get_bytes()?;
        if body_dec.remaining() != 0 {
            return Err(JournalError::bad_message("trailing bytes in entry body"));
        }
        Ok(Some((
            Entry { tag, tid, payload },
            FRAME_HEADER_SIZE + body_len,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let entry = Entry::new("tag-1", 42, b"payload".to_vec());
        let bytes = entry.encode();
        assert_eq!(bytes.len() as u64, entry.encoded_size());

        let (decoded, consumed) = Entry::decode_prefix(&bytes).unwrap().unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn consecutive_frames_decode_in_order() {
        let first = Entry::new("a", 0, vec![1, 2, 3]);
        let second = Entry::new("b", 1, Vec::new());
        let mut buf = first.encode();
        buf.extend_from_slice(&second.encode());

        let (decoded, consumed) = Entry::decode_prefix(&buf).unwrap().unwrap();
        assert_eq!(decoded, first);
        let (decoded, _) = Entry::decode_prefix(&buf[consumed..]).unwrap().unwrap();
        assert_eq!(decoded, second);
    }

    #[test]
    fn truncated_frame_is_clean_tail() {
        let entry = Entry::new("tag", 7, vec![0u8; 64]);
        let bytes = entry.encode();
        assert!(Entry::decode_prefix(&bytes[..10]).unwrap().is_none());
        assert!(Entry::decode_prefix(&bytes[..bytes.len() - 1])
            .unwrap()
            .is_none());
        assert!(Entry::decode_prefix(&[]).unwrap().is_none());
    }

    #[test]
    fn corrupt_frames_are_bad_messages() {
        let entry = Entry::new("tag", 7, vec![9u8; 16]);
        let mut bytes = entry.encode();
        bytes[0] ^= 0xff;
        assert!(matches!(
            Entry::decode_prefix(&bytes),
            Err(JournalError::BadMessage(_))
        ));

        let mut bytes = entry.encode();
        let payload_byte = bytes.len() - 1;
        bytes[payload_byte] ^= 0xff;
        assert!(matches!(
            Entry::decode_prefix(&bytes),
            Err(JournalError::BadMessage(_))
        ));
    }
}
