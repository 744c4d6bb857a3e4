//! Key layout for the topic store.
//!
//! Every piece of per-topic state lives under the `t-<topic>-` prefix so a
//! single prefix scan covers a whole topic:
//!
//! - `t-<topic>-<offset>`: main-queue entry (decimal signed offset)
//! - `t-<topic>-head` / `t-<topic>-tail`: main-queue pointers
//! - `t-<topic>-ack-<offset>`: outstanding (unacknowledged) entry
//! - `t-<topic>-ack-tail`: next outstanding offset to allocate
//! - `t-<topic>-delay-<dueUnixSeconds>-<localSeq>`: delayed entry; the due
//!   second leads the key so byte-ordered iteration is chronological
//!
//! The global topic list sits apart under `m-topics` as a JSON array.

use crate::StoreError;

/// Key of the JSON-encoded list of known topic names.
pub const META_TOPICS: &[u8] = b"m-topics";

pub fn entry(topic: &str, offset: i64) -> Vec<u8> {
    format!("t-{topic}-{offset}").into_bytes()
}

pub fn head(topic: &str) -> Vec<u8> {
    format!("t-{topic}-head").into_bytes()
}

pub fn tail(topic: &str) -> Vec<u8> {
    format!("t-{topic}-tail").into_bytes()
}

pub fn ack_entry(topic: &str, offset: i64) -> Vec<u8> {
    format!("t-{topic}-ack-{offset}").into_bytes()
}

pub fn ack_tail(topic: &str) -> Vec<u8> {
    format!("t-{topic}-ack-tail").into_bytes()
}

pub fn delay_entry(topic: &str, due_unix_secs: i64, local_seq: i64) -> Vec<u8> {
    format!("t-{topic}-delay-{due_unix_secs}-{local_seq}").into_bytes()
}

pub fn delay_prefix(topic: &str) -> Vec<u8> {
    format!("t-{topic}-delay-").into_bytes()
}

/// Prefix shared by every key belonging to one topic. The trailing separator
/// keeps topic `a` from matching keys of topic `ab`.
pub fn topic_prefix(topic: &str) -> Vec<u8> {
    format!("t-{topic}-").into_bytes()
}

/// Recover the due unix-second from a delay-entry key. The exact per-topic
/// prefix is stripped first, so topic names containing `-` parse correctly.
pub fn delay_due_secs(topic: &str, key: &[u8]) -> Result<i64, StoreError> {
    let prefix = delay_prefix(topic);
    let rest = key
        .strip_prefix(prefix.as_slice())
        .ok_or(StoreError::Corrupt("delay key outside topic prefix"))?;
    let rest =
        std::str::from_utf8(rest).map_err(|_| StoreError::Corrupt("delay key is not utf-8"))?;
    let (due, _local_seq) = rest
        .split_once('-')
        .ok_or(StoreError::Corrupt("delay key missing local sequence"))?;
    due.parse()
        .map_err(|_| StoreError::Corrupt("delay key due-second is not an integer"))
}

/// Encode a queue pointer as a zigzag LEB128 varint in an 8-byte zero-padded
/// buffer. This is the wire form `encoding/binary.PutVarint` produces, kept
/// so databases written by earlier deployments stay readable.
pub fn encode_pos(pos: i64) -> [u8; 8] {
    let mut out = [0u8; 8];
    let mut ux = ((pos as u64) << 1) ^ ((pos >> 63) as u64);
    let mut i = 0;
    while ux >= 0x80 {
        out[i] = (ux as u8) | 0x80;
        ux >>= 7;
        i += 1;
    }
    out[i] = ux as u8;
    out
}

/// Decode a queue pointer written by [`encode_pos`]. Trailing zero padding
/// after the terminating byte is ignored.
pub fn decode_pos(buf: &[u8]) -> Result<i64, StoreError> {
    let mut ux: u64 = 0;
    let mut shift = 0u32;
    for &b in buf {
        if shift >= 64 {
            return Err(StoreError::Corrupt("position varint overflows i64"));
        }
        if b < 0x80 {
            ux |= (b as u64) << shift;
            return Ok(((ux >> 1) as i64) ^ -((ux & 1) as i64));
        }
        ux |= ((b & 0x7f) as u64) << shift;
        shift += 7;
    }
    Err(StoreError::Corrupt("truncated position varint"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_keys_render_signed_offsets() {
        assert_eq!(entry("orders", 0), b"t-orders-0".to_vec());
        assert_eq!(entry("orders", -3), b"t-orders--3".to_vec());
        assert_eq!(ack_entry("orders", 12), b"t-orders-ack-12".to_vec());
        assert_eq!(
            delay_entry("orders", 1600000000, 1),
            b"t-orders-delay-1600000000-1".to_vec()
        );
    }

    #[test]
    fn pos_encoding_matches_reference_vectors() {
        // Byte-for-byte against encoding/binary.PutVarint into an 8-byte buffer.
        assert_eq!(encode_pos(0), [0x00, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(encode_pos(1), [0x02, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(encode_pos(-1), [0x01, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(encode_pos(2), [0x04, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(encode_pos(-2), [0x03, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(encode_pos(63), [0x7e, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(encode_pos(64), [0x80, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(encode_pos(-64), [0x7f, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn pos_round_trips() {
        for pos in [0i64, 1, -1, 7, -7, 300, -300, 1 << 40, -(1 << 40)] {
            assert_eq!(decode_pos(&encode_pos(pos)).expect("decode"), pos);
        }
    }

    #[test]
    fn decode_pos_rejects_unterminated_varint() {
        let err = decode_pos(&[0x80; 8]).expect_err("unterminated");
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[test]
    fn delay_due_parses_with_dashed_topic_names() {
        let key = delay_entry("multi-part-topic", 1700000123, 4);
        assert_eq!(
            delay_due_secs("multi-part-topic", &key).expect("parse"),
            1700000123
        );
    }

    #[test]
    fn delay_due_rejects_foreign_keys() {
        let err = delay_due_secs("orders", b"t-other-delay-1-0").expect_err("foreign");
        assert!(matches!(err, StoreError::Corrupt(_)));
    }
}
