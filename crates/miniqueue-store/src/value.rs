// Stored record: a message payload plus its delay-requeue count.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::StoreError;

/// A single stored message.
///
/// The delay-requeue count travels with the payload through every queue the
/// message visits, so a consumer can tell how often the message has been
/// deferred.
///
/// ```
/// use bytes::Bytes;
/// use miniqueue_store::Value;
///
/// let value = Value::new(Bytes::from_static(b"hello"));
/// let decoded = Value::decode(&value.encode()).expect("decode");
/// assert_eq!(decoded, value);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    /// Raw message payload as handed to publish.
    pub raw: Bytes,
    /// Number of times the message has re-entered the delay queue.
    pub dack_count: u32,
}

impl Value {
    pub fn new(raw: Bytes) -> Self {
        Self { raw, dack_count: 0 }
    }

    /// Encode as a fixed big-endian count header followed by the raw payload.
    /// The layout is stable: records written by an older process must decode
    /// after a restart.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.raw.len());
        buf.put_u32(self.dack_count);
        buf.extend_from_slice(&self.raw);
        buf.freeze()
    }

    pub fn decode(mut input: &[u8]) -> Result<Self, StoreError> {
        if input.len() < 4 {
            return Err(StoreError::Corrupt("value shorter than its header"));
        }
        let dack_count = input.get_u32();
        Ok(Self {
            raw: Bytes::copy_from_slice(input),
            dack_count,
        })
    }
}
