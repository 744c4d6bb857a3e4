//! Durable topic storage for the broker.
//!
//! Each topic is three collections in one sled tree: a main queue of
//! messages awaiting delivery, an outstanding set of delivered-but-unacked
//! messages keyed by a monotonically allocated ack offset, and a delay queue
//! keyed by due time. A message lives in exactly one of the three at any
//! moment; every move between them happens inside a single sled transaction
//! so a crash can never observe a half-applied transition.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::IVec;

pub mod keys;
mod value;

pub use value::Value;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("topic is empty")]
    TopicEmpty,
    #[error("topic does not exist")]
    TopicNotExist,
    #[error("msg to nack does not exist")]
    NackMsgNotExist,
    #[error("msg to back does not exist")]
    BackMsgNotExist,
    #[error("msg to dack does not exist")]
    DackMsgNotExist,
    #[error("corrupt record: {0}")]
    Corrupt(&'static str),
    #[error("db error: {0}")]
    Db(#[from] sled::Error),
    #[error("topic metadata: {0}")]
    Meta(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Global store metadata: the list of topics ever inserted into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub topics: Vec<String>,
}

/// One entry of a topic's delay queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedEntry {
    /// Wall-clock moment the message becomes due again.
    pub due: SystemTime,
    pub value: Value,
}

/// Storage backend for topics. Implementations serialise mutating calls
/// internally; callers may share one instance across tasks freely.
pub trait TopicStore: fmt::Debug + Send + Sync {
    /// Append a value at the tail of the topic's main queue, creating the
    /// topic on first use.
    fn insert(&self, topic: &str, value: &Value) -> Result<()>;

    /// Pop the value at the head of the main queue into the outstanding set,
    /// returning it together with its freshly allocated ack offset.
    fn get_next(&self, topic: &str) -> Result<(Value, i64)>;

    /// Drop the outstanding record; the message is done.
    fn ack(&self, topic: &str, ack_offset: i64) -> Result<()>;

    /// Return the outstanding record to the *front* of the main queue.
    fn nack(&self, topic: &str, ack_offset: i64) -> Result<()>;

    /// Return the outstanding record to the *back* of the main queue.
    fn back(&self, topic: &str, ack_offset: i64) -> Result<()>;

    /// Move the outstanding record onto the delay queue, due again
    /// `delay_seconds` from now. Increments the value's dack count.
    fn dack(&self, topic: &str, ack_offset: i64, delay_seconds: u32) -> Result<()>;

    /// Move every delayed message due strictly before `before` back to the
    /// front of the main queue. Returns how many messages moved.
    fn return_delayed(&self, topic: &str, before: SystemTime) -> Result<usize>;

    /// Iterate the topic's delay queue in chronological order. Resources held
    /// by the iterator are released when it is dropped.
    fn delayed(&self, topic: &str) -> Box<dyn Iterator<Item = Result<DelayedEntry>> + Send>;

    /// The persisted list of topic names.
    fn meta(&self) -> Result<Metadata>;

    /// Delete every key belonging to the topic in one batched write. A later
    /// insert re-initialises the topic from scratch.
    fn purge(&self, topic: &str) -> Result<()>;

    /// Flush outstanding writes to disk.
    fn flush(&self) -> Result<()>;
}

/// The two persistent queues sharing the append layout: the main queue and
/// the outstanding (ack) set. Only the main queue has a head pointer.
#[derive(Clone, Copy)]
enum Lane {
    Main,
    Ack,
}

impl Lane {
    fn entry(self, topic: &str, offset: i64) -> Vec<u8> {
        match self {
            Lane::Main => keys::entry(topic, offset),
            Lane::Ack => keys::ack_entry(topic, offset),
        }
    }

    fn tail(self, topic: &str) -> Vec<u8> {
        match self {
            Lane::Main => keys::tail(topic),
            Lane::Ack => keys::ack_tail(topic),
        }
    }
}

/// Sled-backed [`TopicStore`].
///
/// One exclusive lock serialises mutating operations across all topics; the
/// visible effect is a total order over state transitions.
pub struct SledStore {
    path: PathBuf,
    db: sled::Db,
    write_lock: Mutex<()>,
}

impl fmt::Debug for SledStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SledStore")
            .field("path", &self.path)
            .finish()
    }
}

impl SledStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let db = sled::open(&path)?;
        tracing::debug!(path = %path.display(), "opened store");
        Ok(Self {
            path,
            db,
            write_lock: Mutex::new(()),
        })
    }

    /// Open a throwaway store backed by a temporary directory that sled
    /// removes on drop. Intended for tests and demos.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self {
            path: PathBuf::new(),
            db,
            write_lock: Mutex::new(()),
        })
    }

    /// Flush and close the store.
    pub fn close(self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Close the store and remove its on-disk files.
    pub fn destroy(self) -> Result<()> {
        let SledStore {
            path,
            db,
            write_lock: _,
        } = self;
        db.flush()?;
        drop(db);
        if !path.as_os_str().is_empty() {
            std::fs::remove_dir_all(&path)?;
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().expect("store lock")
    }

    fn run_tx<T>(
        &self,
        f: impl Fn(&TransactionalTree) -> ConflictableTransactionResult<T, StoreError>,
    ) -> Result<T> {
        self.db.transaction(f).map_err(|err| match err {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => StoreError::Db(err),
        })
    }

    fn read_topics(&self) -> Result<Vec<String>> {
        match self.db.get(keys::META_TOPICS)? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(Vec::new()),
        }
    }
}

fn abort<T>(err: StoreError) -> ConflictableTransactionResult<T, StoreError> {
    Err(ConflictableTransactionError::Abort(err))
}

fn tx_pos(tx: &TransactionalTree, key: &[u8]) -> ConflictableTransactionResult<i64, StoreError> {
    let raw = match tx.get(key)? {
        Some(raw) => raw,
        None => return abort(StoreError::TopicNotExist),
    };
    keys::decode_pos(&raw).map_err(ConflictableTransactionError::Abort)
}

fn tx_set_pos(
    tx: &TransactionalTree,
    key: &[u8],
    pos: i64,
) -> ConflictableTransactionResult<(), StoreError> {
    tx.insert(key, &keys::encode_pos(pos)[..])?;
    Ok(())
}

/// Write `encoded` at the lane's tail and advance the tail pointer,
/// returning the offset the record landed on.
fn tx_append(
    tx: &TransactionalTree,
    lane: Lane,
    topic: &str,
    encoded: &[u8],
) -> ConflictableTransactionResult<i64, StoreError> {
    let tail_key = lane.tail(topic);
    let offset = tx_pos(tx, &tail_key)?;
    tx.insert(lane.entry(topic, offset), encoded)?;
    tx_set_pos(tx, &tail_key, offset + 1)?;
    Ok(offset)
}

/// Write `encoded` one slot in front of the main-queue head and move the
/// head pointer down onto it.
fn tx_prepend(
    tx: &TransactionalTree,
    topic: &str,
    encoded: &[u8],
) -> ConflictableTransactionResult<i64, StoreError> {
    let head_key = keys::head(topic);
    let new_head = tx_pos(tx, &head_key)? - 1;
    tx.insert(keys::entry(topic, new_head), encoded)?;
    tx_set_pos(tx, &head_key, new_head)?;
    Ok(new_head)
}

fn unix_now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

impl TopicStore for SledStore {
    fn insert(&self, topic: &str, value: &Value) -> Result<()> {
        let _guard = self.lock();
        let encoded = value.encode();

        if self.db.contains_key(keys::tail(topic))? {
            self.run_tx(|tx| {
                tx_append(tx, Lane::Main, topic, &encoded)?;
                Ok(())
            })
        } else {
            // First insert: initialise the queue pointers, write the record
            // at offset zero and register the topic in the global list.
            let mut topics = self.read_topics()?;
            if !topics.iter().any(|existing| existing == topic) {
                topics.push(topic.to_string());
            }
            let topics_json = serde_json::to_vec(&topics)?;
            self.run_tx(|tx| {
                tx_set_pos(tx, &keys::head(topic), 0)?;
                tx_set_pos(tx, &keys::ack_tail(topic), 0)?;
                tx_set_pos(tx, &keys::tail(topic), 1)?;
                tx.insert(keys::entry(topic, 0), encoded.as_ref())?;
                tx.insert(keys::META_TOPICS, topics_json.as_slice())?;
                Ok(())
            })
        }
    }

    fn get_next(&self, topic: &str) -> Result<(Value, i64)> {
        let _guard = self.lock();
        self.run_tx(|tx| {
            let head = tx_pos(tx, &keys::head(topic))?;
            let raw = match tx.get(keys::entry(topic, head))? {
                Some(raw) => raw,
                // head == tail: nothing queued.
                None => return abort(StoreError::TopicEmpty),
            };
            let value = Value::decode(&raw).map_err(ConflictableTransactionError::Abort)?;
            let ack_offset = tx_append(tx, Lane::Ack, topic, &raw)?;
            // The consumed slot is left in place; a later nack overwrites it.
            tx_set_pos(tx, &keys::head(topic), head + 1)?;
            Ok((value, ack_offset))
        })
    }

    fn ack(&self, topic: &str, ack_offset: i64) -> Result<()> {
        let _guard = self.lock();
        self.db.remove(keys::ack_entry(topic, ack_offset))?;
        Ok(())
    }

    fn nack(&self, topic: &str, ack_offset: i64) -> Result<()> {
        let _guard = self.lock();
        self.run_tx(|tx| {
            let ack_key = keys::ack_entry(topic, ack_offset);
            let raw = match tx.get(&ack_key)? {
                Some(raw) => raw,
                None => return abort(StoreError::NackMsgNotExist),
            };
            tx_prepend(tx, topic, &raw)?;
            tx.remove(ack_key)?;
            Ok(())
        })
    }

    fn back(&self, topic: &str, ack_offset: i64) -> Result<()> {
        let _guard = self.lock();
        self.run_tx(|tx| {
            let ack_key = keys::ack_entry(topic, ack_offset);
            let raw = match tx.get(&ack_key)? {
                Some(raw) => raw,
                None => return abort(StoreError::BackMsgNotExist),
            };
            tx_append(tx, Lane::Main, topic, &raw)?;
            tx.remove(ack_key)?;
            Ok(())
        })
    }

    fn dack(&self, topic: &str, ack_offset: i64, delay_seconds: u32) -> Result<()> {
        let _guard = self.lock();
        let due = unix_now_secs() + i64::from(delay_seconds);
        self.run_tx(|tx| {
            let ack_key = keys::ack_entry(topic, ack_offset);
            let raw = match tx.get(&ack_key)? {
                Some(raw) => raw,
                None => return abort(StoreError::DackMsgNotExist),
            };
            let mut value = Value::decode(&raw).map_err(ConflictableTransactionError::Abort)?;
            value.dack_count += 1;
            let encoded = value.encode();

            // Several messages may land on the same due second; the local
            // sequence keeps their keys distinct and ordered.
            let mut local_seq = 0;
            while tx.get(keys::delay_entry(topic, due, local_seq))?.is_some() {
                local_seq += 1;
            }
            tx.insert(keys::delay_entry(topic, due, local_seq), encoded.as_ref())?;
            tx.remove(ack_key)?;
            Ok(())
        })
    }

    fn return_delayed(&self, topic: &str, before: SystemTime) -> Result<usize> {
        let _guard = self.lock();
        let cutoff_nanos = before
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i128)
            .unwrap_or(0);

        // Collect due entries first; the delay queue iterates in key order,
        // which is chronological, so stop at the first future entry. The
        // store lock keeps the scan and the transaction below consistent.
        let mut due_entries: Vec<(IVec, IVec)> = Vec::new();
        for item in self.db.scan_prefix(keys::delay_prefix(topic)) {
            let (key, raw) = item?;
            let due_secs = keys::delay_due_secs(topic, &key)?;
            if (due_secs as i128) * 1_000_000_000 < cutoff_nanos {
                due_entries.push((key, raw));
            } else {
                break;
            }
        }
        if due_entries.is_empty() {
            return Ok(0);
        }

        let count = due_entries.len();
        self.run_tx(|tx| {
            for (key, raw) in &due_entries {
                // Prepending while iterating leaves a multi-message sweep in
                // reverse chronological order at the head.
                tx_prepend(tx, topic, raw)?;
                tx.remove(key.clone())?;
            }
            Ok(())
        })?;
        Ok(count)
    }

    fn delayed(&self, topic: &str) -> Box<dyn Iterator<Item = Result<DelayedEntry>> + Send> {
        let topic = topic.to_string();
        let iter = self.db.scan_prefix(keys::delay_prefix(&topic));
        Box::new(iter.map(move |item| {
            let (key, raw) = item?;
            let due_secs = keys::delay_due_secs(&topic, &key)?;
            let value = Value::decode(&raw)?;
            Ok(DelayedEntry {
                due: UNIX_EPOCH + Duration::from_secs(due_secs.max(0) as u64),
                value,
            })
        }))
    }

    fn meta(&self) -> Result<Metadata> {
        let _guard = self.lock();
        Ok(Metadata {
            topics: self.read_topics()?,
        })
    }

    fn purge(&self, topic: &str) -> Result<()> {
        let _guard = self.lock();
        let mut batch = sled::Batch::default();
        let mut deleted = 0usize;
        for item in self.db.scan_prefix(keys::topic_prefix(topic)) {
            let (key, _) = item?;
            batch.remove(key);
            deleted += 1;
        }
        self.db.apply_batch(batch)?;
        tracing::debug!(topic, deleted, "purged topic");
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Per-topic counts, handy for inspection and assertions: how many messages
/// sit in each of the three collections.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TopicDepths {
    pub queued: u64,
    pub outstanding: u64,
    pub delayed: u64,
}

impl SledStore {
    /// Count the messages currently in each collection of `topic`.
    pub fn depths(&self, topic: &str) -> Result<TopicDepths> {
        let _guard = self.lock();
        let head = match self.db.get(keys::head(topic))? {
            Some(raw) => keys::decode_pos(&raw)?,
            None => return Ok(TopicDepths::default()),
        };
        let tail = match self.db.get(keys::tail(topic))? {
            Some(raw) => keys::decode_pos(&raw)?,
            None => return Ok(TopicDepths::default()),
        };

        let ack_tail_key = keys::ack_tail(topic);
        let mut outstanding = 0u64;
        for item in self.db.scan_prefix(format!("t-{topic}-ack-").as_bytes()) {
            let (key, _) = item?;
            if key.as_ref() != ack_tail_key.as_slice() {
                outstanding += 1;
            }
        }
        let mut delayed = 0u64;
        for item in self.db.scan_prefix(keys::delay_prefix(topic)) {
            item?;
            delayed += 1;
        }

        Ok(TopicDepths {
            queued: (tail - head).max(0) as u64,
            outstanding,
            delayed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn open_store() -> (SledStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SledStore::open(dir.path().join("db")).expect("open");
        (store, dir)
    }

    fn val(payload: &'static [u8]) -> Value {
        Value::new(Bytes::from_static(payload))
    }

    fn in_future(secs: u64) -> SystemTime {
        SystemTime::now() + Duration::from_secs(secs)
    }

    #[test]
    fn insert_then_get_next_is_fifo() {
        let (store, _dir) = open_store();
        store.insert("orders", &val(b"a")).expect("insert");
        store.insert("orders", &val(b"b")).expect("insert");

        let (first, off_a) = store.get_next("orders").expect("next");
        assert_eq!(first.raw, Bytes::from_static(b"a"));
        assert_eq!(off_a, 0);
        store.ack("orders", off_a).expect("ack");

        let (second, off_b) = store.get_next("orders").expect("next");
        assert_eq!(second.raw, Bytes::from_static(b"b"));
        assert_eq!(off_b, 1);
    }

    #[test]
    fn get_next_on_unknown_topic() {
        let (store, _dir) = open_store();
        let err = store.get_next("missing").expect_err("missing");
        assert!(matches!(err, StoreError::TopicNotExist));
    }

    #[test]
    fn get_next_on_drained_topic() {
        let (store, _dir) = open_store();
        store.insert("orders", &val(b"a")).expect("insert");
        store.get_next("orders").expect("next");
        let err = store.get_next("orders").expect_err("drained");
        assert!(matches!(err, StoreError::TopicEmpty));
    }

    #[test]
    fn nack_returns_message_to_the_front() {
        let (store, _dir) = open_store();
        store.insert("orders", &val(b"a")).expect("insert");
        store.insert("orders", &val(b"b")).expect("insert");

        let (_, offset) = store.get_next("orders").expect("next");
        store.nack("orders", offset).expect("nack");

        // The nacked message comes back first, with a fresh ack offset.
        let (redelivered, offset) = store.get_next("orders").expect("next");
        assert_eq!(redelivered.raw, Bytes::from_static(b"a"));
        assert_eq!(offset, 1);
    }

    #[test]
    fn nack_of_missing_offset_fails() {
        let (store, _dir) = open_store();
        store.insert("orders", &val(b"a")).expect("insert");
        let (_, offset) = store.get_next("orders").expect("next");
        store.nack("orders", offset).expect("nack");
        let err = store.nack("orders", offset).expect_err("double nack");
        assert!(matches!(err, StoreError::NackMsgNotExist));
    }

    #[test]
    fn back_returns_message_to_the_tail() {
        let (store, _dir) = open_store();
        store.insert("orders", &val(b"a")).expect("insert");
        store.insert("orders", &val(b"b")).expect("insert");

        let (_, offset) = store.get_next("orders").expect("next");
        store.back("orders", offset).expect("back");

        let (next, _) = store.get_next("orders").expect("next");
        assert_eq!(next.raw, Bytes::from_static(b"b"));
        let (last, _) = store.get_next("orders").expect("next");
        assert_eq!(last.raw, Bytes::from_static(b"a"));
    }

    #[test]
    fn back_of_missing_offset_fails() {
        let (store, _dir) = open_store();
        store.insert("orders", &val(b"a")).expect("insert");
        let (_, offset) = store.get_next("orders").expect("next");
        store.ack("orders", offset).expect("ack");
        let err = store.back("orders", offset).expect_err("acked");
        assert!(matches!(err, StoreError::BackMsgNotExist));
    }

    #[test]
    fn dack_moves_message_to_the_delay_queue() {
        let (store, _dir) = open_store();
        store.insert("orders", &val(b"a")).expect("insert");
        let (_, offset) = store.get_next("orders").expect("next");
        store.dack("orders", offset, 60).expect("dack");

        // Gone from the main queue and the outstanding set.
        assert!(matches!(
            store.get_next("orders").expect_err("empty"),
            StoreError::TopicEmpty
        ));
        assert!(matches!(
            store.dack("orders", offset, 60).expect_err("moved"),
            StoreError::DackMsgNotExist
        ));

        let delayed: Vec<_> = store
            .delayed("orders")
            .collect::<Result<_>>()
            .expect("iterate");
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].value.raw, Bytes::from_static(b"a"));
        assert_eq!(delayed[0].value.dack_count, 1);
    }

    #[test]
    fn return_delayed_requeues_due_messages() {
        let (store, _dir) = open_store();
        store.insert("orders", &val(b"a")).expect("insert");
        let (_, offset) = store.get_next("orders").expect("next");
        store.dack("orders", offset, 0).expect("dack");

        let moved = store
            .return_delayed("orders", in_future(2))
            .expect("return");
        assert_eq!(moved, 1);

        let (value, offset) = store.get_next("orders").expect("next");
        assert_eq!(value.raw, Bytes::from_static(b"a"));
        assert_eq!(value.dack_count, 1);
        assert_eq!(offset, 1);
    }

    #[test]
    fn return_delayed_leaves_future_messages() {
        let (store, _dir) = open_store();
        store.insert("orders", &val(b"a")).expect("insert");
        let (_, offset) = store.get_next("orders").expect("next");
        store.dack("orders", offset, 3600).expect("dack");

        let moved = store
            .return_delayed("orders", SystemTime::now())
            .expect("return");
        assert_eq!(moved, 0);
        assert_eq!(store.delayed("orders").count(), 1);
    }

    #[test]
    fn same_second_delays_get_distinct_sequences() {
        let (store, _dir) = open_store();
        store.insert("orders", &val(b"a")).expect("insert");
        store.insert("orders", &val(b"b")).expect("insert");
        let (_, off_a) = store.get_next("orders").expect("next");
        let (_, off_b) = store.get_next("orders").expect("next");
        store.dack("orders", off_a, 30).expect("dack a");
        store.dack("orders", off_b, 30).expect("dack b");

        let delayed: Vec<_> = store
            .delayed("orders")
            .collect::<Result<_>>()
            .expect("iterate");
        assert_eq!(delayed.len(), 2);
        assert_eq!(delayed[0].value.raw, Bytes::from_static(b"a"));
        assert_eq!(delayed[1].value.raw, Bytes::from_static(b"b"));
    }

    #[test]
    fn sweep_prepends_in_reverse_chronological_order() {
        // Two messages returned by one sweep surface newest-first. Pinned so
        // a change here is deliberate rather than accidental.
        let (store, _dir) = open_store();
        store.insert("orders", &val(b"a")).expect("insert");
        store.insert("orders", &val(b"b")).expect("insert");
        let (_, off_a) = store.get_next("orders").expect("next");
        let (_, off_b) = store.get_next("orders").expect("next");
        store.dack("orders", off_a, 0).expect("dack a");
        store.dack("orders", off_b, 0).expect("dack b");

        let moved = store
            .return_delayed("orders", in_future(2))
            .expect("return");
        assert_eq!(moved, 2);

        let (first, _) = store.get_next("orders").expect("next");
        assert_eq!(first.raw, Bytes::from_static(b"b"));
        let (second, _) = store.get_next("orders").expect("next");
        assert_eq!(second.raw, Bytes::from_static(b"a"));
    }

    #[test]
    fn dack_count_accumulates_over_rounds() {
        let (store, _dir) = open_store();
        store.insert("orders", &val(b"a")).expect("insert");

        for round in 1..=3u32 {
            let (_, offset) = store.get_next("orders").expect("next");
            store.dack("orders", offset, 0).expect("dack");
            store
                .return_delayed("orders", in_future(2))
                .expect("return");
            let (value, offset) = store.get_next("orders").expect("next");
            assert_eq!(value.dack_count, round);
            store.nack("orders", offset).expect("nack");
        }
    }

    #[test]
    fn ack_offsets_are_monotonic() {
        let (store, _dir) = open_store();
        let mut last = -1;
        for payload in [b"a", b"b", b"c"] {
            store
                .insert("orders", &Value::new(Bytes::copy_from_slice(payload)))
                .expect("insert");
        }
        for _ in 0..3 {
            let (_, offset) = store.get_next("orders").expect("next");
            assert!(offset > last);
            last = offset;
            store.nack("orders", offset).expect("nack");
        }
    }

    #[test]
    fn meta_lists_each_topic_once() {
        let (store, _dir) = open_store();
        store.insert("alpha", &val(b"1")).expect("insert");
        store.insert("alpha", &val(b"2")).expect("insert");
        store.insert("beta", &val(b"3")).expect("insert");

        let meta = store.meta().expect("meta");
        assert_eq!(meta.topics, vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[test]
    fn purge_then_reinsert_restarts_the_topic() {
        let (store, _dir) = open_store();
        store.insert("orders", &val(b"a")).expect("insert");
        store.purge("orders").expect("purge");

        assert!(matches!(
            store.get_next("orders").expect_err("purged"),
            StoreError::TopicNotExist
        ));

        store.insert("orders", &val(b"b")).expect("insert");
        let (value, offset) = store.get_next("orders").expect("next");
        assert_eq!(value.raw, Bytes::from_static(b"b"));
        assert_eq!(offset, 0);
    }

    #[test]
    fn purge_is_idempotent_and_keeps_metadata() {
        let (store, _dir) = open_store();
        store.insert("orders", &val(b"a")).expect("insert");
        store.purge("orders").expect("purge");
        store.purge("orders").expect("purge again");

        // The topic list deliberately keeps the purged name.
        let meta = store.meta().expect("meta");
        assert_eq!(meta.topics, vec!["orders".to_string()]);
    }

    #[test]
    fn purge_spares_topics_sharing_a_name_prefix() {
        let (store, _dir) = open_store();
        store.insert("a", &val(b"one")).expect("insert");
        store.insert("ab", &val(b"two")).expect("insert");

        store.purge("a").expect("purge");

        let (value, _) = store.get_next("ab").expect("next");
        assert_eq!(value.raw, Bytes::from_static(b"two"));
    }

    #[test]
    fn reopening_resumes_exact_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db");

        let outstanding_offset;
        {
            let store = SledStore::open(&path).expect("open");
            store.insert("orders", &val(b"a")).expect("insert");
            store.insert("orders", &val(b"b")).expect("insert");
            let (_, offset) = store.get_next("orders").expect("next");
            outstanding_offset = offset;
            store.close().expect("close");
        }

        let store = SledStore::open(&path).expect("reopen");
        // The queued message is still next in line.
        let (value, offset) = store.get_next("orders").expect("next");
        assert_eq!(value.raw, Bytes::from_static(b"b"));
        assert_eq!(offset, 1);
        // The message left outstanding before shutdown can still be nacked.
        store.nack("orders", outstanding_offset).expect("nack");
        let (value, _) = store.get_next("orders").expect("next");
        assert_eq!(value.raw, Bytes::from_static(b"a"));
    }

    #[test]
    fn inserted_dack_count_survives_delivery() {
        let (store, _dir) = open_store();
        let value = Value {
            raw: Bytes::from_static(b"seen before"),
            dack_count: 5,
        };
        store.insert("orders", &value).expect("insert");
        let (delivered, _) = store.get_next("orders").expect("next");
        assert_eq!(delivered.dack_count, 5);
    }

    #[test]
    fn depths_track_all_three_collections() {
        let (store, _dir) = open_store();
        store.insert("orders", &val(b"a")).expect("insert");
        store.insert("orders", &val(b"b")).expect("insert");
        store.insert("orders", &val(b"c")).expect("insert");
        let (_, _off_a) = store.get_next("orders").expect("next");
        let (_, off_b) = store.get_next("orders").expect("next");
        store.dack("orders", off_b, 60).expect("dack");

        let depths = store.depths("orders").expect("depths");
        assert_eq!(
            depths,
            TopicDepths {
                queued: 1,
                outstanding: 1,
                delayed: 1,
            }
        );
    }

    #[test]
    fn every_unacked_message_sits_in_exactly_one_collection() {
        // Mixed workload; inserted minus acked must equal queued plus
        // outstanding plus delayed at every step's end state.
        let (store, _dir) = open_store();
        for payload in [b"1", b"2", b"3", b"4", b"5"] {
            store
                .insert("orders", &Value::new(Bytes::copy_from_slice(payload)))
                .expect("insert");
        }
        let (_, off_a) = store.get_next("orders").expect("next");
        let (_, off_b) = store.get_next("orders").expect("next");
        let (_, off_c) = store.get_next("orders").expect("next");

        store.ack("orders", off_a).expect("ack");
        store.nack("orders", off_b).expect("nack");
        store.dack("orders", off_c, 60).expect("dack");

        // 5 inserted, 1 acked: 3 queued + 0 outstanding + 1 delayed.
        let depths = store.depths("orders").expect("depths");
        assert_eq!(
            depths,
            TopicDepths {
                queued: 3,
                outstanding: 0,
                delayed: 1,
            }
        );
    }

    #[test]
    fn destroy_removes_the_database_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db");
        let store = SledStore::open(&path).expect("open");
        store.insert("orders", &val(b"a")).expect("insert");
        store.destroy().expect("destroy");
        assert!(!path.exists());
    }
}
