//! Broker core for miniqueue.
//!
//! The broker routes published messages into the store and wakes exactly one
//! waiting consumer per state change. Delivery itself is pull-based: each
//! consumer drives its own `next`/ack cycle against the store, so a dropped
//! wakeup costs nothing but latency until the next publish.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use miniqueue_store::{Metadata, StoreError, TopicStore, Value};

mod consumer;

pub use consumer::{Consumer, ConsumerError};

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("consumer not found")]
    ConsumerNotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a consumer is being woken. Carried through the 1-slot signal so a
/// blocked `next` can tell a fresh publish from a requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A new message was published to the topic.
    Publish,
    /// The delay sweeper moved at least one message back to the main queue.
    MsgReturned,
    /// Another consumer returned its message to the front of the queue.
    Nack,
    /// Another consumer returned its message to the back of the queue.
    Back,
}

struct Subscription {
    id: String,
    // 1-slot channel; delivery is try_send so signalling never blocks.
    events: mpsc::Sender<Event>,
}

/// Live consumers per topic. Shared between the broker and every consumer
/// handle: a consumer only needs [`SubscriberTable::notify`], the narrow
/// capability to wake its competitors after a nack or back.
#[derive(Default)]
pub struct SubscriberTable {
    inner: RwLock<HashMap<String, Vec<Subscription>>>,
}

impl std::fmt::Debug for SubscriberTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberTable").finish_non_exhaustive()
    }
}

impl SubscriberTable {
    async fn add(&self, topic: &str, id: String, events: mpsc::Sender<Event>) {
        let mut table = self.inner.write().await;
        table
            .entry(topic.to_string())
            .or_default()
            .push(Subscription { id, events });
    }

    async fn remove(&self, topic: &str, id: &str) -> Result<()> {
        let mut table = self.inner.write().await;
        let subs = table.get_mut(topic).ok_or(BrokerError::ConsumerNotFound)?;
        let before = subs.len();
        subs.retain(|sub| sub.id != id);
        if subs.len() == before {
            return Err(BrokerError::ConsumerNotFound);
        }
        if subs.is_empty() {
            table.remove(topic);
        }
        Ok(())
    }

    /// Offer `event` to the first consumer on `topic` whose signal slot is
    /// free. Best-effort: with every slot full the event is dropped, and the
    /// queue state is observed directly by the next `next` call.
    pub async fn notify(&self, topic: &str, event: Event) {
        let table = self.inner.read().await;
        let Some(subs) = table.get(topic) else {
            return;
        };
        for sub in subs {
            if sub.events.try_send(event).is_ok() {
                return;
            }
        }
        tracing::trace!(topic, ?event, "no consumer free to take event");
    }

    async fn len(&self, topic: &str) -> usize {
        self.inner
            .read()
            .await
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// The broker: topics live in the store, consumers in the subscriber table.
///
/// ```no_run
/// use std::sync::Arc;
/// use bytes::Bytes;
/// use miniqueue_broker::Broker;
/// use miniqueue_store::{SledStore, Value};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let store = Arc::new(SledStore::open("./miniqueue")?);
/// let broker = Broker::new(store);
/// let mut consumer = broker.subscribe("orders").await;
/// broker.publish("orders", Value::new(Bytes::from_static(b"hi"))).await?;
/// let value = consumer.next(&CancellationToken::new()).await?;
/// assert_eq!(value.raw, Bytes::from_static(b"hi"));
/// consumer.ack()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Broker {
    store: Arc<dyn TopicStore>,
    subscribers: Arc<SubscriberTable>,
}

impl Broker {
    pub fn new(store: Arc<dyn TopicStore>) -> Self {
        Self {
            store,
            subscribers: Arc::new(SubscriberTable::default()),
        }
    }

    /// Append a message to the topic and wake one waiting consumer.
    pub async fn publish(&self, topic: &str, value: Value) -> Result<()> {
        self.store.insert(topic, &value)?;
        self.subscribers.notify(topic, Event::Publish).await;
        Ok(())
    }

    /// Register a new consumer on the topic and hand back its handle. The
    /// handle is not safe for concurrent use; callers serialise its calls.
    pub async fn subscribe(&self, topic: &str) -> Consumer {
        let id = uuid::Uuid::new_v4().to_string();
        let (events_tx, events_rx) = mpsc::channel(1);
        self.subscribers.add(topic, id.clone(), events_tx).await;
        tracing::debug!(topic, id, "consumer subscribed");
        Consumer::new(
            id,
            topic.to_string(),
            Arc::clone(&self.store),
            Arc::clone(&self.subscribers),
            events_rx,
        )
    }

    /// Drop the consumer with `id` from the topic. The caller is responsible
    /// for nacking any message the consumer still holds, before removal.
    pub async fn unsubscribe(&self, topic: &str, id: &str) -> Result<()> {
        self.subscribers.remove(topic, id).await?;
        tracing::debug!(topic, id, "consumer unsubscribed");
        Ok(())
    }

    /// Wipe the topic from the store. Existing consumer handles stay
    /// registered; their next `next` blocks until a new publish re-creates
    /// the topic.
    pub async fn purge(&self, topic: &str) -> Result<()> {
        self.store.purge(topic)?;
        Ok(())
    }

    /// Names of every topic the store has seen.
    pub fn topics(&self) -> Result<Vec<String>> {
        Ok(self.store.meta()?.topics)
    }

    /// The persisted store metadata.
    pub fn meta(&self) -> Result<Metadata> {
        Ok(self.store.meta()?)
    }

    /// Number of live consumers on `topic`.
    pub async fn consumer_count(&self, topic: &str) -> usize {
        self.subscribers.len(topic).await
    }

    /// Background loop returning due delayed messages to their main queues.
    /// Runs until `cancel` fires; sweep failures are logged and the loop
    /// carries on at the next tick.
    pub async fn process_delays(&self, period: Duration, cancel: CancellationToken) {
        loop {
            self.sweep_delays_once().await;
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = cancel.cancelled() => {
                    tracing::debug!("delay sweeper stopped");
                    return;
                }
            }
        }
    }

    async fn sweep_delays_once(&self) {
        let topics = match self.store.meta() {
            Ok(meta) => meta.topics,
            Err(err) => {
                tracing::warn!(error = %err, "delay sweep could not read topic list");
                return;
            }
        };
        for topic in topics {
            match self.store.return_delayed(&topic, SystemTime::now()) {
                Ok(0) => {}
                Ok(count) => {
                    tracing::debug!(topic, count, "returned delayed messages");
                    self.subscribers.notify(&topic, Event::MsgReturned).await;
                }
                Err(err) => {
                    tracing::warn!(topic, error = %err, "delay sweep failed");
                }
            }
        }
    }

    /// Flush the store. Called on shutdown.
    pub fn close(&self) -> Result<()> {
        self.store.flush()?;
        Ok(())
    }
}
