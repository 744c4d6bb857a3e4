// Per-subscription consumer handle: owns the outstanding offset and the
// 1-slot wakeup signal.
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use miniqueue_store::{StoreError, TopicStore, Value};

use crate::{Event, SubscriberTable};

pub type Result<T> = std::result::Result<T, ConsumerError>;

#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
    #[error("a message is already outstanding for this consumer")]
    OutstandingMessage,
    #[error("no message outstanding")]
    NoOutstanding,
    #[error("request cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Handle for one subscription. Serialises a single consumer's
/// next/ack/nack/back/dack cycle; not safe for concurrent use, so callers
/// drive it from one task.
#[derive(Debug)]
pub struct Consumer {
    id: String,
    topic: String,
    // Ack offset of the delivered-but-unacknowledged message, if any.
    outstanding: Option<i64>,
    events: mpsc::Receiver<Event>,
    store: Arc<dyn TopicStore>,
    subscribers: Arc<SubscriberTable>,
}

impl Consumer {
    pub(crate) fn new(
        id: String,
        topic: String,
        store: Arc<dyn TopicStore>,
        subscribers: Arc<SubscriberTable>,
        events: mpsc::Receiver<Event>,
    ) -> Self {
        Self {
            id,
            topic,
            outstanding: None,
            events,
            store,
            subscribers,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn has_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Fetch the next message, blocking on the wakeup signal while the topic
    /// is empty or absent. Fails fast with [`ConsumerError::OutstandingMessage`]
    /// if the previous delivery has not been resolved, and with
    /// [`ConsumerError::Cancelled`] once `cancel` fires.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Result<Value> {
        if self.outstanding.is_some() {
            return Err(ConsumerError::OutstandingMessage);
        }
        loop {
            match self.store.get_next(&self.topic) {
                Ok((value, ack_offset)) => {
                    self.outstanding = Some(ack_offset);
                    tracing::trace!(
                        topic = %self.topic,
                        id = %self.id,
                        ack_offset,
                        "delivered message"
                    );
                    return Ok(value);
                }
                Err(StoreError::TopicEmpty) | Err(StoreError::TopicNotExist) => {
                    tokio::select! {
                        event = self.events.recv() => {
                            // A None here means the subscription was removed
                            // out from under us; stop waiting.
                            if event.is_none() {
                                return Err(ConsumerError::Cancelled);
                            }
                        }
                        _ = cancel.cancelled() => return Err(ConsumerError::Cancelled),
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Acknowledge the outstanding message; it is gone for good.
    pub fn ack(&mut self) -> Result<()> {
        let ack_offset = self.outstanding.ok_or(ConsumerError::NoOutstanding)?;
        self.store.ack(&self.topic, ack_offset)?;
        self.outstanding = None;
        Ok(())
    }

    /// Return the outstanding message to the front of the queue and wake a
    /// competing consumer to pick it up.
    pub async fn nack(&mut self) -> Result<()> {
        let ack_offset = self.outstanding.ok_or(ConsumerError::NoOutstanding)?;
        self.store.nack(&self.topic, ack_offset)?;
        self.outstanding = None;
        self.subscribers.notify(&self.topic, Event::Nack).await;
        Ok(())
    }

    /// Return the outstanding message to the back of the queue and wake a
    /// competing consumer.
    pub async fn back(&mut self) -> Result<()> {
        let ack_offset = self.outstanding.ok_or(ConsumerError::NoOutstanding)?;
        self.store.back(&self.topic, ack_offset)?;
        self.outstanding = None;
        self.subscribers.notify(&self.topic, Event::Back).await;
        Ok(())
    }

    /// Defer the outstanding message for `delay_seconds`; the sweeper
    /// re-queues it once due, so no signal is sent here.
    pub fn dack(&mut self, delay_seconds: u32) -> Result<()> {
        let ack_offset = self.outstanding.ok_or(ConsumerError::NoOutstanding)?;
        self.store.dack(&self.topic, ack_offset, delay_seconds)?;
        self.outstanding = None;
        Ok(())
    }
}
