//! Relay bus
//!
//! Authorized readings are republished on `thingsMsg.{thingId}` and fanned
//! out to every current subscriber of that subject. Delivery is at-most-once:
//! a subscriber that is gone or whose queue is full simply misses the message.
//!
//! [`LocalBus`] keeps the bus inside one process. [`NatsBus`] relays through a
//! NATS server so other processes can publish and watch the same subjects.

mod local;
mod nats;
mod subjects;

pub use local::LocalBus;
pub use nats::NatsBus;
pub use subjects::{
    ingest_topic, is_valid_thing_id, parse_ingest_topic, Subject, SubjectError,
    INGEST_TOPIC_FILTER, INGEST_TOPIC_PREFIX, RELAY_SUBJECT_PREFIX,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("bus closed")]
    Closed,

    #[error("bus error: {0}")]
    Backend(String),
}

/// A message delivered to a subscription
#[derive(Debug, Clone)]
pub struct RelayMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

/// Handle to one subscription. Dropping it stops delivery, but callers
/// should still call [`RelayBus::unsubscribe`] so the bus can clean up.
#[derive(Debug)]
pub struct BusSubscription {
    pub id: Uuid,
    pub subject: Subject,
    receiver: mpsc::Receiver<RelayMessage>,
}

impl BusSubscription {
    pub fn new(id: Uuid, subject: Subject, receiver: mpsc::Receiver<RelayMessage>) -> Self {
        Self {
            id,
            subject,
            receiver,
        }
    }

    /// Next message, or `None` once the bus has dropped this subscription
    pub async fn recv(&mut self) -> Option<RelayMessage> {
        self.receiver.recv().await
    }

    /// Next message if one is already queued
    pub fn try_recv(&mut self) -> Option<RelayMessage> {
        self.receiver.try_recv().ok()
    }
}

#[async_trait]
pub trait RelayBus: Send + Sync {
    /// Publish to every subscriber of `subject`, returning how many this
    /// process reached directly
    async fn publish(&self, subject: &Subject, payload: Vec<u8>) -> Result<usize, BusError>;

    async fn subscribe(&self, subject: &Subject) -> Result<BusSubscription, BusError>;

    /// Stop delivery to a subscription. Unknown ids are ignored.
    async fn unsubscribe(&self, id: Uuid) -> Result<(), BusError>;
}
