//! In-process relay bus

use crate::bus::{BusError, BusSubscription, RelayBus, RelayMessage, Subject};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;
use uuid::Uuid;

/// Default per-subscription queue depth
pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 1024;

struct Subscriber {
    subject: String,
    tx: mpsc::Sender<RelayMessage>,
}

/// Relay bus living inside the process, shared by the ingestion authorizer
/// and the gateway.
#[derive(Clone)]
pub struct LocalBus {
    /// All subscriptions by id
    subscribers: Arc<DashMap<Uuid, Subscriber>>,
    /// Index: subject -> subscription ids
    subject_index: Arc<DashMap<String, HashSet<Uuid>>>,
    capacity: usize,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIPTION_CAPACITY)
    }

    /// Bus whose subscriptions each buffer up to `capacity` messages
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(DashMap::new()),
            subject_index: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Number of live subscriptions on one subject
    pub fn subscriber_count(&self, subject: &Subject) -> usize {
        self.subject_index
            .get(subject.as_str())
            .map(|ids| ids.len())
            .unwrap_or(0)
    }

    fn remove(&self, id: Uuid) {
        if let Some((_, sub)) = self.subscribers.remove(&id) {
            let now_empty = match self.subject_index.get_mut(&sub.subject) {
                Some(mut ids) => {
                    ids.remove(&id);
                    ids.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.subject_index.remove_if(&sub.subject, |_, ids| ids.is_empty());
            }
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayBus for LocalBus {
    async fn publish(&self, subject: &Subject, payload: Vec<u8>) -> Result<usize, BusError> {
        let ids: Vec<Uuid> = match self.subject_index.get(subject.as_str()) {
            Some(ids) => ids.iter().copied().collect(),
            None => Vec::new(),
        };

        if ids.is_empty() {
            debug!(subject = %subject, "No subscribers for subject");
            return Ok(0);
        }

        let msg = RelayMessage {
            subject: subject.to_string(),
            payload,
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for id in ids {
            let Some(sub) = self.subscribers.get(&id) else {
                continue;
            };
            match sub.tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(subscription_id = %id, subject = %subject, "Subscription queue full, message dropped");
                }
                Err(TrySendError::Closed(_)) => closed.push(id),
            }
        }

        // Receivers dropped without unsubscribing
        for id in closed {
            debug!(subscription_id = %id, "Removing closed subscription");
            self.remove(id);
        }

        Ok(delivered)
    }

    async fn subscribe(&self, subject: &Subject) -> Result<BusSubscription, BusError> {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.capacity);

        self.subscribers.insert(
            id,
            Subscriber {
                subject: subject.to_string(),
                tx,
            },
        );
        self.subject_index
            .entry(subject.to_string())
            .or_default()
            .insert(id);

        debug!(subscription_id = %id, subject = %subject, "Subscribed");
        Ok(BusSubscription::new(id, subject.clone(), rx))
    }

    async fn unsubscribe(&self, id: Uuid) -> Result<(), BusError> {
        self.remove(id);
        debug!(subscription_id = %id, "Unsubscribed");
        Ok(())
    }
}
