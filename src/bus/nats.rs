//! Relay bus on a NATS server
//!
//! Subjects map one to one onto NATS subjects, so any NATS client can watch
//! `thingsMsg.>` and the ingestion side and the gateway can live in
//! different processes.

use crate::bus::local::DEFAULT_SUBSCRIPTION_CAPACITY;
use crate::bus::{BusError, BusSubscription, RelayBus, RelayMessage, Subject};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Relay bus backed by a NATS connection
#[derive(Clone)]
pub struct NatsBus {
    client: async_nats::Client,
    /// Per-subscription forwarding tasks; dropping the NATS subscriber
    /// inside one unsubscribes on the server
    forwarders: Arc<DashMap<Uuid, JoinHandle<()>>>,
    capacity: usize,
}

impl NatsBus {
    /// Connect to `url`, e.g. `nats://localhost:4222`
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = async_nats::ConnectOptions::new()
            .name("thingbus")
            .connect(url)
            .await
            .map_err(|e| BusError::Backend(e.to_string()))?;

        info!(url = %url, "Connected to NATS relay bus");
        Ok(Self {
            client,
            forwarders: Arc::new(DashMap::new()),
            capacity: DEFAULT_SUBSCRIPTION_CAPACITY,
        })
    }

    /// Number of live subscriptions held by this process
    pub fn subscription_count(&self) -> usize {
        self.forwarders.len()
    }
}

#[async_trait]
impl RelayBus for NatsBus {
    /// Subscribers are remote, so the reached count is always 0
    async fn publish(&self, subject: &Subject, payload: Vec<u8>) -> Result<usize, BusError> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BusError::Backend(e.to_string()))?;
        Ok(0)
    }

    async fn subscribe(&self, subject: &Subject) -> Result<BusSubscription, BusError> {
        let mut subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::Backend(e.to_string()))?;

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.capacity);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    msg = subscriber.next() => {
                        let Some(msg) = msg else { break };
                        let relay = RelayMessage {
                            subject: msg.subject.to_string(),
                            payload: msg.payload.to_vec(),
                        };
                        match tx.try_send(relay) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                debug!(
                                    subscription_id = %id,
                                    "Subscription queue full, message dropped"
                                );
                            }
                            Err(TrySendError::Closed(_)) => break,
                        }
                    }
                }
            }
        });
        self.forwarders.insert(id, handle);

        debug!(subscription_id = %id, subject = %subject, "NATS subscription opened");
        Ok(BusSubscription::new(id, subject.clone(), rx))
    }

    async fn unsubscribe(&self, id: Uuid) -> Result<(), BusError> {
        if let Some((_, handle)) = self.forwarders.remove(&id) {
            handle.abort();
            debug!(subscription_id = %id, "NATS subscription closed");
        }
        Ok(())
    }
}
