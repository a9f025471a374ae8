//! MQTT broker client feeding the ingestion authorizer

use crate::bus::INGEST_TOPIC_FILTER;
use crate::error::ErrorKind;
use crate::ingest::authorizer::{IngestAuthorizer, IngestError, Relayed};
use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const REQUEST_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
}

impl MqttConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            keep_alive: Duration::from_secs(5),
        }
    }

    fn options(&self, client_id: String) -> MqttOptions {
        let mut opts = MqttOptions::new(client_id, self.host.clone(), self.port);
        opts.set_keep_alive(self.keep_alive);
        opts.set_clean_session(true);
        if let Some(user) = &self.username {
            opts.set_credentials(user.clone(), self.password.clone().unwrap_or_default());
        }
        opts
    }
}

/// Random broker client id, `thingbus_<n>`
pub fn client_id() -> String {
    format!("thingbus_{}", rand::rng().random_range(0..1_000_000))
}

/// Subscribe to every thing topic and hand each publish to the authorizer in
/// its own task. Returns once `shutdown` flips to true and in-flight handlers
/// have finished.
pub async fn run_mqtt_ingest(
    config: MqttConfig,
    authorizer: Arc<IngestAuthorizer>,
    mut shutdown: watch::Receiver<bool>,
) {
    let client_id = client_id();
    info!(client_id = %client_id, host = %config.host, port = config.port, "Starting MQTT ingestion");

    let (client, mut eventloop) = AsyncClient::new(config.options(client_id), REQUEST_CAPACITY);
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Ingestion handler panicked");
                }
            }

            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(filter = INGEST_TOPIC_FILTER, "Connected to broker, subscribing");
                    if let Err(e) = client.try_subscribe(INGEST_TOPIC_FILTER, QoS::AtMostOnce) {
                        error!(error = %e, "Failed to queue subscription");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let authorizer = authorizer.clone();
                    handlers.spawn(async move {
                        let result = authorizer.process(&publish.topic, &publish.payload).await;
                        log_outcome(&publish.topic, result);
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, kind = %ErrorKind::Connection, "Broker connection error, reconnecting");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            },
        }
    }

    info!(in_flight = handlers.len(), "Stopping MQTT ingestion");
    if let Err(e) = client.try_disconnect() {
        debug!(error = %e, "Broker disconnect not sent");
    }
    while let Some(joined) = handlers.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Ingestion handler panicked");
        }
    }
}

fn log_outcome(topic: &str, result: Result<Relayed, IngestError>) {
    match result {
        Ok(relayed) => debug!(
            topic = topic,
            thing_id = %relayed.thing_id,
            delivered = relayed.delivered,
            "Message relayed"
        ),
        Err(e) => match e.kind() {
            ErrorKind::Connection => error!(topic = topic, kind = %e.kind(), error = %e, "Message dropped"),
            _ => warn!(topic = topic, kind = %e.kind(), error = %e, "Message dropped"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_format() {
        let id = client_id();
        let n: u32 = id.strip_prefix("thingbus_").unwrap().parse().unwrap();
        assert!(n < 1_000_000);
    }

    #[test]
    fn test_config_defaults() {
        let config = MqttConfig::new("localhost", 1883);
        assert_eq!(config.port, 1883);
        assert!(config.username.is_none());
        assert_eq!(config.keep_alive, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_stops_on_shutdown_without_broker() {
        use crate::auth::CredentialAuthority;
        use crate::bus::LocalBus;
        use crate::cache::MemoryTokenCache;

        let authorizer = Arc::new(IngestAuthorizer::new(
            Arc::new(CredentialAuthority::new(b"mqtt-test".to_vec(), "test")),
            Arc::new(MemoryTokenCache::new()),
            Arc::new(LocalBus::new()),
        ));
        let (tx, rx) = watch::channel(false);

        // Port 1 refuses connections; the loop keeps retrying until shutdown
        let task = tokio::spawn(run_mqtt_ingest(MqttConfig::new("127.0.0.1", 1), authorizer, rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send_replace(true);

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
