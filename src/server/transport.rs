//! Server bootstrap: wires the authority, cache, bus, registry, gateway and
//! ingestion loop together and runs the two HTTP listeners.

use crate::auth::{Authority, CredentialAuthority, ServiceKey};
use crate::bus::{LocalBus, NatsBus, RelayBus};
use crate::cache::{MemoryTokenCache, RedisCacheConfig, RedisTokenCache, TokenCache};
use crate::directory::DeviceRegistry;
use crate::ingest::{run_mqtt_ingest, IngestAuthorizer, MqttConfig};
use crate::server::authority_api::{authority_router, AuthorityApiState};
use crate::server::gateway::{create_router, Gateway, GatewayConfig};

use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

/// Thingbus server configuration
#[derive(Debug, Clone)]
pub struct ThingbusServerConfig {
    /// Viewer-facing listener
    pub gateway_addr: SocketAddr,
    /// Internal authority listener
    pub authority_addr: SocketAddr,
    /// Credential signing secret
    pub secret: Vec<u8>,
    /// Token issuer, the deployment environment name
    pub issuer: String,
    /// Key callers present to have credentials issued over HTTP
    pub service_key: Option<String>,
    /// Redis URL; in-memory cache when absent
    pub redis_url: Option<String>,
    /// NATS URL for the relay bus; in-process bus when absent
    pub nats_url: Option<String>,
    /// Broker settings; ingestion disabled when absent
    pub mqtt: Option<MqttConfig>,
    pub gateway: GatewayConfig,
}

impl ThingbusServerConfig {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            gateway_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            authority_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
            secret: secret.into(),
            issuer: "development".to_string(),
            service_key: None,
            redis_url: None,
            nats_url: None,
            mqtt: None,
            gateway: GatewayConfig::default(),
        }
    }
}

/// The assembled thingbus service
pub struct ThingbusServer {
    config: ThingbusServerConfig,
    authority: Arc<CredentialAuthority>,
    bus: Arc<dyn RelayBus>,
    /// Set when the bus is in-process
    local_bus: Option<LocalBus>,
    registry: Arc<DeviceRegistry>,
    gateway: Gateway,
    ingest: Arc<IngestAuthorizer>,
}

impl ThingbusServer {
    pub async fn new(config: ThingbusServerConfig) -> Result<Self> {
        let cache = build_cache(config.redis_url.as_deref()).await?;
        match config.nats_url.clone() {
            Some(url) => {
                let bus = NatsBus::connect(&url)
                    .await
                    .with_context(|| format!("Failed to connect to NATS at {}", url))?;
                Ok(Self::with_backends(config, cache, Arc::new(bus)))
            }
            None => {
                info!("Using in-process relay bus");
                Ok(Self::with_cache(config, cache))
            }
        }
    }

    /// Assemble the server around an existing cache backend and an
    /// in-process bus
    pub fn with_cache(config: ThingbusServerConfig, cache: Arc<dyn TokenCache>) -> Self {
        let bus = LocalBus::new();
        let mut server = Self::with_backends(config, cache, Arc::new(bus.clone()));
        server.local_bus = Some(bus);
        server
    }

    /// Assemble the server around existing cache and bus backends
    pub fn with_backends(
        config: ThingbusServerConfig,
        cache: Arc<dyn TokenCache>,
        bus: Arc<dyn RelayBus>,
    ) -> Self {
        let authority = Arc::new(CredentialAuthority::new(
            config.secret.clone(),
            config.issuer.clone(),
        ));
        let shared_authority: Arc<dyn Authority> = authority.clone();
        let registry = Arc::new(DeviceRegistry::new(shared_authority.clone(), cache.clone()));
        let gateway = Gateway::new(
            shared_authority.clone(),
            registry.clone(),
            bus.clone(),
            config.gateway.clone(),
        );
        let ingest = Arc::new(IngestAuthorizer::new(
            shared_authority,
            cache,
            bus.clone(),
        ));

        Self {
            config,
            authority,
            bus,
            local_bus: None,
            registry,
            gateway,
            ingest,
        }
    }

    pub fn authority(&self) -> Arc<CredentialAuthority> {
        self.authority.clone()
    }

    pub fn bus(&self) -> Arc<dyn RelayBus> {
        self.bus.clone()
    }

    /// The in-process bus, when the server is not relaying through NATS
    pub fn local_bus(&self) -> Option<LocalBus> {
        self.local_bus.clone()
    }

    pub fn registry(&self) -> Arc<DeviceRegistry> {
        self.registry.clone()
    }

    pub fn gateway(&self) -> Gateway {
        self.gateway.clone()
    }

    /// Ingestion entry point, for feeding messages without a broker
    pub fn ingest(&self) -> Arc<IngestAuthorizer> {
        self.ingest.clone()
    }

    /// Bind both listeners and run until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let gateway_listener = TcpListener::bind(self.config.gateway_addr)
            .await
            .with_context(|| format!("Failed to bind gateway on {}", self.config.gateway_addr))?;
        let authority_listener = TcpListener::bind(self.config.authority_addr)
            .await
            .with_context(|| format!("Failed to bind authority on {}", self.config.authority_addr))?;

        self.serve(gateway_listener, authority_listener, shutdown).await
    }

    /// Run on already-bound listeners until `shutdown` resolves
    pub async fn serve<F>(
        self,
        gateway_listener: TcpListener,
        authority_listener: TcpListener,
        shutdown: F,
    ) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);

        info!(addr = %gateway_listener.local_addr()?, "Gateway listening");
        let gateway_app = create_router(self.gateway.clone());
        let gateway_stop = stop_rx.clone();
        let gateway_task = tokio::spawn(async move {
            axum::serve(gateway_listener, gateway_app)
                .with_graceful_shutdown(wait_for_stop(gateway_stop))
                .await
        });

        info!(addr = %authority_listener.local_addr()?, "Authority listening");
        if self.config.service_key.is_none() {
            info!("No service key configured, credential issuance over HTTP disabled");
        }
        let authority_app = authority_router(AuthorityApiState {
            authority: self.authority.clone(),
            registry: self.registry.clone(),
            service_key: self.config.service_key.clone().map(ServiceKey::new),
        });
        let authority_stop = stop_rx.clone();
        let authority_task = tokio::spawn(async move {
            axum::serve(authority_listener, authority_app)
                .with_graceful_shutdown(wait_for_stop(authority_stop))
                .await
        });

        let ingest_task = match self.config.mqtt.clone() {
            Some(mqtt) => Some(tokio::spawn(run_mqtt_ingest(
                mqtt,
                self.ingest.clone(),
                stop_rx.clone(),
            ))),
            None => {
                info!("No broker configured, MQTT ingestion disabled");
                None
            }
        };

        shutdown.await;
        info!("Shutting down");

        stop_tx.send_replace(true);
        self.gateway.shutdown_signal().stop();

        if let Some(task) = ingest_task {
            if let Err(e) = task.await {
                warn!(error = %e, "Ingestion task failed");
            }
        }
        gateway_task.await.context("Gateway task panicked")??;
        authority_task.await.context("Authority task panicked")??;

        // Upgraded sockets outlive the HTTP server
        let open = self.gateway.active_connections();
        if open > 0 {
            info!(connections = open, "Waiting for viewer connections to close");
        }
        self.gateway.shutdown().await;

        info!("Thingbus stopped");
        Ok(())
    }
}

async fn build_cache(redis_url: Option<&str>) -> Result<Arc<dyn TokenCache>> {
    let Some(url) = redis_url else {
        info!("Using in-memory token cache");
        return Ok(Arc::new(MemoryTokenCache::new()));
    };

    let cache = RedisTokenCache::new(RedisCacheConfig::new(url)).context("Invalid REDIS_URL")?;
    // Unreachable Redis degrades every lookup to a miss
    match cache.ping().await {
        Ok(()) => info!("Connected to Redis token cache"),
        Err(e) => warn!(error = %e, "Redis unreachable, ingestion will fall back to the authority"),
    }
    Ok(Arc::new(cache))
}

async fn wait_for_stop(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}
