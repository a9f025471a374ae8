//! Thingbus CLI entry point

mod cli;

use crate::cli::{Cli, Commands, TokenCommands};
use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use thingbus::auth::{
    Authority, Claims, CredentialAuthority, HttpAuthority, PrincipalKind, ServiceKey,
};
use thingbus::ingest::MqttConfig;
use thingbus::server::{GatewayConfig, ThingbusServer, ThingbusServerConfig};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve {
            gateway_bind,
            authority_bind,
            redis_url,
            nats_url,
            mqtt_host,
            mqtt_port,
            mqtt_user,
            mqtt_pass,
            auth_timeout_secs,
            forward_capacity,
        } => {
            let secret = cli.secret.context("THINGBUS_SECRET or --secret required")?;
            let mqtt = mqtt_host.map(|host| MqttConfig {
                username: mqtt_user,
                password: mqtt_pass,
                ..MqttConfig::new(host, mqtt_port)
            });

            let config = ThingbusServerConfig {
                gateway_addr: gateway_bind.parse().context("Invalid gateway bind address")?,
                authority_addr: authority_bind.parse().context("Invalid authority bind address")?,
                secret: secret.into_bytes(),
                issuer: cli.environment,
                service_key: cli.service_key,
                redis_url,
                nats_url,
                mqtt,
                gateway: GatewayConfig {
                    auth_timeout: Duration::from_secs(auth_timeout_secs),
                    forward_capacity,
                },
            };
            serve(config).await
        }
        Commands::Token { command } => {
            let authority = authority(
                cli.secret,
                cli.environment,
                cli.authority_url,
                cli.service_key,
            )?;
            token(authority, command).await
        }
        Commands::Verify { kind, token } => {
            let authority = authority(
                cli.secret,
                cli.environment,
                cli.authority_url,
                cli.service_key,
            )?;
            verify(authority, kind, &token).await
        }
    }
}

/// Local authority from the shared secret, or a running one over HTTP
fn authority(
    secret: Option<String>,
    issuer: String,
    authority_url: Option<String>,
    service_key: Option<String>,
) -> Result<Arc<dyn Authority>> {
    if let Some(url) = authority_url {
        let mut remote = HttpAuthority::new(url).context("Invalid authority URL")?;
        if let Some(key) = service_key {
            remote = remote.with_service_key(ServiceKey::new(key));
        }
        return Ok(Arc::new(remote));
    }

    let secret = secret.context("THINGBUS_SECRET, --secret or --authority-url required")?;
    Ok(Arc::new(CredentialAuthority::new(secret.into_bytes(), issuer)))
}

async fn serve(config: ThingbusServerConfig) -> Result<()> {
    let server = ThingbusServer::new(config).await?;

    info!("Starting Thingbus server...");
    server.run(shutdown_signal()).await
}

async fn token(authority: Arc<dyn Authority>, command: TokenCommands) -> Result<()> {
    let token = match command {
        TokenCommands::Admin => authority.admin_token().await,
        TokenCommands::User { user_id } => authority.user_token(&user_id).await,
        TokenCommands::Thing { thing_id, user_id } => authority.thing_token(&thing_id, &user_id).await,
    }
    .context("Failed to issue credential")?;

    println!("{}", token);
    Ok(())
}

async fn verify(authority: Arc<dyn Authority>, kind: PrincipalKind, token: &str) -> Result<()> {
    let claims = authority
        .validate(kind, token)
        .await
        .with_context(|| format!("Not a valid {} credential", kind))?;

    let json = match &claims {
        Claims::User(c) => serde_json::to_string_pretty(c)?,
        Claims::Thing(c) => serde_json::to_string_pretty(c)?,
    };
    println!("{}", json);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
