//! CLI command definitions

use clap::{Parser, Subcommand};
use thingbus::auth::PrincipalKind;

#[derive(Parser)]
#[command(name = "thingbus")]
#[command(about = "Credential authority and authenticated telemetry relay", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Credential signing secret
    #[arg(long, env = "THINGBUS_SECRET", global = true, hide_env_values = true)]
    pub secret: Option<String>,

    /// Deployment environment, used as the credential issuer
    #[arg(long, env = "THINGBUS_ENV", default_value = "development", global = true)]
    pub environment: String,

    /// Use a running authority instead of the local secret (token and verify)
    #[arg(long, env = "THINGBUS_AUTHORITY_URL", global = true)]
    pub authority_url: Option<String>,

    /// Key required to issue credentials over the authority listener
    #[arg(long, env = "THINGBUS_SERVICE_KEY", global = true, hide_env_values = true)]
    pub service_key: Option<String>,

    /// Log level
    #[arg(long, env = "RUST_LOG", default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the gateway, the authority listener and MQTT ingestion
    Serve {
        /// Viewer gateway address
        #[arg(long, env = "THINGBUS_GATEWAY_BIND", default_value = "0.0.0.0:8080")]
        gateway_bind: String,

        /// Internal authority address
        #[arg(long, env = "THINGBUS_AUTHORITY_BIND", default_value = "127.0.0.1:8081")]
        authority_bind: String,

        /// Redis URL for the token cache (in-memory when absent)
        #[arg(long, env = "REDIS_URL")]
        redis_url: Option<String>,

        /// NATS URL for the relay bus (in-process when absent)
        #[arg(long, env = "NATS_URL")]
        nats_url: Option<String>,

        /// MQTT broker host (ingestion disabled when absent)
        #[arg(long, env = "MQTT_HOST")]
        mqtt_host: Option<String>,

        #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
        mqtt_port: u16,

        #[arg(long, env = "MQTT_USER")]
        mqtt_user: Option<String>,

        #[arg(long, env = "MQTT_PASS", hide_env_values = true)]
        mqtt_pass: Option<String>,

        /// Seconds a viewer has to send its auth frame
        #[arg(long, env = "THINGBUS_AUTH_TIMEOUT_SECS", default_value_t = 10)]
        auth_timeout_secs: u64,

        /// Messages buffered per viewer before the oldest is dropped
        #[arg(long, env = "THINGBUS_FORWARD_CAPACITY", default_value_t = 256)]
        forward_capacity: usize,
    },

    /// Issue a credential
    ///
    /// Examples:
    ///   thingbus token admin
    ///   thingbus token user u1
    ///   thingbus token thing t1 u1
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Validate a credential and print its claims
    ///
    /// Examples:
    ///   thingbus verify user eyJhbGciOi...
    ///   thingbus verify thing eyJhbGciOi...
    Verify {
        /// Principal kind: admin, user or thing
        #[arg(value_parser = parse_kind)]
        kind: PrincipalKind,

        /// Credential to check
        token: String,
    },
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Admin credential (1 hour)
    Admin,

    /// User credential (24 hours)
    User {
        user_id: String,
    },

    /// Thing credential bound to its owner (24 hours)
    Thing {
        thing_id: String,
        user_id: String,
    },
}

fn parse_kind(s: &str) -> Result<PrincipalKind, String> {
    PrincipalKind::parse(s)
        .ok_or_else(|| format!("Invalid principal kind: {}. Must be admin, user or thing", s))
}
