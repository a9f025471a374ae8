//! Thingbus - authenticated telemetry relay for IoT devices
//!
//! Devices publish readings to an MQTT broker with a signed credential. The
//! ingestion authorizer checks that the credential belongs to the publishing
//! thing and republishes the readings on the relay bus. Viewers connect to
//! the subscription gateway over WebSocket and receive the readings of the
//! things they own.

pub mod auth;
pub mod bus;
pub mod cache;
pub mod directory;
pub mod error;
pub mod ingest;
pub mod server;

pub use auth::{Authority, Claims, CredentialAuthority, HttpAuthority, PrincipalKind, TokenError};
pub use bus::{LocalBus, NatsBus, RelayBus, Subject};
pub use cache::{MemoryTokenCache, RedisTokenCache, TokenCache};
pub use directory::{DeviceRegistry, OwnershipDirectory};
pub use error::ErrorKind;
pub use ingest::IngestAuthorizer;
pub use server::{Gateway, ThingbusServer, ThingbusServerConfig};
