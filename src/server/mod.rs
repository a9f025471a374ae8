//! Thingbus network surfaces
//!
//! - `gateway`: viewer WebSocket endpoint streaming relayed readings
//! - `authority_api`: internal HTTP surface of the credential authority
//! - `transport`: bootstrap running both listeners and the ingestion loop

pub mod authority_api;
pub mod gateway;
mod queue;
pub mod transport;

pub use authority_api::{authority_router, ApiError, AuthorityApiState};
pub use gateway::{
    create_router, Gateway, GatewayConfig, GatewayError, StopSignal, ViewerAuth,
    INVALID_AUTH_REASON, UNAUTHORIZED_REASON,
};
pub use queue::{ForwardQueue, Pushed};
pub use transport::{ThingbusServer, ThingbusServerConfig};
