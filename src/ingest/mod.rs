//! Device message ingestion
//!
//! Devices publish `{"token", "Records"}` on `things/{thingId}`. Each message
//! is authorized against the credential it carries and, if the credential
//! belongs to the thing named by the topic, its normalized records are
//! republished on `thingsMsg.{thingId}`. Rejected messages are logged and
//! dropped.

mod authorizer;
mod mqtt;
mod records;

pub use authorizer::{IngestAuthorizer, IngestError, Relayed};
pub use mqtt::{client_id, run_mqtt_ingest, MqttConfig};
pub use records::{normalize_records, DeviceMessage, RawRecord, Record, RecordValue};
