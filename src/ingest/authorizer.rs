//! Per-message ingestion pipeline: parse, resolve identity, authorize, relay

use crate::auth::{token_prefix, Authority, AuthorityError};
use crate::bus::{parse_ingest_topic, BusError, RelayBus, Subject, SubjectError};
use crate::cache::{CacheLookup, TokenCache};
use crate::error::ErrorKind;
use crate::ingest::records::{normalize_records, DeviceMessage};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("bad topic: {0}")]
    Topic(#[from] SubjectError),

    #[error("failed to decode message: {0}")]
    Parsing(String),

    #[error("credential rejected: {0}")]
    Authentication(AuthorityError),

    #[error("credential for '{resolved}' used on topic of '{topic}'")]
    Authorization { topic: String, resolved: String },

    #[error("relay publish failed: {0}")]
    Publish(#[from] BusError),
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Topic(_) => ErrorKind::Validation,
            IngestError::Parsing(_) => ErrorKind::Parsing,
            IngestError::Authentication(AuthorityError::Unavailable(_)) => ErrorKind::Connection,
            IngestError::Authentication(_) => ErrorKind::Authentication,
            IngestError::Authorization { .. } => ErrorKind::Authorization,
            IngestError::Publish(_) => ErrorKind::Connection,
        }
    }
}

/// Outcome of a relayed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relayed {
    pub thing_id: String,
    pub records: usize,
    /// Subscribers reached on the relay subject
    pub delivered: usize,
    pub cache_hit: bool,
}

/// Authorizes device messages and republishes them on the relay bus
pub struct IngestAuthorizer {
    authority: Arc<dyn Authority>,
    cache: Arc<dyn TokenCache>,
    bus: Arc<dyn RelayBus>,
}

impl IngestAuthorizer {
    pub fn new(
        authority: Arc<dyn Authority>,
        cache: Arc<dyn TokenCache>,
        bus: Arc<dyn RelayBus>,
    ) -> Self {
        Self {
            authority,
            cache,
            bus,
        }
    }

    /// Run one message through the pipeline. Any error means the message was
    /// dropped; nothing is retried. Records without exactly one value form are
    /// dropped individually and whatever remains is relayed, even if that is
    /// an empty array.
    pub async fn process(&self, topic: &str, payload: &[u8]) -> Result<Relayed, IngestError> {
        let thing_id = parse_ingest_topic(topic)?;
        let message: DeviceMessage =
            serde_json::from_slice(payload).map_err(|e| IngestError::Parsing(e.to_string()))?;

        let (resolved, cache_hit) = self.resolve(&message.token).await?;
        if resolved != thing_id {
            return Err(IngestError::Authorization {
                topic: thing_id,
                resolved,
            });
        }

        let records = normalize_records(&thing_id, message.records);

        let body = serde_json::to_vec(&records).map_err(|e| IngestError::Parsing(e.to_string()))?;
        let subject = Subject::for_thing(&thing_id)?;
        let delivered = self.bus.publish(&subject, body).await?;

        debug!(
            thing_id = %thing_id,
            records = records.len(),
            delivered = delivered,
            cache_hit = cache_hit,
            "Relayed device message"
        );

        Ok(Relayed {
            thing_id,
            records: records.len(),
            delivered,
            cache_hit,
        })
    }

    /// Resolve the thing id behind a credential, preferring the cache
    async fn resolve(&self, credential: &str) -> Result<(String, bool), IngestError> {
        match self.cache.get(credential).await {
            Ok(CacheLookup::Hit(thing_id)) => return Ok((thing_id, true)),
            Ok(CacheLookup::Miss) => {}
            Err(e) => {
                warn!(error = %e, kind = %ErrorKind::Cache, "Cache lookup failed, falling back to authority");
            }
        }

        let claims = self
            .authority
            .thing_claims(credential)
            .await
            .map_err(IngestError::Authentication)?;

        if let Err(e) = self.cache.set(credential, &claims.sub).await {
            warn!(
                thing_id = %claims.sub,
                token = token_prefix(credential),
                error = %e,
                kind = %ErrorKind::Cache,
                "Failed to cache credential"
            );
        }

        Ok((claims.sub, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CredentialAuthority;
    use crate::bus::LocalBus;
    use crate::cache::MemoryTokenCache;

    struct Fixture {
        authorizer: IngestAuthorizer,
        authority: Arc<CredentialAuthority>,
        cache: MemoryTokenCache,
        bus: LocalBus,
    }

    fn fixture() -> Fixture {
        let authority = Arc::new(CredentialAuthority::new(b"ingest-test".to_vec(), "test"));
        let cache = MemoryTokenCache::new();
        let bus = LocalBus::new();
        let authorizer = IngestAuthorizer::new(
            authority.clone(),
            Arc::new(cache.clone()),
            Arc::new(bus.clone()),
        );
        Fixture {
            authorizer,
            authority,
            cache,
            bus,
        }
    }

    fn payload(token: &str) -> Vec<u8> {
        serde_json::json!({
            "token": token,
            "Records": [{"Name": "temp", "Unit": "Cel", "Time": 1.0, "Value": 21.5}]
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn test_relays_valid_message() {
        let f = fixture();
        let token = f.authority.issue_thing_token("t1", "u1").unwrap();
        let mut sub = f.bus.subscribe(&Subject::for_thing("t1").unwrap()).await.unwrap();

        let relayed = f.authorizer.process("things/t1", &payload(&token)).await.unwrap();
        assert_eq!(relayed.thing_id, "t1");
        assert_eq!(relayed.records, 1);
        assert_eq!(relayed.delivered, 1);
        assert!(!relayed.cache_hit);

        let msg = sub.recv().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(body[0]["Name"], "temp");
        assert_eq!(body[0]["Value"], 21.5);
    }

    #[tokio::test]
    async fn test_second_message_hits_cache() {
        let f = fixture();
        let token = f.authority.issue_thing_token("t1", "u1").unwrap();

        f.authorizer.process("things/t1", &payload(&token)).await.unwrap();
        assert_eq!(f.cache.get(&token).await.unwrap(), CacheLookup::Hit("t1".to_string()));

        let relayed = f.authorizer.process("things/t1", &payload(&token)).await.unwrap();
        assert!(relayed.cache_hit);
    }

    #[tokio::test]
    async fn test_mismatched_thing_is_not_relayed() {
        let f = fixture();
        let token = f.authority.issue_thing_token("t2", "u1").unwrap();
        let mut on_t1 = f.bus.subscribe(&Subject::for_thing("t1").unwrap()).await.unwrap();
        let mut on_t2 = f.bus.subscribe(&Subject::for_thing("t2").unwrap()).await.unwrap();

        let err = f.authorizer.process("things/t1", &payload(&token)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);

        // Cached pair from the failed attempt must not open a path either
        let err = f.authorizer.process("things/t1", &payload(&token)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);

        assert!(on_t1.try_recv().is_none());
        assert!(on_t2.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_rejects_user_credential() {
        let f = fixture();
        let token = f.authority.issue_user_token("u1").unwrap();

        let err = f.authorizer.process("things/t1", &payload(&token)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(f.cache.len(), 0);
    }

    #[tokio::test]
    async fn test_rejects_foreign_signature() {
        let f = fixture();
        let other = CredentialAuthority::new(b"other-secret".to_vec(), "test");
        let token = other.issue_thing_token("t1", "u1").unwrap();

        let err = f.authorizer.process("things/t1", &payload(&token)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[tokio::test]
    async fn test_parse_failures() {
        let f = fixture();

        let err = f.authorizer.process("things/t1", b"not json").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parsing);

        let err = f.authorizer.process("other/t1", b"{}").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_invalid_records_dropped_rest_relayed() {
        let f = fixture();
        let token = f.authority.issue_thing_token("t1", "u1").unwrap();
        let mut sub = f.bus.subscribe(&Subject::for_thing("t1").unwrap()).await.unwrap();
        let body = serde_json::json!({
            "token": token,
            "Records": [
                {"Name": "temp"},
                {"Name": "hum", "Value": 1, "StringValue": "x"},
                {"Name": "door", "BoolValue": true}
            ]
        })
        .to_string();

        let relayed = f.authorizer.process("things/t1", body.as_bytes()).await.unwrap();
        assert_eq!(relayed.records, 1);

        let msg = sub.recv().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["BoolValue"], true);
    }

    #[tokio::test]
    async fn test_empty_record_set_still_relayed() {
        let f = fixture();
        let token = f.authority.issue_thing_token("t1", "u1").unwrap();
        let mut sub = f.bus.subscribe(&Subject::for_thing("t1").unwrap()).await.unwrap();

        for records in [serde_json::json!([]), serde_json::json!([{"Name": "temp"}])] {
            let body = serde_json::json!({"token": token, "Records": records}).to_string();
            let relayed = f.authorizer.process("things/t1", body.as_bytes()).await.unwrap();
            assert_eq!(relayed.records, 0);
            assert_eq!(relayed.delivered, 1);
            assert_eq!(sub.recv().await.unwrap().payload, b"[]".to_vec());
        }
    }
}
