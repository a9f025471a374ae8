//! In-process cache backend

use crate::cache::{CacheError, CacheLookup, TokenCache};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Token cache kept in a concurrent map. Shares one keyspace for both
/// directions, like the Redis backend.
#[derive(Clone, Default)]
pub struct MemoryTokenCache {
    entries: Arc<DashMap<String, String>>,
}

impl MemoryTokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys (two per pair)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl TokenCache for MemoryTokenCache {
    async fn get(&self, key: &str) -> Result<CacheLookup, CacheError> {
        Ok(match self.entries.get(key) {
            Some(value) => CacheLookup::Hit(value.clone()),
            None => CacheLookup::Miss,
        })
    }

    async fn set(&self, credential: &str, thing_id: &str) -> Result<(), CacheError> {
        self.entries.insert(credential.to_string(), thing_id.to_string());
        if let Some(previous) = self.entries.insert(thing_id.to_string(), credential.to_string()) {
            if previous != credential {
                self.entries.remove_if(&previous, |_, owner| owner == thing_id);
            }
        }
        Ok(())
    }

    async fn delete_by_device(&self, thing_id: &str) -> Result<(), CacheError> {
        let credential = match self.entries.get(thing_id) {
            Some(value) => value.clone(),
            None => return Ok(()),
        };

        self.entries.remove(&credential);
        self.entries.remove(thing_id);
        debug!(thing_id = thing_id, "Deleted cached credential pair");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_then_get_both_directions() {
        let cache = MemoryTokenCache::new();
        cache.set("cred-abc", "t1").await.unwrap();

        assert_eq!(cache.get("cred-abc").await.unwrap(), CacheLookup::Hit("t1".to_string()));
        assert_eq!(cache.get("t1").await.unwrap(), CacheLookup::Hit("cred-abc".to_string()));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_reissued_credential_replaces_old_key() {
        let cache = MemoryTokenCache::new();
        cache.set("cred-old", "t1").await.unwrap();
        cache.set("cred-new", "t1").await.unwrap();

        assert_eq!(cache.get("cred-old").await.unwrap(), CacheLookup::Miss);
        assert_eq!(cache.get("t1").await.unwrap(), CacheLookup::Hit("cred-new".to_string()));
        assert_eq!(cache.len(), 2);

        cache.delete_by_device("t1").await.unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_same_credential_set_twice() {
        let cache = MemoryTokenCache::new();
        cache.set("cred-abc", "t1").await.unwrap();
        cache.set("cred-abc", "t1").await.unwrap();
        assert_eq!(cache.get("cred-abc").await.unwrap(), CacheLookup::Hit("t1".to_string()));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_miss() {
        let cache = MemoryTokenCache::new();
        assert_eq!(cache.get("unknown").await.unwrap(), CacheLookup::Miss);
    }

    #[tokio::test]
    async fn test_delete_by_device() {
        let cache = MemoryTokenCache::new();
        cache.set("cred-abc", "t1").await.unwrap();
        cache.set("cred-xyz", "t2").await.unwrap();

        cache.delete_by_device("t1").await.unwrap();

        assert_eq!(cache.get("cred-abc").await.unwrap(), CacheLookup::Miss);
        assert_eq!(cache.get("t1").await.unwrap(), CacheLookup::Miss);
        assert!(cache.get("cred-xyz").await.unwrap().is_hit());
        assert!(cache.get("t2").await.unwrap().is_hit());
    }

    #[tokio::test]
    async fn test_delete_unknown_device_is_ok() {
        let cache = MemoryTokenCache::new();
        cache.delete_by_device("nope").await.unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_reissue_overwrites_reverse_direction() {
        let cache = MemoryTokenCache::new();
        cache.set("cred-old", "t1").await.unwrap();
        cache.set("cred-new", "t1").await.unwrap();

        assert_eq!(cache.get("t1").await.unwrap(), CacheLookup::Hit("cred-new".to_string()));
        assert_eq!(cache.get("cred-new").await.unwrap().into_value(), Some("t1".to_string()));
    }
}
