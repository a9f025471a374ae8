//! Redis cache backend

use crate::cache::{CacheError, CacheLookup, TokenCache};
use async_trait::async_trait;
use deadpool_redis::redis::{self, AsyncCommands};
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime};
use tracing::{debug, info};

/// Redis connection settings
#[derive(Debug, Clone)]
pub struct RedisCacheConfig {
    /// e.g. `redis://localhost:6379/0`
    pub url: String,
    pub pool_max: usize,
}

impl RedisCacheConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_max: 16,
        }
    }
}

/// Token cache stored in Redis as plain string keys
#[derive(Clone)]
pub struct RedisTokenCache {
    pool: Pool,
}

impl RedisTokenCache {
    pub fn new(config: RedisCacheConfig) -> Result<Self, CacheError> {
        let mut cfg = Config::from_url(config.url.clone());
        cfg.pool = Some(PoolConfig::new(config.pool_max));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        info!(url = %config.url, "Redis token cache configured");
        Ok(Self { pool })
    }

    /// Round-trip a PING so startup can report an unreachable server early
    pub async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Command(e.to_string()))?;
        Ok(())
    }

    async fn conn(&self) -> Result<Connection, CacheError> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl TokenCache for RedisTokenCache {
    async fn get(&self, key: &str) -> Result<CacheLookup, CacheError> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| CacheError::Command(e.to_string()))?;

        Ok(match value {
            Some(v) => CacheLookup::Hit(v),
            None => CacheLookup::Miss,
        })
    }

    async fn set(&self, credential: &str, thing_id: &str) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;

        // MULTI/EXEC so both directions land together
        let (previous,): (Option<String>,) = redis::pipe()
            .atomic()
            .set(credential, thing_id)
            .ignore()
            .getset(thing_id, credential)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Command(e.to_string()))?;

        if let Some(previous) = previous.filter(|p| p != credential) {
            let _: () = conn
                .del(&previous)
                .await
                .map_err(|e| CacheError::Command(e.to_string()))?;
            debug!(thing_id = thing_id, "Replaced cached credential");
        }

        Ok(())
    }

    async fn delete_by_device(&self, thing_id: &str) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;

        let credential: Option<String> = conn
            .get(thing_id)
            .await
            .map_err(|e| CacheError::Command(e.to_string()))?;

        let Some(credential) = credential else {
            return Ok(());
        };

        let _: () = conn
            .del(vec![credential, thing_id.to_string()])
            .await
            .map_err(|e| CacheError::Command(e.to_string()))?;

        debug!(thing_id = thing_id, "Deleted cached credential pair");
        Ok(())
    }
}
