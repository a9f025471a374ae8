//! Token-identity cache
//!
//! Maps a thing credential to its thing id and back, so the ingestion path
//! can skip signature verification for credentials it has already seen.
//! Each pair is stored under two plain string keys with no expiry:
//!
//! - `credential -> thing id`
//! - `thing id -> credential`
//!
//! The cache is an accelerator only. Callers treat any [`CacheError`] as a
//! miss and fall back to the authority.
//!
//! A `set` for a thing that already has a different credential removes the
//! old `credential -> thing id` key, so a reissued device keeps one pair.
//!
//! `delete_by_device` reads the paired credential and then deletes both keys
//! in a second step. A `set` for the same thing racing between those steps can
//! leave a `credential -> thing id` key behind. Nothing overwrites it: it keeps
//! hitting, and so keeps passing ingestion, until it is deleted by hand or the
//! thing is registered and removed again.

mod memory;
mod redis;

pub use memory::MemoryTokenCache;
pub use redis::{RedisCacheConfig, RedisTokenCache};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache command failed: {0}")]
    Command(String),
}

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(String),
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }

    pub fn into_value(self) -> Option<String> {
        match self {
            CacheLookup::Hit(value) => Some(value),
            CacheLookup::Miss => None,
        }
    }
}

#[async_trait]
pub trait TokenCache: Send + Sync {
    /// Look up either direction of a pair
    async fn get(&self, key: &str) -> Result<CacheLookup, CacheError>;

    /// Store both directions of a credential/thing pair, dropping the
    /// thing's previous credential key
    async fn set(&self, credential: &str, thing_id: &str) -> Result<(), CacheError>;

    /// Remove both directions of the pair owned by `thing_id`
    async fn delete_by_device(&self, thing_id: &str) -> Result<(), CacheError>;
}
