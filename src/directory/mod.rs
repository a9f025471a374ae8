//! Thing ownership directory
//!
//! The gateway asks the directory who owns a thing before streaming its
//! readings. [`DeviceRegistry`] is the in-process implementation; it also
//! ties credential issuance and cache cleanup to a thing's registration.

use crate::auth::{Authority, AuthorityError};
use crate::bus::is_valid_thing_id;
use crate::cache::TokenCache;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("invalid thing id '{0}'")]
    InvalidThingId(String),

    #[error("thing '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("thing '{0}' not found")]
    NotFound(String),

    #[error("credential issuance failed: {0}")]
    Authority(#[from] AuthorityError),

    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait OwnershipDirectory: Send + Sync {
    /// Owning user id of a thing, `None` when the thing is unknown
    async fn owner_of(&self, thing_id: &str) -> Result<Option<String>, DirectoryError>;
}

/// In-memory thing registry
#[derive(Clone)]
pub struct DeviceRegistry {
    owners: Arc<DashMap<String, String>>,
    authority: Arc<dyn Authority>,
    cache: Arc<dyn TokenCache>,
}

impl DeviceRegistry {
    pub fn new(authority: Arc<dyn Authority>, cache: Arc<dyn TokenCache>) -> Self {
        Self {
            owners: Arc::new(DashMap::new()),
            authority,
            cache,
        }
    }

    /// Register a thing under an owner and return its credential.
    ///
    /// The credential/thing pair is written to the cache on a best-effort
    /// basis; a cache failure only costs the first ingestion a cache miss.
    pub async fn register(&self, thing_id: &str, owner_id: &str) -> Result<String, DirectoryError> {
        if !is_valid_thing_id(thing_id) {
            return Err(DirectoryError::InvalidThingId(thing_id.to_string()));
        }

        match self.owners.entry(thing_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(DirectoryError::AlreadyRegistered(thing_id.to_string()))
            }
            Entry::Vacant(entry) => {
                entry.insert(owner_id.to_string());
            }
        }

        let token = match self.authority.thing_token(thing_id, owner_id).await {
            Ok(token) => token,
            Err(e) => {
                self.owners.remove(thing_id);
                return Err(e.into());
            }
        };

        if let Err(e) = self.cache.set(&token, thing_id).await {
            warn!(thing_id = thing_id, error = %e, "Failed to prime token cache");
        }

        info!(thing_id = thing_id, owner_id = owner_id, "Thing registered");
        Ok(token)
    }

    /// Remove a thing and drop its cached credential pair
    pub async fn remove(&self, thing_id: &str) -> Result<(), DirectoryError> {
        if self.owners.remove(thing_id).is_none() {
            return Err(DirectoryError::NotFound(thing_id.to_string()));
        }

        if let Err(e) = self.cache.delete_by_device(thing_id).await {
            warn!(thing_id = thing_id, error = %e, "Failed to delete cached credential pair");
        }

        info!(thing_id = thing_id, "Thing removed");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

#[async_trait]
impl OwnershipDirectory for DeviceRegistry {
    async fn owner_of(&self, thing_id: &str) -> Result<Option<String>, DirectoryError> {
        Ok(self.owners.get(thing_id).map(|owner| owner.clone()))
    }
}
