//! Linearizable key-value store holding tenants, volume records and use locks
//!
//! Mutual exclusion across hosts rests entirely on the conditional writes
//! exposed here. Keys carrying a TTL vanish on their own once it elapses;
//! nothing in this crate polls for expiry.

pub mod etcd;
pub mod memory;

use crate::common::{retry_with_backoff, Result, StoreBackend, StoreConfig};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

/// Condition a write or delete must satisfy to take effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    None,
    MustNotExist,
    ValueEquals(Vec<u8>),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write `value`, optionally expiring after `ttl`.
    /// Returns `false` when `cond` did not hold and nothing was written.
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        cond: Precondition,
    ) -> Result<bool>;

    /// Returns `false` when `cond` did not hold or the key was absent.
    async fn delete(&self, key: &str, cond: Precondition) -> Result<bool>;

    /// All live entries under `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

const CONNECT_ATTEMPTS: usize = 5;

/// Open the backend named in the configuration.
pub async fn open(config: &StoreConfig) -> Result<Arc<dyn KvStore>> {
    match config.backend {
        StoreBackend::Etcd => {
            let store = retry_with_backoff(
                || EtcdStore::connect(&config.endpoints),
                CONNECT_ATTEMPTS,
                Duration::from_millis(500),
            )
            .await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store; leases are not shared across processes");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Key layout under the configured prefix.
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn tenants(&self) -> String {
        format!("{}/tenants/", self.prefix)
    }

    pub fn tenant(&self, tenant: &str) -> String {
        format!("{}/tenants/{}", self.prefix, tenant)
    }

    pub fn all_volumes(&self) -> String {
        format!("{}/volumes/", self.prefix)
    }

    pub fn volumes(&self, tenant: &str) -> String {
        format!("{}/volumes/{}/", self.prefix, tenant)
    }

    pub fn volume(&self, tenant: &str, volume: &str) -> String {
        format!("{}/volumes/{}/{}", self.prefix, tenant, volume)
    }

    pub fn uses(&self) -> String {
        format!("{}/users/", self.prefix)
    }

    pub fn use_lock(&self, tenant: &str, volume: &str) -> String {
        format!("{}/users/{}/{}", self.prefix, tenant, volume)
    }
}
