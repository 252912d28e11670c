//! Use locks: at most one live lease per volume.
//!
//! Every acquisition is a single conditional write against the shared store.
//! Leases carrying a TTL expire in the store on their own; this module never
//! runs timers.

use super::metadata::VolumeConfig;
use crate::common::{join_path, Error, Result};
use crate::store::{Keys, KvStore, Precondition};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UseReason {
    Create,
    Mount,
    Remove,
}

impl fmt::Display for UseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UseReason::Create => "Create",
            UseReason::Mount => "Mount",
            UseReason::Remove => "Remove",
        };
        f.write_str(s)
    }
}

/// A lease record: who holds which volume, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UseConfig {
    pub tenant: String,
    pub volume: String,
    pub hostname: String,
    pub reason: UseReason,
}

impl UseConfig {
    pub fn new(
        tenant: impl Into<String>,
        volume: impl Into<String>,
        hostname: impl Into<String>,
        reason: UseReason,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            volume: volume.into(),
            hostname: hostname.into(),
            reason,
        }
    }

    pub fn for_volume(
        config: &VolumeConfig,
        hostname: impl Into<String>,
        reason: UseReason,
    ) -> Self {
        Self::new(&config.tenant, &config.volume_name, hostname, reason)
    }

    pub fn name(&self) -> String {
        join_path(&self.tenant, &self.volume)
    }

    /// The stored form. Field order is fixed, so equal leases encode to equal
    /// bytes and can be compared by value in the store.
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Precondition for a TTL publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeasePrecondition {
    /// First claim
    MustNotExist,
    /// Renewal by the current holder
    MustExist,
}

#[derive(Clone)]
pub struct UseLocker {
    store: Arc<dyn KvStore>,
    keys: Keys,
}

impl UseLocker {
    pub fn new(store: Arc<dyn KvStore>, keys: Keys) -> Self {
        Self { store, keys }
    }

    fn key(&self, lease: &UseConfig) -> String {
        self.keys.use_lock(&lease.tenant, &lease.volume)
    }

    /// Claim without TTL. Fails with [`Error::LockHeld`] if any lease exists.
    pub async fn publish_use(&self, lease: &UseConfig) -> Result<()> {
        let written = self
            .store
            .put(
                &self.key(lease),
                lease.encode()?,
                None,
                Precondition::MustNotExist,
            )
            .await?;
        if !written {
            return Err(Error::LockHeld {
                volume: lease.name(),
            });
        }
        debug!(volume = %lease.name(), host = %lease.hostname, reason = %lease.reason, "Published use");
        Ok(())
    }

    /// Claim or renew with a TTL.
    ///
    /// `MustExist` only succeeds when the stored lease is this exact lease,
    /// so a renewal can never take over a lease held by another host.
    pub async fn publish_use_with_ttl(
        &self,
        lease: &UseConfig,
        ttl: Duration,
        precondition: LeasePrecondition,
    ) -> Result<()> {
        let value = lease.encode()?;
        let cond = match precondition {
            LeasePrecondition::MustNotExist => Precondition::MustNotExist,
            LeasePrecondition::MustExist => Precondition::ValueEquals(value.clone()),
        };

        if self
            .store
            .put(&self.key(lease), value, Some(ttl), cond)
            .await?
        {
            debug!(volume = %lease.name(), host = %lease.hostname, ?ttl, "Published use with TTL");
            return Ok(());
        }

        match precondition {
            LeasePrecondition::MustNotExist => Err(Error::LockHeld {
                volume: lease.name(),
            }),
            LeasePrecondition::MustExist => Err(self.mismatch(lease).await),
        }
    }

    /// Release a lease. Unless `force`, the stored lease must equal `lease`.
    pub async fn remove_use(&self, lease: &UseConfig, force: bool) -> Result<()> {
        let cond = if force {
            Precondition::None
        } else {
            Precondition::ValueEquals(lease.encode()?)
        };

        if self.store.delete(&self.key(lease), cond).await? {
            debug!(volume = %lease.name(), host = %lease.hostname, force, "Removed use");
            return Ok(());
        }
        if force {
            return Ok(());
        }
        Err(self.mismatch(lease).await)
    }

    pub async fn get_use(&self, tenant: &str, volume: &str) -> Result<Option<UseConfig>> {
        match self.store.get(&self.keys.use_lock(tenant, volume)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every live lease.
    pub async fn list_uses(&self) -> Result<Vec<UseConfig>> {
        let mut uses = Vec::new();
        for (_, value) in self.store.list(&self.keys.uses()).await? {
            uses.push(serde_json::from_slice(&value)?);
        }
        Ok(uses)
    }

    /// Explain why a conditional write against `lease` did not apply.
    async fn mismatch(&self, lease: &UseConfig) -> Error {
        match self.get_use(&lease.tenant, &lease.volume).await {
            Ok(Some(current)) => Error::LockOwnerMismatch {
                volume: lease.name(),
                holder: format!("{} ({})", current.hostname, current.reason),
                requester: format!("{} ({})", lease.hostname, lease.reason),
            },
            Ok(None) => Error::LockNotHeld {
                volume: lease.name(),
            },
            Err(e) => e,
        }
    }
}
