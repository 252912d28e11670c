//! Node agent
//!
//! Runs on every host. Translates the container runtime's volume calls into
//! control-plane requests and local backend operations:
//! - Mount claims the lease, mounts locally, applies I/O limits
//! - A background task renews every held mount lease at half its TTL
//! - Repeated mounts of the same volume on this host share one device and
//!   one lease, counted locally

pub mod client;
pub mod http;
pub mod ratelimit;
pub mod server;

use crate::common::{split_path, Error, Result};
use crate::coordinator::http::{UseRequest, VolumeGet, VolumeList};
use crate::coordinator::metadata::{RequestCreate, VolumeConfig};
use crate::storage::{MountRecord, MountTable, VolumeBackend};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub use client::MasterClient;
pub use ratelimit::{CgroupBlkioLimiter, NoopLimiter, RateLimiter};
pub use server::Agent;

struct Mounted {
    config: VolumeConfig,
    record: MountRecord,
    refs: usize,
}

/// Per-volume state. Held across a whole mount or unmount of that volume so
/// its refcount and lease move together.
type Slot = Arc<Mutex<Option<Mounted>>>;

pub struct NodeAgent {
    host: String,
    client: MasterClient,
    backend: Arc<dyn VolumeBackend>,
    mounts: Arc<dyn MountTable>,
    limiter: Arc<dyn RateLimiter>,
    registry: std::sync::Mutex<HashMap<String, Slot>>,
    /// Leases granted to this host, keyed by volume name. Never held across
    /// an await.
    leases: std::sync::Mutex<BTreeMap<String, UseRequest>>,
}

impl NodeAgent {
    pub fn new(
        host: impl Into<String>,
        client: MasterClient,
        backend: Arc<dyn VolumeBackend>,
        mounts: Arc<dyn MountTable>,
        limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        Self {
            host: host.into(),
            client,
            backend,
            mounts,
            limiter,
            registry: std::sync::Mutex::new(HashMap::new()),
            leases: std::sync::Mutex::new(BTreeMap::new()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn use_request(&self, tenant: &str, volume: &str) -> UseRequest {
        UseRequest {
            tenant: tenant.to_string(),
            volume: volume.to_string(),
            host: self.host.clone(),
        }
    }

    fn slot(&self, name: &str) -> Slot {
        self.registry
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Drop an empty slot nobody else is waiting on.
    fn forget_slot(&self, name: &str, slot: &Slot) {
        let mut registry = self.registry.lock().unwrap();
        // One reference in the map, one held by the caller.
        if Arc::strong_count(slot) == 2 {
            registry.remove(name);
        }
    }

    pub async fn create(
        &self,
        name: &str,
        opts: BTreeMap<String, String>,
    ) -> Result<VolumeConfig> {
        let (tenant, volume) = split_path(name)?;
        self.client
            .create(&RequestCreate {
                tenant,
                volume,
                opts,
            })
            .await
    }

    /// Claim the mount lease, mount on this host and apply I/O limits.
    pub async fn mount(&self, name: &str) -> Result<PathBuf> {
        let (tenant, volume) = split_path(name)?;
        let slot = self.slot(name);
        let mut state = slot.lock().await;

        if let Some(mounted) = state.as_mut() {
            mounted.refs += 1;
            debug!(volume = name, refs = mounted.refs, "Already mounted here");
            return Ok(mounted.record.path.clone());
        }

        let result = self.mount_new(name, &tenant, &volume).await;
        match result {
            Ok(mounted) => {
                let path = mounted.record.path.clone();
                *state = Some(mounted);
                Ok(path)
            }
            Err(e) => {
                drop(state);
                self.forget_slot(name, &slot);
                Err(e)
            }
        }
    }

    async fn mount_new(&self, name: &str, tenant: &str, volume: &str) -> Result<Mounted> {
        let config = self.client.request(tenant, volume).await?;
        let spec = config.spec()?;
        let req = self.use_request(tenant, volume);
        self.client.mount(&req).await?;
        // Renewed from here on, even while the device is still being mapped.
        self.leases
            .lock()
            .unwrap()
            .insert(name.to_string(), req.clone());

        let record = match self.backend.mount(&spec, &config.options.filesystem).await {
            Ok(record) => record,
            Err(e) => {
                self.release(name, &req).await;
                return Err(e);
            }
        };

        if !config.options.rate_limit.is_empty() {
            if let Err(e) = self.limiter.apply(&record, &config.options.rate_limit) {
                if let Err(ue) = self.backend.unmount(&spec).await {
                    warn!(volume = name, "Rollback unmount failed: {}", ue);
                }
                self.release(name, &req).await;
                return Err(e);
            }
        }

        info!(volume = name, path = %record.path.display(), device = %record.device.display(), "Mounted");
        Ok(Mounted {
            config,
            record,
            refs: 1,
        })
    }

    async fn release(&self, name: &str, req: &UseRequest) {
        self.leases.lock().unwrap().remove(name);
        if let Err(e) = self.client.unmount(req).await {
            warn!(tenant = %req.tenant, volume = %req.volume, "Could not release mount lease: {}", e);
        }
    }

    /// Drop one local reference; the last one unmounts and releases the lease.
    pub async fn unmount(&self, name: &str) -> Result<()> {
        let (tenant, volume) = split_path(name)?;
        let slot = self.slot(name);
        let mut state = slot.lock().await;
        let result = self.unmount_locked(name, &tenant, &volume, &mut state).await;
        let empty = state.is_none();
        drop(state);
        if empty {
            self.forget_slot(name, &slot);
        }
        result
    }

    async fn unmount_locked(
        &self,
        name: &str,
        tenant: &str,
        volume: &str,
        state: &mut Option<Mounted>,
    ) -> Result<()> {
        if let Some(mounted) = state.as_mut() {
            if mounted.refs > 1 {
                mounted.refs -= 1;
                debug!(volume = name, refs = mounted.refs, "Still in use here");
                return Ok(());
            }
        }

        let spec = match state.as_ref() {
            Some(mounted) => mounted.config.spec()?,
            None => self.client.request(tenant, volume).await?.spec()?,
        };
        self.backend.unmount(&spec).await?;

        *state = None;
        self.leases.lock().unwrap().remove(name);
        self.client.unmount(&self.use_request(tenant, volume)).await?;
        info!(volume = name, "Unmounted");
        Ok(())
    }

    /// Ephemeral volumes are deleted; persistent ones are kept.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let (tenant, volume) = split_path(name)?;
        let config = self.client.request(&tenant, &volume).await?;

        if !config.options.ephemeral {
            debug!(volume = name, "Persistent volume, not removing");
            return Ok(());
        }

        self.client.remove(&tenant, &volume).await?;
        info!(volume = name, "Removed ephemeral volume");
        Ok(())
    }

    /// Where the volume would be mounted, without checking that it is.
    pub async fn mount_path(&self, name: &str) -> Result<PathBuf> {
        let (tenant, volume) = split_path(name)?;
        let slot = self.registry.lock().unwrap().get(name).cloned();
        if let Some(slot) = slot {
            if let Some(mounted) = slot.lock().await.as_ref() {
                return Ok(mounted.record.path.clone());
            }
        }
        let config = self.client.request(&tenant, &volume).await?;
        Ok(self
            .backend
            .mount_path(&config.options.pool, &config.internal_name()?))
    }

    /// The mount path, only if it is currently mounted on this host.
    pub async fn path(&self, name: &str) -> Result<PathBuf> {
        let path = self.mount_path(name).await?;
        if self.mounts.is_mounted(&path)? {
            Ok(path)
        } else {
            Err(Error::VolumeNotFound(format!("{} is not mounted", name)))
        }
    }

    pub async fn list(&self) -> Result<VolumeList> {
        self.client.list().await
    }

    pub async fn get(&self, name: &str) -> Result<VolumeGet> {
        let (tenant, volume) = split_path(name)?;
        self.client.get(&tenant, &volume).await
    }

    /// Names of volumes this host holds a mount lease for.
    pub fn mounted(&self) -> Vec<String> {
        self.leases.lock().unwrap().keys().cloned().collect()
    }

    /// Refresh the TTL of every lease this host holds. Returns how many were
    /// renewed. Does not wait on mounts or unmounts in progress.
    pub async fn renew_leases(&self) -> usize {
        let requests: Vec<UseRequest> = self.leases.lock().unwrap().values().cloned().collect();

        let mut renewed = 0;
        for req in requests {
            match self.client.mount_report(&req).await {
                Ok(()) => renewed += 1,
                Err(e) => {
                    warn!(tenant = %req.tenant, volume = %req.volume, "Lease renewal failed: {}", e)
                }
            }
        }
        renewed
    }

    /// Renew leases every `interval` until the task is dropped.
    pub async fn run_renewal(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let renewed = self.renew_leases().await;
            debug!(renewed, "Renewed mount leases");
        }
    }
}
