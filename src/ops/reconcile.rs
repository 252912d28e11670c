//! Repair drift between leases, volume records and this host's devices.

use crate::common::{external_name, timestamp_now, Error, Result};
use crate::coordinator::lock::{UseConfig, UseLocker, UseReason};
use crate::coordinator::metadata::{MetadataStore, VolumeConfig, VolumeState};
use crate::ops::snapshot;
use crate::storage::{MountRecord, VolumeBackend};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub tenants: usize,
    pub volumes: usize,
    pub orphans_cleaned: usize,
    pub pending_removed: usize,
    pub snapshots_taken: usize,
    pub snapshots_pruned: usize,
    /// Devices mapped here that match no volume record
    pub untracked_devices: usize,
    pub errors: usize,
}

pub struct Reconciler {
    metadata: MetadataStore,
    locks: UseLocker,
    backend: Arc<dyn VolumeBackend>,
    host: String,
    pending_grace: Duration,
}

impl Reconciler {
    pub fn new(
        metadata: MetadataStore,
        locks: UseLocker,
        backend: Arc<dyn VolumeBackend>,
        host: impl Into<String>,
        pending_grace: Duration,
    ) -> Self {
        Self {
            metadata,
            locks,
            backend,
            host: host.into(),
            pending_grace,
        }
    }

    /// One pass over every tenant and volume. Failures are counted and
    /// logged; a tenant that cannot be listed is skipped.
    pub async fn run_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let mapped: HashSet<(String, String)> = match self.backend.mounted().await {
            Ok(records) => records
                .into_iter()
                .map(|MountRecord { pool, volume, .. }| (pool, volume))
                .collect(),
            Err(e) => {
                warn!("Could not list mapped devices: {}", e);
                report.errors += 1;
                HashSet::new()
            }
        };

        let tenants = match self.metadata.list_tenants().await {
            Ok(tenants) => tenants,
            Err(e) => {
                warn!("Could not locate any tenant information: {}", e);
                report.errors += 1;
                return report;
            }
        };

        let mut known = HashSet::new();
        let mut complete = true;
        for tenant in tenants {
            report.tenants += 1;
            let volumes = match self.metadata.list_volumes(&tenant).await {
                Ok(volumes) => volumes,
                Err(e) => {
                    warn!(tenant = %tenant, "Could not list volumes: {}", e);
                    report.errors += 1;
                    complete = false;
                    continue;
                }
            };

            for config in volumes.values() {
                report.volumes += 1;
                if let Ok(name) = config.internal_name() {
                    known.insert((config.options.pool.clone(), name));
                }
                if let Err(e) = self.check_volume(config, &mapped, &mut report).await {
                    warn!(volume = %config.name(), "Reconciliation failed: {}", e);
                    report.errors += 1;
                }
            }
        }

        if complete {
            for (pool, image) in mapped.difference(&known) {
                warn!(pool = %pool, volume = %external_name(image), "Mapped device has no volume record");
                report.untracked_devices += 1;
            }
        }

        info!(
            tenants = report.tenants,
            volumes = report.volumes,
            orphans = report.orphans_cleaned,
            pending = report.pending_removed,
            errors = report.errors,
            "Reconciliation pass complete"
        );
        report
    }

    async fn check_volume(
        &self,
        config: &VolumeConfig,
        mapped: &HashSet<(String, String)>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let lease = self
            .locks
            .get_use(&config.tenant, &config.volume_name)
            .await?;
        let spec = config.spec()?;

        let is_mapped = mapped.contains(&(spec.pool.clone(), spec.name.clone()));
        if lease.is_none() && is_mapped && self.cleanup_orphan(config).await? {
            report.orphans_cleaned += 1;
        }

        match config.state {
            VolumeState::Pending if lease.is_none() => {
                if self.sweep_pending(config).await? {
                    report.pending_removed += 1;
                }
            }
            VolumeState::Pending => {}
            VolumeState::Ready => {
                let snaps =
                    snapshot::run_schedule(self.backend.as_ref(), config, Utc::now()).await?;
                report.snapshots_taken += usize::from(snaps.taken.is_some());
                report.snapshots_pruned += snaps.pruned.len();
            }
        }
        Ok(())
    }

    /// Unmount and unmap a device whose mount lease has lapsed, holding a
    /// Remove lease for the duration.
    async fn cleanup_orphan(&self, config: &VolumeConfig) -> Result<bool> {
        let lease = UseConfig::for_volume(config, &self.host, UseReason::Remove);
        match self.locks.publish_use(&lease).await {
            Ok(()) => {}
            Err(Error::LockHeld { .. }) => {
                debug!(volume = %config.name(), "Lease appeared, leaving device alone");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        warn!(volume = %config.name(), host = %self.host, "Cleaning up device with no lease");
        let result = self.backend.unmount(&config.spec()?).await;

        if let Err(e) = self.locks.remove_use(&lease, false).await {
            warn!(volume = %config.name(), "Could not release cleanup lease: {}", e);
        }
        result.map(|()| true)
    }

    /// Drop a record that never got provisioned.
    async fn sweep_pending(&self, config: &VolumeConfig) -> Result<bool> {
        let age = timestamp_now().saturating_sub(config.created_at);
        if age < self.pending_grace.as_secs() {
            return Ok(false);
        }

        if self.backend.exists(&config.spec()?).await? {
            warn!(volume = %config.name(), "Pending record has an image; leaving for an operator");
            return Ok(false);
        }

        self.metadata
            .remove_volume(&config.tenant, &config.volume_name)
            .await?;
        info!(volume = %config.name(), age_secs = age, "Removed unprovisioned volume record");
        Ok(true)
    }
}
