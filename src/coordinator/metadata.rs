//! Tenant and volume records in the shared store
//!
//! Stores:
//! - Tenant configuration (default volume options, filesystem commands)
//! - Volume records (`VolumeConfig`), keyed by tenant and volume name

use crate::common::{internal_name, join_path, parse_duration, timestamp_now, Error, Result};
use crate::storage::{FsOptions, VolumeSpec};
use crate::store::{Keys, KvStore, Precondition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Optional blkio throttles. Zero or absent means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitOptions {
    pub read_bps: Option<u64>,
    pub write_bps: Option<u64>,
    pub read_iops: Option<u64>,
    pub write_iops: Option<u64>,
}

impl RateLimitOptions {
    pub fn is_empty(&self) -> bool {
        [self.read_bps, self.write_bps, self.read_iops, self.write_iops]
            .iter()
            .all(|v| v.unwrap_or(0) == 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotOptions {
    pub enabled: bool,
    /// Duration string, e.g. `30m`
    pub frequency: String,
    pub keep: usize,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            frequency: "1h".into(),
            keep: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeOptions {
    pub pool: String,
    /// Size in MB
    pub size: u64,
    pub filesystem: String,
    pub ephemeral: bool,
    pub rate_limit: RateLimitOptions,
    pub snapshots: SnapshotOptions,
}

impl Default for VolumeOptions {
    fn default() -> Self {
        Self {
            pool: "rbd".into(),
            size: 10,
            filesystem: "ext4".into(),
            ephemeral: false,
            rate_limit: RateLimitOptions::default(),
            snapshots: SnapshotOptions::default(),
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(Error::MalformedRequest(format!(
            "option {}: {:?} is not a boolean",
            key, value
        ))),
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value.trim().parse().map_err(|_| {
        Error::MalformedRequest(format!("option {}: {:?} is not a number", key, value))
    })
}

/// Size in MB. Accepts a bare number or an `MB`/`GB`/`TB` suffix.
fn parse_size(value: &str) -> Result<u64> {
    let upper = value.trim().to_ascii_uppercase();
    let (num, factor) = if let Some(n) = upper.strip_suffix("TB") {
        (n, 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("GB") {
        (n, 1024)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, 1)
    } else {
        (upper.as_str(), 1)
    };
    parse_u64("size", num)?
        .checked_mul(factor)
        .ok_or_else(|| Error::MalformedRequest(format!("size {:?} is too large", value)))
}

impl VolumeOptions {
    /// Overlay request options on top of these defaults.
    pub fn merge(&self, opts: &BTreeMap<String, String>) -> Result<Self> {
        let mut merged = self.clone();
        for (key, value) in opts {
            match key.as_str() {
                "pool" => merged.pool = value.clone(),
                "size" => merged.size = parse_size(value)?,
                "filesystem" => merged.filesystem = value.clone(),
                "ephemeral" => merged.ephemeral = parse_bool(key, value)?,
                "rate-limit.read.bps" => merged.rate_limit.read_bps = Some(parse_u64(key, value)?),
                "rate-limit.write.bps" => {
                    merged.rate_limit.write_bps = Some(parse_u64(key, value)?)
                }
                "rate-limit.read.iops" => {
                    merged.rate_limit.read_iops = Some(parse_u64(key, value)?)
                }
                "rate-limit.write.iops" => {
                    merged.rate_limit.write_iops = Some(parse_u64(key, value)?)
                }
                "snapshots" => merged.snapshots.enabled = parse_bool(key, value)?,
                "snapshots.frequency" => merged.snapshots.frequency = value.clone(),
                "snapshots.keep" => merged.snapshots.keep = parse_u64(key, value)? as usize,
                _ => {
                    return Err(Error::MalformedRequest(format!(
                        "unknown option {:?}",
                        key
                    )))
                }
            }
        }
        Ok(merged)
    }

    pub fn validate(&self, tenant: &TenantConfig) -> Result<()> {
        if self.pool.is_empty() {
            return Err(Error::MalformedRequest("pool was blank".into()));
        }
        if self.size == 0 {
            return Err(Error::MalformedRequest("size must be greater than zero".into()));
        }
        if !tenant.filesystems.contains_key(&self.filesystem) {
            return Err(Error::MalformedRequest(format!(
                "filesystem {:?} is not configured for this tenant",
                self.filesystem
            )));
        }
        if self.snapshots.enabled {
            parse_duration(&self.snapshots.frequency)
                .map_err(|e| Error::MalformedRequest(format!("snapshots.frequency: {}", e)))?;
            if self.snapshots.keep == 0 {
                return Err(Error::MalformedRequest("snapshots.keep must be positive".into()));
            }
        }
        Ok(())
    }
}

/// Per-tenant defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantConfig {
    pub default_options: VolumeOptions,
    /// Filesystem name → creation command; `%` is the device path
    pub filesystems: BTreeMap<String, String>,
}

impl Default for TenantConfig {
    fn default() -> Self {
        let mut filesystems = BTreeMap::new();
        filesystems.insert("ext4".to_string(), "mkfs.ext4 -m0 %".to_string());
        Self {
            default_options: VolumeOptions::default(),
            filesystems,
        }
    }
}

impl TenantConfig {
    pub fn filesystem(&self, name: &str) -> Result<FsOptions> {
        let command = self.filesystems.get(name).ok_or_else(|| {
            Error::MalformedRequest(format!("filesystem {:?} is not configured", name))
        })?;
        Ok(FsOptions {
            fs_type: name.to_string(),
            create_command: command.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeState {
    /// Recorded, not yet provisioned
    Pending,
    Ready,
}

/// A volume record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub tenant: String,
    pub volume_name: String,
    pub options: VolumeOptions,
    pub state: VolumeState,
    pub created_at: u64,
}

impl VolumeConfig {
    /// Public `tenant/volume` name.
    pub fn name(&self) -> String {
        join_path(&self.tenant, &self.volume_name)
    }

    /// Image name, `tenant.volume`.
    pub fn internal_name(&self) -> Result<String> {
        internal_name(&self.name())
    }

    pub fn spec(&self) -> Result<VolumeSpec> {
        Ok(VolumeSpec::new(
            &self.options.pool,
            self.internal_name()?,
            self.options.size,
        ))
    }
}

/// Body of a create request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCreate {
    pub tenant: String,
    pub volume: String,
    #[serde(default)]
    pub opts: BTreeMap<String, String>,
}

/// Tenant and volume records over a [`KvStore`].
#[derive(Clone)]
pub struct MetadataStore {
    store: Arc<dyn KvStore>,
    keys: Keys,
}

impl MetadataStore {
    pub fn new(store: Arc<dyn KvStore>, keys: Keys) -> Self {
        Self { store, keys }
    }

    // === Tenant operations ===

    pub async fn publish_tenant(&self, name: &str, tenant: &TenantConfig) -> Result<()> {
        if name.is_empty() || name.contains('/') || name.contains('.') {
            return Err(Error::InvalidName {
                name: name.to_string(),
                reason: "tenant names may not be blank or contain '/' or '.'".into(),
            });
        }
        let value = serde_json::to_vec(tenant)?;
        self.store
            .put(&self.keys.tenant(name), value, None, Precondition::None)
            .await?;
        Ok(())
    }

    pub async fn get_tenant(&self, name: &str) -> Result<TenantConfig> {
        match self.store.get(&self.keys.tenant(name)).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(Error::TenantNotFound(name.to_string())),
        }
    }

    pub async fn delete_tenant(&self, name: &str) -> Result<()> {
        if !self
            .store
            .delete(&self.keys.tenant(name), Precondition::None)
            .await?
        {
            return Err(Error::TenantNotFound(name.to_string()));
        }
        Ok(())
    }

    pub async fn list_tenants(&self) -> Result<Vec<String>> {
        let prefix = self.keys.tenants();
        Ok(self
            .store
            .list(&prefix)
            .await?
            .into_iter()
            .filter_map(|(k, _)| k.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    // === Volume operations ===

    /// Record a new volume as [`VolumeState::Pending`]. Returns the stored
    /// record and whether this call wrote it; an existing record is returned
    /// unchanged.
    pub async fn create_volume(
        &self,
        req: &RequestCreate,
        tenant: &TenantConfig,
    ) -> Result<(VolumeConfig, bool)> {
        let options = tenant.default_options.merge(&req.opts)?;
        options.validate(tenant)?;

        let config = VolumeConfig {
            tenant: req.tenant.clone(),
            volume_name: req.volume.clone(),
            options,
            state: VolumeState::Pending,
            created_at: timestamp_now(),
        };
        config.internal_name()?;

        let key = self.keys.volume(&req.tenant, &req.volume);
        let written = self
            .store
            .put(
                &key,
                serde_json::to_vec(&config)?,
                None,
                Precondition::MustNotExist,
            )
            .await?;
        if written {
            return Ok((config, true));
        }

        Ok((self.get_volume(&req.tenant, &req.volume).await?, false))
    }

    /// Overwrite a volume record.
    pub async fn publish_volume(&self, config: &VolumeConfig) -> Result<()> {
        let key = self.keys.volume(&config.tenant, &config.volume_name);
        self.store
            .put(&key, serde_json::to_vec(config)?, None, Precondition::None)
            .await?;
        Ok(())
    }

    pub async fn get_volume(&self, tenant: &str, volume: &str) -> Result<VolumeConfig> {
        match self.store.get(&self.keys.volume(tenant, volume)).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(Error::VolumeNotFound(join_path(tenant, volume))),
        }
    }

    pub async fn remove_volume(&self, tenant: &str, volume: &str) -> Result<()> {
        if !self
            .store
            .delete(&self.keys.volume(tenant, volume), Precondition::None)
            .await?
        {
            return Err(Error::VolumeNotFound(join_path(tenant, volume)));
        }
        Ok(())
    }

    /// Volumes of one tenant, keyed by volume name.
    pub async fn list_volumes(&self, tenant: &str) -> Result<BTreeMap<String, VolumeConfig>> {
        let prefix = self.keys.volumes(tenant);
        let mut volumes = BTreeMap::new();
        for (key, value) in self.store.list(&prefix).await? {
            let Some(name) = key.strip_prefix(&prefix) else {
                continue;
            };
            volumes.insert(name.to_string(), serde_json::from_slice(&value)?);
        }
        Ok(volumes)
    }

    pub async fn list_all_volumes(&self) -> Result<Vec<VolumeConfig>> {
        let mut volumes = Vec::new();
        for (_, value) in self.store.list(&self.keys.all_volumes()).await? {
            volumes.push(serde_json::from_slice(&value)?);
        }
        Ok(volumes)
    }
}
