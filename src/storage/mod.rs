//! Volume lifecycle driver
//!
//! Per volume: `Absent -> Created (unmapped) -> Mapped -> Mounted`, with
//! snapshots as an independent set of named points. Mount-side operations
//! absorb "already in the desired state" as success so racing containers
//! and retried requests converge instead of failing. Snapshot operations do
//! not: a duplicate or missing snapshot name is a caller error.

pub mod mount;
pub mod parse;
pub mod rbd;

use crate::common::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use mount::{MountTable, SystemMounts};
pub use rbd::RbdDriver;

/// A block image: pool, image name and size in MB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub pool: String,
    pub name: String,
    pub size_mb: u64,
}

impl VolumeSpec {
    pub fn new(pool: impl Into<String>, name: impl Into<String>, size_mb: u64) -> Self {
        Self {
            pool: pool.into(),
            name: name.into(),
            size_mb,
        }
    }
}

impl fmt::Display for VolumeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[name: {}/{} size: {}]", self.pool, self.name, self.size_mb)
    }
}

/// Filesystem type plus the command template that initialises it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsOptions {
    pub fs_type: String,
    /// `%` is replaced by the device path
    pub create_command: String,
}

/// A mapped (and usually mounted) device on this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRecord {
    pub pool: String,
    /// Image name, i.e. the internal `tenant.volume` form
    pub volume: String,
    pub device: PathBuf,
    pub path: PathBuf,
    pub host: String,
    pub dev_major: u64,
    pub dev_minor: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Mount paths are `<mount_base>/<pool>/<name>`.
pub fn mount_path(mount_base: &Path, pool: &str, name: &str) -> PathBuf {
    mount_base.join(pool).join(name)
}

/// Lifecycle operations a block storage backend must provide.
#[async_trait]
pub trait VolumeBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn mount_path(&self, pool: &str, name: &str) -> PathBuf;

    async fn exists(&self, vol: &VolumeSpec) -> Result<bool>;

    /// Create the image and initialise its filesystem. An image that already
    /// exists is left untouched and reported as [`CreateOutcome::AlreadyExists`].
    async fn create(
        &self,
        vol: &VolumeSpec,
        fs: &FsOptions,
        timeout: Duration,
    ) -> Result<CreateOutcome>;

    async fn mount(&self, vol: &VolumeSpec, fs_type: &str) -> Result<MountRecord>;

    async fn unmount(&self, vol: &VolumeSpec) -> Result<()>;

    /// Purge snapshots, then delete the image.
    async fn remove(&self, vol: &VolumeSpec) -> Result<()>;

    async fn create_snapshot(&self, vol: &VolumeSpec, snapshot: &str) -> Result<()>;

    async fn remove_snapshot(&self, vol: &VolumeSpec, snapshot: &str) -> Result<()>;

    /// Snapshot names in creation order.
    async fn list_snapshots(&self, vol: &VolumeSpec) -> Result<Vec<String>>;

    /// Devices currently mapped on this host.
    async fn mounted(&self) -> Result<Vec<MountRecord>>;
}
