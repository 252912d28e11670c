//! Configuration for blocklease components
//!
//! Loaded once at startup (file, then `BLOCKLEASE_*` environment, then CLI
//! flags in each binary) and shared read-only behind an `Arc`.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the TOML config file
pub const CONFIG_ENV: &str = "BLOCKLEASE_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "blocklease.toml";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Shared lease/metadata store
    pub store: StoreConfig,

    /// Block device driver settings
    pub storage: StorageConfig,

    /// Control-plane daemon
    pub master: MasterConfig,

    /// Per-host node agent
    pub agent: AgentConfig,

    /// Reconciliation loop
    pub supervisor: SupervisorConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            store: StoreConfig::default(),
            storage: StorageConfig::default(),
            master: MasterConfig::default(),
            agent: AgentConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Etcd,
    Memory,
}

/// Shared store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,

    /// etcd endpoints
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Key prefix every record lives under
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Etcd
}
fn default_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}
fn default_prefix() -> String {
    "/blocklease".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            endpoints: default_endpoints(),
            prefix: default_prefix(),
        }
    }
}

/// Storage driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Mount paths are `<mount_base>/<pool>/<volume>`
    #[serde(default = "default_mount_base")]
    pub mount_base: PathBuf,

    #[serde(default = "default_rbd_binary")]
    pub rbd_binary: String,

    #[serde(default = "default_ceph_binary")]
    pub ceph_binary: String,

    /// Mapped devices are `/dev/<device_prefix><N>`
    #[serde(default = "default_device_prefix")]
    pub device_prefix: String,

    /// Upper bound for a single storage tool invocation
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_mount_base() -> PathBuf {
    PathBuf::from("/mnt/ceph")
}
fn default_rbd_binary() -> String {
    "rbd".to_string()
}
fn default_ceph_binary() -> String {
    "ceph".to_string()
}
fn default_device_prefix() -> String {
    "rbd".to_string()
}
fn default_command_timeout() -> u64 {
    120
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mount_base: default_mount_base(),
            rbd_binary: default_rbd_binary(),
            ceph_binary: default_ceph_binary(),
            device_prefix: default_device_prefix(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl StorageConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Control-plane daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Bind address for HTTP API
    #[serde(default = "default_master_bind")]
    pub bind_addr: SocketAddr,

    /// TTL on mount leases
    #[serde(default = "default_mount_ttl")]
    pub mount_ttl_secs: u64,

    /// Timeout for filesystem initialisation during create
    #[serde(default = "default_operation_timeout")]
    pub timeout_secs: u64,
}

fn default_master_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}
fn default_mount_ttl() -> u64 {
    30
}
fn default_operation_timeout() -> u64 {
    600
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_master_bind(),
            mount_ttl_secs: default_mount_ttl(),
            timeout_secs: default_operation_timeout(),
        }
    }
}

impl MasterConfig {
    pub fn mount_ttl(&self) -> Duration {
        Duration::from_secs(self.mount_ttl_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Node agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_bind")]
    pub bind_addr: SocketAddr,

    /// Base URL of the control plane
    #[serde(default = "default_master_url")]
    pub master_url: String,

    /// Overrides the OS hostname as lease holder identity
    #[serde(default)]
    pub hostname: Option<String>,

    /// blkio cgroup directory receiving throttle settings
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,

    /// Must match the control plane's mount TTL
    #[serde(default = "default_mount_ttl")]
    pub mount_ttl_secs: u64,
}

fn default_agent_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}
fn default_master_url() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup/blkio")
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_agent_bind(),
            master_url: default_master_url(),
            hostname: None,
            cgroup_root: default_cgroup_root(),
            mount_ttl_secs: default_mount_ttl(),
        }
    }
}

impl AgentConfig {
    /// Renewal happens twice per TTL window
    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.mount_ttl_secs.max(1) * 500)
    }
}

/// Reconciler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Age after which a never-provisioned volume record is swept
    #[serde(default = "default_pending_grace")]
    pub pending_grace_secs: u64,

    #[serde(default)]
    pub hostname: Option<String>,
}

fn default_interval() -> u64 {
    60
}
fn default_pending_grace() -> u64 {
    3600
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            pending_grace_secs: default_pending_grace(),
            hostname: None,
        }
    }
}

impl SupervisorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn pending_grace(&self) -> Duration {
        Duration::from_secs(self.pending_grace_secs)
    }
}

impl Config {
    /// Load from `$BLOCKLEASE_CONFIG` (or `./blocklease.toml`) and the environment.
    /// A missing file is not an error; defaults apply.
    pub fn load() -> crate::Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::from_file(&path)
    }

    pub fn from_file(path: &str) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("BLOCKLEASE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Config = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.store.backend == StoreBackend::Etcd && self.store.endpoints.is_empty() {
            return Err(crate::Error::InvalidConfig(
                "etcd backend needs at least one endpoint".into(),
            ));
        }
        if self.master.mount_ttl_secs == 0 || self.agent.mount_ttl_secs == 0 {
            return Err(crate::Error::InvalidConfig(
                "mount TTL must be positive".into(),
            ));
        }
        if self.supervisor.interval_secs == 0 {
            return Err(crate::Error::InvalidConfig(
                "supervisor interval must be positive".into(),
            ));
        }
        if self.agent.mount_ttl_secs != self.master.mount_ttl_secs {
            tracing::warn!(
                agent = self.agent.mount_ttl_secs,
                master = self.master.mount_ttl_secs,
                "Agent and master mount TTLs differ; renewals may lag expiry"
            );
        }
        if !self.storage.mount_base.is_absolute() {
            return Err(crate::Error::InvalidConfig(format!(
                "mount base {} must be absolute",
                self.storage.mount_base.display()
            )));
        }
        Ok(())
    }
}
