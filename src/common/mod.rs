//! Common utilities and types shared across blocklease

pub mod config;
pub mod error;
pub mod exec;
pub mod middleware;
pub mod utils;

pub use config::{
    AgentConfig, Config, MasterConfig, StorageConfig, StoreBackend, StoreConfig, SupervisorConfig,
};
pub use error::{Error, Result};
pub use exec::{Executor, Invocation, Output, SystemExecutor};
pub use utils::{
    external_name, internal_name, join_path, local_hostname, parse_duration, retry_with_backoff,
    split_path, template_fs_cmd, timestamp_now,
};
