//! Control-plane binary

use blocklease::common::{Config, StoreBackend};
use blocklease::Master;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "blocklease-master")]
#[command(about = "blocklease control plane: volume records and use locks")]
#[command(version)]
struct Cli {
    /// Bind address for HTTP
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// etcd endpoints (comma-separated)
    #[arg(long, value_delimiter = ',')]
    etcd: Vec<String>,

    /// Keep leases and records in memory (single process only)
    #[arg(long)]
    memory_store: bool,

    /// TTL for mount leases, in seconds
    #[arg(long)]
    ttl: Option<u64>,

    /// Timeout for create operations, in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Base directory for mount points
    #[arg(long)]
    mount_base: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config from file and environment, then override with CLI arguments
    let mut config = Config::load()?;
    if let Some(bind) = cli.bind {
        config.master.bind_addr = bind;
    }
    if !cli.etcd.is_empty() {
        config.store.endpoints = cli.etcd;
    }
    if cli.memory_store {
        config.store.backend = StoreBackend::Memory;
    }
    if let Some(ttl) = cli.ttl {
        config.master.mount_ttl_secs = ttl;
    }
    if let Some(timeout) = cli.timeout {
        config.master.timeout_secs = timeout;
    }
    if let Some(mount_base) = cli.mount_base {
        config.storage.mount_base = mount_base;
    }
    config.validate()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Master::new(Arc::new(config)).serve().await?;
    Ok(())
}
