//! Node agent binary

use blocklease::common::Config;
use blocklease::Agent;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "blocklease-agent")]
#[command(about = "blocklease node agent: mounts volumes on this host")]
#[command(version)]
struct Cli {
    /// Bind address for the volume-driver API
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Control-plane URL
    #[arg(long)]
    master: Option<String>,

    /// Lease holder name (defaults to the OS hostname)
    #[arg(long)]
    hostname: Option<String>,

    /// Mount lease TTL configured on the control plane, in seconds
    #[arg(long)]
    ttl: Option<u64>,

    /// blkio cgroup directory
    #[arg(long)]
    cgroup_root: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(bind) = cli.bind {
        config.agent.bind_addr = bind;
    }
    if let Some(master) = cli.master {
        config.agent.master_url = master;
    }
    if cli.hostname.is_some() {
        config.agent.hostname = cli.hostname;
    }
    if let Some(ttl) = cli.ttl {
        config.agent.mount_ttl_secs = ttl;
    }
    if let Some(root) = cli.cgroup_root {
        config.agent.cgroup_root = root;
    }
    config.validate()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Agent::new(Arc::new(config)).serve().await?;
    Ok(())
}
