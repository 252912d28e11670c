//! Reconciler binary

use blocklease::common::{local_hostname, Config, SystemExecutor};
use blocklease::coordinator::{MetadataStore, UseLocker};
use blocklease::storage::{RbdDriver, SystemMounts};
use blocklease::store::{self, Keys};
use blocklease::Reconciler;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "blocklease-supervisor")]
#[command(about = "blocklease reconciler: cleans up lapsed mounts, takes scheduled snapshots")]
#[command(version)]
struct Cli {
    /// Seconds between passes
    #[arg(long)]
    interval: Option<u64>,

    /// etcd endpoints (comma-separated)
    #[arg(long, value_delimiter = ',')]
    etcd: Vec<String>,

    /// Run a single pass and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(interval) = cli.interval {
        config.supervisor.interval_secs = interval;
    }
    if !cli.etcd.is_empty() {
        config.store.endpoints = cli.etcd;
    }
    config.validate()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let host = match &config.supervisor.hostname {
        Some(name) => name.clone(),
        None => local_hostname()?,
    };
    let kv = store::open(&config.store).await?;
    let keys = Keys::new(&config.store.prefix);
    let backend = Arc::new(RbdDriver::new(
        config.storage.clone(),
        host.clone(),
        Arc::new(SystemExecutor),
        Arc::new(SystemMounts),
    ));
    let reconciler = Reconciler::new(
        MetadataStore::new(kv.clone(), keys.clone()),
        UseLocker::new(kv, keys),
        backend,
        host,
        config.supervisor.pending_grace(),
    );

    if cli.once {
        let report = reconciler.run_once().await;
        println!("{:#?}", report);
        return Ok(());
    }

    let interval = config.supervisor.interval();
    tracing::info!("Reconciling every {:?}", interval);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                reconciler.run_once().await;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down reconciler");
                break;
            }
        }
    }

    Ok(())
}
