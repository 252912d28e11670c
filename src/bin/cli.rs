//! Admin CLI

use blocklease::agent::MasterClient;
use blocklease::common::{local_hostname, split_path, Config, SystemExecutor};
use blocklease::coordinator::{MetadataStore, TenantConfig, UseConfig, UseLocker, UseReason};
use blocklease::storage::{RbdDriver, SystemMounts, VolumeBackend};
use blocklease::store::{self, Keys};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "blocklease")]
#[command(about = "blocklease administration")]
#[command(version)]
struct Cli {
    /// etcd endpoints (comma-separated)
    #[arg(long, value_delimiter = ',', global = true)]
    etcd: Vec<String>,

    /// Control-plane URL, for operations that touch storage
    #[arg(long, global = true)]
    master: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage tenants
    Tenant {
        #[command(subcommand)]
        command: TenantCommands,
    },

    /// Inspect and remove volumes
    Volume {
        #[command(subcommand)]
        command: VolumeCommands,
    },

    /// Inspect and break use locks
    Use {
        #[command(subcommand)]
        command: UseCommands,
    },

    /// Inspect snapshots
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommands,
    },
}

#[derive(Subcommand)]
enum TenantCommands {
    /// Upload a tenant from a JSON file
    Upload {
        name: String,

        #[arg(long)]
        file: PathBuf,
    },
    /// Show a tenant
    Get { name: String },
    /// List tenants
    List,
    /// Delete a tenant
    Delete { name: String },
}

#[derive(Subcommand)]
enum VolumeCommands {
    /// List all volumes
    List,
    /// Show a volume record (`tenant/volume`)
    Get { name: String },
    /// Remove a volume and its image through the control plane
    Remove { name: String },
}

#[derive(Subcommand)]
enum UseCommands {
    /// List live use locks
    List,
    /// Show the lock on a volume
    Get { name: String },
    /// Delete a lock regardless of its holder
    ForceRemove { name: String },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// List snapshots of a volume
    List { name: String },
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = Config::load()?;
    if !cli.etcd.is_empty() {
        config.store.endpoints = cli.etcd;
    }
    if let Some(master) = cli.master {
        config.agent.master_url = master;
    }

    let kv = store::open(&config.store).await?;
    let keys = Keys::new(&config.store.prefix);
    let metadata = MetadataStore::new(kv.clone(), keys.clone());
    let locks = UseLocker::new(kv, keys);

    match cli.command {
        Commands::Tenant { command } => match command {
            TenantCommands::Upload { name, file } => {
                let content = std::fs::read(&file)?;
                let tenant: TenantConfig = serde_json::from_slice(&content)?;
                tenant.default_options.validate(&tenant)?;
                metadata.publish_tenant(&name, &tenant).await?;
                println!("Uploaded tenant {}", name);
            }
            TenantCommands::Get { name } => print_json(&metadata.get_tenant(&name).await?)?,
            TenantCommands::List => {
                for name in metadata.list_tenants().await? {
                    println!("{}", name);
                }
            }
            TenantCommands::Delete { name } => {
                metadata.delete_tenant(&name).await?;
                println!("Deleted tenant {}", name);
            }
        },

        Commands::Volume { command } => match command {
            VolumeCommands::List => {
                for volume in metadata.list_all_volumes().await? {
                    println!("{}\t{:?}", volume.name(), volume.state);
                }
            }
            VolumeCommands::Get { name } => {
                let (tenant, volume) = split_path(&name)?;
                print_json(&metadata.get_volume(&tenant, &volume).await?)?;
            }
            VolumeCommands::Remove { name } => {
                let (tenant, volume) = split_path(&name)?;
                let client =
                    MasterClient::new(&config.agent.master_url, Duration::from_secs(600))?;
                client.remove(&tenant, &volume).await?;
                println!("Removed {}", name);
            }
        },

        Commands::Use { command } => match command {
            UseCommands::List => {
                for lease in locks.list_uses().await? {
                    println!("{}\t{}\t{}", lease.name(), lease.hostname, lease.reason);
                }
            }
            UseCommands::Get { name } => {
                let (tenant, volume) = split_path(&name)?;
                match locks.get_use(&tenant, &volume).await? {
                    Some(lease) => print_json(&lease)?,
                    None => println!("{} is not in use", name),
                }
            }
            UseCommands::ForceRemove { name } => {
                let (tenant, volume) = split_path(&name)?;
                let lease = UseConfig::new(tenant, volume, local_hostname()?, UseReason::Remove);
                locks.remove_use(&lease, true).await?;
                println!("Removed use lock on {}", name);
            }
        },

        Commands::Snapshot { command } => match command {
            SnapshotCommands::List { name } => {
                let (tenant, volume) = split_path(&name)?;
                let record = metadata.get_volume(&tenant, &volume).await?;
                let driver = RbdDriver::new(
                    config.storage.clone(),
                    local_hostname()?,
                    Arc::new(SystemExecutor),
                    Arc::new(SystemMounts),
                );
                let spec = record.spec()?;
                let snapshots = driver.list_snapshots(&spec).await?;
                if snapshots.is_empty() {
                    println!("{} has no snapshots", name);
                }
                for snapshot in snapshots {
                    println!("{}", snapshot);
                }
            }
        },
    }

    Ok(())
}
