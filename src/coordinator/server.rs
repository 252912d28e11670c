//! Control-plane server

use crate::common::{local_hostname, Config, Result, SystemExecutor};
use crate::coordinator::http::{create_router, MasterState};
use crate::coordinator::lock::UseLocker;
use crate::coordinator::metadata::MetadataStore;
use crate::storage::{RbdDriver, SystemMounts};
use crate::store::{self, Keys};
use std::sync::Arc;

pub struct Master {
    config: Arc<Config>,
}

impl Master {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Wire the store, locks and backend into router state.
    pub async fn state(&self) -> Result<MasterState> {
        let store = store::open(&self.config.store).await?;
        let keys = Keys::new(&self.config.store.prefix);
        let hostname = local_hostname()?;

        let backend = Arc::new(RbdDriver::new(
            self.config.storage.clone(),
            hostname.clone(),
            Arc::new(SystemExecutor),
            Arc::new(SystemMounts),
        ));

        Ok(MasterState {
            config: self.config.clone(),
            metadata: MetadataStore::new(store.clone(), keys.clone()),
            locks: UseLocker::new(store, keys),
            backend,
            hostname,
        })
    }

    pub async fn serve(self) -> Result<()> {
        let master = &self.config.master;
        tracing::info!("Starting control plane");
        tracing::info!("  HTTP API: {}", master.bind_addr);
        tracing::info!(
            "  Store: {:?} {:?}",
            self.config.store.backend,
            self.config.store.endpoints
        );
        tracing::info!("  Mount TTL: {:?}", master.mount_ttl());
        tracing::info!("  Operation timeout: {:?}", master.timeout());

        let router = create_router(self.state().await?);
        let listener = tokio::net::TcpListener::bind(master.bind_addr).await?;
        let server = axum::serve(listener, router);

        tracing::info!("✓ Control plane ready");

        tokio::select! {
            res = server => {
                if let Err(e) = res {
                    tracing::error!("HTTP server error: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down control plane");
            }
        }

        Ok(())
    }
}
