//! Node agent server

use super::http::create_router;
use super::{CgroupBlkioLimiter, MasterClient, NodeAgent};
use crate::common::{local_hostname, Config, Result, SystemExecutor};
use crate::storage::{RbdDriver, SystemMounts};
use std::sync::Arc;
use std::time::Duration;

const MASTER_REQUEST_TIMEOUT: Duration = Duration::from_secs(15 * 60);

pub struct Agent {
    config: Arc<Config>,
}

impl Agent {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub fn build(&self) -> Result<NodeAgent> {
        let hostname = match &self.config.agent.hostname {
            Some(name) => name.clone(),
            None => local_hostname()?,
        };
        let mounts = Arc::new(SystemMounts);
        let backend = Arc::new(RbdDriver::new(
            self.config.storage.clone(),
            hostname.clone(),
            Arc::new(SystemExecutor),
            mounts.clone(),
        ));
        let client = MasterClient::new(&self.config.agent.master_url, MASTER_REQUEST_TIMEOUT)?;

        Ok(NodeAgent::new(
            hostname,
            client,
            backend,
            mounts,
            Arc::new(CgroupBlkioLimiter::new(&self.config.agent.cgroup_root)),
        ))
    }

    pub async fn serve(self) -> Result<()> {
        let agent_config = &self.config.agent;
        let node = Arc::new(self.build()?);

        tracing::info!("Starting node agent: {}", node.host());
        tracing::info!("  HTTP API: {}", agent_config.bind_addr);
        tracing::info!("  Control plane: {}", agent_config.master_url);
        tracing::info!("  Lease renewal every {:?}", agent_config.renew_interval());

        let renewal = tokio::spawn(node.clone().run_renewal(agent_config.renew_interval()));

        let listener = tokio::net::TcpListener::bind(agent_config.bind_addr).await?;
        let server = axum::serve(listener, create_router(node));

        tracing::info!("✓ Node agent ready");

        tokio::select! {
            res = server => {
                if let Err(e) = res {
                    tracing::error!("HTTP server error: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down node agent");
            }
        }

        renewal.abort();
        Ok(())
    }
}
