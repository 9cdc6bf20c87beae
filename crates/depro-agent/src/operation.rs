//! The agent-side operation: one deployment loop per configured deployment.

use crate::config::AgentConfig;
use crate::deployment::Deployment;
use depro_core::shutdown::Shutdown;
use depro_core::Result;
use depro_kv::KvStore;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info};

pub struct Operation {
    config: AgentConfig,
    store: Arc<dyn KvStore>,
    shutdown: Shutdown,
}

impl Operation {
    pub fn new(config: AgentConfig, store: Arc<dyn KvStore>, shutdown: Shutdown) -> Operation {
        Operation {
            config,
            store,
            shutdown,
        }
    }

    /// Spawn every deployment loop and wait for all of them to return. One
    /// deployment failing does not cancel the others.
    pub async fn run(&self) -> Result<()> {
        let mut deployments = JoinSet::new();

        for config in &self.config.deployments {
            let deployment = Deployment::new(
                config.clone(),
                self.config.name.clone(),
                Arc::clone(&self.store),
                self.shutdown.clone(),
            );

            deployments.spawn(async move {
                info!(deployment = %deployment.id(), "Starting agent");
                match deployment.run().await {
                    Ok(()) => info!(deployment = %deployment.id(), "Stopping agent"),
                    Err(e) => error!(deployment = %deployment.id(), error = %e, "Failed to run agent"),
                }
            });
        }

        while deployments.join_next().await.is_some() {}
        Ok(())
    }
}
