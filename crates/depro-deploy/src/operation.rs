//! The deployer flow: barrier first, rollout marker second.

use crate::config::DeployConfig;
use depro_core::{Error, Result};
use depro_kv::KvStore;
use depro_waiter::{ReadyPredicate, WaitNode, Waiter};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// States the deployer counts towards the barrier. `failed` is quorum-ready
/// but flags the node in the final report.
fn deploy_ready(node: &WaitNode) -> bool {
    matches!(
        node.state.as_str(),
        "ready" | "available" | "failed" | "active"
    )
}

pub struct Operation {
    pub version: String,
    pub config: DeployConfig,
    store: Arc<dyn KvStore>,
}

impl Operation {
    pub fn new(version: &str, config: DeployConfig, store: Arc<dyn KvStore>) -> Operation {
        Operation {
            version: version.to_string(),
            config,
            store,
        }
    }

    /// Wait for the fleet, then mark the version for rollout. The `current`
    /// key is only written when every node converged without failure.
    pub async fn run(&self) -> Result<()> {
        self.run_deployment().await?;
        self.mark_rollout().await
    }

    async fn run_deployment(&self) -> Result<()> {
        let predicate: ReadyPredicate = Box::new(deploy_ready);
        let (waiter, mut events) = Waiter::new(
            Arc::clone(&self.store),
            &self.config.common.version_path(&self.version),
            self.config.nodes,
            Some(predicate),
        );
        let wait_time = self.config.common.wait_time()?;

        println!("Starting deployment of version '{}'", self.version);

        // The barrier outcome only surfaces here when it is a failure; on
        // success the all-ready notification below carries the snapshot.
        let (failure_tx, mut failure_rx) = mpsc::channel::<Error>(1);
        tokio::spawn(async move {
            let outcome = match waiter.wait(wait_time).await {
                Ok(true) => None,
                Ok(false) => Some(Error::PreparationTimeout),
                Err(e) => Some(e),
            };
            if let Some(e) = outcome {
                let _ = failure_tx.try_send(e);
            }
        });

        let mut wait_done = false;
        loop {
            tokio::select! {
                Some(update) = events.node_update.recv() => {
                    if update.state.is_empty() && update.last_state.is_empty() {
                        println!("+ {}", update.node);
                    } else if update.state.is_empty() {
                        println!("- {} #{}", update.node, update.last_state);
                    } else if update.last_state.is_empty() {
                        println!("+ {} #{}", update.node, update.state);
                    } else {
                        println!("> {} #{} -> #{}", update.node, update.last_state, update.state);
                    }
                }
                Some(node) = events.node_ready.recv() => {
                    println!("+ {}@{}", self.version, node.node);
                }
                Some(nodes) = events.all_ready.recv() => {
                    let mut successful = true;
                    for node in &nodes {
                        if node.state == "failed" {
                            println!("! {} #failed", node.node);
                            successful = false;
                        }
                    }
                    if !successful {
                        return Err(Error::DeploymentFailed(self.version.clone()));
                    }
                    println!(
                        "Version '{}' deployed to all nodes, starting rollout.",
                        self.version
                    );
                    return Ok(());
                }
                failure = failure_rx.recv(), if !wait_done => {
                    match failure {
                        Some(e) => return Err(e),
                        // Closed without a failure: the all-ready
                        // notification is already in flight.
                        None => wait_done = true,
                    }
                }
            }
        }
    }

    async fn mark_rollout(&self) -> Result<()> {
        let key = format!("{}/current", self.config.common.prefix.trim_matches('/'));
        debug!(key = %key, version = %self.version, "Marking version for rollout");
        self.store.put(&key, &self.version).await?;

        println!("Version '{}' marked for rollout", self.version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depro_kv::MemoryStore;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_config(wait: &str, nodes: usize) -> DeployConfig {
        let mut config = DeployConfig::defaults();
        config.common.prefix = "versions".to_string();
        config.common.wait = wait.to_string();
        config.nodes = nodes;
        config
    }

    #[tokio::test]
    async fn converged_fleet_marks_the_rollout() {
        let store = MemoryStore::with_wait_time(Duration::from_millis(50));
        let operation = Operation::new("test", test_config("10s", 1), store.clone());

        let publisher = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                store.put("versions/test/node1", "busy").await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
                store.put("versions/test/node1", "ready").await.unwrap();
            })
        };

        timeout(Duration::from_secs(5), operation.run())
            .await
            .expect("deployment should converge")
            .unwrap();
        publisher.await.unwrap();

        let (current, _) = store.get("versions/current", 0).await.unwrap();
        assert_eq!(current.unwrap().value, "test");
    }

    #[tokio::test]
    async fn failed_node_blocks_the_rollout() {
        let store = MemoryStore::with_wait_time(Duration::from_millis(50));
        store.put("versions/test/node1", "active").await.unwrap();
        store.put("versions/test/node2", "failed").await.unwrap();
        let operation = Operation::new("test", test_config("10s", 2), store.clone());

        let err = timeout(Duration::from_secs(5), operation.run())
            .await
            .expect("deployment should resolve")
            .unwrap_err();
        assert!(matches!(err, Error::DeploymentFailed(v) if v == "test"));

        let (current, _) = store.get("versions/current", 0).await.unwrap();
        assert!(current.is_none(), "current must not be written on failure");
    }

    #[tokio::test]
    async fn timeout_blocks_the_rollout() {
        let store = MemoryStore::with_wait_time(Duration::from_millis(20));
        let operation = Operation::new("test", test_config("200ms", 1), store.clone());

        let err = timeout(Duration::from_secs(5), operation.run())
            .await
            .expect("deployment should time out")
            .unwrap_err();
        assert!(matches!(err, Error::PreparationTimeout));

        let (current, _) = store.get("versions/current", 0).await.unwrap();
        assert!(current.is_none(), "current must not be written on timeout");
    }
}
