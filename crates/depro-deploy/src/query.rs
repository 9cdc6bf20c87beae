//! Read-only cluster state listing.

use depro_core::config::CommonConfig;
use depro_core::Result;
use depro_kv::KvStore;
use std::sync::Arc;

/// Prints the node→state table for the current (or a given) version.
pub struct QueryOperation {
    pub version: String,
    pub config: CommonConfig,
    store: Arc<dyn KvStore>,
}

impl QueryOperation {
    /// An empty `version` queries whatever is currently rolled out.
    pub fn new(version: &str, config: CommonConfig, store: Arc<dyn KvStore>) -> QueryOperation {
        QueryOperation {
            version: version.to_string(),
            config,
            store,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let prefix = self.config.prefix.trim_matches('/');
        let (current, _) = self.store.get(&format!("{}/current", prefix), 0).await?;

        let current = match current {
            Some(pair) => pair.value,
            None => {
                println!(
                    "No version currently rolled out to your cluster, or you specified an incorrect prefix."
                );
                return Ok(());
            }
        };

        let version = if self.version.is_empty() {
            current.clone()
        } else {
            self.version.clone()
        };

        if version == current {
            println!("Version '{}' (active)", version);
        } else {
            println!("Version '{}'", version);
        }

        let version_prefix = self.config.version_path(&version);
        let (pairs, _) = self.store.list(&version_prefix, 0).await?;

        for pair in pairs {
            let node = pair
                .key
                .strip_prefix(&version_prefix)
                .unwrap_or("")
                .trim_matches('/');
            if !node.is_empty() {
                println!("{:>10} | {}", pair.value, node);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depro_kv::MemoryStore;

    #[tokio::test]
    async fn lists_node_states_for_the_current_version() {
        let store = MemoryStore::new();
        store.put("deploy/versions/current", "v2").await.unwrap();
        store.put("deploy/versions/v2/", "").await.unwrap();
        store.put("deploy/versions/v2/node1", "active").await.unwrap();
        store.put("deploy/versions/v2/node2", "failed").await.unwrap();

        let operation = QueryOperation::new("", CommonConfig::defaults(), store);
        operation.run().await.unwrap();
    }

    #[tokio::test]
    async fn missing_current_pointer_is_not_an_error() {
        let store = MemoryStore::new();
        let operation = QueryOperation::new("", CommonConfig::defaults(), store);
        operation.run().await.unwrap();
    }
}
