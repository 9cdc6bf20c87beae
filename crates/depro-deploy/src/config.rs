//! Deployer configuration.

use depro_core::config::CommonConfig;
use depro_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    #[serde(flatten)]
    pub common: CommonConfig,

    /// The minimum number of agent entries required before the barrier may
    /// complete.
    pub nodes: usize,
}

impl DeployConfig {
    pub fn defaults() -> DeployConfig {
        DeployConfig {
            common: CommonConfig::defaults(),
            nodes: 1,
        }
    }

    pub fn decode(input: &str) -> Result<DeployConfig> {
        let config: DeployConfig = serde_json::from_str(input)?;
        if !config.common.wait.is_empty() {
            config.common.wait_time()?;
        }
        Ok(config)
    }

    /// Merge `other` into `self`; non-empty strings and non-zero numerics
    /// override.
    pub fn merge(&mut self, other: DeployConfig) {
        self.common.merge(other.common);
        if other.nodes != 0 {
            self.nodes = other.nodes;
        }
    }

    pub fn read_file(path: &Path) -> Result<DeployConfig> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("error reading '{}': {}", path.display(), e)))?;
        Self::decode(&contents)
            .map_err(|e| Error::Config(format!("error decoding '{}': {}", path.display(), e)))
    }

    /// Defaults, overlaid with an optional file, then the environment.
    pub fn load(path: Option<&Path>) -> Result<DeployConfig> {
        let mut config = DeployConfig::defaults();
        if let Some(path) = path {
            config.merge(Self::read_file(path)?);
        }
        config.common.apply_env();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn decode_server() {
        let config = DeployConfig::decode(r#"{"server": "127.0.0.1:8500"}"#).unwrap();
        assert_eq!(config.common.server, "127.0.0.1:8500");
    }

    #[test]
    fn decode_prefix() {
        let config = DeployConfig::decode(r#"{"prefix": "myapp/production/versions"}"#).unwrap();
        assert_eq!(config.common.prefix, "myapp/production/versions");
    }

    #[test]
    fn decode_nodes() {
        let config = DeployConfig::decode(r#"{"nodes": 3}"#).unwrap();
        assert_eq!(config.nodes, 3);
    }

    #[test]
    fn decode_wait_time() {
        let config = DeployConfig::decode(r#"{"wait": "10s"}"#).unwrap();
        assert_eq!(config.common.wait_time().unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn merge_prefers_later_non_zero_nodes() {
        let mut c1 = DeployConfig::defaults();
        c1.common.server = "127.0.0.1:8000".to_string();

        let c2 = DeployConfig::decode(r#"{"prefix": "test"}"#).unwrap();
        c1.merge(c2);

        assert_eq!(c1.common.server, "127.0.0.1:8000");
        assert_eq!(c1.common.prefix, "test");
        assert_eq!(c1.nodes, 1, "a zero nodes field never clobbers");

        c1.merge(DeployConfig::decode(r#"{"nodes": 5}"#).unwrap());
        assert_eq!(c1.nodes, 5);
    }
}
