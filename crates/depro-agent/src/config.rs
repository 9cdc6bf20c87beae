//! Agent configuration.
//!
//! Read from JSON files (`--config-file`) or every `*.json` file in a
//! directory (`--config-dir`) in sorted order, merged left to right on top
//! of the defaults, with `DEPRO_*` environment overrides applied last.

use depro_core::config::CommonConfig;
use depro_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    #[serde(flatten)]
    pub common: CommonConfig,

    /// The name this node publishes its entries under.
    pub name: String,
    pub deployments: Vec<DeploymentConfig>,
}

/// An individual deployment: where it lives in the KV tree, where its
/// versions live on disk and the scripts that move them through their
/// lifecycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    pub id: String,
    pub path: PathBuf,
    pub prefix: String,
    pub shell: String,
    pub deploy: Vec<String>,
    pub rollout: Vec<String>,
    pub clean: Vec<String>,
}

impl DeploymentConfig {
    /// The non-slash-terminated KV key of a version under this deployment's
    /// prefix.
    pub fn version_prefix(&self, version: &str) -> String {
        format!(
            "{}/{}",
            self.prefix.trim_matches('/'),
            version.trim_matches('/')
        )
    }

    /// The local directory of a version; the deployment root when `version`
    /// is empty.
    pub fn full_path(&self, version: &str) -> PathBuf {
        if version.is_empty() {
            self.path.clone()
        } else {
            self.path.join(version)
        }
    }

    /// The shell used to run this deployment's scripts.
    pub fn shell(&self) -> &str {
        if self.shell.is_empty() {
            "sh"
        } else {
            &self.shell
        }
    }
}

impl AgentConfig {
    /// The baseline the file and flag values merge into. Agents poll with a
    /// shorter wait than the deployer's barrier timeout.
    pub fn defaults() -> AgentConfig {
        let mut common = CommonConfig::defaults();
        common.wait = "5m".to_string();

        AgentConfig {
            common,
            name: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_default(),
            deployments: Vec::new(),
        }
    }

    pub fn decode(input: &str) -> Result<AgentConfig> {
        let config: AgentConfig = serde_json::from_str(input)?;
        if !config.common.wait.is_empty() {
            config.common.wait_time()?;
        }
        Ok(config)
    }

    /// Merge `other` into `self`: non-empty scalars override, deployment
    /// lists append.
    pub fn merge(&mut self, other: AgentConfig) {
        self.common.merge(other.common);
        if !other.name.is_empty() {
            self.name = other.name;
        }
        self.deployments.extend(other.deployments);
    }

    /// Read and merge every configuration path: a file is decoded directly,
    /// a directory contributes its `*.json` files in sorted order.
    pub fn read_paths(paths: &[PathBuf]) -> Result<AgentConfig> {
        let mut result = AgentConfig::default();

        for path in paths {
            if path.is_dir() {
                let mut files: Vec<PathBuf> = std::fs::read_dir(path)
                    .map_err(|e| Error::Config(format!("error reading '{}': {}", path.display(), e)))?
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
                    .collect();
                files.sort();

                for file in files {
                    result.merge(Self::read_file(&file)?);
                }
            } else {
                result.merge(Self::read_file(path)?);
            }
        }

        Ok(result)
    }

    fn read_file(path: &Path) -> Result<AgentConfig> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("error reading '{}': {}", path.display(), e)))?;
        Self::decode(&contents)
            .map_err(|e| Error::Config(format!("error decoding '{}': {}", path.display(), e)))
    }

    /// Defaults, overlaid with every file, then the environment.
    pub fn load(paths: &[PathBuf]) -> Result<AgentConfig> {
        let mut config = AgentConfig::defaults();
        config.merge(Self::read_paths(paths)?);
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
        let config = AgentConfig::decode(r#"{"server": "127.0.0.1:8500"}"#).unwrap();
        assert_eq!(config.common.server, "127.0.0.1:8500");
    }

    #[test]
    fn decode_deployment_prefix() {
        let config =
            AgentConfig::decode(r#"{"deployments": [{"prefix": "myapp/production/versions"}]}"#)
                .unwrap();
        assert_eq!(config.deployments.len(), 1);
        assert_eq!(config.deployments[0].prefix, "myapp/production/versions");
    }

    #[test]
    fn decode_wait_time() {
        let config = AgentConfig::decode(r#"{"wait": "10s"}"#).unwrap();
        assert_eq!(config.common.wait_time().unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn decode_rejects_bad_wait_time() {
        assert!(AgentConfig::decode(r#"{"wait": "soon"}"#).is_err());
    }

    #[test]
    fn merge_keeps_earlier_fields_and_appends_deployments() {
        let mut c1 = AgentConfig::decode(r#"{"server": "127.0.0.1:8000"}"#).unwrap();
        c1.deployments.push(DeploymentConfig {
            id: "one".to_string(),
            ..DeploymentConfig::default()
        });

        let c2 = AgentConfig::decode(r#"{"wait": "12s", "deployments": [{"id": "two"}]}"#).unwrap();
        c1.merge(c2);

        assert_eq!(c1.common.server, "127.0.0.1:8000");
        assert_eq!(c1.common.wait_time().unwrap(), Duration::from_secs(12));
        let ids: Vec<&str> = c1.deployments.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["one", "two"]);
    }

    #[test]
    fn reads_directory_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("20-b.json"), r#"{"prefix": "later"}"#).unwrap();
        std::fs::write(dir.path().join("10-a.json"), r#"{"prefix": "earlier"}"#).unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "not json").unwrap();

        let config = AgentConfig::read_paths(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(config.common.prefix, "later");
    }

    #[test]
    fn deployment_paths() {
        let config = DeploymentConfig {
            id: "test".to_string(),
            path: PathBuf::from("/data/deploy"),
            prefix: "deploy/myapp".to_string(),
            ..DeploymentConfig::default()
        };

        assert_eq!(config.full_path(""), PathBuf::from("/data/deploy"));
        assert_eq!(config.full_path("1234"), PathBuf::from("/data/deploy/1234"));
        assert_eq!(config.version_prefix("1234"), "deploy/myapp/1234");
    }

    #[test]
    fn shell_defaults_to_sh() {
        let config = DeploymentConfig::default();
        assert_eq!(config.shell(), "sh");
    }
}
