//! Configuration shared by the agent, deployer and query commands.
//!
//! Configuration is read from JSON files and merged left to right: later
//! non-empty string fields override, later non-zero durations override and
//! `allowStale` is sticky once enabled. Environment variables override the
//! merged file values.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection and tree-location settings common to every command.
///
/// Decoding a partial JSON document yields empty fields; merge the result
/// into [`CommonConfig::defaults`] to obtain a usable configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CommonConfig {
    pub server: String,
    pub username: String,
    pub password: String,
    pub token: String,
    pub datacenter: String,
    pub prefix: String,
    /// Duration string such as `10m` or `30s`.
    pub wait: String,
    pub allow_stale: bool,
}

impl CommonConfig {
    /// The baseline configuration every command starts from.
    pub fn defaults() -> Self {
        CommonConfig {
            server: "127.0.0.1:8500".to_string(),
            username: String::new(),
            password: String::new(),
            token: String::new(),
            datacenter: String::new(),
            prefix: "deploy/versions".to_string(),
            wait: "10m".to_string(),
            allow_stale: true,
        }
    }

    /// Merge `other` into `self`. Non-empty fields of `other` win.
    pub fn merge(&mut self, other: CommonConfig) {
        if !other.server.is_empty() {
            self.server = other.server;
        }
        if !other.username.is_empty() {
            self.username = other.username;
        }
        if !other.password.is_empty() {
            self.password = other.password;
        }
        if !other.token.is_empty() {
            self.token = other.token;
        }
        if !other.datacenter.is_empty() {
            self.datacenter = other.datacenter;
        }
        if !other.prefix.is_empty() {
            self.prefix = other.prefix;
        }
        if !other.wait.is_empty() {
            self.wait = other.wait;
        }
        if other.allow_stale {
            self.allow_stale = true;
        }
    }

    /// Apply `DEPRO_*` environment overrides on top of the current values.
    pub fn apply_env(&mut self) {
        if let Ok(server) = std::env::var("DEPRO_SERVER") {
            if !server.is_empty() {
                self.server = server;
            }
        }
        if let Ok(auth) = std::env::var("DEPRO_AUTH") {
            if let Some((user, pass)) = auth.split_once(':') {
                self.username = user.to_string();
                self.password = pass.to_string();
            } else if !auth.is_empty() {
                self.username = auth;
            }
        }
        if let Ok(token) = std::env::var("DEPRO_TOKEN") {
            if !token.is_empty() {
                self.token = token;
            }
        }
        if let Ok(datacenter) = std::env::var("DEPRO_DATACENTER") {
            if !datacenter.is_empty() {
                self.datacenter = datacenter;
            }
        }
        if let Ok(prefix) = std::env::var("DEPRO_PREFIX") {
            if !prefix.is_empty() {
                self.prefix = prefix;
            }
        }
    }

    /// Parse the `wait` field. Fails on malformed duration strings so that
    /// bad configuration surfaces at startup rather than mid-deployment.
    pub fn wait_time(&self) -> Result<Duration> {
        humantime::parse_duration(&self.wait)
            .map_err(|e| Error::Config(format!("invalid wait duration '{}': {}", self.wait, e)))
    }

    /// The non-slash-terminated key path of a version under the prefix,
    /// such as `deploy/myapp/version12345`.
    pub fn version_path(&self, version: &str) -> String {
        format!(
            "{}/{}",
            self.prefix.trim_matches('/'),
            version.trim_matches('/')
        )
    }
}
