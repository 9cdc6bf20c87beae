//! The version state vocabulary published into the KV tree.
//!
//! Agents publish these values as plain strings under
//! `<prefix>/<version>/<node>`; other tooling may publish values outside this
//! vocabulary (for example `ready` or `busy`), so anything that consumes
//! foreign entries works on raw strings instead.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionState {
    Unregistered,
    Deploying,
    Available,
    Starting,
    Active,
    Failed,
}

impl VersionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionState::Unregistered => "unregistered",
            VersionState::Deploying => "deploying",
            VersionState::Available => "available",
            VersionState::Starting => "starting",
            VersionState::Active => "active",
            VersionState::Failed => "failed",
        }
    }
}

impl fmt::Display for VersionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_lowercase() {
        assert_eq!(VersionState::Unregistered.to_string(), "unregistered");
        assert_eq!(VersionState::Active.as_str(), "active");
    }
}
