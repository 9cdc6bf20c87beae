//! The Depro deployment agent.
//!
//! One agent runs per node. For every configured deployment it opens a KV
//! session, watches the version set and the current-version pointer with
//! blocking reads, and drives per-version state machines that execute the
//! deploy/rollout/clean scripts and publish their state back into the tree.

pub mod config;
pub mod deployment;
pub mod executor;
pub mod operation;
pub mod version;

pub use config::{AgentConfig, DeploymentConfig};
pub use deployment::Deployment;
pub use operation::Operation;
pub use version::Version;
