//! The Depro deployer.
//!
//! A one-shot operation: wait at the version's KV prefix until the fleet
//! converges (every agent entry ready, quorum met), then mark the version as
//! current to trigger the rollout. Also hosts the read-only query operation.

pub mod config;
pub mod operation;
pub mod query;

pub use config::DeployConfig;
pub use operation::Operation;
pub use query::QueryOperation;
