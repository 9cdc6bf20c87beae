//! Depro Core
//!
//! Shared vocabulary for the Depro workspace: error handling, the version
//! state vocabulary published into the KV tree, common configuration and the
//! process-wide shutdown notifier.

pub mod config;
pub mod error;
pub mod shutdown;
pub mod state;

pub use error::{Error, Result};
pub use state::VersionState;
