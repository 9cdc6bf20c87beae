//! Error types for Depro.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // KV store errors
    #[error("KV store error: {0}")]
    Kv(String),

    #[error("session '{0}' lost")]
    SessionLost(String),

    // Script execution errors
    #[error("script exited with status {code}:\n{output}")]
    Script { code: i32, output: String },

    // Deployer errors
    #[error("version '{0}' deployment failed")]
    DeploymentFailed(String),

    #[error("deployment failed or timed out during preparation phase")]
    PreparationTimeout,

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
