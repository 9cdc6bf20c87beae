//! The KV store port.

use async_trait::async_trait;
use depro_core::Result;
use std::fmt;

/// A single key/value entry together with its modify-index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: String,
    pub modify_index: u64,
}

/// A server-side session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The capabilities the coordination core needs from the store.
///
/// Blocking reads follow the wait-index protocol: the caller passes the last
/// index it saw and the call returns once the modify-index of the queried
/// subtree exceeds it, or after the store's configured wait time (in which
/// case the same index comes back and the caller re-polls). An index of `0`
/// returns immediately with the current state.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// All entries under `prefix`, blocking on `since`.
    async fn list(&self, prefix: &str, since: u64) -> Result<(Vec<KvPair>, u64)>;

    /// Child key names under `prefix` up to the next `separator`, blocking
    /// on `since`.
    async fn keys(&self, prefix: &str, separator: &str, since: u64) -> Result<(Vec<String>, u64)>;

    /// A single entry, blocking on `since`.
    async fn get(&self, key: &str, since: u64) -> Result<(Option<KvPair>, u64)>;

    async fn put(&self, key: &str, value: &str) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn delete_tree(&self, prefix: &str) -> Result<()>;

    async fn session_create(&self, name: &str) -> Result<SessionId>;

    async fn session_renew(&self, id: &SessionId) -> Result<()>;

    async fn session_destroy(&self, id: &SessionId) -> Result<()>;

    /// Write `key` as an ephemeral entry owned by `session`. The entry is
    /// deleted by the store when the session dies. Returns `false` when the
    /// session no longer holds a valid lease.
    async fn acquire(&self, key: &str, value: &str, session: &SessionId) -> Result<bool>;
}
