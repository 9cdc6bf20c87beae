//! Session-bound publication of one node's state.

use depro_core::{Error, Result, VersionState};
use depro_kv::{KvStore, Session};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Publishes one node's state for one version at
/// `<version_key>/<node_name>`, as an ephemeral entry that the store
/// reclaims when the owning session dies.
pub struct Customer {
    store: Arc<dyn KvStore>,
    key: String,
    state_rx: Mutex<Option<mpsc::Receiver<String>>>,
}

impl Customer {
    pub fn new(
        store: Arc<dyn KvStore>,
        version_key: &str,
        node_name: &str,
        state_rx: mpsc::Receiver<String>,
    ) -> Customer {
        Customer {
            store,
            key: format!(
                "{}/{}",
                version_key.trim_matches('/'),
                node_name.trim_matches('/')
            ),
            state_rx: Mutex::new(Some(state_rx)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Acquire the entry with the initial `unregistered` value, then publish
    /// every incoming state until the channel closes or the session is lost.
    /// Bursts are coalesced to the latest value; the final state before close
    /// is always written. The entry is released on return.
    pub async fn run(&self, session: &Session) -> Result<()> {
        let mut rx = self
            .state_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Other(format!("customer for '{}' already running", self.key)))?;

        self.write(VersionState::Unregistered.as_str(), session)
            .await?;

        let mut lost = session.lost();
        loop {
            tokio::select! {
                state = rx.recv() => {
                    match state {
                        Some(mut state) => {
                            // Coalesce any backlog down to the newest value.
                            while let Ok(next) = rx.try_recv() {
                                state = next;
                            }
                            self.write(&state, session).await?;
                        }
                        None => break,
                    }
                }
                changed = lost.changed() => {
                    // A dropped sender means the session stopped renewing.
                    if changed.is_err() || *lost.borrow() {
                        return Err(Error::SessionLost(session.id().to_string()));
                    }
                }
            }
        }

        debug!(key = %self.key, "Releasing state entry");
        self.store.delete(&self.key).await?;
        Ok(())
    }

    async fn write(&self, state: &str, session: &Session) -> Result<()> {
        debug!(key = %self.key, state, "Publishing state");
        if !self.store.acquire(&self.key, state, session.id()).await? {
            return Err(Error::SessionLost(session.id().to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depro_kv::MemoryStore;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn wait_for_value(
        store: &Arc<MemoryStore>,
        key: &str,
        expected: &str,
    ) {
        let mut index = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            let (pair, next) = store.get(key, index).await.unwrap();
            if pair.as_ref().map(|p| p.value.as_str()) == Some(expected) {
                return;
            }
            index = next;
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {} to become '{}'",
                key,
                expected
            );
        }
    }

    #[tokio::test]
    async fn publishes_states_until_closed() {
        let store = MemoryStore::with_wait_time(Duration::from_millis(50));
        let session = Arc::new(Session::create(store.clone(), "test").await.unwrap());
        let (tx, rx) = mpsc::channel(1);
        let customer = Arc::new(Customer::new(store.clone(), "app/v1", "node1", rx));

        let runner = {
            let customer = Arc::clone(&customer);
            let session = Arc::clone(&session);
            tokio::spawn(async move { customer.run(&session).await })
        };

        // The entry appears with the initial state as soon as run starts.
        wait_for_value(&store, "app/v1/node1", "unregistered").await;

        tx.send("deploying".to_string()).await.unwrap();
        wait_for_value(&store, "app/v1/node1", "deploying").await;

        tx.send("available".to_string()).await.unwrap();
        wait_for_value(&store, "app/v1/node1", "available").await;

        // Closing the channel releases the entry.
        drop(tx);
        timeout(Duration::from_secs(1), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let (pair, _) = store.get("app/v1/node1", 0).await.unwrap();
        assert!(pair.is_none());

        session.close().await;
    }

    #[tokio::test]
    async fn entry_dies_with_the_session() {
        let store = MemoryStore::with_wait_time(Duration::from_millis(50));
        let session = Session::create_with_renew_interval(
            store.clone(),
            "test",
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        let (tx, rx) = mpsc::channel(1);
        let customer = Customer::new(store.clone(), "app/v1", "node1", rx);

        let run = customer.run(&session);
        tokio::pin!(run);

        // Drive run until the entry exists, then kill the session behind
        // its back.
        tokio::select! {
            _ = &mut run => panic!("run ended before the session died"),
            _ = wait_for_value(&store, "app/v1/node1", "unregistered") => {}
        }
        store.session_destroy(session.id()).await.unwrap();

        let result = timeout(Duration::from_secs(1), run).await.unwrap();
        assert!(matches!(result, Err(Error::SessionLost(_))));

        let (pair, _) = store.get("app/v1/node1", 0).await.unwrap();
        assert!(pair.is_none(), "the store reclaims the ephemeral entry");
        drop(tx);
    }

    #[tokio::test]
    async fn run_is_single_use() {
        let store = MemoryStore::new();
        let session = Session::create(store.clone(), "test").await.unwrap();
        let (tx, rx) = mpsc::channel(1);
        let customer = Customer::new(store.clone(), "app/v1", "node1", rx);

        drop(tx);
        customer.run(&session).await.unwrap();
        assert!(customer.run(&session).await.is_err());
    }
}
