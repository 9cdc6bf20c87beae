//! Session leases with background renewal.

use crate::store::{KvStore, SessionId};
use depro_core::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

const RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// A server-side lease kept alive by a background renewal task.
///
/// Ephemeral entries acquired under the session are reclaimed by the store
/// when the lease dies, whether through [`Session::close`] or through the
/// process disappearing and the TTL running out.
pub struct Session {
    id: SessionId,
    store: Arc<dyn KvStore>,
    lost_rx: watch::Receiver<bool>,
    stop_tx: watch::Sender<bool>,
}

impl Session {
    pub async fn create(store: Arc<dyn KvStore>, name: &str) -> Result<Session> {
        Session::create_with_renew_interval(store, name, RENEW_INTERVAL).await
    }

    pub async fn create_with_renew_interval(
        store: Arc<dyn KvStore>,
        name: &str,
        renew_interval: Duration,
    ) -> Result<Session> {
        let id = store.session_create(name).await?;
        debug!(session = %id, name, "Session created");

        let (lost_tx, lost_rx) = watch::channel(false);
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let renew_store = Arc::clone(&store);
        let renew_id = id.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(renew_interval);
            ticker.tick().await; // the first tick completes immediately
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = renew_store.session_renew(&renew_id).await {
                            warn!(session = %renew_id, error = %e, "Session renewal failed");
                            let _ = lost_tx.send(true);
                            break;
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        });

        Ok(Session {
            id,
            store,
            lost_rx,
            stop_tx,
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// A watch that flips to `true` when the lease can no longer be renewed.
    pub fn lost(&self) -> watch::Receiver<bool> {
        self.lost_rx.clone()
    }

    /// Stop renewing and destroy the lease, reclaiming its ephemeral entries.
    pub async fn close(&self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.store.session_destroy(&self.id).await {
            warn!(session = %self.id, error = %e, "Failed to destroy session");
        }
    }
}
