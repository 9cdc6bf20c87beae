//! A barrier over a KV prefix.
//!
//! The waiter polls the prefix with blocking list calls, diffs each snapshot
//! against what it has observed so far and publishes notifications for node
//! transitions, per-node readiness and the all-ready barrier. Notification
//! streams are bounded and lossy; the return value of [`Waiter::wait`] is the
//! authoritative outcome.

use depro_core::Result;
use depro_kv::{KvPair, KvStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

const EVENT_BUFFER: usize = 1000;

/// A point-in-time snapshot of one entry under the waited prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitNode {
    pub node: String,
    pub state: String,
}

/// A transition of one node's entry. An empty `state` means the entry
/// disappeared; an empty `last_state` means it just appeared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitNodeUpdate {
    pub node: String,
    pub state: String,
    pub last_state: String,
}

pub type ReadyPredicate = Box<dyn Fn(&WaitNode) -> bool + Send + Sync>;

/// The notification streams of one waiter. Receivers lag at their own risk:
/// publishing never blocks the poll loop.
pub struct WaiterEvents {
    pub node_update: mpsc::Receiver<WaitNodeUpdate>,
    pub node_ready: mpsc::Receiver<WaitNode>,
    pub all_ready: mpsc::Receiver<Vec<WaitNode>>,
}

pub struct Waiter {
    store: Arc<dyn KvStore>,
    prefix: String,
    minimum_nodes: usize,
    is_ready: ReadyPredicate,

    node_update_tx: mpsc::Sender<WaitNodeUpdate>,
    node_ready_tx: mpsc::Sender<WaitNode>,
    all_ready_tx: mpsc::Sender<Vec<WaitNode>>,
}

impl Waiter {
    /// Build a waiter over `prefix` requiring `minimum_nodes` entries. A
    /// `None` predicate treats any published value as ready.
    pub fn new(
        store: Arc<dyn KvStore>,
        prefix: &str,
        minimum_nodes: usize,
        is_ready: Option<ReadyPredicate>,
    ) -> (Waiter, WaiterEvents) {
        let (node_update_tx, node_update) = mpsc::channel(EVENT_BUFFER);
        let (node_ready_tx, node_ready) = mpsc::channel(EVENT_BUFFER);
        let (all_ready_tx, all_ready) = mpsc::channel(EVENT_BUFFER);

        let waiter = Waiter {
            store,
            prefix: prefix.trim_matches('/').to_string(),
            minimum_nodes,
            is_ready: is_ready.unwrap_or_else(|| Box::new(|_| true)),
            node_update_tx,
            node_ready_tx,
            all_ready_tx,
        };
        let events = WaiterEvents {
            node_update,
            node_ready,
            all_ready,
        };
        (waiter, events)
    }

    /// Block until every observed node is ready and the quorum is met, the
    /// timeout elapses, or the store fails.
    ///
    /// Returns `Ok(true)` on the barrier, `Ok(false)` on timeout. The
    /// timeout is checked both before and after each blocking list, since
    /// the list itself may consume most of the window.
    pub async fn wait(&self, timeout: Duration) -> Result<bool> {
        let start = Instant::now();

        // Write the root entry so the first list has something to return
        // against even before any node has published.
        self.store
            .put(&format!("{}/", self.prefix), "")
            .await?;

        let mut last_index = 0u64;
        let mut observed: BTreeMap<String, WaitNode> = BTreeMap::new();

        while start.elapsed() <= timeout {
            let (snapshot, next_index) = self.node_list(last_index).await?;
            last_index = next_index;

            if start.elapsed() > timeout {
                return Ok(false);
            }

            self.apply_snapshot(&mut observed, &snapshot);

            let all_ready = observed.len() >= self.minimum_nodes
                && observed.values().all(|n| (self.is_ready)(n));
            if all_ready {
                let _ = self.all_ready_tx.try_send(snapshot);
                return Ok(true);
            }
        }

        Ok(false)
    }

    async fn node_list(&self, since: u64) -> Result<(Vec<WaitNode>, u64)> {
        let (pairs, index) = self.store.list(&self.prefix, since).await?;
        let nodes = pairs
            .iter()
            .filter_map(|p| self.to_wait_node(p))
            .collect();
        Ok((nodes, index))
    }

    fn to_wait_node(&self, pair: &KvPair) -> Option<WaitNode> {
        let rest = pair.key.strip_prefix(&self.prefix)?;
        let node = rest.trim_matches('/');
        if node.is_empty() {
            // The root entry itself.
            return None;
        }
        Some(WaitNode {
            node: node.to_string(),
            state: pair.value.clone(),
        })
    }

    /// Reconcile `observed` with the latest snapshot, publishing one update
    /// per changed node and one ready notification per node that became
    /// ready.
    fn apply_snapshot(&self, observed: &mut BTreeMap<String, WaitNode>, snapshot: &[WaitNode]) {
        let departed: Vec<String> = observed
            .keys()
            .filter(|name| !snapshot.iter().any(|n| n.node == **name))
            .cloned()
            .collect();
        for name in departed {
            if let Some(old) = observed.remove(&name) {
                debug!(node = %name, last_state = %old.state, "Node entry disappeared");
                let _ = self.node_update_tx.try_send(WaitNodeUpdate {
                    node: name,
                    state: String::new(),
                    last_state: old.state,
                });
            }
        }

        for node in snapshot {
            let last_state = match observed.get(&node.node) {
                Some(prev) if prev.state == node.state => continue,
                Some(prev) => prev.state.clone(),
                None => String::new(),
            };

            observed.insert(node.node.clone(), node.clone());
            debug!(node = %node.node, state = %node.state, last_state = %last_state, "Node update");
            let _ = self.node_update_tx.try_send(WaitNodeUpdate {
                node: node.node.clone(),
                state: node.state.clone(),
                last_state,
            });

            if (self.is_ready)(node) {
                let _ = self.node_ready_tx.try_send(node.clone());
            }
        }
    }
}
