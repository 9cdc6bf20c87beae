//! In-process implementation of the KV port.
//!
//! Faithful to the wait-index contract: every write bumps a monotonic store
//! index, blocking reads sleep on a watch channel until the index passes the
//! caller's and ephemeral entries die with their session. Tests across the
//! workspace run against this store.

use crate::store::{KvPair, KvStore, SessionId};
use async_trait::async_trait;
use depro_core::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

struct Entry {
    value: String,
    modify_index: u64,
    session: Option<SessionId>,
}

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, Entry>,
    index: u64,
    sessions: HashMap<SessionId, String>,
    next_session: u64,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    wake: watch::Sender<u64>,
    wait_time: Duration,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Self::with_wait_time(Duration::from_secs(5))
    }

    /// A store whose blocking reads give up after `wait_time`.
    pub fn with_wait_time(wait_time: Duration) -> Arc<Self> {
        let (wake, _) = watch::channel(0u64);
        // Indexes start at 1 so that the empty store already has a
        // well-defined wait-index.
        let inner = Inner {
            index: 1,
            ..Inner::default()
        };
        Arc::new(MemoryStore {
            inner: Mutex::new(inner),
            wake,
            wait_time,
        })
    }

    fn notify(&self, index: u64) {
        // send_replace stores the value even when no poller is subscribed.
        self.wake.send_replace(index);
    }

    /// Run `snapshot` until its index exceeds `since` or the wait time runs
    /// out, in which case the latest snapshot comes back under the caller's
    /// own index for re-polling.
    async fn block_on<T>(&self, since: u64, snapshot: impl Fn(&Inner) -> T) -> (T, u64) {
        let mut wake = self.wake.subscribe();
        let deadline = Instant::now() + self.wait_time;

        loop {
            let (value, index) = {
                let inner = self.inner.lock().unwrap();
                (snapshot(&inner), inner.index)
            };

            if since == 0 || index > since {
                return (value, index);
            }

            tokio::select! {
                changed = wake.changed() => {
                    if changed.is_err() {
                        return (value, since);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return (value, since);
                }
            }
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn list(&self, prefix: &str, since: u64) -> Result<(Vec<KvPair>, u64)> {
        let prefix = prefix.to_string();
        let (pairs, index) = self
            .block_on(since, |inner| {
                inner
                    .data
                    .iter()
                    .filter(|(k, _)| k.starts_with(&prefix))
                    .map(|(k, e)| KvPair {
                        key: k.clone(),
                        value: e.value.clone(),
                        modify_index: e.modify_index,
                    })
                    .collect::<Vec<_>>()
            })
            .await;
        Ok((pairs, index))
    }

    async fn keys(&self, prefix: &str, separator: &str, since: u64) -> Result<(Vec<String>, u64)> {
        let prefix = prefix.to_string();
        let separator = separator.to_string();
        let (names, index) = self
            .block_on(since, |inner| {
                let mut names = BTreeSet::new();
                for key in inner.data.keys().filter(|k| k.starts_with(&prefix)) {
                    let rest = &key[prefix.len()..];
                    match rest.find(&separator) {
                        Some(pos) if !separator.is_empty() => {
                            names.insert(format!("{}{}", prefix, &rest[..pos + separator.len()]));
                        }
                        _ => {
                            names.insert(key.clone());
                        }
                    }
                }
                names.into_iter().collect::<Vec<_>>()
            })
            .await;
        Ok((names, index))
    }

    async fn get(&self, key: &str, since: u64) -> Result<(Option<KvPair>, u64)> {
        let key = key.to_string();
        let (pair, index) = self
            .block_on(since, |inner| {
                inner.data.get(&key).map(|e| KvPair {
                    key: key.clone(),
                    value: e.value.clone(),
                    modify_index: e.modify_index,
                })
            })
            .await;
        Ok((pair, index))
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let index = {
            let mut inner = self.inner.lock().unwrap();
            inner.index += 1;
            let index = inner.index;
            match inner.data.get_mut(key) {
                Some(entry) => {
                    entry.value = value.to_string();
                    entry.modify_index = index;
                }
                None => {
                    inner.data.insert(
                        key.to_string(),
                        Entry {
                            value: value.to_string(),
                            modify_index: index,
                            session: None,
                        },
                    );
                }
            }
            index
        };
        self.notify(index);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let index = {
            let mut inner = self.inner.lock().unwrap();
            if inner.data.remove(key).is_none() {
                return Ok(());
            }
            inner.index += 1;
            inner.index
        };
        self.notify(index);
        Ok(())
    }

    async fn delete_tree(&self, prefix: &str) -> Result<()> {
        let index = {
            let mut inner = self.inner.lock().unwrap();
            let doomed: Vec<String> = inner
                .data
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect();
            if doomed.is_empty() {
                return Ok(());
            }
            for key in doomed {
                inner.data.remove(&key);
            }
            inner.index += 1;
            inner.index
        };
        self.notify(index);
        Ok(())
    }

    async fn session_create(&self, name: &str) -> Result<SessionId> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_session += 1;
        let id = SessionId::new(format!("session-{:04x}", inner.next_session));
        inner.sessions.insert(id.clone(), name.to_string());
        Ok(id)
    }

    async fn session_renew(&self, id: &SessionId) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        if inner.sessions.contains_key(id) {
            Ok(())
        } else {
            Err(Error::SessionLost(id.to_string()))
        }
    }

    async fn session_destroy(&self, id: &SessionId) -> Result<()> {
        let index = {
            let mut inner = self.inner.lock().unwrap();
            inner.sessions.remove(id);
            let doomed: Vec<String> = inner
                .data
                .iter()
                .filter(|(_, e)| e.session.as_ref() == Some(id))
                .map(|(k, _)| k.clone())
                .collect();
            if doomed.is_empty() {
                return Ok(());
            }
            for key in doomed {
                inner.data.remove(&key);
            }
            inner.index += 1;
            inner.index
        };
        self.notify(index);
        Ok(())
    }

    async fn acquire(&self, key: &str, value: &str, session: &SessionId) -> Result<bool> {
        let index = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.sessions.contains_key(session) {
                return Ok(false);
            }
            inner.index += 1;
            let index = inner.index;
            inner.data.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    modify_index: index,
                    session: Some(session.clone()),
                },
            );
            index
        };
        self.notify(index);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn put_bumps_the_store_index() {
        let store = MemoryStore::new();
        let (_, first) = store.list("app/", 0).await.unwrap();

        store.put("app/a", "1").await.unwrap();
        let (pairs, second) = store.list("app/", 0).await.unwrap();

        assert!(second > first);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].value, "1");
    }

    #[tokio::test]
    async fn blocking_list_wakes_on_write() {
        let store = MemoryStore::new();
        store.put("app/a", "1").await.unwrap();
        let (_, index) = store.list("app/", 0).await.unwrap();

        let poller = {
            let store = store.clone();
            tokio::spawn(async move { store.list("app/", index).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.put("app/b", "2").await.unwrap();

        let (pairs, next) = timeout(Duration::from_secs(1), poller)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(next > index);
        assert_eq!(pairs.len(), 2);
    }

    #[tokio::test]
    async fn blocking_read_times_out_with_same_index() {
        let store = MemoryStore::with_wait_time(Duration::from_millis(50));
        store.put("app/a", "1").await.unwrap();
        let (_, index) = store.list("app/", 0).await.unwrap();

        let (_, next) = store.list("app/", index).await.unwrap();
        assert_eq!(next, index);
    }

    #[tokio::test]
    async fn keys_cut_at_the_separator() {
        let store = MemoryStore::new();
        store.put("app/v1/node1", "ready").await.unwrap();
        store.put("app/v1/node2", "ready").await.unwrap();
        store.put("app/current", "v1").await.unwrap();

        let (names, _) = store.keys("app/", "/", 0).await.unwrap();
        assert_eq!(names, vec!["app/current".to_string(), "app/v1/".to_string()]);
    }

    #[tokio::test]
    async fn session_destroy_reclaims_ephemeral_entries() {
        let store = MemoryStore::new();
        let session = store.session_create("test").await.unwrap();

        assert!(store.acquire("app/v1/node1", "ready", &session).await.unwrap());
        store.session_destroy(&session).await.unwrap();

        let (pair, _) = store.get("app/v1/node1", 0).await.unwrap();
        assert!(pair.is_none());
        assert!(!store.acquire("app/v1/node1", "ready", &session).await.unwrap());
        assert!(store.session_renew(&session).await.is_err());
    }
}
